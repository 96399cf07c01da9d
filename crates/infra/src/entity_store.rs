use redis::aio::ConnectionManager;
use ripple_domain::diff::RecordDiff;
use ripple_domain::ports::BoxFuture;
use ripple_domain::ports::store::{
    Condition, EntityStore, Index, KeyRange, Page, PageRequest, ReadConsistency, StoreError,
    UpdateItem, WriteOp,
};
use ripple_domain::ports::stream::DiffEnvelope;
use ripple_domain::record::{ItemKey, Record};
use ripple_domain::util::{new_id, now_ms};
use serde_json::Value;
use tracing::debug;

use crate::diff_queue::QueueKeys;

const MAX_WRITE_ATTEMPTS: u32 = 8;
const INDEXES: [Index; 3] = [Index::A1, Index::A3, Index::K1];

/// KEYS are the touched rows and ARGV[i] the value each was read with ('' when absent).
/// Nothing is written unless every row is unchanged; the last argument is the command list.
const COMMIT_SCRIPT: &str = r#"
    local count = #KEYS
    for i = 1, count do
        local current = redis.call('GET', KEYS[i])
        if (current or '') ~= ARGV[i] then
            return 0
        end
    end
    for _, command in ipairs(cjson.decode(ARGV[count + 1])) do
        redis.call(unpack(command))
    end
    return 1
"#;

fn operation(err: impl std::fmt::Display) -> StoreError {
    StoreError::Operation(err.to_string())
}

/// Key layout of the shared table under one namespace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreKeys {
    namespace: String,
}

impl StoreKeys {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    /// Sorted-set member naming a row; JSON keeps separators inside keys unambiguous.
    pub fn member(key: &ItemKey) -> Result<String, StoreError> {
        serde_json::to_string(&(&key.partition_key, &key.sort_key)).map_err(operation)
    }

    pub fn parse_member(member: &str) -> Result<ItemKey, StoreError> {
        let (partition_key, sort_key): (String, String) =
            serde_json::from_str(member).map_err(operation)?;
        Ok(ItemKey::new(partition_key, sort_key))
    }

    pub fn row(&self, key: &ItemKey) -> Result<String, StoreError> {
        Ok(format!("{}:row:{}", self.namespace, Self::member(key)?))
    }

    pub fn partition(&self, partition_key: &str) -> String {
        format!("{}:part:{partition_key}", self.namespace)
    }

    pub fn all_rows(&self) -> String {
        format!("{}:rows", self.namespace)
    }

    pub fn index(&self, index: Index, partition_key: &str) -> String {
        format!("{}:idx:{}:{partition_key}", self.namespace, index.name())
    }
}

/// Fixed-width token whose byte order matches the numeric order of `value`.
pub fn sort_token(value: i64) -> String {
    format!("{:020}", (value as u64) ^ (1 << 63))
}

fn index_bound(value: &Value) -> Result<i64, StoreError> {
    value
        .as_i64()
        .ok_or_else(|| StoreError::Operation(format!("index range bound {value} is not an integer")))
}

/// Index entries of one row. Only integer sort values are indexed.
fn index_entries(
    keys: &StoreKeys,
    key: &ItemKey,
    record: &Record,
) -> Result<Vec<(String, String)>, StoreError> {
    let member = StoreKeys::member(key)?;
    Ok(INDEXES
        .iter()
        .filter_map(|index| {
            let partition = record.get_str(index.partition_attr())?;
            let sort = record.get_i64(index.sort_attr())?;
            Some((
                keys.index(*index, partition),
                format!("{}|{member}", sort_token(sort)),
            ))
        })
        .collect())
}

/// Row, partition, index and queue commands for a batch of committed diffs.
fn commit_commands(
    keys: &StoreKeys,
    queue: Option<&QueueKeys>,
    diffs: &[RecordDiff],
) -> Result<Vec<Vec<String>>, StoreError> {
    let mut commands = Vec::new();
    for diff in diffs {
        let member = StoreKeys::member(&diff.key)?;
        let row = keys.row(&diff.key)?;
        let partition = keys.partition(&diff.key.partition_key);
        if let Some(old) = &diff.old {
            for (index_key, entry) in index_entries(keys, &diff.key, old)? {
                commands.push(vec!["ZREM".into(), index_key, entry]);
            }
        }
        match &diff.new {
            Some(new) => {
                let encoded = serde_json::to_string(new).map_err(operation)?;
                commands.push(vec!["SET".into(), row, encoded]);
                commands.push(vec![
                    "ZADD".into(),
                    partition,
                    "0".into(),
                    diff.key.sort_key.clone(),
                ]);
                commands.push(vec!["ZADD".into(), keys.all_rows(), "0".into(), member]);
                for (index_key, entry) in index_entries(keys, &diff.key, new)? {
                    commands.push(vec!["ZADD".into(), index_key, "0".into(), entry]);
                }
            }
            None => {
                commands.push(vec!["DEL".into(), row]);
                commands.push(vec!["ZREM".into(), partition, diff.key.sort_key.clone()]);
                commands.push(vec!["ZREM".into(), keys.all_rows(), member]);
            }
        }
        if let Some(queue) = queue {
            let envelope = DiffEnvelope::new(new_id(), diff.clone(), now_ms());
            let payload = serde_json::to_string(&envelope).map_err(operation)?;
            commands.push(vec![
                "HSET".into(),
                queue.payloads.clone(),
                envelope.delivery_id.clone(),
                payload,
            ]);
            commands.push(vec!["LPUSH".into(), queue.ready.clone(), envelope.delivery_id]);
        }
    }
    Ok(commands)
}

fn decode_record(raw: &str) -> Result<Record, StoreError> {
    serde_json::from_str(raw).map_err(|err| StoreError::Operation(format!("corrupt row: {err}")))
}

fn lex_inclusive(value: &str) -> Vec<u8> {
    let mut bound = vec![b'['];
    bound.extend_from_slice(value.as_bytes());
    bound
}

fn lex_exclusive(value: &str) -> Vec<u8> {
    let mut bound = vec![b'('];
    bound.extend_from_slice(value.as_bytes());
    bound
}

/// Upper bound covering every member that starts with `prefix`.
fn lex_prefix_end(prefix: &str) -> Vec<u8> {
    let mut bound = lex_inclusive(prefix);
    bound.push(0xff);
    bound
}

fn paged(mut members: Vec<String>, limit: usize) -> (Vec<String>, Option<String>) {
    let has_more = members.len() > limit;
    members.truncate(limit);
    let cursor = if has_more { members.last().cloned() } else { None };
    (members, cursor)
}

fn single_write(result: Result<Vec<RecordDiff>, StoreError>) -> Result<Option<RecordDiff>, StoreError> {
    match result {
        Ok(mut diffs) => Ok(diffs.pop()),
        Err(StoreError::TransactionCanceled { .. }) => Err(StoreError::ConditionFailed),
        Err(err) => Err(err),
    }
}

/// Shared table in Redis. Writes are optimistic: rows are read, resolved locally and committed
/// by a script that re-checks them. When a queue is attached, each committed change is
/// published to it by the same script.
#[derive(Clone)]
pub struct RedisEntityStore {
    manager: ConnectionManager,
    keys: StoreKeys,
    queue: Option<QueueKeys>,
}

impl RedisEntityStore {
    pub async fn connect(
        redis_url: &str,
        namespace: &str,
        diff_queue_prefix: Option<&str>,
    ) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        Ok(Self {
            manager,
            keys: StoreKeys::new(namespace),
            queue: diff_queue_prefix.map(QueueKeys::new),
        })
    }

    async fn load_rows(&self, row_keys: Vec<String>) -> Result<Vec<Option<String>>, StoreError> {
        if row_keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.manager.clone();
        redis::cmd("MGET")
            .arg(row_keys)
            .query_async(&mut conn)
            .await
            .map_err(operation)
    }

    async fn load_records(&self, item_keys: &[ItemKey]) -> Result<Vec<Record>, StoreError> {
        let row_keys = item_keys
            .iter()
            .map(|key| self.keys.row(key))
            .collect::<Result<Vec<_>, _>>()?;
        // Rows deleted since the range read simply drop out of the page.
        self.load_rows(row_keys)
            .await?
            .into_iter()
            .flatten()
            .map(|raw| decode_record(&raw))
            .collect()
    }

    async fn range_by_lex(
        &self,
        zset: &str,
        min: Vec<u8>,
        max: Vec<u8>,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        let mut conn = self.manager.clone();
        redis::cmd("ZRANGEBYLEX")
            .arg(zset)
            .arg(min)
            .arg(max)
            .arg("LIMIT")
            .arg(0)
            .arg(limit.saturating_add(1))
            .query_async(&mut conn)
            .await
            .map_err(operation)
    }

    /// Commits `writes` atomically. A failed condition cancels the whole batch and names
    /// its branch; a concurrent change to any touched row restarts the attempt.
    async fn commit(&self, writes: &[WriteOp]) -> Result<Vec<RecordDiff>, StoreError> {
        let mut item_keys: Vec<ItemKey> = Vec::with_capacity(writes.len());
        for write in writes {
            let key = write.key()?;
            if item_keys.contains(&key) {
                return Err(StoreError::Operation(format!(
                    "transaction touches {key} more than once"
                )));
            }
            item_keys.push(key);
        }
        let row_keys = item_keys
            .iter()
            .map(|key| self.keys.row(key))
            .collect::<Result<Vec<_>, _>>()?;

        let script = redis::Script::new(COMMIT_SCRIPT);
        let mut conn = self.manager.clone();
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let current = self.load_rows(row_keys.clone()).await?;
            let mut diffs = Vec::with_capacity(writes.len());
            for (branch, ((write, key), raw)) in
                writes.iter().zip(&item_keys).zip(&current).enumerate()
            {
                let old = raw.as_deref().map(decode_record).transpose()?;
                match write.resolve(old.as_ref()) {
                    Ok(Some(new)) if old.is_some() || new.is_some() => {
                        diffs.push(RecordDiff::new(key.clone(), old, new));
                    }
                    Ok(_) => {}
                    Err(StoreError::ConditionFailed) => {
                        return Err(StoreError::TransactionCanceled {
                            failed_branch: Some(branch),
                        });
                    }
                    Err(err) => return Err(err),
                }
            }

            let commands = commit_commands(&self.keys, self.queue.as_ref(), &diffs)?;
            let mut invocation = script.prepare_invoke();
            for row_key in &row_keys {
                invocation.key(row_key);
            }
            for raw in &current {
                invocation.arg(raw.as_deref().unwrap_or(""));
            }
            invocation.arg(serde_json::to_string(&commands).map_err(operation)?);
            let committed: i32 = invocation
                .invoke_async(&mut conn)
                .await
                .map_err(operation)?;
            if committed == 1 {
                return Ok(diffs);
            }
            debug!(attempt, rows = row_keys.len(), "entity rows changed during write; retrying");
        }
        Err(StoreError::Unavailable(format!(
            "entity rows kept changing across {MAX_WRITE_ATTEMPTS} write attempts"
        )))
    }
}

impl EntityStore for RedisEntityStore {
    /// Redis reads are always current, so both consistency levels read the same row.
    fn get(
        &self,
        key: &ItemKey,
        _consistency: ReadConsistency,
    ) -> BoxFuture<'_, Result<Option<Record>, StoreError>> {
        let key = key.clone();
        Box::pin(async move {
            let row = self.keys.row(&key)?;
            let mut conn = self.manager.clone();
            let raw: Option<String> = redis::cmd("GET")
                .arg(row)
                .query_async(&mut conn)
                .await
                .map_err(operation)?;
            raw.as_deref().map(decode_record).transpose()
        })
    }

    fn put(
        &self,
        item: &Record,
        condition: Option<&Condition>,
    ) -> BoxFuture<'_, Result<(), StoreError>> {
        let write = WriteOp::Put {
            item: item.clone(),
            condition: condition.cloned(),
        };
        Box::pin(async move {
            single_write(self.commit(std::slice::from_ref(&write)).await)?;
            Ok(())
        })
    }

    fn update(&self, update: &UpdateItem) -> BoxFuture<'_, Result<Record, StoreError>> {
        let write = WriteOp::Update(update.clone());
        Box::pin(async move {
            single_write(self.commit(std::slice::from_ref(&write)).await)?
                .and_then(|diff| diff.new)
                .ok_or_else(|| StoreError::Operation("update produced no item".into()))
        })
    }

    fn delete(
        &self,
        key: &ItemKey,
        condition: Option<&Condition>,
    ) -> BoxFuture<'_, Result<Option<Record>, StoreError>> {
        let write = WriteOp::Delete {
            key: key.clone(),
            condition: condition.cloned(),
        };
        Box::pin(async move {
            Ok(single_write(self.commit(std::slice::from_ref(&write)).await)?
                .and_then(|diff| diff.old))
        })
    }

    fn transact_write(&self, writes: &[WriteOp]) -> BoxFuture<'_, Result<(), StoreError>> {
        let writes = writes.to_vec();
        Box::pin(async move {
            self.commit(&writes).await?;
            Ok(())
        })
    }

    fn query_partition(
        &self,
        partition_key: &str,
        sort_key_prefix: Option<&str>,
        page: &PageRequest,
    ) -> BoxFuture<'_, Result<Page, StoreError>> {
        let partition_key = partition_key.to_string();
        let sort_key_prefix = sort_key_prefix.map(ToString::to_string);
        let page = page.clone();
        Box::pin(async move {
            let min = match (&page.cursor, &sort_key_prefix) {
                (Some(after), _) => lex_exclusive(after),
                (None, Some(prefix)) => lex_inclusive(prefix),
                (None, None) => b"-".to_vec(),
            };
            let max = sort_key_prefix
                .as_deref()
                .map_or_else(|| b"+".to_vec(), lex_prefix_end);
            let members = self
                .range_by_lex(&self.keys.partition(&partition_key), min, max, page.limit)
                .await?;
            let (sort_keys, next_cursor) = paged(members, page.limit);
            let item_keys: Vec<ItemKey> = sort_keys
                .into_iter()
                .map(|sort_key| ItemKey::new(partition_key.clone(), sort_key))
                .collect();
            Ok(Page {
                items: self.load_records(&item_keys).await?,
                next_cursor,
            })
        })
    }

    fn query_index(
        &self,
        index: Index,
        partition_key: &str,
        range: &KeyRange,
        page: &PageRequest,
    ) -> BoxFuture<'_, Result<Page, StoreError>> {
        let partition_key = partition_key.to_string();
        let range = range.clone();
        let page = page.clone();
        Box::pin(async move {
            let lower = range.lower.as_ref().map(index_bound).transpose()?;
            let upper = range.upper.as_ref().map(index_bound).transpose()?;
            let min = match (&page.cursor, lower) {
                (Some(after), _) => lex_exclusive(after),
                (None, Some(lower)) => lex_inclusive(&format!("{}|", sort_token(lower))),
                (None, None) => b"-".to_vec(),
            };
            let max = upper.map_or_else(
                || b"+".to_vec(),
                |upper| lex_prefix_end(&format!("{}|", sort_token(upper))),
            );
            let members = self
                .range_by_lex(&self.keys.index(index, &partition_key), min, max, page.limit)
                .await?;
            let (entries, next_cursor) = paged(members, page.limit);
            let item_keys = entries
                .iter()
                .map(|entry| {
                    let (_, member) = entry.split_once('|').ok_or_else(|| {
                        StoreError::Operation(format!("malformed index entry {entry}"))
                    })?;
                    StoreKeys::parse_member(member)
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Page {
                items: self.load_records(&item_keys).await?,
                next_cursor,
            })
        })
    }

    fn scan(
        &self,
        filter: Option<&Condition>,
        page: &PageRequest,
    ) -> BoxFuture<'_, Result<Page, StoreError>> {
        let filter = filter.cloned();
        let page = page.clone();
        Box::pin(async move {
            let min = page
                .cursor
                .as_deref()
                .map_or_else(|| b"-".to_vec(), lex_exclusive);
            let members = self
                .range_by_lex(&self.keys.all_rows(), min, b"+".to_vec(), page.limit)
                .await?;
            // The limit bounds rows examined, not rows returned.
            let (members, next_cursor) = paged(members, page.limit);
            let item_keys = members
                .iter()
                .map(|member| StoreKeys::parse_member(member))
                .collect::<Result<Vec<_>, _>>()?;
            let items = self
                .load_records(&item_keys)
                .await?
                .into_iter()
                .filter(|record| filter.as_ref().is_none_or(|f| f.evaluate(Some(record))))
                .collect();
            Ok(Page { items, next_cursor })
        })
    }
}
