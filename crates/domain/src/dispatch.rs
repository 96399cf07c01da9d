use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::DomainResult;
use crate::diff::{DiffOp, RecordDiff};
use crate::ports::BoxFuture;
use crate::record::EntityKind;

/// Reacts to diffs of one entity kind by applying deltas to other entities.
pub trait PostProcessor: Send + Sync {
    fn name(&self) -> &'static str;
    fn run<'a>(&'a self, diff: &'a RecordDiff) -> BoxFuture<'a, DomainResult<()>>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteOutcome {
    Dispatched { kind: EntityKind, op: DiffOp },
    Unhandled,
    Malformed,
}

#[derive(Clone, Default)]
pub struct DiffRouter {
    handlers: HashMap<EntityKind, Arc<dyn PostProcessor>>,
}

impl DiffRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, kind: EntityKind, handler: Arc<dyn PostProcessor>) -> Self {
        self.handlers.insert(kind, handler);
        self
    }

    pub fn handles(&self, kind: EntityKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    /// Classifies the diff and hands it to the handler registered for its entity kind.
    /// Handler errors propagate so the delivery can be retried.
    pub async fn route(&self, diff: &RecordDiff) -> DomainResult<RouteOutcome> {
        let Some(op) = diff.op() else {
            warn!(key = %diff.key, "dropping diff with neither old nor new image");
            return Ok(RouteOutcome::Malformed);
        };
        let Some(kind) = diff.key.entity_kind() else {
            debug!(key = %diff.key, "no entity kind for partition key");
            return Ok(RouteOutcome::Unhandled);
        };
        let Some(handler) = self.handlers.get(&kind) else {
            debug!(key = %diff.key, kind = %kind, "no postprocessor registered");
            return Ok(RouteOutcome::Unhandled);
        };

        debug!(key = %diff.key, handler = handler.name(), op = op.as_str(), "postprocessing diff");
        if let Err(err) = handler.run(diff).await {
            error!(
                key = %diff.key,
                handler = handler.name(),
                op = op.as_str(),
                error = %err,
                "postprocessing failed"
            );
            return Err(err);
        }
        Ok(RouteOutcome::Dispatched { kind, op })
    }
}
