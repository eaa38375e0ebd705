use std::{future::Future, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use futures::FutureExt;
use kube::{runtime::controller::Action, Resource};
use log::error;
use ovnkube_core::{allocations::AllocationsError, helpers::pretty_type_name, nbdb::client::DbError};

use crate::{orchestrator::OrchestratorError, watcher::key_of};

use self::{context::ReconcilerContext, error::ReconcilerError};

pub mod context;
pub mod endpoint;
pub mod error;
pub mod gateway;
pub mod node;
pub mod policy;
pub mod service;

#[cfg(test)]
mod tests;

const ERROR_REQUEUE_SECS: u64 = 10;
const USER_ERROR_REQUEUE_SECS: u64 = 60 * 5;
const EXHAUSTED_REQUEUE_SECS: u64 = 30;

/// Error policy handed to every controller. Counts the failure streak of the
/// object and picks the requeue from it.
pub fn reconcile_error<K: Resource>(object: Arc<K>, error: &ReconcilerError, context: Arc<ReconcilerContext>) -> Action {
    let kind = pretty_type_name::<K>();
    let key = key_of(object.as_ref());
    let attempt = context.failures.record(kind, &key);
    let action = requeue_action(&key, error, attempt, &context);

    // a dropped object starts over on its next event
    if action == Action::await_change() {
        context.failures.clear(kind, &key);
    }

    action
}

/// Requeue for the `attempt`-th consecutive failure of `key`.
pub fn requeue_action(key: &str, error: &ReconcilerError, attempt: u32, context: &ReconcilerContext) -> Action {
    match error {
        // the supervisor is on its way down in both cases
        ReconcilerError::Db(DbError::Cancelled) | ReconcilerError::Db(DbError::RetriesExhausted { .. }) => {
            Action::await_change()
        }
        ReconcilerError::Db(DbError::Permanent(..))
        | ReconcilerError::AnnotationConflict(..)
        | ReconcilerError::Orchestrator(OrchestratorError::Conflict(_)) => retry_once(key, error, attempt),
        ReconcilerError::Allocation(allocation) if allocation.is_conflict() => retry_once(key, error, attempt),
        ReconcilerError::Allocation(allocation) if allocation.is_exhausted() => {
            Action::requeue(Duration::from_secs(EXHAUSTED_REQUEUE_SECS))
        }
        ReconcilerError::HostSubnetMissing(_)
        | ReconcilerError::Allocation(AllocationsError::NodeSubnetMissing(_))
        | ReconcilerError::Orchestrator(_) => Action::requeue(context.settings.retry_backoff.delay(attempt)),
        ReconcilerError::Allocation(_)
        | ReconcilerError::InvalidAnnotation(..)
        | ReconcilerError::TransitRangeExhausted(_) => Action::requeue(Duration::from_secs(USER_ERROR_REQUEUE_SECS)),
        ReconcilerError::MissingObjectMetadata | ReconcilerError::MalformedKey(_) | ReconcilerError::Panicked => {
            Action::requeue(Duration::from_secs(ERROR_REQUEUE_SECS))
        }
    }
}

fn retry_once(key: &str, error: &ReconcilerError, attempt: u32) -> Action {
    if attempt <= 1 {
        return Action::requeue(Duration::from_secs(ERROR_REQUEUE_SECS));
    }

    error!("Dropping '{key}' after {attempt} failed attempts! Last error: {error}");

    Action::await_change()
}

/// Runs one reconcile of a `K` object. A panic becomes an error so the
/// controller keeps going; success ends the failure streak.
pub async fn guarded<K, F>(key: &str, context: &ReconcilerContext, reconcile: F) -> Result<Action, ReconcilerError>
where
    F: Future<Output = Result<Action, ReconcilerError>>,
{
    let result = match AssertUnwindSafe(reconcile).catch_unwind().await {
        Ok(result) => result,
        Err(_) => {
            error!("{} reconciler panicked on '{key}'!", pretty_type_name::<K>());
            Err(ReconcilerError::Panicked)
        }
    };

    if result.is_ok() {
        context.failures.clear(pretty_type_name::<K>(), key);
    }

    result
}
