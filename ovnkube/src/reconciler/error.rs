use ipnet::Ipv4Net;
use ovnkube_core::{
    allocations::AllocationsError, kubernetes::annotations::AnnotationError, nbdb::client::DbError,
};
use thiserror::Error;

use crate::orchestrator::OrchestratorError;

#[derive(Debug, Error)]
pub enum ReconcilerError {
    #[error("Object is missing metadata!")]
    MissingObjectMetadata,
    #[error("'{}' is not a namespace/name key!", .0)]
    MalformedKey(String),
    #[error("'{}' annotation of '{}' is invalid! {}", .0, .1, .2)]
    InvalidAnnotation(&'static str, String, AnnotationError),
    #[error("Node '{}' has no host subnet yet!", .0)]
    HostSubnetMissing(String),
    #[error("Transit range has no link left for {} host subnet!", .0)]
    TransitRangeExhausted(Ipv4Net),
    #[error("Gave up writing '{}' annotation of '{}' after {} conflicts!", .0, .1, .2)]
    AnnotationConflict(&'static str, String, u32),
    #[error("Couldn't allocate! Reason: {}", .0)]
    Allocation(#[from] AllocationsError),
    #[error("Couldn't update the northbound database! Reason: {}", .0)]
    Db(#[from] DbError),
    #[error("Couldn't talk to the orchestrator! Reason: {}", .0)]
    Orchestrator(#[from] OrchestratorError),
    #[error("Reconciler panicked!")]
    Panicked,
}

impl ReconcilerError {
    /// Shutdown in progress; not worth a warning.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ReconcilerError::Db(DbError::Cancelled))
    }
}
