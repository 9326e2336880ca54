//! Outcome of one reconcile pass and its mapping onto controller actions

use std::time::Duration;

use kube::runtime::controller::Action;
use tracing::debug;

use iscsi_common::{Error, Result};

/// How a reconcile pass ended
#[derive(Debug)]
pub enum ReconcileResult {
    /// Everything converged; wait for the next change
    Done,
    /// Something was written; run another pass right away
    Requeue,
    /// The pass failed
    Error(Error),
}

impl ReconcileResult {
    pub fn is_done(&self) -> bool {
        matches!(self, ReconcileResult::Done)
    }

    pub fn is_requeue(&self) -> bool {
        matches!(self, ReconcileResult::Requeue)
    }

    pub fn err(&self) -> Option<&Error> {
        match self {
            ReconcileResult::Error(e) => Some(e),
            _ => None,
        }
    }

    /// Translate into what `kube::runtime::Controller` expects.
    ///
    /// Errors are handed back so `error_policy` picks the backoff.
    pub fn into_action(self) -> Result<Action> {
        match self {
            ReconcileResult::Done => Ok(Action::await_change()),
            ReconcileResult::Requeue => Ok(Action::requeue(Duration::ZERO)),
            ReconcileResult::Error(e) => Err(e),
        }
    }
}

impl From<Error> for ReconcileResult {
    fn from(e: Error) -> Self {
        if e.is_conflict() {
            debug!(error = %e, "write conflict, requeueing");
            return ReconcileResult::Requeue;
        }
        ReconcileResult::Error(e)
    }
}

impl From<Result<ReconcileResult>> for ReconcileResult {
    fn from(r: Result<ReconcileResult>) -> Self {
        match r {
            Ok(result) => result,
            Err(e) => e.into(),
        }
    }
}
