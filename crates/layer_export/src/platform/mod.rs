//! The remote geoprocessing platform as seen by the exporter.
//!
//! [`Platform`] is the seam between the pipeline and the network. The REST
//! client talks to the real service; [`InMemoryPlatform`] evaluates
//! expressions locally and backs dry runs and tests.

mod memory;
mod rest;

pub use memory::InMemoryPlatform;
pub use rest::{RestPlatform, DEFAULT_API_BASE};

use crate::asset::AssetId;
use crate::expr::CollectionExpr;
use std::fmt;
use std::future::Future;
use thiserror::Error;

/// Errors returned by platform operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PlatformError {
    /// The request never produced an HTTP response.
    #[error("transport error: {0}")]
    Transport(String),

    /// The platform answered with a non-success status.
    #[error("HTTP {status} from {url}: {body}")]
    Status { status: u16, url: String, body: String },

    /// The response body could not be understood.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// The platform refused the request.
    #[error("rejected: {0}")]
    Rejected(String),
}

/// Outcome of an asset existence check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetProbe {
    Exists,
    Missing,
}

/// Lifecycle state of a remote task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    Pending,
    Running,
    Cancelling,
    Completed,
    Failed,
    Cancelled,
    /// A state string this client does not know; treated as still running.
    Unknown,
}

impl TaskState {
    /// Completed, Failed and Cancelled never change again.
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Maps the platform's state strings. The REST API says `SUCCEEDED`
    /// where older clients say `COMPLETED`.
    pub fn from_remote(state: &str) -> Self {
        match state.to_ascii_uppercase().as_str() {
            "PENDING" | "READY" | "UNSUBMITTED" => Self::Pending,
            "RUNNING" => Self::Running,
            "CANCELLING" | "CANCEL_REQUESTED" => Self::Cancelling,
            "SUCCEEDED" | "COMPLETED" => Self::Completed,
            "FAILED" => Self::Failed,
            "CANCELLED" => Self::Cancelled,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Cancelling => "CANCELLING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
            Self::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// Handle of a submitted asynchronous task.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskHandle {
    /// Operation name, e.g. `projects/p/operations/ABC123`.
    pub id: String,
    /// Description the task was submitted with.
    pub description: String,
}

/// One poll of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskStatus {
    pub state: TaskState,
    pub description: String,
    /// Error message reported for failed tasks, when there is one.
    pub error: Option<String>,
}

/// Operations the exporter needs from the remote platform.
pub trait Platform: Send + Sync {
    /// Checks whether an asset exists. A failed check is an `Err`, never
    /// `Missing`.
    fn probe_asset(
        &self,
        id: &AssetId,
    ) -> impl Future<Output = Result<AssetProbe, PlatformError>> + Send;

    /// Submits and starts an "export table to asset" task.
    fn export_table(
        &self,
        collection: &CollectionExpr,
        description: &str,
        destination: &AssetId,
    ) -> impl Future<Output = Result<TaskHandle, PlatformError>> + Send;

    /// Polls a task's current state.
    fn task_status(
        &self,
        task: &TaskHandle,
    ) -> impl Future<Output = Result<TaskStatus, PlatformError>> + Send;

    /// Synchronously counts the features of a collection.
    fn collection_size(
        &self,
        collection: &CollectionExpr,
    ) -> impl Future<Output = Result<u64, PlatformError>> + Send;

    /// Deletes an asset.
    fn delete_asset(&self, id: &AssetId) -> impl Future<Output = Result<(), PlatformError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(TaskState::Completed.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::Cancelled.is_terminal());
        assert!(!TaskState::Pending.is_terminal());
        assert!(!TaskState::Running.is_terminal());
        assert!(!TaskState::Cancelling.is_terminal());
        assert!(!TaskState::Unknown.is_terminal());
    }

    #[test]
    fn remote_state_names() {
        assert_eq!(TaskState::from_remote("SUCCEEDED"), TaskState::Completed);
        assert_eq!(TaskState::from_remote("completed"), TaskState::Completed);
        assert_eq!(TaskState::from_remote("READY"), TaskState::Pending);
        assert_eq!(TaskState::from_remote("CANCELLED"), TaskState::Cancelled);
        assert_eq!(TaskState::from_remote("STATE_UNSPECIFIED"), TaskState::Unknown);
        assert_eq!(TaskState::Failed.to_string(), "FAILED");
    }
}
