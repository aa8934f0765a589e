use thiserror::Error;

/// Failure kinds surfaced by the maintenance orchestrator and its services.
///
/// None of these are fatal to the process: the controller is the source of
/// truth, and every failure is recoverable by operator retry or by the
/// reconnect loop.
#[derive(Debug, Error)]
pub enum MaintenanceError {
    /// A maintenance operation is already active and not in a terminal phase.
    #[error("another maintenance operation is already in progress")]
    OperationInProgress,

    /// The filesystem overlay is still active after a disable attempt.
    #[error("filesystem overlay is still active")]
    PreconditionFailed,

    /// The controller answered, but refused the request (`state` not ok).
    #[error("controller rejected the {action} request")]
    RejectedByController { action: &'static str },

    /// The controller could not produce a backup archive.
    #[error("controller failed to create the backup archive")]
    BackupCreateFailed,

    /// The controller did not accept the uploaded restore archive.
    #[error("controller failed to accept the restore archive")]
    RestoreFailed,

    /// The transport could not complete the request at all.
    #[error("could not reach the controller")]
    ConnectionFailure(#[source] anyhow::Error),
}

impl MaintenanceError {
    /// Connection failures leave the operation state untouched so the
    /// operator may simply retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MaintenanceError::ConnectionFailure(_))
    }
}
