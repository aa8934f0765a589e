use crate::orchestrator::{DeviceSnapshot, OperationKind, Phase};
use crate::services::overlay::OverlayState;
use serde::Serialize;

/// Progress sample derived from a poll observation.
///
/// The marker counts line breaks in the controller's kernel log excerpt and
/// is deliberately unclamped: values above 100 simply mean a long log.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ProgressUpdate {
    /// Raw kernel log excerpt for display.
    pub text: String,
    /// Line-break count of the excerpt.
    pub marker: u32,
    /// Whether the controller still reports the operation as running.
    pub in_progress: bool,
}

impl ProgressUpdate {
    /// Label for a progress bar, e.g. `"42%"`. Not clamped to 100.
    pub fn percent_label(&self) -> String {
        format!("{}%", self.marker)
    }
}

/// Notifications the orchestrator emits toward the presentation layer.
///
/// The orchestrator never renders anything itself; a shell subscribes to
/// this stream and decides how each event is shown.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum MaintenanceEvent {
    /// The active operation changed phase.
    PhaseChanged { kind: OperationKind, phase: Phase },
    /// New progress sample from the poll loop.
    Progress(ProgressUpdate),
    /// Fresh device state after a handshake.
    SnapshotRefreshed(DeviceSnapshot),
    /// New overlay classification. Every handshake emits one; a poll emits
    /// one only when the classification differs from the last.
    OverlayChanged(OverlayState),
    /// Human-readable status line.
    Message(String),
    /// The operation was rolled back; controls should be re-enabled.
    Rollback,
    /// The controller needs a reboot to finish applying the operation.
    RebootRequired,
    /// The device is back after a reboot; the shell should leave the
    /// maintenance view.
    NavigateHome,
}
