use crate::controller_client::ControllerClient;
use crate::error::MaintenanceError;
use log::{info, warn};
use serde::Serialize;

/// Classification of the read-only filesystem overlay.
///
/// Two generations of overlay exist in the field: the current `ro` layout
/// and the legacy raspi-config one. Either blocks system updates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct OverlayState {
    /// Any overlay indicator is set.
    pub present: bool,
    /// The legacy raspi-config overlay specifically.
    pub rw_active: bool,
}

/// Overlay precondition logic for reboot-spanning operations.
pub struct OverlayManager;

impl OverlayManager {
    /// Derive the overlay state from the controller's two indicator flags.
    pub fn classify(ro_exists: bool, old_overlay_active: bool) -> OverlayState {
        OverlayState {
            present: ro_exists || old_overlay_active,
            rw_active: old_overlay_active,
        }
    }

    /// Whether a system update may start without disabling the overlay.
    pub fn update_allowed(state: OverlayState) -> bool {
        !state.present
    }

    /// Ask the controller to disable the overlay. Takes effect on the next
    /// reboot; scheduling that reboot is the caller's concern.
    pub async fn request_disable<C: ControllerClient>(client: &C) -> Result<(), MaintenanceError> {
        let response = client.disable_overlay().await.map_err(|e| {
            warn!("overlay disable request did not reach the controller: {e:#}");
            MaintenanceError::PreconditionFailed
        })?;

        if response.state.is_ok() {
            info!("overlay disable accepted, effective after reboot");
            Ok(())
        } else {
            warn!("controller refused to disable the overlay");
            Err(MaintenanceError::PreconditionFailed)
        }
    }
}
