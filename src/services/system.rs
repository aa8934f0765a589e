use crate::controller_client::{ControllerClient, SetTimeResponse, StatsResponse};
use crate::error::MaintenanceError;
use anyhow::Result;
use log::{info, warn};

/// Boundary operations that complete within a single request and never
/// span a reboot. These do not touch the operation session.
pub struct SystemService;

impl SystemService {
    /// Stage a manually downloaded update archive for installation on the
    /// next boot.
    pub async fn manual_update<C: ControllerClient>(client: &C) -> Result<(), MaintenanceError> {
        let response = client
            .manual_update()
            .await
            .map_err(MaintenanceError::ConnectionFailure)?;
        if response.state.is_ok() {
            info!("manual update staged for the next boot");
            Ok(())
        } else {
            Err(MaintenanceError::RejectedByController {
                action: "manual_update",
            })
        }
    }

    /// Run the controller's installed-files audit. Empty output means
    /// nothing is missing.
    pub async fn files_check<C: ControllerClient>(client: &C) -> Result<String> {
        let response = client.files_check().await?;
        Ok(response.files_check_output)
    }

    /// The controller's current shell date string, if the clock page
    /// endpoint reports one.
    pub async fn shell_date<C: ControllerClient>(client: &C) -> Result<Option<String>> {
        let response = client.clock_page_init().await?;
        Ok(response.shell_date)
    }

    /// Trigger an NTP synchronization on the controller.
    pub async fn sync_time<C: ControllerClient>(client: &C) -> Result<()> {
        client.sync_time().await
    }

    /// Set the hardware clock. The response echoes the applied time.
    pub async fn set_time<C: ControllerClient>(
        client: &C,
        hours: u8,
        minutes: u8,
    ) -> Result<SetTimeResponse, MaintenanceError> {
        let response = client
            .set_time(hours, minutes)
            .await
            .map_err(MaintenanceError::ConnectionFailure)?;
        if response.state.is_ok() {
            Ok(response)
        } else {
            Err(MaintenanceError::RejectedByController { action: "set_time" })
        }
    }

    pub async fn set_ntp<C: ControllerClient>(client: &C, ntp: bool) -> Result<()> {
        client.set_ntp(ntp).await
    }

    pub async fn stats<C: ControllerClient>(client: &C) -> Result<StatsResponse> {
        client.get_stats().await
    }

    pub async fn set_anonymous_mqtt<C: ControllerClient>(client: &C, allow: bool) -> Result<()> {
        client.anonymous_mqtt(allow).await
    }

    /// Drop the published backup download directory. Failures are logged
    /// and swallowed; a stale symlink is harmless and cleared on the next
    /// backup anyway.
    pub async fn release_backup_download<C: ControllerClient>(client: &C) {
        match client.unlink_backup_download_dir().await {
            Ok(response) if response.state.is_ok() => {}
            Ok(_) => warn!("controller declined to unlink the backup download dir"),
            Err(e) => warn!("could not unlink the backup download dir: {e:#}"),
        }
    }
}
