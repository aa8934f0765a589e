use crate::controller_client::{ControllerClient, UploadChunk};
use crate::error::MaintenanceError;
use base64::{Engine, engine::general_purpose::STANDARD};
use log::{info, warn};

/// Fixed download location of a freshly created backup archive, relative to
/// the controller base URL.
pub const BACKUP_DOWNLOAD_PATH: &str = "/extensions/power-settings/backup/candle_backup.tar";

/// Position of one part within a chunked archive transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkDescriptor {
    /// 1-based part number.
    pub index: u32,
    pub total: u32,
}

impl ChunkDescriptor {
    /// The whole archive in one part, which is all the controller currently
    /// accepts.
    pub const SINGLE: ChunkDescriptor = ChunkDescriptor { index: 1, total: 1 };
}

/// A restore archive prepared for upload.
#[derive(Clone, Debug)]
pub struct BackupArchive {
    pub filename: String,
    /// Not sent over the wire; kept so a shell can offer the archive back
    /// for download with the right content type.
    pub mime_type: String,
    pub data: Vec<u8>,
    pub chunk: ChunkDescriptor,
}

impl BackupArchive {
    pub fn new(filename: &str, data: Vec<u8>) -> Self {
        BackupArchive {
            filename: sanitize_filename(filename),
            mime_type: "application/x-tar".to_string(),
            data,
            chunk: ChunkDescriptor::SINGLE,
        }
    }
}

/// Replace anything outside ASCII alphanumerics and dots with underscores
/// and lowercase the rest. Matches what the controller does to the name on
/// its side, so both ends agree on the stored filename.
pub fn sanitize_filename(filename: &str) -> String {
    filename
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Backup archive creation and restore upload.
pub struct BackupTransferManager;

impl BackupTransferManager {
    /// Ask the controller to assemble a backup archive. On success, returns
    /// the path the archive can be downloaded from.
    pub async fn create_backup<C: ControllerClient>(
        client: &C,
    ) -> Result<&'static str, MaintenanceError> {
        // The init call clears stale archives and checks disk space.
        let init = client
            .backup_init()
            .await
            .map_err(MaintenanceError::ConnectionFailure)?;
        if !init.state.is_ok() {
            warn!("controller refused to prepare for a backup");
            return Err(MaintenanceError::BackupCreateFailed);
        }

        let response = client
            .create_backup()
            .await
            .map_err(MaintenanceError::ConnectionFailure)?;
        if response.state.is_ok() {
            info!("backup archive ready at {BACKUP_DOWNLOAD_PATH}");
            Ok(BACKUP_DOWNLOAD_PATH)
        } else {
            warn!("controller failed to create the backup archive");
            Err(MaintenanceError::BackupCreateFailed)
        }
    }

    /// Upload a restore archive. The controller unpacks it and restores on
    /// its next reboot.
    pub async fn restore<C: ControllerClient>(
        client: &C,
        archive: BackupArchive,
    ) -> Result<(), MaintenanceError> {
        let chunk = UploadChunk {
            filename: archive.filename,
            filedata: STANDARD.encode(&archive.data),
            parts_total: archive.chunk.total,
            parts_current: archive.chunk.index,
        };

        let response = client
            .upload_chunk(chunk)
            .await
            .map_err(MaintenanceError::ConnectionFailure)?;
        if response.state.is_ok() {
            info!("restore archive accepted");
            Ok(())
        } else {
            warn!("controller did not accept the restore archive");
            Err(MaintenanceError::RestoreFailed)
        }
    }
}
