use crate::config::AppConfig;
use anyhow::{Context, Result, ensure};
use log::{debug, info};
#[cfg(any(test, feature = "mock"))]
use mockall::automock;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::fmt::Debug;
use trait_variant::make;

/// Acknowledgement field of a maintenance response. The controller answers
/// some actions with a boolean and others with `"ok"`/`"error"`.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum AckState {
    Flag(bool),
    Text(String),
}

impl AckState {
    pub fn is_ok(&self) -> bool {
        match self {
            AckState::Flag(accepted) => *accepted,
            AckState::Text(text) => text == "ok",
        }
    }
}

impl Default for AckState {
    fn default() -> Self {
        AckState::Flag(false)
    }
}

/// Disk usage triple as reported by the controller: total, used, free bytes.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
pub struct DiskUsage(pub u64, pub u64, pub u64);

impl DiskUsage {
    pub fn total(&self) -> u64 {
        self.0
    }

    pub fn free(&self) -> u64 {
        self.2
    }
}

/// Update-flavor flags, passed through to the controller unchanged.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct UpdateFlags {
    pub cutting_edge: bool,
    pub live_update: bool,
}

/// Factory-reset retention flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ResetFlags {
    pub keep_z2m: bool,
    pub keep_bluetooth: bool,
}

/// One part of an uploaded archive. The current protocol always sends a
/// single part, but the wire format carries part numbers for larger
/// archives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadChunk {
    pub filename: String,
    /// Base64 encoded payload.
    pub filedata: String,
    pub parts_total: u32,
    pub parts_current: u32,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct InitResponse {
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub hours: u8,
    #[serde(default)]
    pub minutes: u8,
    #[serde(default)]
    pub ntp: bool,
    #[serde(default)]
    pub allow_anonymous_mqtt: bool,
    #[serde(default)]
    pub hardware_clock_detected: bool,
    #[serde(default)]
    pub candle_version: Option<String>,
    #[serde(default)]
    pub candle_original_version: Option<String>,
    #[serde(default)]
    pub ro_exists: bool,
    #[serde(default)]
    pub old_overlay_active: bool,
    #[serde(default)]
    pub post_bootup_actions_supported: bool,
    #[serde(default)]
    pub live_update_attempted: bool,
    #[serde(default)]
    pub system_update_in_progress: bool,
    #[serde(default)]
    pub files_check_exists: bool,
    #[serde(default)]
    pub update_needs_two_reboots: bool,
    #[serde(default)]
    pub bootup_actions_failed: bool,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct PollResponse {
    #[serde(default)]
    pub dmesg: String,
    #[serde(default)]
    pub system_update_in_progress: bool,
    #[serde(default)]
    pub old_overlay_active: bool,
    #[serde(default)]
    pub ro_exists: bool,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct StateResponse {
    #[serde(default)]
    pub state: AckState,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct StartUpdateResponse {
    #[serde(default)]
    pub state: AckState,
    #[serde(default)]
    pub live_update: bool,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct BackupInitResponse {
    #[serde(default)]
    pub state: AckState,
    #[serde(default)]
    pub backup_exists: bool,
    #[serde(default)]
    pub restore_exists: bool,
    #[serde(default)]
    pub disk_usage: Option<DiskUsage>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct FilesCheckResponse {
    /// Empty output means no missing files.
    #[serde(default)]
    pub files_check_output: String,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct ClockPageResponse {
    #[serde(default)]
    pub shell_date: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct SetTimeResponse {
    #[serde(default)]
    pub state: AckState,
    #[serde(default)]
    pub hours: u8,
    #[serde(default)]
    pub minutes: u8,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct StatsResponse {
    #[serde(default)]
    pub total_memory: Option<u64>,
    #[serde(default)]
    pub available_memory: Option<u64>,
    #[serde(default)]
    pub free_memory: Option<u64>,
    #[serde(default)]
    pub disk_usage: Option<DiskUsage>,
    #[serde(default)]
    pub low_voltage: Option<bool>,
}

// Wire payloads. Every ajax body carries its action name.

#[derive(Debug, Serialize)]
struct ActionRequest {
    action: &'static str,
}

#[derive(Debug, Serialize)]
struct InitRequest {
    init: u8,
}

#[derive(Debug, Serialize)]
struct StartSystemUpdateRequest {
    action: &'static str,
    cutting_edge: bool,
    live_update: bool,
}

#[derive(Debug, Serialize)]
struct FactoryResetRequest {
    action: &'static str,
    keep_z2m: bool,
    keep_bluetooth: bool,
}

#[derive(Debug, Serialize)]
struct AnonymousMqttRequest {
    action: &'static str,
    allow_anonymous_mqtt: bool,
}

#[derive(Debug, Serialize)]
struct UploadRequest {
    action: &'static str,
    filename: String,
    filedata: String,
    parts_total: u32,
    parts_current: u32,
}

#[derive(Debug, Serialize)]
struct SetTimeRequest {
    hours: u8,
    minutes: u8,
}

#[derive(Debug, Serialize)]
struct SetNtpRequest {
    ntp: bool,
}

#[derive(Debug, Serialize)]
struct SystemActionRequest {
    action: &'static str,
}

/// Client for the controller's maintenance endpoint. All other components
/// reach the controller exclusively through this trait so tests can inject
/// a fake.
#[make(Send)]
#[cfg_attr(any(test, feature = "mock"), automock)]
pub trait ControllerClient {
    /// Initial handshake; also used as the post-reboot liveness probe.
    async fn init(&self) -> Result<InitResponse>;
    async fn poll(&self) -> Result<PollResponse>;
    async fn disable_overlay(&self) -> Result<StateResponse>;
    async fn start_system_update(&self, flags: UpdateFlags) -> Result<StartUpdateResponse>;
    async fn manual_update(&self) -> Result<StateResponse>;
    async fn factory_reset(&self, flags: ResetFlags) -> Result<StateResponse>;
    async fn backup_init(&self) -> Result<BackupInitResponse>;
    async fn create_backup(&self) -> Result<StateResponse>;
    async fn unlink_backup_download_dir(&self) -> Result<StateResponse>;
    async fn upload_chunk(&self, chunk: UploadChunk) -> Result<StateResponse>;
    async fn files_check(&self) -> Result<FilesCheckResponse>;
    async fn clock_page_init(&self) -> Result<ClockPageResponse>;
    async fn sync_time(&self) -> Result<()>;
    async fn set_time(&self, hours: u8, minutes: u8) -> Result<SetTimeResponse>;
    async fn set_ntp(&self, ntp: bool) -> Result<()>;
    async fn get_stats(&self) -> Result<StatsResponse>;
    async fn anonymous_mqtt(&self, allow: bool) -> Result<()>;
    /// Generic device restart, a separate endpoint from the maintenance API.
    async fn restart_system(&self) -> Result<()>;
}

#[derive(Clone)]
pub struct PowerSettingsClient {
    client: Client,
    base_url: String,
}

impl PowerSettingsClient {
    // API endpoint constants
    const AJAX_ENDPOINT: &str = "/extensions/power-settings/api/ajax";
    const INIT_ENDPOINT: &str = "/extensions/power-settings/api/init";
    const SET_TIME_ENDPOINT: &str = "/extensions/power-settings/api/set-time";
    const SET_NTP_ENDPOINT: &str = "/extensions/power-settings/api/set-ntp";
    const SAVE_ENDPOINT: &str = "/extensions/power-settings/api/save";
    const SYSTEM_ACTIONS_ENDPOINT: &str = "/settings/system/actions";

    pub fn new() -> Result<Self> {
        Ok(Self::with_base_url(
            AppConfig::get().controller.base_url.clone(),
        ))
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        PowerSettingsClient {
            client: Client::new(),
            base_url: base_url.into(),
        }
    }

    fn build_url(&self, path: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        format!("{base}/{path}")
    }

    /// POST request with JSON body, parsing the JSON response
    async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: impl Debug + Serialize,
    ) -> Result<T> {
        let body = self.post_raw(path, body).await?;
        serde_json::from_str(&body).context("failed to parse controller response")
    }

    /// POST request with JSON body, discarding the response body
    async fn post_unit(&self, path: &str, body: impl Debug + Serialize) -> Result<()> {
        self.post_raw(path, body).await.map(|_| ())
    }

    async fn post_raw(&self, path: &str, body: impl Debug + Serialize) -> Result<String> {
        let url = self.build_url(path);
        debug!("POST {url} with body: {body:?}");

        let res = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .context(format!("failed to send POST request to {url}"))?;

        handle_http_response(res, &format!("POST {url}")).await
    }
}

/// Handle HTTP response by checking status and extracting the body text
async fn handle_http_response(res: Response, context_msg: &str) -> Result<String> {
    let status = res.status();
    let body = res.text().await.context("failed to read response body")?;

    ensure!(
        status.is_success(),
        "{context_msg} failed with status {status} and body: {body}"
    );

    Ok(body)
}

impl ControllerClient for PowerSettingsClient {
    async fn init(&self) -> Result<InitResponse> {
        self.post_json(Self::INIT_ENDPOINT, InitRequest { init: 1 })
            .await
    }

    async fn poll(&self) -> Result<PollResponse> {
        self.post_json(Self::AJAX_ENDPOINT, ActionRequest { action: "poll" })
            .await
    }

    async fn disable_overlay(&self) -> Result<StateResponse> {
        info!("requesting overlay disable");
        self.post_json(
            Self::AJAX_ENDPOINT,
            ActionRequest {
                action: "disable_overlay",
            },
        )
        .await
    }

    async fn start_system_update(&self, flags: UpdateFlags) -> Result<StartUpdateResponse> {
        info!("requesting system update: {flags:?}");
        self.post_json(
            Self::AJAX_ENDPOINT,
            StartSystemUpdateRequest {
                action: "start_system_update",
                cutting_edge: flags.cutting_edge,
                live_update: flags.live_update,
            },
        )
        .await
    }

    async fn manual_update(&self) -> Result<StateResponse> {
        info!("requesting manual update staging");
        self.post_json(
            Self::AJAX_ENDPOINT,
            ActionRequest {
                action: "manual_update",
            },
        )
        .await
    }

    async fn factory_reset(&self, flags: ResetFlags) -> Result<StateResponse> {
        info!("requesting factory reset: {flags:?}");
        self.post_json(
            Self::AJAX_ENDPOINT,
            FactoryResetRequest {
                action: "reset",
                keep_z2m: flags.keep_z2m,
                keep_bluetooth: flags.keep_bluetooth,
            },
        )
        .await
    }

    async fn backup_init(&self) -> Result<BackupInitResponse> {
        self.post_json(
            Self::AJAX_ENDPOINT,
            ActionRequest {
                action: "backup_init",
            },
        )
        .await
    }

    async fn create_backup(&self) -> Result<StateResponse> {
        info!("requesting backup archive creation");
        self.post_json(
            Self::AJAX_ENDPOINT,
            ActionRequest {
                action: "create_backup",
            },
        )
        .await
    }

    async fn unlink_backup_download_dir(&self) -> Result<StateResponse> {
        self.post_json(
            Self::AJAX_ENDPOINT,
            ActionRequest {
                action: "unlink_backup_download_dir",
            },
        )
        .await
    }

    async fn upload_chunk(&self, chunk: UploadChunk) -> Result<StateResponse> {
        info!(
            "uploading {} (part {} of {})",
            chunk.filename, chunk.parts_current, chunk.parts_total
        );
        self.post_json(
            Self::SAVE_ENDPOINT,
            UploadRequest {
                action: "upload",
                filename: chunk.filename,
                filedata: chunk.filedata,
                parts_total: chunk.parts_total,
                parts_current: chunk.parts_current,
            },
        )
        .await
    }

    async fn files_check(&self) -> Result<FilesCheckResponse> {
        self.post_json(
            Self::AJAX_ENDPOINT,
            ActionRequest {
                action: "files_check",
            },
        )
        .await
    }

    async fn clock_page_init(&self) -> Result<ClockPageResponse> {
        self.post_json(
            Self::AJAX_ENDPOINT,
            ActionRequest {
                action: "clock_page_init",
            },
        )
        .await
    }

    async fn sync_time(&self) -> Result<()> {
        self.post_unit(Self::AJAX_ENDPOINT, ActionRequest { action: "sync_time" })
            .await
    }

    async fn set_time(&self, hours: u8, minutes: u8) -> Result<SetTimeResponse> {
        self.post_json(Self::SET_TIME_ENDPOINT, SetTimeRequest { hours, minutes })
            .await
    }

    async fn set_ntp(&self, ntp: bool) -> Result<()> {
        self.post_unit(Self::SET_NTP_ENDPOINT, SetNtpRequest { ntp })
            .await
    }

    async fn get_stats(&self) -> Result<StatsResponse> {
        self.post_json(Self::AJAX_ENDPOINT, ActionRequest { action: "get_stats" })
            .await
    }

    async fn anonymous_mqtt(&self, allow: bool) -> Result<()> {
        self.post_unit(
            Self::AJAX_ENDPOINT,
            AnonymousMqttRequest {
                action: "anonymous_mqtt",
                allow_anonymous_mqtt: allow,
            },
        )
        .await
    }

    async fn restart_system(&self) -> Result<()> {
        info!("requesting controller restart");
        self.post_unit(
            Self::SYSTEM_ACTIONS_ENDPOINT,
            SystemActionRequest {
                action: "restartSystem",
            },
        )
        .await
    }
}
