use anyhow::{Context, Result};
use std::{env, sync::OnceLock, time::Duration};

/// Application configuration loaded and validated at startup
#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Controller endpoint configuration
    pub controller: ControllerConfig,

    /// Progress poller configuration
    pub poller: PollerConfig,

    /// Post-reboot reconnect configuration
    pub reconnect: ReconnectConfig,
}

#[derive(Clone, Debug)]
pub struct ControllerConfig {
    pub base_url: String,
}

#[derive(Clone, Debug)]
pub struct PollerConfig {
    /// Cadence of the progress poll loop.
    pub interval: Duration,
    /// Consecutive transport failures tolerated before the poller gives up.
    /// `None` means poll failures are swallowed indefinitely, which matches
    /// the controller's own expectation that it will come back eventually.
    pub failure_cap: Option<u32>,
}

#[derive(Clone, Debug)]
pub struct ReconnectConfig {
    /// Delay between handshake probes after a reboot-inducing action.
    pub delay: Duration,
    /// Probe attempts before giving up. `None` retries until success.
    pub attempt_cap: Option<u32>,
}

impl AppConfig {
    /// Get or load the application configuration
    ///
    /// Returns a reference to the cached configuration. On first call, it
    /// loads and validates all configuration from environment variables.
    /// Subsequent calls return the cached instance.
    ///
    /// # Panics
    /// Panics if configuration loading fails. This is intentional as the
    /// crate cannot function without a valid configuration.
    pub fn get() -> &'static Self {
        static APP_CONFIG: OnceLock<AppConfig> = OnceLock::new();
        APP_CONFIG.get_or_init(|| {
            Self::load_internal().expect("failed to load application configuration")
        })
    }

    fn load_internal() -> Result<Self> {
        Ok(Self {
            controller: ControllerConfig::load()?,
            poller: PollerConfig::load()?,
            reconnect: ReconnectConfig::load()?,
        })
    }
}

impl ControllerConfig {
    fn load() -> Result<Self> {
        let base_url =
            env::var("CONTROLLER_BASE_URL").unwrap_or_else(|_| "http://candle.local".to_string());

        Ok(Self { base_url })
    }
}

impl PollerConfig {
    fn load() -> Result<Self> {
        let interval = env::var("POLL_INTERVAL_SECS")
            .unwrap_or_else(|_| "10".to_string())
            .parse::<u64>()
            .context("failed to parse POLL_INTERVAL_SECS: invalid format")?;

        let failure_cap = parse_optional_cap("POLL_FAILURE_CAP")?;

        Ok(Self {
            interval: Duration::from_secs(interval),
            failure_cap,
        })
    }
}

impl ReconnectConfig {
    fn load() -> Result<Self> {
        let delay = env::var("RECONNECT_DELAY_SECS")
            .unwrap_or_else(|_| "5".to_string())
            .parse::<u64>()
            .context("failed to parse RECONNECT_DELAY_SECS: invalid format")?;

        let attempt_cap = parse_optional_cap("RECONNECT_ATTEMPT_CAP")?;

        Ok(Self {
            delay: Duration::from_secs(delay),
            attempt_cap,
        })
    }
}

fn parse_optional_cap(var: &str) -> Result<Option<u32>> {
    env::var(var)
        .ok()
        .map(|v| v.parse::<u32>())
        .transpose()
        .with_context(|| format!("failed to parse {var}: invalid format"))
}
