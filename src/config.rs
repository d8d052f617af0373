use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use serde::Deserialize;
use tracing::warn;

use crate::events::TrackedEntities;
use crate::platform::capture::OUTPUT_PLACEHOLDER;
use crate::platform::device::{FILE_PLACEHOLDER, ID_PLACEHOLDER, IDS_PLACEHOLDER};

/// Environment variable consulted when `hub.token` is omitted.
pub const TOKEN_ENV: &str = "HASS_TOKEN";
pub const DEFAULT_LEDGER_PATH: &str = "/var/lib/hass-frame/ledger.db";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Configuration {
    /// Automation hub connection.
    pub hub: HubConfig,
    /// Hub entities mirrored into the state bus.
    pub entities: EntitiesConfig,
    /// Dashboard screenshot step.
    pub capture: CaptureConfig,
    /// Display device commands.
    pub device: DeviceConfig,
    /// Snapshot loop pacing and retention.
    #[serde(default)]
    pub snapshot: SnapshotOptions,
    /// Art rotation loop.
    #[serde(default)]
    pub art: ArtOptions,
    /// Uploaded-content ledger.
    #[serde(default)]
    pub ledger: LedgerConfig,
}

impl Configuration {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_yaml_str(&s)
    }

    pub fn from_yaml_str(s: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(s)?)
    }

    /// Validate runtime invariants, taking the hub token from `HASS_TOKEN`
    /// when the file does not set one.
    pub fn validated(self) -> Result<Self> {
        self.validated_with(std::env::var(TOKEN_ENV).ok())
    }

    pub fn validated_with(mut self, env_token: Option<String>) -> Result<Self> {
        if self.hub.token.as_deref().is_none_or(|t| t.trim().is_empty()) {
            self.hub.token = env_token.filter(|t| !t.trim().is_empty());
        }
        self.hub.validate().context("invalid hub configuration")?;
        self.entities
            .validate()
            .context("invalid entities configuration")?;
        self.capture
            .validate()
            .context("invalid capture configuration")?;
        self.device
            .validate()
            .context("invalid device configuration")?;
        self.snapshot
            .validate()
            .context("invalid snapshot configuration")?;
        self.art.validate().context("invalid art configuration")?;
        ensure!(
            !self.ledger.path.as_os_str().is_empty(),
            "ledger.path must not be empty"
        );
        Ok(self)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct HubConfig {
    /// Hub base address, e.g. `http://homeassistant.local:8123`.
    pub url: String,
    /// Long-lived access token. Falls back to `HASS_TOKEN`.
    pub token: Option<String>,
    /// Pause between connection attempts after any failure.
    #[serde(with = "humantime_serde")]
    pub reconnect_backoff: Duration,
    /// Upper bound for connect plus authentication.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl HubConfig {
    const fn default_reconnect_backoff() -> Duration {
        Duration::from_secs(60)
    }

    const fn default_connect_timeout() -> Duration {
        Duration::from_secs(30)
    }

    fn validate(&self) -> Result<()> {
        let url = self.url.trim();
        ensure!(!url.is_empty(), "hub.url must not be empty");
        ensure!(
            self.token.as_deref().is_some_and(|t| !t.trim().is_empty()),
            "hub.token is not set and {TOKEN_ENV} is empty"
        );
        ensure!(
            !self.reconnect_backoff.is_zero(),
            "hub.reconnect-backoff must be positive"
        );
        ensure!(
            !self.connect_timeout.is_zero(),
            "hub.connect-timeout must be positive"
        );
        Ok(())
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            token: None,
            reconnect_backoff: Self::default_reconnect_backoff(),
            connect_timeout: Self::default_connect_timeout(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct EntitiesConfig {
    /// Entity whose `on` state means the display is powered.
    pub power: String,
    /// Entity whose `on` state means art mode is wanted.
    pub art_mode: String,
}

impl EntitiesConfig {
    pub fn tracked(&self) -> TrackedEntities {
        TrackedEntities {
            power: self.power.trim().to_string(),
            art_mode: self.art_mode.trim().to_string(),
        }
    }

    fn validate(&self) -> Result<()> {
        ensure!(!self.power.trim().is_empty(), "entities.power must not be empty");
        ensure!(
            !self.art_mode.trim().is_empty(),
            "entities.art-mode must not be empty"
        );
        ensure!(
            self.power.trim() != self.art_mode.trim(),
            "entities.power and entities.art-mode must be different entities"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct CaptureConfig {
    /// Screenshot command; `@OUTPUT@` is replaced with the PNG path to write.
    pub command: String,
    /// Kill the capture command after this long.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Directory for the transient screenshot file (system temp dir if unset).
    pub output_dir: Option<PathBuf>,
}

impl CaptureConfig {
    const fn default_timeout() -> Duration {
        Duration::from_secs(90)
    }

    fn validate(&self) -> Result<()> {
        ensure_template(&self.command, "capture.command", OUTPUT_PLACEHOLDER)?;
        ensure!(!self.timeout.is_zero(), "capture.timeout must be positive");
        Ok(())
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            timeout: Self::default_timeout(),
            output_dir: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct DeviceConfig {
    /// Upload command; `@FILE@` is the image path, stdout's last line is the new id.
    pub upload_command: String,
    /// Select command; `@ID@` is the content id.
    pub select_command: String,
    /// Delete command; `@IDS@` is a comma-separated id list.
    pub delete_command: String,
    /// List command; one id per line, first tab-separated column.
    pub list_command: String,
    /// Kill any device command after this long.
    #[serde(with = "humantime_serde")]
    pub command_timeout: Duration,
    /// Most ids passed to a single delete call.
    pub delete_batch_size: usize,
    /// Directory for staged upload files (system temp dir if unset).
    pub staging_dir: Option<PathBuf>,
}

impl DeviceConfig {
    const fn default_command_timeout() -> Duration {
        Duration::from_secs(60)
    }

    pub const fn default_delete_batch_size() -> usize {
        5
    }

    pub fn validate(&self) -> Result<()> {
        ensure_template(&self.upload_command, "device.upload-command", FILE_PLACEHOLDER)?;
        ensure_template(&self.select_command, "device.select-command", ID_PLACEHOLDER)?;
        ensure_template(&self.delete_command, "device.delete-command", IDS_PLACEHOLDER)?;
        ensure!(
            !self.list_command.trim().is_empty(),
            "device.list-command must not be blank"
        );
        ensure!(
            !self.command_timeout.is_zero(),
            "device.command-timeout must be positive"
        );
        ensure!(
            self.delete_batch_size >= 1,
            "device.delete-batch-size must be >= 1"
        );
        Ok(())
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            upload_command: String::new(),
            select_command: String::new(),
            delete_command: String::new(),
            list_command: String::new(),
            command_timeout: Self::default_command_timeout(),
            delete_batch_size: Self::default_delete_batch_size(),
            staging_dir: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct SnapshotOptions {
    /// How long a snapshot stays up before the next capture.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Pause after a failed cycle.
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
    /// Most recent uploads kept on the device.
    pub retain: usize,
    /// Switch the display to each snapshot right after uploading it.
    pub select_after_upload: bool,
}

impl SnapshotOptions {
    const fn default_interval() -> Duration {
        Duration::from_secs(300)
    }

    const fn default_retry_delay() -> Duration {
        Duration::from_secs(5)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(!self.interval.is_zero(), "snapshot.interval must be positive");
        ensure!(
            !self.retry_delay.is_zero(),
            "snapshot.retry-delay must be positive"
        );
        ensure!(self.retain >= 1, "snapshot.retain must be >= 1");
        Ok(())
    }
}

impl Default for SnapshotOptions {
    fn default() -> Self {
        Self {
            interval: Self::default_interval(),
            retry_delay: Self::default_retry_delay(),
            retain: 1,
            select_after_upload: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct ArtOptions {
    /// Device content ids to rotate through.
    pub files: Vec<String>,
    /// Permute `files` once at startup.
    pub shuffle: bool,
    /// Deterministic seed for the startup shuffle.
    pub shuffle_seed: Option<u64>,
    /// How long each art piece stays up.
    #[serde(with = "humantime_serde")]
    pub rotate_interval: Duration,
    /// Pause after a failed selection.
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
}

impl ArtOptions {
    const fn default_rotate_interval() -> Duration {
        Duration::from_secs(300)
    }

    const fn default_retry_delay() -> Duration {
        Duration::from_secs(5)
    }

    fn validate(&mut self) -> Result<()> {
        ensure!(
            !self.rotate_interval.is_zero(),
            "art.rotate-interval must be positive"
        );
        ensure!(!self.retry_delay.is_zero(), "art.retry-delay must be positive");
        self.files.retain(|f| !f.trim().is_empty());
        if self.files.is_empty() {
            warn!("art.files is empty; art mode will leave the display untouched");
        }
        Ok(())
    }
}

impl Default for ArtOptions {
    fn default() -> Self {
        Self {
            files: Vec::new(),
            shuffle: false,
            shuffle_seed: None,
            rotate_interval: Self::default_rotate_interval(),
            retry_delay: Self::default_retry_delay(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct LedgerConfig {
    /// SQLite file recording uploaded snapshot ids.
    pub path: PathBuf,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_LEDGER_PATH),
        }
    }
}

fn ensure_template(command: &str, key: &str, placeholder: &str) -> Result<()> {
    ensure!(!command.trim().is_empty(), "{key} must not be blank");
    ensure!(
        command.contains(placeholder),
        "{key} must reference {placeholder}"
    );
    Ok(())
}
