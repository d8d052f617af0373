use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::config::DeviceConfig;
use crate::error::{Error, Result};
use crate::platform::shell::{CommandRunner, CommandTemplate, default_runner, run_checked};

/// Remote picture display that stores uploaded images by identifier.
#[async_trait]
pub trait DisplayDevice: Send + Sync {
    /// Store `image` on the device and return the identifier it was given.
    async fn upload(&self, image: &[u8]) -> Result<String>;
    /// Show an already stored image.
    async fn select(&self, identifier: &str) -> Result<()>;
    /// Remove stored images; callers keep batches small.
    async fn delete(&self, identifiers: &[String]) -> Result<()>;
    /// Identifiers currently stored on the device.
    async fn list(&self) -> Result<Vec<String>>;
}

pub const FILE_PLACEHOLDER: &str = "@FILE@";
pub const ID_PLACEHOLDER: &str = "@ID@";
pub const IDS_PLACEHOLDER: &str = "@IDS@";

/// Drives the display through operator-supplied shell commands
/// (e.g. a `tv-updater upload @FILE@` style helper).
pub struct CommandDevice {
    upload: CommandTemplate,
    select: CommandTemplate,
    delete: CommandTemplate,
    list: CommandTemplate,
    timeout: Duration,
    staging_dir: Option<PathBuf>,
    runner: CommandRunner,
}

impl std::fmt::Debug for CommandDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandDevice")
            .field("upload", &self.upload)
            .field("select", &self.select)
            .field("delete", &self.delete)
            .field("list", &self.list)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl CommandDevice {
    pub fn new(cfg: &DeviceConfig) -> Self {
        Self::with_runner(cfg, default_runner())
    }

    pub fn with_runner(cfg: &DeviceConfig, runner: CommandRunner) -> Self {
        Self {
            upload: CommandTemplate::new(cfg.upload_command.clone()),
            select: CommandTemplate::new(cfg.select_command.clone()),
            delete: CommandTemplate::new(cfg.delete_command.clone()),
            list: CommandTemplate::new(cfg.list_command.clone()),
            timeout: cfg.command_timeout,
            staging_dir: cfg.staging_dir.clone(),
            runner,
        }
    }

    fn stage(&self, image: &[u8]) -> Result<tempfile::TempPath> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("hass-frame-upload-").suffix(".png");
        let mut file = match &self.staging_dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };
        file.write_all(image)?;
        file.flush()?;
        Ok(file.into_temp_path())
    }
}

#[async_trait]
impl DisplayDevice for CommandDevice {
    async fn upload(&self, image: &[u8]) -> Result<String> {
        let staged = self.stage(image)?;
        let path = staged.to_string_lossy().into_owned();
        let command = self.upload.render(&[(FILE_PLACEHOLDER, &path)]);
        let output = run_checked(&self.runner, "upload", command, self.timeout).await?;
        // `staged` is removed when dropped here.
        let identifier = parse_upload_identifier(&output.stdout)
            .ok_or_else(|| Error::device("upload", "upload command printed no identifier"))?;
        info!(identifier, bytes = image.len(), "uploaded image");
        Ok(identifier)
    }

    async fn select(&self, identifier: &str) -> Result<()> {
        let command = self.select.render(&[(ID_PLACEHOLDER, identifier)]);
        run_checked(&self.runner, "select", command, self.timeout).await?;
        debug!(identifier, "selected image");
        Ok(())
    }

    async fn delete(&self, identifiers: &[String]) -> Result<()> {
        if identifiers.is_empty() {
            return Ok(());
        }
        let joined = identifiers.join(",");
        let command = self.delete.render(&[(IDS_PLACEHOLDER, &joined)]);
        run_checked(&self.runner, "delete", command, self.timeout).await?;
        debug!(count = identifiers.len(), identifiers = joined, "deleted images");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>> {
        let command = self.list.render(&[]);
        let output = run_checked(&self.runner, "list", command, self.timeout).await?;
        Ok(parse_listing(&output.stdout))
    }
}

/// The helper logs progress before it prints the new name; take the last line.
pub fn parse_upload_identifier(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()
        .map(str::to_string)
}

/// One item per line, identifier first, further tab-separated columns ignored.
pub fn parse_listing(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && *line != "No content")
        .filter_map(|line| line.split('\t').next())
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .collect()
}
