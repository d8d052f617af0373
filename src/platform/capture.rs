use std::io::Cursor;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use image::ImageReader;
use tracing::{debug, info, instrument};

use crate::config::CaptureConfig;
use crate::error::{Error, Result};
use crate::platform::shell::{CommandRunner, CommandTemplate, default_runner, run_checked};

/// Renders the dashboard to an encoded image.
#[async_trait]
pub trait Capture: Send + Sync {
    async fn capture(&self) -> Result<Vec<u8>>;
}

pub const OUTPUT_PLACEHOLDER: &str = "@OUTPUT@";

/// Runs a screenshot command (typically headless chromium) that writes to
/// `@OUTPUT@`, then hands back the file contents once they decode.
pub struct CommandCapture {
    command: CommandTemplate,
    timeout: Duration,
    output_dir: Option<PathBuf>,
    runner: CommandRunner,
}

impl std::fmt::Debug for CommandCapture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandCapture")
            .field("command", &self.command)
            .field("timeout", &self.timeout)
            .field("output_dir", &self.output_dir)
            .finish()
    }
}

impl CommandCapture {
    pub fn new(cfg: &CaptureConfig) -> Self {
        Self::with_runner(cfg, default_runner())
    }

    pub fn with_runner(cfg: &CaptureConfig, runner: CommandRunner) -> Self {
        Self {
            command: CommandTemplate::new(cfg.command.clone()),
            timeout: cfg.timeout,
            output_dir: cfg.output_dir.clone(),
            runner,
        }
    }
}

#[async_trait]
impl Capture for CommandCapture {
    #[instrument(skip(self), fields(timeout = ?self.timeout))]
    async fn capture(&self) -> Result<Vec<u8>> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("hass-frame-capture-").suffix(".png");
        let target = match &self.output_dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        }
        .into_temp_path();

        let path = target.to_string_lossy().into_owned();
        let command = self.command.render(&[(OUTPUT_PLACEHOLDER, &path)]);
        run_checked(&self.runner, "capture", command, self.timeout)
            .await
            .map_err(|err| match err {
                Error::Device { message, .. } => Error::Capture(message),
                other => other,
            })?;

        let bytes = tokio::fs::read(&target).await?;
        let (width, height) = validate_image(&bytes)?;
        info!(width, height, bytes = bytes.len(), "captured dashboard");
        Ok(bytes)
    }
}

/// Dimensions of an encoded image; rejects empty or undecodable output.
pub fn validate_image(bytes: &[u8]) -> Result<(u32, u32)> {
    if bytes.is_empty() {
        return Err(Error::Capture("capture produced an empty file".to_string()));
    }
    let reader = ImageReader::new(Cursor::new(bytes)).with_guessed_format()?;
    debug!(format = ?reader.format(), "decoding capture header");
    if reader.format().is_none() {
        return Err(Error::Capture("capture output is not a known image format".to_string()));
    }
    Ok(reader.into_dimensions()?)
}
