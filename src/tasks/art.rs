use std::sync::Arc;

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::ArtOptions;
use crate::platform::device::DisplayDevice;
use crate::state::{FrameState, StateBus, WaitOutcome};

/// Cyclic cursor over the configured art pieces.
#[derive(Debug, Clone)]
pub struct ArtRotation {
    items: Vec<String>,
    next: usize,
}

impl ArtRotation {
    pub fn new(items: Vec<String>) -> Self {
        Self { items, next: 0 }
    }

    /// Build from config, permuting once when `shuffle` is set.
    pub fn from_options(options: &ArtOptions) -> Self {
        let mut items = options.files.clone();
        if options.shuffle {
            let mut rng = match options.shuffle_seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_os_rng(),
            };
            items.shuffle(&mut rng);
            debug!(order = ?items, "shuffled art rotation");
        }
        Self::new(items)
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[String] {
        &self.items
    }

    /// Next piece, wrapping after the last one. `None` only when empty.
    pub fn advance(&mut self) -> Option<&str> {
        if self.items.is_empty() {
            return None;
        }
        let index = self.next;
        self.next = (index + 1) % self.items.len();
        self.items.get(index).map(String::as_str)
    }
}

/// Rotates art on the display while it is powered and art mode is on.
pub struct ArtScheduler {
    bus: Arc<StateBus>,
    device: Arc<dyn DisplayDevice>,
    rotation: ArtRotation,
    options: ArtOptions,
}

impl ArtScheduler {
    pub fn new(bus: Arc<StateBus>, device: Arc<dyn DisplayDevice>, options: ArtOptions) -> Self {
        Self {
            rotation: ArtRotation::from_options(&options),
            bus,
            device,
            options,
        }
    }

    #[instrument(skip_all, name = "art", fields(pieces = self.rotation.items().len()))]
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        if self.rotation.is_empty() {
            warn!("no art configured; art mode will not change the display");
        }
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.bus.wait_until(FrameState::wants_art, None) => {}
            }

            if self.rotation.is_empty() {
                // Nothing to show: sit out this art-mode period.
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = self.bus.wait_until(|s| !s.wants_art(), None) => {}
                }
                continue;
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.show_next() => result,
            };

            match result {
                Ok(_) => {
                    let outcome = tokio::select! {
                        _ = cancel.cancelled() => break,
                        outcome = self.bus.wait_until(|s| !s.wants_art(), Some(self.options.rotate_interval)) => outcome,
                    };
                    if outcome == WaitOutcome::Satisfied {
                        info!("art mode left; rotation going idle");
                    }
                }
                Err(err) => {
                    warn!(error = ?err, "art rotation failed");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.options.retry_delay) => {}
                    }
                }
            }
        }
        info!("cancel received; exiting art task");
        Ok(())
    }

    /// Advance the cursor and select that piece on the device.
    pub async fn show_next(&mut self) -> Result<Option<String>> {
        let Some(identifier) = self.rotation.advance().map(str::to_owned) else {
            return Ok(None);
        };
        self.device
            .select(&identifier)
            .await
            .with_context(|| format!("failed to select art {identifier}"))?;
        info!(identifier = %identifier, "showing art");
        Ok(Some(identifier))
    }
}
