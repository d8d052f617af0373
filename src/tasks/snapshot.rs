use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::SnapshotOptions;
use crate::ledger::{self, ContentLedger};
use crate::platform::capture::Capture;
use crate::platform::device::DisplayDevice;
use crate::state::{FrameState, StateBus, WaitOutcome};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Snapshot uploaded and recorded under this identifier.
    Uploaded(String),
    /// Admission stopped holding while capturing; nothing was uploaded.
    Abandoned,
}

/// Refreshes the dashboard snapshot on the display while it is powered and
/// art mode is off.
pub struct SnapshotScheduler {
    bus: Arc<StateBus>,
    capture: Arc<dyn Capture>,
    device: Arc<dyn DisplayDevice>,
    ledger: Arc<ContentLedger>,
    options: SnapshotOptions,
    delete_batch_size: usize,
}

impl SnapshotScheduler {
    pub fn new(
        bus: Arc<StateBus>,
        capture: Arc<dyn Capture>,
        device: Arc<dyn DisplayDevice>,
        ledger: Arc<ContentLedger>,
        options: SnapshotOptions,
        delete_batch_size: usize,
    ) -> Self {
        Self {
            bus,
            capture,
            device,
            ledger,
            options,
            delete_batch_size,
        }
    }

    #[instrument(skip_all, name = "snapshot", fields(interval = %humantime::format_duration(self.options.interval)))]
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.bus.wait_until(FrameState::wants_snapshot, None) => {}
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.cycle() => result,
            };

            match result {
                Ok(CycleOutcome::Uploaded(_)) => {
                    let outcome = tokio::select! {
                        _ = cancel.cancelled() => break,
                        outcome = self.bus.wait_until(FrameState::wants_art, Some(self.options.interval)) => outcome,
                    };
                    if outcome == WaitOutcome::Satisfied {
                        info!("art mode requested; snapshot loop going idle");
                    }
                }
                Ok(CycleOutcome::Abandoned) => {}
                Err(err) => {
                    warn!(error = ?err, "snapshot cycle failed");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.options.retry_delay) => {}
                    }
                }
            }
        }
        info!("cancel received; exiting snapshot task");
        Ok(())
    }

    /// One Active pass: capture, upload, record, optionally select, prune.
    pub async fn cycle(&self) -> Result<CycleOutcome> {
        let image = self.capture.capture().await.context("capture failed")?;

        let state = self.bus.current();
        if !state.wants_snapshot() {
            debug!(?state, "admission lost during capture; dropping snapshot");
            return Ok(CycleOutcome::Abandoned);
        }

        let identifier = self
            .device
            .upload(&image)
            .await
            .context("upload failed")?;
        self.ledger
            .append(&identifier)
            .with_context(|| format!("failed to record {identifier} in ledger"))?;
        info!(identifier = %identifier, bytes = image.len(), "uploaded snapshot");

        if self.options.select_after_upload {
            self.device
                .select(&identifier)
                .await
                .with_context(|| format!("failed to select {identifier}"))?;
        }

        let report = ledger::prune(
            &self.ledger,
            self.device.as_ref(),
            self.options.retain,
            self.delete_batch_size,
        )
        .await
        .context("pruning old snapshots failed")?;
        debug!(deleted = report.deleted.len(), "prune finished");

        Ok(CycleOutcome::Uploaded(identifier))
    }
}
