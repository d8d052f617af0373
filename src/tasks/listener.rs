use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::error::Error;
use crate::events::{EntityEvent, EntityState, TrackedEntities, is_on};
use crate::platform::hub::HubConnector;
use crate::state::{FrameState, StateBus};

/// Keep the state bus in step with the hub until cancelled.
///
/// Every session end, clean close included, is followed by `backoff` before
/// the next attempt. The bus keeps its last values while disconnected.
#[instrument(
    skip(connector, bus, cancel),
    fields(power = %entities.power, art_mode = %entities.art_mode)
)]
pub async fn run(
    connector: Arc<dyn HubConnector>,
    bus: Arc<StateBus>,
    entities: TrackedEntities,
    backoff: Duration,
    cancel: CancellationToken,
) -> Result<()> {
    let mut attempt: u64 = 0;
    loop {
        attempt += 1;
        let outcome = tokio::select! {
            _ = cancel.cancelled() => break,
            outcome = run_session(connector.as_ref(), &bus, &entities) => outcome,
        };
        match outcome {
            Ok(()) => warn!(attempt, "hub connection closed"),
            Err(err) => warn!(attempt, error = %err, "hub connection failed"),
        }

        debug!(
            backoff = %humantime::format_duration(backoff),
            state = ?bus.current(),
            "waiting before reconnect"
        );
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(backoff) => {}
        }
    }
    info!("cancel received; exiting listener task");
    Ok(())
}

/// One connection: connect, seed the bus, subscribe, then follow events
/// until the hub goes away.
pub async fn run_session(
    connector: &dyn HubConnector,
    bus: &StateBus,
    entities: &TrackedEntities,
) -> Result<(), Error> {
    let mut session = connector.connect().await?;

    let states = session.get_states().await?;
    let seeded = apply_initial_states(bus, entities, &states);
    info!(
        powered_on = seeded.powered_on,
        art_mode_active = seeded.art_mode_active,
        "seeded state from hub"
    );

    session.subscribe_entities(&entities.ids()).await?;

    while let Some(event) = session.next_event().await? {
        apply_event(bus, entities, &event);
    }
    Ok(())
}

/// Seed both fields from a full state listing in a single bus update.
/// An entity missing from the listing keeps its current value.
pub fn apply_initial_states(
    bus: &StateBus,
    entities: &TrackedEntities,
    states: &[EntityState],
) -> FrameState {
    let lookup = |entity_id: &str| {
        states
            .iter()
            .find(|s| s.entity_id == entity_id)
            .map(|s| is_on(&s.state))
    };

    let mut next = bus.current();
    match lookup(&entities.power) {
        Some(on) => next.powered_on = on,
        None => warn!(entity = %entities.power, "power entity missing from hub state"),
    }
    match lookup(&entities.art_mode) {
        Some(on) => next.art_mode_active = on,
        None => warn!(entity = %entities.art_mode, "art-mode entity missing from hub state"),
    }
    bus.apply(next);
    next
}

/// Push whatever `event` says about the tracked entities onto the bus.
/// Returns `false` when neither entity resolved.
pub fn apply_event(bus: &StateBus, entities: &TrackedEntities, event: &EntityEvent) -> bool {
    let power = event.resolve_on(&entities.power);
    let art_mode = event.resolve_on(&entities.art_mode);
    if power.is_none() && art_mode.is_none() {
        trace!("event did not resolve a tracked entity");
        return false;
    }

    let mut next = bus.current();
    if let Some(on) = power {
        debug!(powered_on = on, "power changed");
        next.powered_on = on;
    }
    if let Some(on) = art_mode {
        debug!(art_mode_active = on, "art mode changed");
        next.art_mode_active = on;
    }
    bus.apply(next);
    true
}
