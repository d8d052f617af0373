mod support;

use std::sync::Arc;
use std::time::Duration;

use hass_frame::events::EntityEvent;
use hass_frame::state::{FrameState, StateBus};
use hass_frame::tasks::listener;
use serde_json::json;
use support::{ART_MODE, Attempt, POWER, ScriptedHub, entities, row};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

const BACKOFF: Duration = Duration::from_secs(60);

fn spawn_listener(
    hub: &ScriptedHub,
    bus: &Arc<StateBus>,
    cancel: &CancellationToken,
) -> tokio::task::JoinHandle<anyhow::Result<()>> {
    tokio::spawn(listener::run(
        Arc::new(hub.clone()),
        bus.clone(),
        entities(),
        BACKOFF,
        cancel.clone(),
    ))
}

#[tokio::test(start_paused = true)]
async fn reconnects_after_fixed_backoff() {
    let hub = ScriptedHub::new(vec![
        Attempt::Fail,
        Attempt::Fail,
        Attempt::Fail,
        Attempt::Session {
            states: vec![row(POWER, "on"), row(ART_MODE, "off")],
            events: Vec::new(),
            hang: true,
        },
    ]);
    let bus = Arc::new(StateBus::default());
    let cancel = CancellationToken::new();
    let handle = spawn_listener(&hub, &bus, &cancel);

    sleep(Duration::from_secs(200)).await;
    let connects = hub.connects();
    assert_eq!(connects.len(), 4);
    assert!(connects[3] - connects[0] >= BACKOFF * 3);
    for pair in connects.windows(2) {
        assert!(pair[1] - pair[0] >= BACKOFF);
    }
    assert_eq!(bus.current(), FrameState::new(true, false));
    assert_eq!(hub.subscriptions(), vec![vec![POWER.to_string(), ART_MODE.to_string()]]);

    cancel.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn state_survives_failed_reconnects() {
    let hub = ScriptedHub::new(vec![
        Attempt::Session {
            states: vec![row(POWER, "on"), row(ART_MODE, "on")],
            events: Vec::new(),
            hang: false,
        },
        Attempt::Fail,
        Attempt::Fail,
        Attempt::Fail,
        Attempt::Session {
            states: vec![row(POWER, "off"), row(ART_MODE, "on")],
            events: Vec::new(),
            hang: true,
        },
    ]);
    let bus = Arc::new(StateBus::default());
    let cancel = CancellationToken::new();
    let handle = spawn_listener(&hub, &bus, &cancel);

    // Session closed at t=0, failures at 60, 120 and 180.
    sleep(Duration::from_secs(150)).await;
    assert_eq!(bus.current(), FrameState::new(true, true));

    sleep(Duration::from_secs(100)).await;
    assert_eq!(hub.connects().len(), 5);
    assert_eq!(bus.current(), FrameState::new(false, true));

    cancel.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn events_drive_the_bus() {
    let events = vec![
        EntityEvent::from_value(&json!({ "c": { ART_MODE: { "+": { "s": "on", "lc": 1.0 } } } })),
        EntityEvent::from_value(&json!({ "c": { "sensor.unrelated": { "+": { "s": "42" } } } })),
        EntityEvent::from_value(&json!({ "a": { POWER: { "s": "off" } } })),
    ];
    let hub = ScriptedHub::new(vec![Attempt::Session {
        states: vec![row(POWER, "on"), row(ART_MODE, "off")],
        events,
        hang: true,
    }]);
    let bus = Arc::new(StateBus::default());
    let cancel = CancellationToken::new();

    let handle = spawn_listener(&hub, &bus, &cancel);

    sleep(Duration::from_secs(1)).await;
    assert_eq!(bus.current(), FrameState::new(false, true));

    cancel.cancel();
    handle.await.unwrap().unwrap();
}
