#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use hass_frame::error::{Error, Result};
use hass_frame::events::{EntityEvent, EntityState};
use hass_frame::platform::capture::Capture;
use hass_frame::platform::device::DisplayDevice;
use hass_frame::platform::hub::{HubConnector, HubSession};
use hass_frame::state::{FrameState, StateBus};
use tokio::time::Instant;

pub const POWER: &str = "binary_sensor.tv_power";
pub const ART_MODE: &str = "input_boolean.tv_art_mode";

pub fn entities() -> hass_frame::events::TrackedEntities {
    hass_frame::events::TrackedEntities {
        power: POWER.to_string(),
        art_mode: ART_MODE.to_string(),
    }
}

pub fn row(entity_id: &str, state: &str) -> EntityState {
    EntityState {
        entity_id: entity_id.to_string(),
        state: state.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCall {
    Upload(String),
    Select(String),
    Delete(Vec<String>),
    List,
}

/// Display device double that hands out `img1`, `img2`, ... and records
/// every call.
#[derive(Default)]
pub struct RecordingDevice {
    calls: Mutex<Vec<DeviceCall>>,
    uploads: Mutex<u32>,
    fail_uploads: Mutex<u32>,
    fail_delete_call: Mutex<Option<usize>>,
    delete_calls: Mutex<usize>,
}

impl RecordingDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next `count` uploads.
    pub fn fail_next_uploads(&self, count: u32) {
        *self.fail_uploads.lock().unwrap() = count;
    }

    /// Fail the `n`th delete call (1-based, counted from now on).
    pub fn fail_delete_call(&self, n: usize) {
        *self.delete_calls.lock().unwrap() = 0;
        *self.fail_delete_call.lock().unwrap() = Some(n);
    }

    pub fn calls(&self) -> Vec<DeviceCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn uploads(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                DeviceCall::Upload(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    pub fn selects(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                DeviceCall::Select(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    pub fn deletes(&self) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                DeviceCall::Delete(ids) => Some(ids),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl DisplayDevice for RecordingDevice {
    async fn upload(&self, _image: &[u8]) -> Result<String> {
        {
            let mut failures = self.fail_uploads.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(Error::device("upload", "device unreachable"));
            }
        }
        let id = {
            let mut n = self.uploads.lock().unwrap();
            *n += 1;
            format!("img{n}")
        };
        self.calls.lock().unwrap().push(DeviceCall::Upload(id.clone()));
        Ok(id)
    }

    async fn select(&self, identifier: &str) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(DeviceCall::Select(identifier.to_string()));
        Ok(())
    }

    async fn delete(&self, identifiers: &[String]) -> Result<()> {
        let call = {
            let mut n = self.delete_calls.lock().unwrap();
            *n += 1;
            *n
        };
        if *self.fail_delete_call.lock().unwrap() == Some(call) {
            return Err(Error::device("delete", "device refused delete"));
        }
        self.calls
            .lock()
            .unwrap()
            .push(DeviceCall::Delete(identifiers.to_vec()));
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>> {
        self.calls.lock().unwrap().push(DeviceCall::List);
        Ok(Vec::new())
    }
}

/// Capture double. Records the bus state seen at each call and can run a
/// hook mid-capture to simulate state flipping while the page renders.
pub struct ScriptedCapture {
    bus: Arc<StateBus>,
    duration: Duration,
    seen: Mutex<Vec<FrameState>>,
    during: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl ScriptedCapture {
    pub fn new(bus: Arc<StateBus>) -> Arc<Self> {
        Self::taking(bus, Duration::from_secs(1))
    }

    pub fn taking(bus: Arc<StateBus>, duration: Duration) -> Arc<Self> {
        Arc::new(Self {
            bus,
            duration,
            seen: Mutex::new(Vec::new()),
            during: Mutex::new(None),
        })
    }

    pub fn during_next(&self, hook: impl FnOnce() + Send + 'static) {
        *self.during.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn seen(&self) -> Vec<FrameState> {
        self.seen.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

#[async_trait]
impl Capture for ScriptedCapture {
    async fn capture(&self) -> Result<Vec<u8>> {
        self.seen.lock().unwrap().push(self.bus.current());
        let hook = self.during.lock().unwrap().take();
        if let Some(hook) = hook {
            hook();
        }
        tokio::time::sleep(self.duration).await;
        Ok(b"\x89PNG fake".to_vec())
    }
}

/// What the scripted hub does on one connect attempt.
pub enum Attempt {
    Fail,
    Session {
        states: Vec<EntityState>,
        events: Vec<EntityEvent>,
        /// Keep the session open after the events instead of closing it.
        hang: bool,
    },
}

struct HubScript {
    attempts: Mutex<VecDeque<Attempt>>,
    connects: Mutex<Vec<Instant>>,
    subscriptions: Mutex<Vec<Vec<String>>>,
}

#[derive(Clone)]
pub struct ScriptedHub(Arc<HubScript>);

impl ScriptedHub {
    pub fn new(attempts: Vec<Attempt>) -> Self {
        Self(Arc::new(HubScript {
            attempts: Mutex::new(attempts.into()),
            connects: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
        }))
    }

    pub fn connects(&self) -> Vec<Instant> {
        self.0.connects.lock().unwrap().clone()
    }

    pub fn subscriptions(&self) -> Vec<Vec<String>> {
        self.0.subscriptions.lock().unwrap().clone()
    }
}

#[async_trait]
impl HubConnector for ScriptedHub {
    async fn connect(&self) -> Result<Box<dyn HubSession>> {
        self.0.connects.lock().unwrap().push(Instant::now());
        let next = self.0.attempts.lock().unwrap().pop_front();
        match next {
            None | Some(Attempt::Fail) => Err(Error::Transport("connection refused".to_string())),
            Some(Attempt::Session {
                states,
                events,
                hang,
            }) => Ok(Box::new(ScriptedSession {
                script: Arc::clone(&self.0),
                states,
                events: events.into(),
                hang,
            })),
        }
    }
}

struct ScriptedSession {
    script: Arc<HubScript>,
    states: Vec<EntityState>,
    events: VecDeque<EntityEvent>,
    hang: bool,
}

#[async_trait]
impl HubSession for ScriptedSession {
    async fn get_states(&mut self) -> Result<Vec<EntityState>> {
        Ok(self.states.clone())
    }

    async fn subscribe_entities(&mut self, entity_ids: &[String]) -> Result<()> {
        self.script
            .subscriptions
            .lock()
            .unwrap()
            .push(entity_ids.to_vec());
        Ok(())
    }

    async fn next_event(&mut self) -> Result<Option<EntityEvent>> {
        if let Some(event) = self.events.pop_front() {
            return Ok(Some(event));
        }
        if self.hang {
            std::future::pending::<()>().await;
        }
        Ok(None)
    }
}
