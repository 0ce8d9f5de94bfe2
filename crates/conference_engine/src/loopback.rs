//! In-process engine that reflects local actions back as notifications.
//!
//! No media leaves the process: starting the session announces the local
//! attendee, starting the local tile or a content share announces a tile for
//! it, and the matching stops announce removal.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use shared::domain::{AttendeeId, DeviceId, DeviceKind, MediaDevice, SinkHandle, TileId};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::{
    ConferenceSession, ContentSource, EngineConnector, EngineEvent, PresenceNotification,
    SessionConfiguration, TileNotification,
};

const EVENT_CAPACITY: usize = 256;
const CONTENT_ATTENDEE_SUFFIX: &str = "#content";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopbackDevices {
    pub audio_inputs: Vec<MediaDevice>,
    pub audio_outputs: Vec<MediaDevice>,
    pub video_inputs: Vec<MediaDevice>,
}

impl LoopbackDevices {
    /// One fake device per category.
    pub fn standard() -> Self {
        let device = |id: &str, label: &str| MediaDevice {
            device_id: DeviceId::new(id),
            label: label.to_string(),
        };
        Self {
            audio_inputs: vec![device("loopback-mic", "Loopback microphone")],
            audio_outputs: vec![device("loopback-speaker", "Loopback speaker")],
            video_inputs: vec![device("loopback-camera", "Loopback camera")],
        }
    }

    fn for_kind(&self, kind: DeviceKind) -> &[MediaDevice] {
        match kind {
            DeviceKind::AudioInput => &self.audio_inputs,
            DeviceKind::AudioOutput => &self.audio_outputs,
            DeviceKind::VideoInput => &self.video_inputs,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoopbackConnector {
    devices: LoopbackDevices,
}

impl LoopbackConnector {
    pub fn new(devices: LoopbackDevices) -> Self {
        Self { devices }
    }
}

impl Default for LoopbackConnector {
    fn default() -> Self {
        Self::new(LoopbackDevices::standard())
    }
}

#[async_trait]
impl EngineConnector for LoopbackConnector {
    async fn connect(&self, config: SessionConfiguration) -> Result<Arc<dyn ConferenceSession>> {
        let session = LoopbackSession::new(config, self.devices.clone())?;
        Ok(Arc::new(session))
    }
}

#[derive(Default)]
struct LoopbackState {
    started: bool,
    next_tile_id: u32,
    local_tile: Option<TileId>,
    content_tile: Option<TileId>,
    active_devices: HashMap<DeviceKind, DeviceId>,
    audio_sink: Option<SinkHandle>,
    video_bindings: HashMap<TileId, SinkHandle>,
}

impl LoopbackState {
    fn allocate_tile_id(&mut self) -> TileId {
        self.next_tile_id += 1;
        TileId(self.next_tile_id)
    }
}

pub struct LoopbackSession {
    local_attendee: AttendeeId,
    external_user_id: Option<String>,
    devices: LoopbackDevices,
    events: broadcast::Sender<EngineEvent>,
    state: Mutex<LoopbackState>,
}

impl LoopbackSession {
    pub fn new(config: SessionConfiguration, devices: LoopbackDevices) -> Result<Self> {
        let local_attendee = config.attendee.attendee_id()?;
        let external_user_id = config
            .attendee
            .0
            .get("ExternalUserId")
            .and_then(|value| value.as_str())
            .map(str::to_string)
            .or(config.display_name);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            local_attendee,
            external_user_id,
            devices,
            events,
            state: Mutex::new(LoopbackState::default()),
        })
    }

    pub fn local_attendee(&self) -> &AttendeeId {
        &self.local_attendee
    }

    pub fn video_binding(&self, tile_id: TileId) -> Option<SinkHandle> {
        self.state()
            .ok()
            .and_then(|state| state.video_bindings.get(&tile_id).cloned())
    }

    pub fn audio_binding(&self) -> Option<SinkHandle> {
        self.state().ok().and_then(|state| state.audio_sink.clone())
    }

    fn content_attendee(&self) -> AttendeeId {
        AttendeeId::new(format!(
            "{}{CONTENT_ATTENDEE_SUFFIX}",
            self.local_attendee.as_str()
        ))
    }

    fn state(&self) -> Result<MutexGuard<'_, LoopbackState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("loopback engine state poisoned"))
    }

    fn emit(&self, event: EngineEvent) {
        // No subscribers is fine; the controller may not have attached yet.
        let _ = self.events.send(event);
    }

    fn emit_presence(&self, attendee_id: AttendeeId, present: bool, name: Option<String>) {
        self.emit(EngineEvent::AttendeePresence(PresenceNotification {
            attendee_id,
            present,
            external_user_id: name,
        }));
    }
}

#[async_trait]
impl ConferenceSession for LoopbackSession {
    async fn list_devices(&self, kind: DeviceKind) -> Result<Vec<MediaDevice>> {
        Ok(self.devices.for_kind(kind).to_vec())
    }

    async fn start_device(&self, kind: DeviceKind, device: &DeviceId) -> Result<()> {
        if !self
            .devices
            .for_kind(kind)
            .iter()
            .any(|known| &known.device_id == device)
        {
            bail!("unknown {} device {device}", kind.label());
        }
        self.state()?.active_devices.insert(kind, device.clone());
        debug!(kind = kind.label(), %device, "loopback: device started");
        Ok(())
    }

    async fn stop_device(&self, kind: DeviceKind) -> Result<()> {
        self.state()?.active_devices.remove(&kind);
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        {
            let mut state = self.state()?;
            if state.started {
                bail!("loopback session already started");
            }
            state.started = true;
        }
        info!(attendee_id = %self.local_attendee, "loopback: session started");
        self.emit_presence(
            self.local_attendee.clone(),
            true,
            self.external_user_id.clone(),
        );
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let (local_tile, content_tile) = {
            let mut state = self.state()?;
            if !state.started {
                return Ok(());
            }
            state.started = false;
            state.video_bindings.clear();
            (state.local_tile.take(), state.content_tile.take())
        };
        for tile_id in [local_tile, content_tile].into_iter().flatten() {
            self.emit(EngineEvent::TileChanged(TileNotification::removed(tile_id)));
        }
        if content_tile.is_some() {
            self.emit_presence(self.content_attendee(), false, None);
        }
        self.emit_presence(self.local_attendee.clone(), false, None);
        info!(attendee_id = %self.local_attendee, "loopback: session stopped");
        Ok(())
    }

    async fn start_local_video_tile(&self) -> Result<()> {
        let tile_id = {
            let mut state = self.state()?;
            if !state.started {
                bail!("loopback session not started");
            }
            if !state.active_devices.contains_key(&DeviceKind::VideoInput) {
                bail!("no video input started");
            }
            if let Some(existing) = state.local_tile {
                existing
            } else {
                let tile_id = state.allocate_tile_id();
                state.local_tile = Some(tile_id);
                tile_id
            }
        };
        self.emit(EngineEvent::TileChanged(TileNotification::updated(
            tile_id,
            self.local_attendee.clone(),
            true,
            false,
        )));
        Ok(())
    }

    async fn stop_local_video_tile(&self) -> Result<()> {
        let tile_id = {
            let mut state = self.state()?;
            let tile_id = state.local_tile.take();
            if let Some(tile_id) = tile_id {
                state.video_bindings.remove(&tile_id);
            }
            tile_id
        };
        if let Some(tile_id) = tile_id {
            self.emit(EngineEvent::TileChanged(TileNotification::removed(tile_id)));
        }
        Ok(())
    }

    async fn start_content_share(&self, source: ContentSource) -> Result<()> {
        let tile_id = {
            let mut state = self.state()?;
            if !state.started {
                bail!("loopback session not started");
            }
            if state.content_tile.is_some() {
                bail!("content share already active");
            }
            let tile_id = state.allocate_tile_id();
            state.content_tile = Some(tile_id);
            tile_id
        };
        debug!(source = %source.0, %tile_id, "loopback: content share started");
        let content_attendee = self.content_attendee();
        let content_name = self
            .external_user_id
            .as_ref()
            .map(|name| format!("{name} (screen)"));
        self.emit_presence(content_attendee.clone(), true, content_name);
        self.emit(EngineEvent::TileChanged(TileNotification::updated(
            tile_id,
            content_attendee,
            true,
            true,
        )));
        Ok(())
    }

    async fn stop_content_share(&self) -> Result<()> {
        let tile_id = {
            let mut state = self.state()?;
            let tile_id = state.content_tile.take();
            if let Some(tile_id) = tile_id {
                state.video_bindings.remove(&tile_id);
            }
            tile_id
        };
        if let Some(tile_id) = tile_id {
            self.emit(EngineEvent::TileChanged(TileNotification::removed(tile_id)));
            self.emit_presence(self.content_attendee(), false, None);
        }
        Ok(())
    }

    fn bind_audio_sink(&self, sink: &SinkHandle) -> Result<()> {
        self.state()?.audio_sink = Some(sink.clone());
        Ok(())
    }

    fn bind_video_sink(&self, tile_id: TileId, sink: &SinkHandle) -> Result<()> {
        self.state()?.video_bindings.insert(tile_id, sink.clone());
        Ok(())
    }

    fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
#[path = "tests/loopback_tests.rs"]
mod tests;
