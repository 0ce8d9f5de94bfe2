use std::sync::Arc;

use async_trait::async_trait;
use shared::{
    domain::{AttendeeId, DeviceId, DeviceKind, MediaDevice, SinkHandle, TileId},
    protocol::{AttendeeDescriptor, MeetingDescriptor},
};
use tokio::sync::broadcast;

mod loopback;

pub use loopback::{LoopbackConnector, LoopbackDevices, LoopbackSession};

/// Descriptors handed to the engine when a session object is constructed.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfiguration {
    pub meeting: MeetingDescriptor,
    pub attendee: AttendeeDescriptor,
    pub display_name: Option<String>,
}

/// Opaque handle to a capture source for content share (a screen or window).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentSource(pub String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceNotification {
    pub attendee_id: AttendeeId,
    pub present: bool,
    pub external_user_id: Option<String>,
}

/// Tile update or removal. Camera and content tiles share this shape and are
/// told apart by `is_content` only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileNotification {
    pub tile_id: TileId,
    pub attendee_id: Option<AttendeeId>,
    pub is_local: bool,
    pub is_content: bool,
    pub removed: bool,
}

impl TileNotification {
    pub fn updated(
        tile_id: TileId,
        attendee_id: AttendeeId,
        is_local: bool,
        is_content: bool,
    ) -> Self {
        Self {
            tile_id,
            attendee_id: Some(attendee_id),
            is_local,
            is_content,
            removed: false,
        }
    }

    pub fn removed(tile_id: TileId) -> Self {
        Self {
            tile_id,
            attendee_id: None,
            is_local: false,
            is_content: false,
            removed: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    AttendeePresence(PresenceNotification),
    TileChanged(TileNotification),
}

/// A live conferencing session owned by the engine.
///
/// Notifications are delivered one at a time through [`subscribe_events`];
/// binding calls are synchronous so they can be issued from inside a
/// notification handler.
///
/// [`subscribe_events`]: ConferenceSession::subscribe_events
#[async_trait]
pub trait ConferenceSession: Send + Sync {
    async fn list_devices(&self, kind: DeviceKind) -> anyhow::Result<Vec<MediaDevice>>;
    /// Starts an input device or routes output to a device, depending on `kind`.
    async fn start_device(&self, kind: DeviceKind, device: &DeviceId) -> anyhow::Result<()>;
    async fn stop_device(&self, kind: DeviceKind) -> anyhow::Result<()>;
    async fn start(&self) -> anyhow::Result<()>;
    async fn stop(&self) -> anyhow::Result<()>;
    async fn start_local_video_tile(&self) -> anyhow::Result<()>;
    async fn stop_local_video_tile(&self) -> anyhow::Result<()>;
    async fn start_content_share(&self, source: ContentSource) -> anyhow::Result<()>;
    async fn stop_content_share(&self) -> anyhow::Result<()>;
    fn bind_audio_sink(&self, sink: &SinkHandle) -> anyhow::Result<()>;
    fn bind_video_sink(&self, tile_id: TileId, sink: &SinkHandle) -> anyhow::Result<()>;
    fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent>;
}

#[async_trait]
pub trait EngineConnector: Send + Sync {
    async fn connect(
        &self,
        config: SessionConfiguration,
    ) -> anyhow::Result<Arc<dyn ConferenceSession>>;
}
