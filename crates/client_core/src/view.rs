//! Read-only projections handed to whatever renders the meeting.

use chrono::{DateTime, Utc};
use shared::{
    domain::{AttendeeId, DeviceSelection, MeetingId, Tile, TileRole},
    protocol::MeetingDescriptor,
};

use crate::{
    presence_roster::PresenceRoster, session_controller::SessionPhase,
    tile_registry::TileRegistry,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantView {
    pub attendee_id: AttendeeId,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileView {
    pub tile: Tile,
    /// Owner's display name, or the raw attendee id when the owner is not on the roster.
    pub label: String,
    pub owner_present: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TileLayout {
    pub local: Option<TileView>,
    pub remote: Vec<TileView>,
    pub content: Option<TileView>,
}

impl TileLayout {
    pub fn project(tiles: &TileRegistry, roster: &PresenceRoster) -> Self {
        let view = |tile: &Tile| TileView {
            tile: tile.clone(),
            label: roster.display_label(&tile.attendee_id),
            owner_present: roster.contains(&tile.attendee_id),
        };
        Self {
            local: tiles
                .list_by_role(TileRole::LocalCamera)
                .first()
                .map(|tile| view(tile)),
            remote: tiles
                .list_by_role(TileRole::RemoteCamera)
                .into_iter()
                .map(view)
                .collect(),
            content: tiles
                .list_by_role(TileRole::ContentShare)
                .first()
                .map(|tile| view(tile)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.local.is_none() && self.remote.is_empty() && self.content.is_none()
    }
}

pub fn participants(roster: &PresenceRoster) -> Vec<ParticipantView> {
    roster
        .list()
        .into_iter()
        .map(|attendee| ParticipantView {
            label: attendee.label().to_string(),
            attendee_id: attendee.attendee_id,
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionView {
    pub phase: SessionPhase,
    pub status: Option<String>,
    pub meeting_id: Option<MeetingId>,
    /// Descriptor the session joined with; other clients can join with it.
    pub meeting_descriptor: Option<MeetingDescriptor>,
    pub local_attendee: Option<AttendeeId>,
    pub join_url: Option<String>,
    pub joined_at: Option<DateTime<Utc>>,
    pub devices: DeviceSelection,
    pub participants: Vec<ParticipantView>,
    pub tiles: TileLayout,
    pub content_sharing: bool,
    pub transcribing: bool,
}

impl SessionView {
    pub fn idle(phase: SessionPhase, status: Option<String>) -> Self {
        Self {
            phase,
            status,
            meeting_id: None,
            meeting_descriptor: None,
            local_attendee: None,
            join_url: None,
            joined_at: None,
            devices: DeviceSelection::default(),
            participants: Vec::new(),
            tiles: TileLayout::default(),
            content_sharing: false,
            transcribing: false,
        }
    }
}
