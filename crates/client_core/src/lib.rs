//! Client-side meeting state: the tile registry, the presence roster, and the
//! session controller that keeps both in step with a conferencing engine.

use shared::domain::Attendee;

pub mod backend;
pub mod error;
pub mod presence_roster;
pub mod session_controller;
pub mod tile_registry;
pub mod view;

pub use backend::{HttpMeetingBackend, MeetingBackend, MissingMeetingBackend, ProvisionedMeeting};
pub use error::{ProvisioningError, SessionError};
pub use presence_roster::PresenceRoster;
pub use session_controller::{
    ControllerOptions, JoinTarget, SessionController, SessionPhase, SinkLayout,
};
pub use tile_registry::{TileConflict, TileRegistry, UpsertOutcome};
pub use view::{ParticipantView, SessionView, TileLayout, TileView};

#[derive(Debug, Clone)]
pub enum ControllerEvent {
    PhaseChanged(SessionPhase),
    Status(String),
    RosterUpdated(Vec<Attendee>),
    TilesUpdated(TileLayout),
    ContentShareChanged(bool),
    TranscriptionChanged(bool),
    Error(String),
}
