//! Meeting lifecycle and reconciliation of engine notifications into
//! roster/tile state.
//!
//! Phases run `idle -> creating -> joining -> active -> leaving -> idle`, with
//! `failed` reachable from `creating` and `joining`. The state lock is never
//! held across an engine or backend await; while a call is in flight the
//! phase is one of the pending ones and conflicting commands are refused with
//! [`SessionError::Busy`].

use std::{
    fmt,
    future::Future,
    sync::{Arc, Weak},
};

use chrono::{DateTime, Utc};
use conference_engine::{
    ConferenceSession, ContentSource, EngineConnector, EngineEvent, PresenceNotification,
    SessionConfiguration, TileNotification,
};
use shared::{
    domain::{
        AttendeeId, DeviceId, DeviceKind, DeviceSelection, MeetingId, SinkHandle, TileId, TileRole,
    },
    protocol::{AttendeeDescriptor, MeetingDescriptor},
};
use tokio::{
    sync::{broadcast, broadcast::error::RecvError, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{
    backend::{MeetingBackend, ProvisionedMeeting},
    error::{ProvisioningError, SessionError},
    presence_roster::PresenceRoster,
    tile_registry::{TileRegistry, UpsertOutcome},
    view::{participants, SessionView, TileLayout},
    ControllerEvent,
};

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionPhase {
    Idle,
    Creating,
    Joining,
    Active,
    Leaving,
    Failed,
}

impl SessionPhase {
    fn is_pending(self) -> bool {
        matches!(self, Self::Creating | Self::Joining | Self::Leaving)
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Creating => "creating",
            Self::Joining => "joining",
            Self::Active => "active",
            Self::Leaving => "leaving",
            Self::Failed => "failed",
        })
    }
}

/// Either descriptors issued earlier, or a meeting id to resolve through the backend.
#[derive(Debug, Clone)]
pub enum JoinTarget {
    Descriptors {
        meeting: MeetingDescriptor,
        attendee: AttendeeDescriptor,
    },
    MeetingId {
        meeting_id: MeetingId,
        name: String,
    },
}

/// Rendering sinks the controller hands to the engine per tile role.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SinkLayout {
    pub audio: Option<SinkHandle>,
    pub local_video: Option<SinkHandle>,
    pub content_share: Option<SinkHandle>,
    /// Grid slots for remote cameras, filled first-free.
    pub remote_video: Vec<SinkHandle>,
}

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub sinks: SinkLayout,
    pub start_local_video: bool,
    pub display_name: Option<String>,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            sinks: SinkLayout::default(),
            start_local_video: true,
            display_name: None,
        }
    }
}

/// Media the controller has started and must release on the way out.
#[derive(Debug, Clone, Default)]
struct MediaFootprint {
    devices: DeviceSelection,
    local_video_started: bool,
    content_sharing: bool,
}

struct ActiveSession {
    meeting_id: MeetingId,
    meeting: MeetingDescriptor,
    local_attendee: AttendeeId,
    join_url: Option<String>,
    joined_at: DateTime<Utc>,
    engine: Arc<dyn ConferenceSession>,
    media: MediaFootprint,
    transcribing: bool,
    tiles: TileRegistry,
    roster: PresenceRoster,
    event_task: Option<JoinHandle<()>>,
}

impl ActiveSession {
    fn layout(&self) -> TileLayout {
        TileLayout::project(&self.tiles, &self.roster)
    }

    /// Applies one notification. Never awaits; sink binding goes through the
    /// engine's synchronous bind call.
    fn apply(&mut self, sinks: &SinkLayout, event: EngineEvent) -> Vec<ControllerEvent> {
        match event {
            EngineEvent::AttendeePresence(presence) => self.apply_presence(presence),
            EngineEvent::TileChanged(tile) => self.apply_tile(sinks, tile),
        }
    }

    fn apply_presence(&mut self, presence: PresenceNotification) -> Vec<ControllerEvent> {
        let PresenceNotification {
            attendee_id,
            present,
            external_user_id,
        } = presence;
        let changed = if present {
            self.roster.set_present(attendee_id.clone(), external_user_id)
        } else {
            self.roster.set_absent(&attendee_id)
        };
        if !changed {
            return Vec::new();
        }
        debug!(%attendee_id, present, "session: roster updated");

        let mut events = vec![ControllerEvent::RosterUpdated(self.roster.list())];
        // Labels of tiles owned by this attendee depend on the roster entry.
        if self.tiles.tiles_for_attendee(&attendee_id).next().is_some() {
            events.push(ControllerEvent::TilesUpdated(self.layout()));
        }
        events
    }

    fn apply_tile(&mut self, sinks: &SinkLayout, tile: TileNotification) -> Vec<ControllerEvent> {
        let tile_id = tile.tile_id;
        if tile.removed {
            return match self.tiles.remove(tile_id) {
                Some(removed) => {
                    debug!(%tile_id, role = ?removed.role, "session: tile removed");
                    vec![ControllerEvent::TilesUpdated(self.layout())]
                }
                None => Vec::new(),
            };
        }

        let attendee_id = match tile.attendee_id {
            Some(attendee_id) if !attendee_id.is_empty() && tile_id.0 != 0 => attendee_id,
            _ => {
                debug!(%tile_id, "session: ignoring update for unbound tile");
                return Vec::new();
            }
        };
        let role = TileRole::from_flags(tile.is_local, tile.is_content);
        let sink = match self.tiles.get(tile_id) {
            Some(existing) if existing.sink.is_some() => None,
            _ => self.pick_sink(sinks, role),
        };

        let outcome = self
            .tiles
            .upsert(tile_id, attendee_id.clone(), role, sink.clone());
        match outcome {
            UpsertOutcome::Inserted { evicted } => {
                if let Some(evicted) = evicted {
                    info!(
                        evicted = %evicted.tile_id,
                        %tile_id,
                        ?role,
                        "session: replaced tile in exclusive slot"
                    );
                }
                if !self.roster.contains(&attendee_id) {
                    debug!(%tile_id, %attendee_id, "session: tile arrived before owner presence");
                }
                self.bind(tile_id, sink.as_ref());
                vec![ControllerEvent::TilesUpdated(self.layout())]
            }
            UpsertOutcome::Rebound => {
                self.bind(tile_id, sink.as_ref());
                vec![ControllerEvent::TilesUpdated(self.layout())]
            }
            UpsertOutcome::Unchanged | UpsertOutcome::Rejected(_) => Vec::new(),
        }
    }

    fn pick_sink(&self, sinks: &SinkLayout, role: TileRole) -> Option<SinkHandle> {
        match role {
            TileRole::LocalCamera => sinks.local_video.clone(),
            TileRole::ContentShare => sinks.content_share.clone(),
            TileRole::RemoteCamera => sinks
                .remote_video
                .iter()
                .find(|sink| !self.tiles.is_sink_bound(sink))
                .cloned(),
        }
    }

    fn bind(&self, tile_id: TileId, sink: Option<&SinkHandle>) {
        let Some(sink) = sink else {
            return;
        };
        if let Err(err) = self.engine.bind_video_sink(tile_id, sink) {
            warn!(%tile_id, %sink, "session: failed to bind video sink: {err:#}");
        }
    }
}

struct ControllerState {
    phase: SessionPhase,
    generation: u64,
    leave_requested: bool,
    /// Engine commands awaiting the engine against the active session.
    engine_commands: usize,
    status: Option<String>,
    session: Option<ActiveSession>,
}

pub struct SessionController {
    backend: Arc<dyn MeetingBackend>,
    connector: Arc<dyn EngineConnector>,
    options: ControllerOptions,
    inner: Mutex<ControllerState>,
    events: broadcast::Sender<ControllerEvent>,
}

impl SessionController {
    pub fn new(
        backend: Arc<dyn MeetingBackend>,
        connector: Arc<dyn EngineConnector>,
        options: ControllerOptions,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            backend,
            connector,
            options,
            inner: Mutex::new(ControllerState {
                phase: SessionPhase::Idle,
                generation: 0,
                leave_requested: false,
                engine_commands: 0,
                status: None,
                session: None,
            }),
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ControllerEvent> {
        self.events.subscribe()
    }

    pub async fn phase(&self) -> SessionPhase {
        self.inner.lock().await.phase
    }

    pub async fn status(&self) -> Option<String> {
        self.inner.lock().await.status.clone()
    }

    pub async fn view(&self) -> SessionView {
        let state = self.inner.lock().await;
        let Some(session) = state.session.as_ref() else {
            return SessionView::idle(state.phase, state.status.clone());
        };
        SessionView {
            phase: state.phase,
            status: state.status.clone(),
            meeting_id: Some(session.meeting_id.clone()),
            meeting_descriptor: Some(session.meeting.clone()),
            local_attendee: Some(session.local_attendee.clone()),
            join_url: session.join_url.clone(),
            joined_at: Some(session.joined_at),
            devices: session.media.devices.clone(),
            participants: participants(&session.roster),
            tiles: session.layout(),
            content_sharing: session.media.content_sharing,
            transcribing: session.transcribing,
        }
    }

    /// Host flow: provision a new meeting, then join it with the issued descriptors.
    pub async fn create(self: &Arc<Self>) -> Result<(), SessionError> {
        let generation = self.begin(SessionPhase::Creating).await?;
        info!("session: creating meeting");

        let provisioned = match self.backend.create_meeting().await {
            Ok(provisioned) => provisioned,
            Err(err) => {
                let err = SessionError::Provisioning(provisioning_error(err));
                self.fail(generation, format!("Failed to create meeting: {err}"))
                    .await;
                return Err(err);
            }
        };

        self.transition(generation, SessionPhase::Joining).await;
        self.run_join(generation, provisioned).await
    }

    pub async fn join(self: &Arc<Self>, target: JoinTarget) -> Result<(), SessionError> {
        if let JoinTarget::MeetingId { meeting_id, name } = &target {
            if meeting_id.is_empty() || name.trim().is_empty() {
                let mut state = self.inner.lock().await;
                if state.phase != SessionPhase::Idle {
                    warn!(phase = %state.phase, "session: join rejected");
                    return Err(SessionError::Busy { phase: state.phase });
                }
                let err = SessionError::Validation("meeting id and name are required".into());
                let status = err.to_string();
                state.status = Some(status.clone());
                self.emit(ControllerEvent::Status(status));
                return Err(err);
            }
        }

        let generation = self.begin(SessionPhase::Joining).await?;
        let provisioned = match target {
            JoinTarget::Descriptors { meeting, attendee } => {
                ProvisionedMeeting::from_parts(Some(meeting), Some(attendee), None)
            }
            JoinTarget::MeetingId { meeting_id, name } => {
                info!(%meeting_id, "session: requesting attendee credentials");
                self.backend
                    .join_meeting(&meeting_id, name.trim())
                    .await
                    .map_err(provisioning_error)
            }
        };

        match provisioned {
            Ok(provisioned) => self.run_join(generation, provisioned).await,
            Err(err) => {
                let err = SessionError::Provisioning(err);
                self.fail(generation, format!("Failed to get meeting data: {err}"))
                    .await;
                Err(err)
            }
        }
    }

    async fn run_join(
        self: &Arc<Self>,
        generation: u64,
        provisioned: ProvisionedMeeting,
    ) -> Result<(), SessionError> {
        let ids = provisioned
            .meeting
            .meeting_id()
            .and_then(|meeting_id| Ok((meeting_id, provisioned.attendee.attendee_id()?)));
        let (meeting_id, local_attendee) = match ids {
            Ok(ids) => ids,
            Err(err) => {
                let err = SessionError::Provisioning(ProvisioningError::from(err));
                self.fail(generation, format!("Failed to join meeting: {err}"))
                    .await;
                return Err(err);
            }
        };

        let engine = match self
            .connector
            .connect(SessionConfiguration {
                meeting: provisioned.meeting.clone(),
                attendee: provisioned.attendee.clone(),
                display_name: self.options.display_name.clone(),
            })
            .await
        {
            Ok(engine) => engine,
            Err(err) => {
                let err = SessionError::Engine(format!("{err:#}"));
                self.fail(generation, format!("Failed to join meeting: {err}"))
                    .await;
                return Err(err);
            }
        };

        if let Some(sink) = &self.options.sinks.audio {
            if let Err(err) = engine.bind_audio_sink(sink) {
                warn!(%sink, "session: failed to bind audio sink: {err:#}");
            }
        }

        let mut media = MediaFootprint {
            devices: self.select_default_devices(engine.as_ref()).await,
            ..MediaFootprint::default()
        };

        // Subscribe before start so nothing emitted during start is missed.
        let engine_events = engine.subscribe_events();

        if let Err(err) = engine.start().await {
            error!(%meeting_id, "session: engine start failed: {err:#}");
            release_media(engine.as_ref(), &media, false).await;
            let err = SessionError::Engine(format!("{err:#}"));
            self.fail(generation, format!("Failed to join meeting: {err}"))
                .await;
            return Err(err);
        }

        if self.options.start_local_video && media.devices.video_input.is_some() {
            match engine.start_local_video_tile().await {
                Ok(()) => media.local_video_started = true,
                Err(err) => warn!("session: local video tile did not start: {err:#}"),
            }
        }

        let leave_requested = {
            let mut state = self.inner.lock().await;
            if state.generation != generation {
                // Unreachable while joining refuses other commands; release anyway.
                drop(state);
                release_media(engine.as_ref(), &media, true).await;
                return Err(SessionError::Busy {
                    phase: self.phase().await,
                });
            }
            let event_task = self.spawn_event_pump(generation, engine_events);
            state.session = Some(ActiveSession {
                meeting_id: meeting_id.clone(),
                meeting: provisioned.meeting,
                local_attendee: local_attendee.clone(),
                join_url: provisioned.join_url,
                joined_at: Utc::now(),
                engine,
                media,
                transcribing: false,
                tiles: TileRegistry::new(),
                roster: PresenceRoster::new(),
                event_task: Some(event_task),
            });
            state.phase = SessionPhase::Active;
            let status = format!("Joined meeting {meeting_id}");
            state.status = Some(status.clone());
            self.emit(ControllerEvent::PhaseChanged(SessionPhase::Active));
            self.emit(ControllerEvent::Status(status));
            std::mem::take(&mut state.leave_requested)
        };
        info!(%meeting_id, attendee_id = %local_attendee, "session: joined");

        if leave_requested {
            info!(%meeting_id, "session: honouring leave requested while joining");
            self.leave().await?;
        }
        Ok(())
    }

    async fn select_default_devices(&self, engine: &dyn ConferenceSession) -> DeviceSelection {
        let mut selection = DeviceSelection::default();
        for kind in DeviceKind::ALL {
            let devices = match engine.list_devices(kind).await {
                Ok(devices) => devices,
                Err(err) => {
                    warn!(kind = kind.label(), "session: device enumeration failed: {err:#}");
                    continue;
                }
            };
            let Some(device) = devices.into_iter().next() else {
                debug!(kind = kind.label(), "session: no device available");
                continue;
            };
            match engine.start_device(kind, &device.device_id).await {
                Ok(()) => {
                    debug!(kind = kind.label(), device = %device.device_id, "session: device selected");
                    selection.set(kind, Some(device.device_id));
                }
                Err(err) => warn!(
                    kind = kind.label(),
                    device = %device.device_id,
                    "session: device start failed: {err:#}"
                ),
            }
        }
        selection
    }

    fn spawn_event_pump(
        self: &Arc<Self>,
        generation: u64,
        mut events: broadcast::Receiver<EngineEvent>,
    ) -> JoinHandle<()> {
        let controller: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let Some(controller) = controller.upgrade() else {
                            break;
                        };
                        controller.apply_for_generation(generation, event).await;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "session: engine notifications lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    /// Applies a notification to the current session. Ignored without one.
    pub async fn apply_engine_event(&self, event: EngineEvent) {
        let mut state = self.inner.lock().await;
        self.apply_locked(&mut state, event);
    }

    async fn apply_for_generation(&self, generation: u64, event: EngineEvent) {
        let mut state = self.inner.lock().await;
        if state.generation != generation {
            debug!(generation, "session: dropping notification from previous session");
            return;
        }
        self.apply_locked(&mut state, event);
    }

    fn apply_locked(&self, state: &mut ControllerState, event: EngineEvent) {
        let Some(session) = state.session.as_mut() else {
            debug!("session: notification without active session ignored");
            return;
        };
        for event in session.apply(&self.options.sinks, event) {
            self.emit(event);
        }
    }

    pub async fn leave(&self) -> Result<(), SessionError> {
        let Some((generation, session)) = self.begin_leave().await else {
            return Ok(());
        };
        self.finish_leave(generation, session, "Left the meeting").await;
        Ok(())
    }

    /// Host flow: ask the backend to end the meeting for everyone, then leave.
    pub async fn end_meeting(&self) -> Result<(), SessionError> {
        let (generation, session) = {
            let mut state = self.inner.lock().await;
            if state.phase != SessionPhase::Active {
                return Err(reject(state.phase));
            }
            if state.engine_commands > 0 {
                return Err(SessionError::Busy { phase: state.phase });
            }
            match self.hand_off_session(&mut state) {
                Some(claimed) => claimed,
                None => return Ok(()),
            }
        };
        if let Err(err) = self.backend.end_meeting(&session.meeting_id).await {
            error!(meeting_id = %session.meeting_id, "session: end meeting failed: {err:#}");
            self.emit(ControllerEvent::Error(format!("Error ending meeting: {err:#}")));
        }
        self.finish_leave(generation, session, "Meeting ended and cleaned up")
            .await;
        Ok(())
    }

    /// Moves an active session to `leaving` and hands it out for teardown.
    /// Pending phases, and an active session with an engine command in
    /// flight, record the request instead.
    async fn begin_leave(&self) -> Option<(u64, ActiveSession)> {
        let mut state = self.inner.lock().await;
        match state.phase {
            SessionPhase::Idle | SessionPhase::Failed | SessionPhase::Leaving => None,
            SessionPhase::Creating | SessionPhase::Joining => {
                info!(phase = %state.phase, "session: leave deferred until join completes");
                state.leave_requested = true;
                None
            }
            SessionPhase::Active if state.engine_commands > 0 => {
                info!("session: leave deferred until engine command completes");
                state.leave_requested = true;
                None
            }
            SessionPhase::Active => self.hand_off_session(&mut state),
        }
    }

    fn hand_off_session(&self, state: &mut ControllerState) -> Option<(u64, ActiveSession)> {
        let session = state.session.take()?;
        state.phase = SessionPhase::Leaving;
        self.emit(ControllerEvent::PhaseChanged(SessionPhase::Leaving));
        Some((state.generation, session))
    }

    async fn finish_leave(&self, generation: u64, mut session: ActiveSession, status: &str) {
        if let Some(task) = session.event_task.take() {
            task.abort();
        }
        let failed_steps = release_media(session.engine.as_ref(), &session.media, true).await;
        debug!(
            tiles = session.tiles.len(),
            attendees = session.roster.len(),
            "session: dropping reconciled state"
        );
        session.tiles.clear();
        session.roster.clear();

        let mut state = self.inner.lock().await;
        if state.generation == generation {
            state.generation += 1;
        }
        state.phase = SessionPhase::Idle;
        state.leave_requested = false;
        let status = if failed_steps == 0 {
            status.to_string()
        } else {
            format!("{status} ({failed_steps} cleanup step(s) failed)")
        };
        state.status = Some(status.clone());
        info!(meeting_id = %session.meeting_id, failed_steps, "session: left");
        self.emit(ControllerEvent::PhaseChanged(SessionPhase::Idle));
        self.emit(ControllerEvent::RosterUpdated(Vec::new()));
        self.emit(ControllerEvent::TilesUpdated(TileLayout::default()));
        self.emit(ControllerEvent::Status(status));
    }

    /// Clears a failed session back to `idle`.
    pub async fn reset(&self) -> Result<(), SessionError> {
        let mut state = self.inner.lock().await;
        match state.phase {
            SessionPhase::Idle => Ok(()),
            SessionPhase::Failed => {
                state.phase = SessionPhase::Idle;
                state.status = None;
                self.emit(ControllerEvent::PhaseChanged(SessionPhase::Idle));
                Ok(())
            }
            phase => Err(SessionError::Busy { phase }),
        }
    }

    pub async fn start_content_share(&self, source: ContentSource) -> Result<(), SessionError> {
        self.with_engine(|generation, engine, media| async move {
            if media.content_sharing {
                return Ok(());
            }
            if let Err(err) = engine.start_content_share(source).await {
                return Err(self
                    .engine_failure("Error starting screen share", err)
                    .await);
            }
            self.update_session(generation, |session| session.media.content_sharing = true)
                .await;
            info!("session: screen sharing started");
            self.emit(ControllerEvent::ContentShareChanged(true));
            self.set_status("Screen sharing started".to_string()).await;
            Ok(())
        })
        .await
    }

    pub async fn stop_content_share(&self) -> Result<(), SessionError> {
        self.with_engine(|generation, engine, media| async move {
            if !media.content_sharing {
                return Ok(());
            }
            if let Err(err) = engine.stop_content_share().await {
                return Err(self
                    .engine_failure("Error stopping screen share", err)
                    .await);
            }
            self.update_session(generation, |session| session.media.content_sharing = false)
                .await;
            info!("session: screen sharing stopped");
            self.emit(ControllerEvent::ContentShareChanged(false));
            self.set_status("Screen sharing stopped".to_string()).await;
            Ok(())
        })
        .await
    }

    pub async fn start_local_video(&self) -> Result<(), SessionError> {
        self.with_engine(|generation, engine, media| async move {
            if media.local_video_started {
                return Ok(());
            }
            if let Err(err) = engine.start_local_video_tile().await {
                return Err(self
                    .engine_failure("Error starting local video", err)
                    .await);
            }
            self.update_session(generation, |session| session.media.local_video_started = true)
                .await;
            Ok(())
        })
        .await
    }

    pub async fn stop_local_video(&self) -> Result<(), SessionError> {
        self.with_engine(|generation, engine, media| async move {
            if !media.local_video_started {
                return Ok(());
            }
            if let Err(err) = engine.stop_local_video_tile().await {
                return Err(self
                    .engine_failure("Error stopping local video", err)
                    .await);
            }
            self.update_session(generation, |session| {
                session.media.local_video_started = false
            })
            .await;
            Ok(())
        })
        .await
    }

    /// Switches the active device of one category.
    pub async fn select_device(
        &self,
        kind: DeviceKind,
        device: DeviceId,
    ) -> Result<(), SessionError> {
        self.with_engine(|generation, engine, _| async move {
            if let Err(err) = engine.start_device(kind, &device).await {
                return Err(self
                    .engine_failure("Error selecting device", err)
                    .await);
            }
            info!(kind = kind.label(), %device, "session: device switched");
            self.update_session(generation, |session| {
                session.media.devices.set(kind, Some(device))
            })
            .await;
            Ok(())
        })
        .await
    }

    pub async fn start_transcription(&self) -> Result<(), SessionError> {
        self.set_transcription(true).await
    }

    pub async fn stop_transcription(&self) -> Result<(), SessionError> {
        self.set_transcription(false).await
    }

    async fn set_transcription(&self, enabled: bool) -> Result<(), SessionError> {
        let (generation, meeting_id) = {
            let state = self.inner.lock().await;
            match (state.phase, state.session.as_ref()) {
                (SessionPhase::Active, Some(session)) => {
                    (state.generation, session.meeting_id.clone())
                }
                (phase, _) => return Err(reject(phase)),
            }
        };

        let result = if enabled {
            self.backend.start_transcription(&meeting_id).await
        } else {
            self.backend.stop_transcription(&meeting_id).await
        };
        let action = if enabled { "starting" } else { "stopping" };
        if let Err(err) = result {
            error!(%meeting_id, "session: {action} transcription failed: {err:#}");
            let message = format!("Error {action} transcription: {err:#}");
            self.emit(ControllerEvent::Error(message.clone()));
            self.set_status(message).await;
            return Err(SessionError::Backend(format!("{err:#}")));
        }

        self.update_session(generation, |session| session.transcribing = enabled)
            .await;
        self.emit(ControllerEvent::TranscriptionChanged(enabled));
        let status = if enabled {
            "Transcription started"
        } else {
            "Transcription stopped"
        };
        self.set_status(status.to_string()).await;
        Ok(())
    }

    /// Runs one engine command against the active session. While it is in
    /// flight a `leave` is deferred until the command has finished, so the
    /// teardown sees whatever the command started.
    async fn with_engine<F, Fut>(&self, command: F) -> Result<(), SessionError>
    where
        F: FnOnce(u64, Arc<dyn ConferenceSession>, MediaFootprint) -> Fut,
        Fut: Future<Output = Result<(), SessionError>>,
    {
        let (generation, engine, media) = {
            let mut state = self.inner.lock().await;
            let claimed = match (state.phase, state.session.as_ref()) {
                (SessionPhase::Active, Some(session)) => (
                    state.generation,
                    Arc::clone(&session.engine),
                    session.media.clone(),
                ),
                (phase, _) => return Err(reject(phase)),
            };
            state.engine_commands += 1;
            claimed
        };

        let result = command(generation, engine, media).await;

        let leave_now = {
            let mut state = self.inner.lock().await;
            state.engine_commands = state.engine_commands.saturating_sub(1);
            state.engine_commands == 0
                && state.phase == SessionPhase::Active
                && std::mem::take(&mut state.leave_requested)
        };
        if leave_now {
            info!("session: honouring leave requested during an engine command");
            self.leave().await?;
        }
        result
    }

    async fn update_session(&self, generation: u64, update: impl FnOnce(&mut ActiveSession)) {
        let mut state = self.inner.lock().await;
        if state.generation != generation {
            return;
        }
        if let Some(session) = state.session.as_mut() {
            update(session);
        }
    }

    async fn engine_failure(&self, context: &str, err: anyhow::Error) -> SessionError {
        error!("session: {context}: {err:#}");
        let message = format!("{context}: {err:#}");
        self.emit(ControllerEvent::Error(message.clone()));
        self.set_status(message).await;
        SessionError::Engine(format!("{err:#}"))
    }

    async fn begin(&self, next: SessionPhase) -> Result<u64, SessionError> {
        let mut state = self.inner.lock().await;
        if state.phase != SessionPhase::Idle {
            warn!(phase = %state.phase, requested = %next, "session: command rejected");
            return Err(SessionError::Busy { phase: state.phase });
        }
        state.generation += 1;
        state.phase = next;
        state.leave_requested = false;
        state.status = None;
        self.emit(ControllerEvent::PhaseChanged(next));
        Ok(state.generation)
    }

    async fn transition(&self, generation: u64, next: SessionPhase) {
        let mut state = self.inner.lock().await;
        if state.generation == generation {
            state.phase = next;
            self.emit(ControllerEvent::PhaseChanged(next));
        }
    }

    async fn fail(&self, generation: u64, message: String) {
        let mut state = self.inner.lock().await;
        if state.generation != generation {
            return;
        }
        error!(phase = %state.phase, "session: {message}");
        state.phase = SessionPhase::Failed;
        state.session = None;
        state.leave_requested = false;
        state.status = Some(message.clone());
        self.emit(ControllerEvent::PhaseChanged(SessionPhase::Failed));
        self.emit(ControllerEvent::Error(message));
    }

    async fn set_status(&self, status: String) {
        self.inner.lock().await.status = Some(status.clone());
        self.emit(ControllerEvent::Status(status));
    }

    fn emit(&self, event: ControllerEvent) {
        let _ = self.events.send(event);
    }
}

fn reject(phase: SessionPhase) -> SessionError {
    if phase.is_pending() {
        SessionError::Busy { phase }
    } else {
        SessionError::NotActive
    }
}

fn provisioning_error(err: anyhow::Error) -> ProvisioningError {
    match err.downcast::<ProvisioningError>() {
        Ok(err) => err,
        Err(err) => ProvisioningError::Request(format!("{err:#}")),
    }
}

/// Best-effort teardown in fixed order. Every step runs regardless of earlier
/// failures; returns how many failed.
async fn release_media(
    engine: &dyn ConferenceSession,
    media: &MediaFootprint,
    stop_session: bool,
) -> usize {
    let mut failed = 0;
    let mut step = |name: &str, result: anyhow::Result<()>| {
        if let Err(err) = result {
            failed += 1;
            warn!(step = name, "session: cleanup step failed: {err:#}");
        }
    };

    if media.content_sharing {
        step("stop_content_share", engine.stop_content_share().await);
    }
    if media.local_video_started {
        step("stop_local_video_tile", engine.stop_local_video_tile().await);
    }
    if media.devices.video_input.is_some() {
        step(
            "stop_video_input",
            engine.stop_device(DeviceKind::VideoInput).await,
        );
    }
    if media.devices.audio_input.is_some() {
        step(
            "stop_audio_input",
            engine.stop_device(DeviceKind::AudioInput).await,
        );
    }
    if stop_session {
        step("stop_session", engine.stop().await);
    }
    failed
}

#[cfg(test)]
#[path = "tests/session_controller_tests.rs"]
mod tests;
