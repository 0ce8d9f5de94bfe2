use super::*;
use crate::backend::MissingMeetingBackend;
use std::{
    collections::{HashMap, HashSet},
    sync::Mutex as StdMutex,
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use conference_engine::LoopbackConnector;
use serde_json::json;
use shared::domain::MediaDevice;
use tokio::sync::Notify;

struct FakeEngine {
    devices: HashMap<DeviceKind, Vec<MediaDevice>>,
    failing: HashSet<&'static str>,
    calls: StdMutex<Vec<String>>,
    bindings: StdMutex<Vec<(TileId, SinkHandle)>>,
    gate: StdMutex<Option<(&'static str, Arc<Notify>)>>,
    events: broadcast::Sender<EngineEvent>,
}

impl FakeEngine {
    fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            devices: HashMap::new(),
            failing: HashSet::new(),
            calls: StdMutex::new(Vec::new()),
            bindings: StdMutex::new(Vec::new()),
            gate: StdMutex::new(None),
            events,
        }
    }

    fn with_standard_devices(mut self) -> Self {
        for (kind, id) in [
            (DeviceKind::AudioInput, "mic-1"),
            (DeviceKind::AudioOutput, "speaker-1"),
            (DeviceKind::VideoInput, "cam-1"),
        ] {
            self.devices.insert(
                kind,
                vec![MediaDevice {
                    device_id: DeviceId::new(id),
                    label: id.to_string(),
                }],
            );
        }
        self
    }

    fn failing(mut self, op: &'static str) -> Self {
        self.failing.insert(op);
        self
    }

    /// Blocks the first device enumeration until the returned gate is notified.
    fn gated(self) -> (Self, Arc<Notify>) {
        self.gated_on("list_devices")
    }

    /// Blocks the first call of `op` until the returned gate is notified.
    fn gated_on(self, op: &'static str) -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        *self.gate.lock().expect("gate") = Some((op, Arc::clone(&gate)));
        (self, gate)
    }

    async fn pass_gate(&self, op: &str) {
        let gate = {
            let mut slot = self.gate.lock().expect("gate");
            let gated = matches!(slot.as_ref(), Some((gated_op, _)) if *gated_op == op);
            if gated {
                slot.take().map(|(_, gate)| gate)
            } else {
                None
            }
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }
    }

    fn record(&self, op: impl Into<String>) -> Result<()> {
        let op = op.into();
        self.calls.lock().expect("calls").push(op.clone());
        if self.failing.contains(op.as_str()) {
            return Err(anyhow!("simulated {op} failure"));
        }
        Ok(())
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls").clone()
    }

    fn bindings(&self) -> Vec<(TileId, SinkHandle)> {
        self.bindings.lock().expect("bindings").clone()
    }
}

#[async_trait]
impl ConferenceSession for FakeEngine {
    async fn list_devices(&self, kind: DeviceKind) -> Result<Vec<MediaDevice>> {
        self.pass_gate("list_devices").await;
        self.record(format!("list_devices:{}", kind.label()))?;
        Ok(self.devices.get(&kind).cloned().unwrap_or_default())
    }

    async fn start_device(&self, kind: DeviceKind, device: &DeviceId) -> Result<()> {
        self.record(format!("start_device:{}:{device}", kind.label()))
    }

    async fn stop_device(&self, kind: DeviceKind) -> Result<()> {
        self.record(format!("stop_device:{}", kind.label()))
    }

    async fn start(&self) -> Result<()> {
        self.record("start")
    }

    async fn stop(&self) -> Result<()> {
        self.record("stop")
    }

    async fn start_local_video_tile(&self) -> Result<()> {
        self.record("start_local_video_tile")
    }

    async fn stop_local_video_tile(&self) -> Result<()> {
        self.record("stop_local_video_tile")
    }

    async fn start_content_share(&self, source: ContentSource) -> Result<()> {
        let result = self.record(format!("start_content_share:{}", source.0));
        self.pass_gate("start_content_share").await;
        result
    }

    async fn stop_content_share(&self) -> Result<()> {
        self.record("stop_content_share")
    }

    fn bind_audio_sink(&self, sink: &SinkHandle) -> Result<()> {
        self.record(format!("bind_audio_sink:{sink}"))
    }

    fn bind_video_sink(&self, tile_id: TileId, sink: &SinkHandle) -> Result<()> {
        self.bindings
            .lock()
            .expect("bindings")
            .push((tile_id, sink.clone()));
        Ok(())
    }

    fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }
}

struct FakeConnector {
    engine: Arc<FakeEngine>,
    fail: bool,
}

#[async_trait]
impl EngineConnector for FakeConnector {
    async fn connect(&self, _config: SessionConfiguration) -> Result<Arc<dyn ConferenceSession>> {
        if self.fail {
            return Err(anyhow!("engine refused configuration"));
        }
        Ok(Arc::clone(&self.engine) as Arc<dyn ConferenceSession>)
    }
}

#[derive(Default)]
struct FakeBackend {
    fail_create: bool,
    fail_end: bool,
    omit_attendee: bool,
    calls: StdMutex<Vec<String>>,
}

impl FakeBackend {
    fn record(&self, call: String) {
        self.calls.lock().expect("calls").push(call);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls").clone()
    }
}

fn descriptors(meeting_id: &str, attendee_id: &str) -> ProvisionedMeeting {
    ProvisionedMeeting {
        meeting: MeetingDescriptor(json!({ "MeetingId": meeting_id })),
        attendee: AttendeeDescriptor(json!({ "AttendeeId": attendee_id })),
        join_url: None,
    }
}

#[async_trait]
impl MeetingBackend for FakeBackend {
    async fn create_meeting(&self) -> Result<ProvisionedMeeting> {
        self.record("create_meeting".into());
        if self.fail_create {
            return Err(anyhow!("backend returned 500"));
        }
        let mut provisioned = descriptors("m-1", "host-1");
        provisioned.join_url = Some("https://meet.example/join?m=m-1".into());
        Ok(provisioned)
    }

    async fn join_meeting(&self, meeting_id: &MeetingId, name: &str) -> Result<ProvisionedMeeting> {
        self.record(format!("join_meeting:{meeting_id}:{name}"));
        if self.omit_attendee {
            return Ok(ProvisionedMeeting::from_parts(
                Some(MeetingDescriptor(json!({ "MeetingId": meeting_id.as_str() }))),
                None,
                None,
            )?);
        }
        Ok(descriptors(meeting_id.as_str(), "guest-1"))
    }

    async fn start_transcription(&self, meeting_id: &MeetingId) -> Result<()> {
        self.record(format!("start_transcription:{meeting_id}"));
        Ok(())
    }

    async fn stop_transcription(&self, meeting_id: &MeetingId) -> Result<()> {
        self.record(format!("stop_transcription:{meeting_id}"));
        Ok(())
    }

    async fn end_meeting(&self, meeting_id: &MeetingId) -> Result<()> {
        self.record(format!("end_meeting:{meeting_id}"));
        if self.fail_end {
            return Err(anyhow!("backend unreachable"));
        }
        Ok(())
    }
}

fn controller_with(
    engine: Arc<FakeEngine>,
    backend: Arc<FakeBackend>,
    options: ControllerOptions,
) -> Arc<SessionController> {
    SessionController::new(
        backend,
        Arc::new(FakeConnector {
            engine,
            fail: false,
        }),
        options,
    )
}

fn descriptor_target(meeting_id: &str, attendee_id: &str) -> JoinTarget {
    let provisioned = descriptors(meeting_id, attendee_id);
    JoinTarget::Descriptors {
        meeting: provisioned.meeting,
        attendee: provisioned.attendee,
    }
}

async fn wait_for_phase(controller: &SessionController, phase: SessionPhase) {
    for _ in 0..400 {
        if controller.phase().await == phase {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("controller never reached {phase}");
}

async fn wait_for_call(engine: &FakeEngine, call: &str) {
    for _ in 0..400 {
        if engine.calls().iter().any(|c| c == call) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("engine never saw {call}");
}

fn presence(id: &str, present: bool, name: Option<&str>) -> EngineEvent {
    EngineEvent::AttendeePresence(PresenceNotification {
        attendee_id: AttendeeId::new(id),
        present,
        external_user_id: name.map(str::to_string),
    })
}

fn remote_tile(tile_id: u32, attendee: &str) -> EngineEvent {
    EngineEvent::TileChanged(TileNotification::updated(
        TileId(tile_id),
        AttendeeId::new(attendee),
        false,
        false,
    ))
}

#[tokio::test]
async fn create_without_devices_still_becomes_active() {
    let engine = Arc::new(FakeEngine::new());
    let backend = Arc::new(FakeBackend::default());
    let controller = controller_with(
        Arc::clone(&engine),
        Arc::clone(&backend),
        ControllerOptions::default(),
    );

    controller.create().await.expect("create");

    let view = controller.view().await;
    assert_eq!(view.phase, SessionPhase::Active);
    assert_eq!(view.devices.count(), 0);
    assert_eq!(view.meeting_id, Some(MeetingId::new("m-1")));
    assert_eq!(
        view.meeting_descriptor,
        Some(MeetingDescriptor(json!({ "MeetingId": "m-1" })))
    );
    assert_eq!(
        view.join_url.as_deref(),
        Some("https://meet.example/join?m=m-1")
    );
    let calls = engine.calls();
    assert!(calls.iter().all(|call| !call.starts_with("start_device")));
    assert!(!calls.contains(&"start_local_video_tile".to_string()));
    assert!(calls.contains(&"start".to_string()));
    assert_eq!(backend.calls(), vec!["create_meeting"]);
}

#[tokio::test]
async fn joining_selects_first_device_of_each_kind_and_starts_local_tile() {
    let engine = Arc::new(FakeEngine::new().with_standard_devices());
    let controller = controller_with(
        Arc::clone(&engine),
        Arc::new(FakeBackend::default()),
        ControllerOptions {
            sinks: SinkLayout {
                audio: Some(SinkHandle::new("audio-main")),
                ..SinkLayout::default()
            },
            ..ControllerOptions::default()
        },
    );

    controller
        .join(descriptor_target("m-2", "guest-9"))
        .await
        .expect("join");

    let view = controller.view().await;
    assert_eq!(view.devices.count(), 3);
    assert_eq!(view.local_attendee, Some(AttendeeId::new("guest-9")));
    let calls = engine.calls();
    assert_eq!(calls.first().map(String::as_str), Some("bind_audio_sink:audio-main"));
    let start_at = calls.iter().position(|c| c == "start").expect("start");
    let tile_at = calls
        .iter()
        .position(|c| c == "start_local_video_tile")
        .expect("local tile");
    assert!(start_at < tile_at);
}

#[tokio::test]
async fn device_failures_do_not_block_join() {
    let engine = Arc::new(
        FakeEngine::new()
            .with_standard_devices()
            .failing("start_device:video_input:cam-1")
            .failing("list_devices:audio_output"),
    );
    let controller = controller_with(
        Arc::clone(&engine),
        Arc::new(FakeBackend::default()),
        ControllerOptions::default(),
    );

    controller
        .join(descriptor_target("m-1", "a-1"))
        .await
        .expect("join");

    let view = controller.view().await;
    assert_eq!(view.phase, SessionPhase::Active);
    assert_eq!(view.devices.audio_input, Some(DeviceId::new("mic-1")));
    assert!(view.devices.audio_output.is_none());
    assert!(view.devices.video_input.is_none());
    // No camera, so no local tile attempt.
    assert!(!engine
        .calls()
        .contains(&"start_local_video_tile".to_string()));
}

#[tokio::test]
async fn removed_tile_leaves_roster_entry_in_place() {
    let engine = Arc::new(FakeEngine::new());
    let controller = controller_with(
        engine,
        Arc::new(FakeBackend::default()),
        ControllerOptions::default(),
    );
    controller
        .join(descriptor_target("m-1", "me"))
        .await
        .expect("join");

    controller
        .apply_engine_event(presence("A1", true, Some("Alice")))
        .await;
    controller.apply_engine_event(remote_tile(5, "A1")).await;
    assert_eq!(controller.view().await.tiles.remote.len(), 1);

    controller
        .apply_engine_event(EngineEvent::TileChanged(TileNotification::removed(TileId(
            5,
        ))))
        .await;

    let view = controller.view().await;
    assert!(view.tiles.is_empty());
    assert_eq!(view.participants.len(), 1);
    assert_eq!(view.participants[0].attendee_id, AttendeeId::new("A1"));
    assert_eq!(view.participants[0].label, "Alice");

    controller
        .apply_engine_event(presence("A1", false, None))
        .await;
    assert!(controller.view().await.participants.is_empty());
}

#[tokio::test]
async fn tile_before_presence_uses_raw_id_until_owner_arrives() {
    let controller = controller_with(
        Arc::new(FakeEngine::new()),
        Arc::new(FakeBackend::default()),
        ControllerOptions::default(),
    );
    controller
        .join(descriptor_target("m-1", "me"))
        .await
        .expect("join");

    controller.apply_engine_event(remote_tile(3, "A2")).await;
    let tile = controller.view().await.tiles.remote[0].clone();
    assert_eq!(tile.label, "A2");
    assert!(!tile.owner_present);

    controller
        .apply_engine_event(presence("A2", true, Some("Bea")))
        .await;
    let tile = controller.view().await.tiles.remote[0].clone();
    assert_eq!(tile.label, "Bea");
    assert!(tile.owner_present);
}

#[tokio::test]
async fn remote_tiles_take_first_free_grid_sink() {
    let engine = Arc::new(FakeEngine::new());
    let controller = controller_with(
        Arc::clone(&engine),
        Arc::new(FakeBackend::default()),
        ControllerOptions {
            sinks: SinkLayout {
                local_video: Some(SinkHandle::new("local")),
                remote_video: vec![SinkHandle::new("remote-0")],
                ..SinkLayout::default()
            },
            ..ControllerOptions::default()
        },
    );
    controller
        .join(descriptor_target("m-1", "me"))
        .await
        .expect("join");

    controller.apply_engine_event(remote_tile(1, "A1")).await;
    controller.apply_engine_event(remote_tile(2, "A2")).await;
    let view = controller.view().await;
    assert_eq!(view.tiles.remote[0].tile.sink, Some(SinkHandle::new("remote-0")));
    assert_eq!(view.tiles.remote[1].tile.sink, None);

    controller
        .apply_engine_event(EngineEvent::TileChanged(TileNotification::removed(TileId(
            1,
        ))))
        .await;
    controller.apply_engine_event(remote_tile(2, "A2")).await;

    assert_eq!(
        engine.bindings(),
        vec![
            (TileId(1), SinkHandle::new("remote-0")),
            (TileId(2), SinkHandle::new("remote-0")),
        ]
    );
}

#[tokio::test]
async fn unbound_and_conflicting_tile_updates_are_ignored() {
    let controller = controller_with(
        Arc::new(FakeEngine::new()),
        Arc::new(FakeBackend::default()),
        ControllerOptions::default(),
    );
    controller
        .join(descriptor_target("m-1", "me"))
        .await
        .expect("join");

    controller
        .apply_engine_event(EngineEvent::TileChanged(TileNotification {
            tile_id: TileId(4),
            attendee_id: None,
            is_local: false,
            is_content: false,
            removed: false,
        }))
        .await;
    controller.apply_engine_event(remote_tile(0, "A1")).await;
    assert!(controller.view().await.tiles.is_empty());

    controller.apply_engine_event(remote_tile(4, "A1")).await;
    controller
        .apply_engine_event(EngineEvent::TileChanged(TileNotification::updated(
            TileId(4),
            AttendeeId::new("A1"),
            true,
            false,
        )))
        .await;
    let view = controller.view().await;
    assert!(view.tiles.local.is_none());
    assert_eq!(view.tiles.remote.len(), 1);
}

#[tokio::test]
async fn teardown_continues_after_failed_step() {
    let engine = Arc::new(
        FakeEngine::new()
            .with_standard_devices()
            .failing("stop_local_video_tile"),
    );
    let controller = controller_with(
        Arc::clone(&engine),
        Arc::new(FakeBackend::default()),
        ControllerOptions::default(),
    );
    controller
        .join(descriptor_target("m-1", "me"))
        .await
        .expect("join");

    controller.leave().await.expect("leave");

    assert_eq!(controller.phase().await, SessionPhase::Idle);
    let calls = engine.calls();
    let teardown: Vec<&str> = calls
        .iter()
        .map(String::as_str)
        .skip_while(|call| *call != "stop_local_video_tile")
        .collect();
    assert_eq!(
        teardown,
        vec![
            "stop_local_video_tile",
            "stop_device:video_input",
            "stop_device:audio_input",
            "stop",
        ]
    );
    let status = controller.status().await.expect("status");
    assert!(status.contains("1 cleanup step(s) failed"), "{status}");
    assert!(controller.view().await.tiles.is_empty());
}

#[tokio::test]
async fn join_while_joining_is_busy() {
    let (engine, gate) = FakeEngine::new().gated();
    let engine = Arc::new(engine);
    let controller = controller_with(
        Arc::clone(&engine),
        Arc::new(FakeBackend::default()),
        ControllerOptions::default(),
    );

    let first = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move { controller.join(descriptor_target("m-1", "me")).await })
    };
    wait_for_phase(&controller, SessionPhase::Joining).await;

    let err = controller
        .join(descriptor_target("m-2", "me"))
        .await
        .expect_err("busy");
    assert!(err.is_busy());
    assert!(matches!(
        err,
        SessionError::Busy {
            phase: SessionPhase::Joining
        }
    ));
    assert_eq!(controller.phase().await, SessionPhase::Joining);
    let err = controller
        .start_content_share(ContentSource("screen:0".into()))
        .await
        .expect_err("busy");
    assert!(err.is_busy());

    gate.notify_one();
    first.await.expect("task").expect("first join");
    let view = controller.view().await;
    assert_eq!(view.phase, SessionPhase::Active);
    assert_eq!(view.meeting_id, Some(MeetingId::new("m-1")));
}

#[tokio::test]
async fn invalid_join_while_joining_is_busy_and_keeps_status() {
    let (engine, gate) = FakeEngine::new().gated();
    let controller = controller_with(
        Arc::new(engine),
        Arc::new(FakeBackend::default()),
        ControllerOptions::default(),
    );

    let first = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move { controller.join(descriptor_target("m-1", "me")).await })
    };
    wait_for_phase(&controller, SessionPhase::Joining).await;
    let status_before = controller.status().await;

    let err = controller
        .join(JoinTarget::MeetingId {
            meeting_id: MeetingId::new(""),
            name: "x".into(),
        })
        .await
        .expect_err("busy");
    assert!(matches!(
        err,
        SessionError::Busy {
            phase: SessionPhase::Joining
        }
    ));
    assert_eq!(controller.status().await, status_before);
    assert_eq!(controller.phase().await, SessionPhase::Joining);

    gate.notify_one();
    first.await.expect("task").expect("first join");
    assert_eq!(controller.phase().await, SessionPhase::Active);
}

#[tokio::test]
async fn leave_while_joining_takes_effect_after_join() {
    let (engine, gate) = FakeEngine::new().with_standard_devices().gated();
    let engine = Arc::new(engine);
    let controller = controller_with(
        Arc::clone(&engine),
        Arc::new(FakeBackend::default()),
        ControllerOptions::default(),
    );

    let join = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move { controller.join(descriptor_target("m-1", "me")).await })
    };
    wait_for_phase(&controller, SessionPhase::Joining).await;

    controller.leave().await.expect("deferred leave");
    assert_eq!(controller.phase().await, SessionPhase::Joining);

    gate.notify_one();
    join.await.expect("task").expect("join");

    assert_eq!(controller.phase().await, SessionPhase::Idle);
    assert_eq!(engine.calls().last().map(String::as_str), Some("stop"));
}

#[tokio::test]
async fn provisioning_failure_is_terminal_until_reset() {
    let backend = Arc::new(FakeBackend {
        fail_create: true,
        ..FakeBackend::default()
    });
    let engine = Arc::new(FakeEngine::new());
    let controller = controller_with(Arc::clone(&engine), backend, ControllerOptions::default());

    let err = controller.create().await.expect_err("provisioning");
    assert!(matches!(
        err,
        SessionError::Provisioning(ProvisioningError::Request(_))
    ));
    assert_eq!(controller.phase().await, SessionPhase::Failed);
    assert!(engine.calls().is_empty());
    assert!(controller
        .status()
        .await
        .expect("status")
        .starts_with("Failed to create meeting"));

    let err = controller.create().await.expect_err("still failed");
    assert!(matches!(
        err,
        SessionError::Busy {
            phase: SessionPhase::Failed
        }
    ));

    controller.reset().await.expect("reset");
    assert_eq!(controller.phase().await, SessionPhase::Idle);
}

#[tokio::test]
async fn incomplete_join_response_fails_without_touching_engine() {
    let backend = Arc::new(FakeBackend {
        omit_attendee: true,
        ..FakeBackend::default()
    });
    let engine = Arc::new(FakeEngine::new());
    let controller = controller_with(
        Arc::clone(&engine),
        Arc::clone(&backend),
        ControllerOptions::default(),
    );

    let err = controller
        .join(JoinTarget::MeetingId {
            meeting_id: MeetingId::new("m-3"),
            name: "  Bob ".into(),
        })
        .await
        .expect_err("incomplete");
    assert!(matches!(
        err,
        SessionError::Provisioning(ProvisioningError::MissingDescriptor("attendee"))
    ));
    assert_eq!(backend.calls(), vec!["join_meeting:m-3:Bob"]);
    assert_eq!(controller.phase().await, SessionPhase::Failed);
    assert!(engine.calls().is_empty());
}

#[tokio::test]
async fn join_by_meeting_id_requires_id_and_name() {
    let backend = Arc::new(FakeBackend::default());
    let controller = controller_with(
        Arc::new(FakeEngine::new()),
        Arc::clone(&backend),
        ControllerOptions::default(),
    );

    let err = controller
        .join(JoinTarget::MeetingId {
            meeting_id: MeetingId::new(""),
            name: "Bob".into(),
        })
        .await
        .expect_err("validation");
    assert!(matches!(err, SessionError::Validation(_)));
    assert_eq!(controller.phase().await, SessionPhase::Idle);
    assert!(backend.calls().is_empty());
}

#[tokio::test]
async fn engine_connect_failure_moves_to_failed() {
    let controller = SessionController::new(
        Arc::new(FakeBackend::default()),
        Arc::new(FakeConnector {
            engine: Arc::new(FakeEngine::new()),
            fail: true,
        }),
        ControllerOptions::default(),
    );

    let err = controller
        .join(descriptor_target("m-1", "me"))
        .await
        .expect_err("connect");
    assert!(matches!(err, SessionError::Engine(_)));
    assert_eq!(controller.phase().await, SessionPhase::Failed);
}

#[tokio::test]
async fn engine_start_failure_releases_started_devices() {
    let engine = Arc::new(FakeEngine::new().with_standard_devices().failing("start"));
    let controller = controller_with(
        Arc::clone(&engine),
        Arc::new(FakeBackend::default()),
        ControllerOptions::default(),
    );

    controller
        .join(descriptor_target("m-1", "me"))
        .await
        .expect_err("start fails");

    assert_eq!(controller.phase().await, SessionPhase::Failed);
    let calls = engine.calls();
    assert!(calls.contains(&"stop_device:video_input".to_string()));
    assert!(calls.contains(&"stop_device:audio_input".to_string()));
    assert!(!calls.contains(&"stop".to_string()));
}

#[tokio::test]
async fn commands_without_session_are_rejected() {
    let controller = controller_with(
        Arc::new(FakeEngine::new()),
        Arc::new(FakeBackend::default()),
        ControllerOptions::default(),
    );

    assert!(matches!(
        controller.start_transcription().await,
        Err(SessionError::NotActive)
    ));
    assert!(matches!(
        controller.stop_content_share().await,
        Err(SessionError::NotActive)
    ));
    assert!(matches!(
        controller.end_meeting().await,
        Err(SessionError::NotActive)
    ));
    controller.leave().await.expect("leave from idle is a no-op");
    controller
        .apply_engine_event(presence("A1", true, None))
        .await;
    assert!(controller.view().await.participants.is_empty());
}

#[tokio::test]
async fn content_share_is_routed_to_engine_and_reconciled_from_tile_stream() {
    let engine = Arc::new(FakeEngine::new());
    let controller = controller_with(
        Arc::clone(&engine),
        Arc::new(FakeBackend::default()),
        ControllerOptions {
            sinks: SinkLayout {
                content_share: Some(SinkHandle::new("screen")),
                ..SinkLayout::default()
            },
            ..ControllerOptions::default()
        },
    );
    controller
        .join(descriptor_target("m-1", "me"))
        .await
        .expect("join");
    let mut events = controller.subscribe_events();

    controller
        .start_content_share(ContentSource("screen:0".into()))
        .await
        .expect("share");
    assert!(controller.view().await.content_sharing);
    assert!(controller.view().await.tiles.content.is_none());

    controller
        .apply_engine_event(EngineEvent::TileChanged(TileNotification::updated(
            TileId(8),
            AttendeeId::new("me#content"),
            true,
            true,
        )))
        .await;
    let view = controller.view().await;
    let content = view.tiles.content.expect("content tile");
    assert_eq!(content.tile.sink, Some(SinkHandle::new("screen")));
    assert!(view.tiles.local.is_none());

    let mut saw_share_event = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, ControllerEvent::ContentShareChanged(true)) {
            saw_share_event = true;
        }
    }
    assert!(saw_share_event);

    controller.stop_content_share().await.expect("stop share");
    assert!(!controller.view().await.content_sharing);
    assert!(engine
        .calls()
        .contains(&"start_content_share:screen:0".to_string()));
}

#[tokio::test]
async fn transcription_toggles_use_active_meeting_id() {
    let backend = Arc::new(FakeBackend::default());
    let controller = controller_with(
        Arc::new(FakeEngine::new()),
        Arc::clone(&backend),
        ControllerOptions::default(),
    );
    controller.create().await.expect("create");

    controller.start_transcription().await.expect("start");
    assert!(controller.view().await.transcribing);
    controller.stop_transcription().await.expect("stop");
    assert!(!controller.view().await.transcribing);

    assert_eq!(
        backend.calls(),
        vec![
            "create_meeting",
            "start_transcription:m-1",
            "stop_transcription:m-1",
        ]
    );
}

#[tokio::test]
async fn end_meeting_tears_down_even_when_backend_fails() {
    let backend = Arc::new(FakeBackend {
        fail_end: true,
        ..FakeBackend::default()
    });
    let engine = Arc::new(FakeEngine::new());
    let controller = controller_with(
        Arc::clone(&engine),
        Arc::clone(&backend),
        ControllerOptions::default(),
    );
    controller.create().await.expect("create");

    controller.end_meeting().await.expect("end");

    assert_eq!(controller.phase().await, SessionPhase::Idle);
    assert!(backend.calls().contains(&"end_meeting:m-1".to_string()));
    assert_eq!(engine.calls().last().map(String::as_str), Some("stop"));
    let view = controller.view().await;
    assert!(view.meeting_id.is_none());
    assert!(view.participants.is_empty());
}

#[tokio::test]
async fn select_device_updates_selection() {
    let engine = Arc::new(FakeEngine::new());
    let controller = controller_with(
        Arc::clone(&engine),
        Arc::new(FakeBackend::default()),
        ControllerOptions::default(),
    );
    controller
        .join(descriptor_target("m-1", "me"))
        .await
        .expect("join");

    controller
        .select_device(DeviceKind::AudioOutput, DeviceId::new("headset"))
        .await
        .expect("select");

    assert_eq!(
        controller.view().await.devices.audio_output,
        Some(DeviceId::new("headset"))
    );
}

#[tokio::test]
async fn loopback_engine_notifications_reach_the_view() {
    let controller = SessionController::new(
        Arc::new(FakeBackend::default()),
        Arc::new(LoopbackConnector::default()),
        ControllerOptions {
            sinks: SinkLayout {
                local_video: Some(SinkHandle::new("local")),
                ..SinkLayout::default()
            },
            display_name: Some("Host".into()),
            ..ControllerOptions::default()
        },
    );
    controller.create().await.expect("create");

    let mut view = controller.view().await;
    for _ in 0..400 {
        if view.tiles.local.is_some() && !view.participants.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
        view = controller.view().await;
    }

    assert_eq!(view.participants.len(), 1);
    assert_eq!(view.participants[0].label, "Host");
    let local = view.tiles.local.expect("local tile");
    assert_eq!(local.tile.attendee_id, AttendeeId::new("host-1"));
    assert_eq!(local.tile.sink, Some(SinkHandle::new("local")));

    controller.leave().await.expect("leave");
    assert_eq!(controller.phase().await, SessionPhase::Idle);
}

#[tokio::test]
async fn descriptor_join_needs_no_backend_but_transcription_does() {
    let controller = SessionController::new(
        Arc::new(MissingMeetingBackend),
        Arc::new(FakeConnector {
            engine: Arc::new(FakeEngine::new()),
            fail: false,
        }),
        ControllerOptions::default(),
    );

    controller
        .join(descriptor_target("m-1", "me"))
        .await
        .expect("join");

    let err = controller
        .start_transcription()
        .await
        .expect_err("no backend");
    assert!(matches!(err, SessionError::Backend(_)));
    let view = controller.view().await;
    assert_eq!(view.phase, SessionPhase::Active);
    assert!(!view.transcribing);
    assert!(view
        .status
        .expect("status")
        .starts_with("Error starting transcription"));
}

#[tokio::test]
async fn leave_during_content_share_start_waits_and_stops_the_share() {
    let (engine, gate) = FakeEngine::new().gated_on("start_content_share");
    let engine = Arc::new(engine);
    let controller = controller_with(
        Arc::clone(&engine),
        Arc::new(FakeBackend::default()),
        ControllerOptions::default(),
    );
    controller
        .join(descriptor_target("m-1", "me"))
        .await
        .expect("join");

    let share = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move {
            controller
                .start_content_share(ContentSource("screen:0".into()))
                .await
        })
    };
    wait_for_call(&engine, "start_content_share:screen:0").await;

    controller.leave().await.expect("deferred leave");
    assert_eq!(controller.phase().await, SessionPhase::Active);
    assert!(matches!(
        controller.end_meeting().await,
        Err(SessionError::Busy {
            phase: SessionPhase::Active
        })
    ));

    gate.notify_one();
    share.await.expect("task").expect("share");

    assert_eq!(controller.phase().await, SessionPhase::Idle);
    let calls = engine.calls();
    let tail: Vec<&str> = calls
        .iter()
        .map(String::as_str)
        .skip_while(|call| !call.starts_with("start_content_share"))
        .collect();
    assert_eq!(
        tail,
        vec!["start_content_share:screen:0", "stop_content_share", "stop"]
    );
    assert!(!controller.view().await.content_sharing);
}

#[tokio::test]
async fn second_sharer_replaces_content_tile_and_takes_the_sink() {
    let engine = Arc::new(FakeEngine::new());
    let controller = controller_with(
        Arc::clone(&engine),
        Arc::new(FakeBackend::default()),
        ControllerOptions {
            sinks: SinkLayout {
                content_share: Some(SinkHandle::new("screen")),
                ..SinkLayout::default()
            },
            ..ControllerOptions::default()
        },
    );
    controller
        .join(descriptor_target("m-1", "me"))
        .await
        .expect("join");

    let content_tile = |tile_id: u32, attendee: &str| {
        EngineEvent::TileChanged(TileNotification::updated(
            TileId(tile_id),
            AttendeeId::new(attendee),
            false,
            true,
        ))
    };
    controller
        .apply_engine_event(content_tile(8, "A1#content"))
        .await;
    controller
        .apply_engine_event(content_tile(9, "A2#content"))
        .await;

    let view = controller.view().await;
    let content = view.tiles.content.expect("content tile");
    assert_eq!(content.tile.tile_id, TileId(9));
    assert_eq!(content.tile.attendee_id, AttendeeId::new("A2#content"));
    assert!(view.tiles.remote.is_empty());
    assert_eq!(
        engine.bindings(),
        vec![
            (TileId(8), SinkHandle::new("screen")),
            (TileId(9), SinkHandle::new("screen")),
        ]
    );

    // The evicted tile's late removal must not disturb the current share.
    controller
        .apply_engine_event(EngineEvent::TileChanged(TileNotification::removed(TileId(
            8,
        ))))
        .await;
    let content = controller.view().await.tiles.content.expect("content tile");
    assert_eq!(content.tile.tile_id, TileId(9));
}
