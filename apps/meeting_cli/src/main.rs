mod config;

use std::{fs, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use client_core::{
    ControllerEvent, ControllerOptions, HttpMeetingBackend, JoinTarget, SessionController,
};
use conference_engine::{ContentSource, LoopbackConnector};
use shared::{
    domain::MeetingId,
    protocol::{AttendeeDescriptor, MeetingDescriptor},
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::config::load_settings;

#[derive(Parser, Debug)]
#[command(about = "Host or join a meeting against a meeting backend")]
struct Cli {
    /// Overrides `backend_url` from settings.
    #[arg(long, global = true)]
    backend_url: Option<String>,
    /// Overrides `log_filter` from settings.
    #[arg(long, global = true)]
    log_filter: Option<String>,
    /// Join with the camera off.
    #[arg(long, global = true)]
    no_video: bool,
    #[command(flatten)]
    media: MediaArgs,
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct MediaArgs {
    /// Share this capture source once the meeting is active.
    #[arg(long, global = true)]
    share_screen: Option<String>,
    #[arg(long, global = true)]
    transcribe: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Provision a new meeting and join it as host.
    Host {
        /// Write the meeting descriptor here for `join --meeting-file`;
        /// printed to stdout when omitted.
        #[arg(long)]
        export_meeting: Option<PathBuf>,
    },
    /// Join an existing meeting by id, or with descriptors issued earlier.
    Join {
        #[arg(long, conflicts_with_all = ["meeting_file", "attendee_file"])]
        meeting_id: Option<String>,
        #[arg(long)]
        name: Option<String>,
        #[arg(long, requires = "attendee_file")]
        meeting_file: Option<PathBuf>,
        #[arg(long, requires = "meeting_file")]
        attendee_file: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut settings = load_settings();
    if let Some(url) = cli.backend_url.clone() {
        settings.backend_url = url;
    }
    if let Some(filter) = cli.log_filter.clone() {
        settings.log_filter = filter;
    }
    if cli.no_video {
        settings.start_local_video = false;
    }

    tracing_subscriber::fmt()
        .with_env_filter(settings.log_filter.as_str())
        .init();

    let backend = HttpMeetingBackend::new(&settings.backend_url)?;
    info!(backend = %backend.base_url(), "meeting_cli: using backend");

    let controller = SessionController::new(
        Arc::new(backend),
        Arc::new(LoopbackConnector::default()),
        ControllerOptions {
            sinks: settings.sink_layout(),
            start_local_video: settings.start_local_video,
            display_name: settings.display_name.clone(),
        },
    );
    let printer = tokio::spawn(print_events(controller.subscribe_events()));

    let hosting = matches!(cli.command, Command::Host { .. });
    let mut export_meeting = None;
    let result = match cli.command {
        Command::Host {
            export_meeting: path,
        } => {
            export_meeting = path;
            controller.create().await
        }
        Command::Join {
            meeting_id,
            name,
            meeting_file,
            attendee_file,
        } => {
            let target = join_target(
                meeting_id,
                name.or_else(|| settings.display_name.clone()),
                meeting_file,
                attendee_file,
            )?;
            controller.join(target).await
        }
    };
    result.context("meeting_cli: could not enter the meeting")?;

    let view = controller.view().await;
    if let Some(meeting_id) = &view.meeting_id {
        println!("In meeting {meeting_id}");
    }
    if let Some(join_url) = &view.join_url {
        println!("Share this link: {join_url}");
    }
    if hosting {
        if let Some(meeting) = &view.meeting_descriptor {
            export_descriptor(meeting, export_meeting.as_ref())?;
        }
    }

    if let Some(source) = cli.media.share_screen {
        if let Err(err) = controller.start_content_share(ContentSource(source)).await {
            warn!("meeting_cli: content share failed: {err}");
        }
    }
    if cli.media.transcribe {
        if let Err(err) = controller.start_transcription().await {
            warn!("meeting_cli: transcription failed: {err}");
        }
    }

    println!("Press ctrl-c to {}", if hosting { "end the meeting" } else { "leave" });
    tokio::signal::ctrl_c()
        .await
        .context("meeting_cli: failed to listen for ctrl-c")?;

    let exit = if hosting {
        controller.end_meeting().await
    } else {
        controller.leave().await
    };
    if let Err(err) = exit {
        warn!("meeting_cli: exit was not clean: {err}");
    }

    printer.abort();
    Ok(())
}

fn join_target(
    meeting_id: Option<String>,
    name: Option<String>,
    meeting_file: Option<PathBuf>,
    attendee_file: Option<PathBuf>,
) -> Result<JoinTarget> {
    if let (Some(meeting_file), Some(attendee_file)) = (meeting_file, attendee_file) {
        return Ok(JoinTarget::Descriptors {
            meeting: MeetingDescriptor(read_json(&meeting_file)?),
            attendee: AttendeeDescriptor(read_json(&attendee_file)?),
        });
    }
    // Empty values are refused by the controller with a validation status.
    Ok(JoinTarget::MeetingId {
        meeting_id: MeetingId::new(meeting_id.unwrap_or_default()),
        name: name.unwrap_or_default(),
    })
}

fn export_descriptor(meeting: &MeetingDescriptor, path: Option<&PathBuf>) -> Result<()> {
    let json =
        serde_json::to_string_pretty(meeting).context("failed to encode meeting descriptor")?;
    match path {
        Some(path) => {
            fs::write(path, json)
                .with_context(|| format!("failed to write descriptor '{}'", path.display()))?;
            println!("Meeting descriptor written to {}", path.display());
        }
        None => println!("Meeting descriptor:\n{json}"),
    }
    Ok(())
}

fn read_json(path: &PathBuf) -> Result<serde_json::Value> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read descriptor '{}'", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("descriptor '{}' is not valid json", path.display()))
}

async fn print_events(mut events: tokio::sync::broadcast::Receiver<ControllerEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => print_event(&event),
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "meeting_cli: event printer lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

fn print_event(event: &ControllerEvent) {
    match event {
        ControllerEvent::PhaseChanged(phase) => println!("[phase] {phase}"),
        ControllerEvent::Status(status) => println!("[status] {status}"),
        ControllerEvent::RosterUpdated(attendees) => {
            let names: Vec<&str> = attendees.iter().map(|a| a.label()).collect();
            println!("[roster] {}", names.join(", "));
        }
        ControllerEvent::TilesUpdated(layout) => {
            let local = layout.local.as_ref().map(|t| t.label.as_str());
            let content = layout.content.as_ref().map(|t| t.label.as_str());
            println!(
                "[tiles] local={} remote={} content={}",
                local.unwrap_or("-"),
                layout.remote.len(),
                content.unwrap_or("-"),
            );
        }
        ControllerEvent::ContentShareChanged(on) => println!("[share] {on}"),
        ControllerEvent::TranscriptionChanged(on) => println!("[transcription] {on}"),
        ControllerEvent::Error(message) => eprintln!("[error] {message}"),
    }
}
