use std::{collections::HashMap, fs, path::Path};

use client_core::SinkLayout;
use shared::domain::SinkHandle;

pub const SETTINGS_FILE: &str = "meeting.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub backend_url: String,
    pub display_name: Option<String>,
    pub log_filter: String,
    pub start_local_video: bool,
    pub remote_sinks: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            backend_url: "http://127.0.0.1:8080".into(),
            display_name: None,
            log_filter: "info".into(),
            start_local_video: true,
            remote_sinks: 4,
        }
    }
}

impl ClientSettings {
    /// One handle per rendering target; remote cameras get `remote-video-N` slots.
    pub fn sink_layout(&self) -> SinkLayout {
        SinkLayout {
            audio: Some(SinkHandle::new("audio-out")),
            local_video: Some(SinkHandle::new("local-video")),
            content_share: Some(SinkHandle::new("content-share")),
            remote_video: (0..self.remote_sinks)
                .map(|slot| SinkHandle::new(format!("remote-video-{slot}")))
                .collect(),
        }
    }
}

pub fn load_settings() -> ClientSettings {
    load_settings_from(Path::new(SETTINGS_FILE), |key| std::env::var(key).ok())
}

pub fn load_settings_from(
    path: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> ClientSettings {
    let mut settings = ClientSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<HashMap<String, toml::Value>>(&raw) {
            Ok(file_cfg) => apply_file(&mut settings, &file_cfg),
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "config: ignoring unreadable settings file")
            }
        }
    }

    if let Some(v) = env("MEETING_BACKEND_URL") {
        settings.backend_url = v;
    }
    if let Some(v) = env("APP__BACKEND_URL") {
        settings.backend_url = v;
    }
    if let Some(v) = env("APP__DISPLAY_NAME") {
        settings.display_name = non_empty(v);
    }
    if let Some(v) = env("APP__LOG_FILTER") {
        settings.log_filter = v;
    }
    if let Some(v) = env("APP__START_LOCAL_VIDEO") {
        if let Some(parsed) = parse_flag(&v) {
            settings.start_local_video = parsed;
        }
    }
    if let Some(v) = env("APP__REMOTE_SINKS") {
        if let Ok(parsed) = v.trim().parse::<usize>() {
            settings.remote_sinks = parsed;
        }
    }

    settings
}

fn apply_file(settings: &mut ClientSettings, file_cfg: &HashMap<String, toml::Value>) {
    if let Some(v) = file_cfg.get("backend_url").and_then(toml::Value::as_str) {
        settings.backend_url = v.to_string();
    }
    if let Some(v) = file_cfg.get("display_name").and_then(toml::Value::as_str) {
        settings.display_name = non_empty(v.to_string());
    }
    if let Some(v) = file_cfg.get("log_filter").and_then(toml::Value::as_str) {
        settings.log_filter = v.to_string();
    }
    if let Some(v) = file_cfg
        .get("start_local_video")
        .and_then(toml::Value::as_bool)
    {
        settings.start_local_video = v;
    }
    if let Some(v) = file_cfg
        .get("remote_sinks")
        .and_then(toml::Value::as_integer)
        .and_then(|n| usize::try_from(n).ok())
    {
        settings.remote_sinks = v;
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
