use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! string_id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

string_id_newtype!(MeetingId);
string_id_newtype!(AttendeeId);
string_id_newtype!(DeviceId);
string_id_newtype!(SinkHandle);

/// Engine-assigned video tile identifier. `0` is never a bound tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TileId(pub u32);

impl fmt::Display for TileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TileRole {
    LocalCamera,
    RemoteCamera,
    ContentShare,
}

impl TileRole {
    /// Content flag wins over the local flag: a local screen share is still content.
    pub fn from_flags(is_local: bool, is_content: bool) -> Self {
        if is_content {
            Self::ContentShare
        } else if is_local {
            Self::LocalCamera
        } else {
            Self::RemoteCamera
        }
    }

    /// Roles that may be held by at most one tile at a time.
    pub fn is_exclusive(self) -> bool {
        matches!(self, Self::LocalCamera | Self::ContentShare)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceState {
    Present,
    Absent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    AudioInput,
    AudioOutput,
    VideoInput,
}

impl DeviceKind {
    pub const ALL: [DeviceKind; 3] = [Self::AudioInput, Self::AudioOutput, Self::VideoInput];

    pub fn label(self) -> &'static str {
        match self {
            Self::AudioInput => "audio_input",
            Self::AudioOutput => "audio_output",
            Self::VideoInput => "video_input",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaDevice {
    pub device_id: DeviceId,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attendee {
    pub attendee_id: AttendeeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub presence: PresenceState,
}

impl Attendee {
    pub fn label(&self) -> &str {
        self.display_name
            .as_deref()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| self.attendee_id.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tile {
    pub tile_id: TileId,
    pub attendee_id: AttendeeId,
    pub role: TileRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sink: Option<SinkHandle>,
}

/// Active device per category; `None` means the category was left unset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSelection {
    pub audio_input: Option<DeviceId>,
    pub audio_output: Option<DeviceId>,
    pub video_input: Option<DeviceId>,
}

impl DeviceSelection {
    pub fn get(&self, kind: DeviceKind) -> Option<&DeviceId> {
        match kind {
            DeviceKind::AudioInput => self.audio_input.as_ref(),
            DeviceKind::AudioOutput => self.audio_output.as_ref(),
            DeviceKind::VideoInput => self.video_input.as_ref(),
        }
    }

    pub fn set(&mut self, kind: DeviceKind, device: Option<DeviceId>) {
        let slot = match kind {
            DeviceKind::AudioInput => &mut self.audio_input,
            DeviceKind::AudioOutput => &mut self.audio_output,
            DeviceKind::VideoInput => &mut self.video_input,
        };
        *slot = device;
    }

    pub fn count(&self) -> usize {
        DeviceKind::ALL
            .iter()
            .filter(|kind| self.get(**kind).is_some())
            .count()
    }
}
