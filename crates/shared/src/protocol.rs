use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::domain::{AttendeeId, MeetingId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DescriptorError {
    #[error("{descriptor} descriptor is missing field {field}")]
    MissingField {
        descriptor: &'static str,
        field: &'static str,
    },
}

/// Opaque meeting payload issued by the backend. Only `MeetingId` is read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MeetingDescriptor(pub Value);

impl MeetingDescriptor {
    pub const ID_FIELD: &'static str = "MeetingId";

    pub fn meeting_id(&self) -> Result<MeetingId, DescriptorError> {
        non_empty_str(&self.0, Self::ID_FIELD)
            .map(MeetingId::new)
            .ok_or(DescriptorError::MissingField {
                descriptor: "meeting",
                field: Self::ID_FIELD,
            })
    }
}

/// Opaque per-attendee credential payload. Only `AttendeeId` is read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttendeeDescriptor(pub Value);

impl AttendeeDescriptor {
    pub const ID_FIELD: &'static str = "AttendeeId";

    pub fn attendee_id(&self) -> Result<AttendeeId, DescriptorError> {
        non_empty_str(&self.0, Self::ID_FIELD)
            .map(AttendeeId::new)
            .ok_or(DescriptorError::MissingField {
                descriptor: "attendee",
                field: Self::ID_FIELD,
            })
    }
}

fn non_empty_str<'a>(value: &'a Value, field: &str) -> Option<&'a str> {
    value
        .get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMeetingResponse {
    #[serde(default)]
    pub meeting: Option<MeetingDescriptor>,
    #[serde(default)]
    pub attendee: Option<AttendeeDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinMeetingRequest {
    pub meeting_id: MeetingId,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinMeetingResponse {
    #[serde(default)]
    pub meeting: Option<MeetingDescriptor>,
    #[serde(default)]
    pub attendee: Option<AttendeeDescriptor>,
}

/// Body shared by the transcription and end-meeting calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeetingIdRequest {
    pub meeting_id: MeetingId,
}
