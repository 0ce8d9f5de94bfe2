use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::{de::DeserializeOwned, Serialize};
use shared::{
    domain::MeetingId,
    error::ApiError,
    protocol::{
        AttendeeDescriptor, CreateMeetingResponse, JoinMeetingRequest, JoinMeetingResponse,
        MeetingDescriptor, MeetingIdRequest,
    },
};
use tracing::debug;
use url::Url;

use crate::error::ProvisioningError;

/// Descriptors issued by the backend for one attendee of one meeting.
#[derive(Debug, Clone, PartialEq)]
pub struct ProvisionedMeeting {
    pub meeting: MeetingDescriptor,
    pub attendee: AttendeeDescriptor,
    pub join_url: Option<String>,
}

impl ProvisionedMeeting {
    /// Both descriptors must be present and carry their identifiers.
    pub fn from_parts(
        meeting: Option<MeetingDescriptor>,
        attendee: Option<AttendeeDescriptor>,
        join_url: Option<String>,
    ) -> std::result::Result<Self, ProvisioningError> {
        let meeting = meeting.ok_or(ProvisioningError::MissingDescriptor("meeting"))?;
        let attendee = attendee.ok_or(ProvisioningError::MissingDescriptor("attendee"))?;
        meeting.meeting_id()?;
        attendee.attendee_id()?;
        Ok(Self {
            meeting,
            attendee,
            join_url: join_url.filter(|url| !url.trim().is_empty()),
        })
    }
}

#[async_trait]
pub trait MeetingBackend: Send + Sync {
    async fn create_meeting(&self) -> Result<ProvisionedMeeting>;
    async fn join_meeting(&self, meeting_id: &MeetingId, name: &str)
        -> Result<ProvisionedMeeting>;
    async fn start_transcription(&self, meeting_id: &MeetingId) -> Result<()>;
    async fn stop_transcription(&self, meeting_id: &MeetingId) -> Result<()>;
    async fn end_meeting(&self, meeting_id: &MeetingId) -> Result<()>;
}

pub struct MissingMeetingBackend;

#[async_trait]
impl MeetingBackend for MissingMeetingBackend {
    async fn create_meeting(&self) -> Result<ProvisionedMeeting> {
        Err(anyhow!("meeting backend is unavailable"))
    }

    async fn join_meeting(
        &self,
        meeting_id: &MeetingId,
        _name: &str,
    ) -> Result<ProvisionedMeeting> {
        Err(anyhow!(
            "meeting backend is unavailable; cannot join {meeting_id}"
        ))
    }

    async fn start_transcription(&self, _meeting_id: &MeetingId) -> Result<()> {
        Err(anyhow!("meeting backend is unavailable"))
    }

    async fn stop_transcription(&self, _meeting_id: &MeetingId) -> Result<()> {
        Err(anyhow!("meeting backend is unavailable"))
    }

    async fn end_meeting(&self, _meeting_id: &MeetingId) -> Result<()> {
        Err(anyhow!("meeting backend is unavailable"))
    }
}

/// JSON-over-HTTP meeting backend.
pub struct HttpMeetingBackend {
    http: Client,
    base_url: String,
}

impl HttpMeetingBackend {
    pub fn new(base_url: &str) -> Result<Self> {
        let parsed = Url::parse(base_url.trim())
            .with_context(|| format!("invalid backend url: {base_url}"))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            bail!("backend url must start with http:// or https://");
        }
        Ok(Self {
            http: Client::new(),
            base_url: parsed.as_str().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post<B: Serialize + ?Sized>(&self, path: &str, body: Option<&B>) -> Result<Response> {
        let url = format!("{}/{path}", self.base_url);
        debug!(%url, "backend: POST");
        let mut request = self.http.post(&url);
        if let Some(body) = body {
            request = request.json(body);
        }
        let res = request
            .send()
            .await
            .with_context(|| format!("failed to reach meeting backend: {url}"))?;

        let status = res.status();
        if status.is_success() {
            return Ok(res);
        }

        let text = res.text().await.unwrap_or_default();
        match serde_json::from_str::<ApiError>(&text) {
            Ok(api_error) => Err(api_error)
                .with_context(|| format!("{path} failed with status {status}")),
            Err(_) => Err(anyhow!("{path} failed with status {status}: {text}")),
        }
    }

    async fn post_json<B, R>(&self, path: &str, body: Option<&B>) -> Result<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let res = self.post(path, body).await?;
        res.json::<R>()
            .await
            .with_context(|| format!("invalid {path} response body"))
    }
}

#[async_trait]
impl MeetingBackend for HttpMeetingBackend {
    async fn create_meeting(&self) -> Result<ProvisionedMeeting> {
        let body: CreateMeetingResponse = self
            .post_json::<MeetingIdRequest, _>("createMeeting", None)
            .await?;
        Ok(ProvisionedMeeting::from_parts(
            body.meeting,
            body.attendee,
            body.join_url,
        )?)
    }

    async fn join_meeting(
        &self,
        meeting_id: &MeetingId,
        name: &str,
    ) -> Result<ProvisionedMeeting> {
        let request = JoinMeetingRequest {
            meeting_id: meeting_id.clone(),
            name: name.to_string(),
        };
        let body: JoinMeetingResponse = self.post_json("joinMeeting", Some(&request)).await?;
        Ok(ProvisionedMeeting::from_parts(
            body.meeting,
            body.attendee,
            None,
        )?)
    }

    async fn start_transcription(&self, meeting_id: &MeetingId) -> Result<()> {
        self.post(
            "startTranscription",
            Some(&MeetingIdRequest {
                meeting_id: meeting_id.clone(),
            }),
        )
        .await?;
        Ok(())
    }

    async fn stop_transcription(&self, meeting_id: &MeetingId) -> Result<()> {
        self.post(
            "stopTranscription",
            Some(&MeetingIdRequest {
                meeting_id: meeting_id.clone(),
            }),
        )
        .await?;
        Ok(())
    }

    async fn end_meeting(&self, meeting_id: &MeetingId) -> Result<()> {
        self.post(
            "endMeeting",
            Some(&MeetingIdRequest {
                meeting_id: meeting_id.clone(),
            }),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/backend_tests.rs"]
mod tests;
