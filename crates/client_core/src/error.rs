use shared::protocol::DescriptorError;
use thiserror::Error;

use crate::session_controller::SessionPhase;

#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error("meeting backend request failed: {0}")]
    Request(String),
    #[error("backend response is missing the {0} descriptor")]
    MissingDescriptor(&'static str),
    #[error("incomplete descriptor: {0}")]
    IncompleteDescriptor(#[from] DescriptorError),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session busy ({phase})")]
    Busy { phase: SessionPhase },
    #[error("no active session")]
    NotActive,
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("failed to provision meeting: {0}")]
    Provisioning(#[from] ProvisioningError),
    #[error("conferencing engine error: {0}")]
    Engine(String),
    #[error("meeting backend error: {0}")]
    Backend(String),
}

impl SessionError {
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy { .. })
    }
}
