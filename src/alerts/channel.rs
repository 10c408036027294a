//! The notification channel seam.

use thiserror::Error;

use super::Envelope;
use crate::config::ChannelKind;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SendError {
    /// Worth retrying: network trouble, timeouts, 5xx, throttling.
    #[error("transient send failure: {0}")]
    Transient(String),
    /// Retrying cannot help: bad credentials, rejected payload.
    #[error("permanent send failure: {0}")]
    Permanent(String),
}

impl SendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SendError::Transient(_))
    }
}

/// A destination for alert envelopes.
#[async_trait::async_trait]
pub trait AlertChannel: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> ChannelKind;

    async fn send(&self, envelope: &Envelope) -> Result<(), SendError>;
}
