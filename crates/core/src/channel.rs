//! Narrow contracts the runtime uses to reach the messaging platform.

use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;

use crate::capability::ImageArtifact;
use crate::session::UserId;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("outbound delivery failed: {0}")]
    Delivery(String),
    #[error("profile lookup failed: {0}")]
    Profile(String),
}

/// Sends replies to a user. Delivery is best-effort: no retries are expected from callers.
#[async_trait]
pub trait OutboundChannel: Send + Sync {
    async fn send_text(&self, user_id: UserId, text: &str) -> Result<(), ChannelError>;
    async fn send_image(&self, user_id: UserId, image: &ImageArtifact)
        -> Result<(), ChannelError>;
}

/// Resolves the platform display name of a user.
#[async_trait]
pub trait ProfileDirectory: Send + Sync {
    async fn display_name(&self, user_id: UserId) -> Result<Option<String>, ChannelError>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutboundMessage {
    Text { user_id: UserId, text: String },
    Image { user_id: UserId, file_name: String, bytes: usize },
}

/// In-memory channel that records everything sent through it.
#[derive(Debug, Default)]
pub struct RecordingChannel {
    sent: Mutex<Vec<OutboundMessage>>,
    fail_sends: bool,
    display_name: Option<String>,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self { fail_sends: true, ..Self::default() }
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().map(|sent| sent.clone()).unwrap_or_default()
    }

    pub fn texts(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter_map(|message| match message {
                OutboundMessage::Text { text, .. } => Some(text),
                OutboundMessage::Image { .. } => None,
            })
            .collect()
    }

    fn record(&self, message: OutboundMessage) -> Result<(), ChannelError> {
        if self.fail_sends {
            return Err(ChannelError::Delivery("recording channel is set to fail".to_owned()));
        }
        self.sent
            .lock()
            .map_err(|_| ChannelError::Delivery("recording channel lock poisoned".to_owned()))?
            .push(message);
        Ok(())
    }
}

#[async_trait]
impl OutboundChannel for RecordingChannel {
    async fn send_text(&self, user_id: UserId, text: &str) -> Result<(), ChannelError> {
        self.record(OutboundMessage::Text { user_id, text: text.to_owned() })
    }

    async fn send_image(
        &self,
        user_id: UserId,
        image: &ImageArtifact,
    ) -> Result<(), ChannelError> {
        self.record(OutboundMessage::Image {
            user_id,
            file_name: image.file_name.clone(),
            bytes: image.bytes.len(),
        })
    }
}

#[async_trait]
impl ProfileDirectory for RecordingChannel {
    async fn display_name(&self, _user_id: UserId) -> Result<Option<String>, ChannelError> {
        Ok(self.display_name.clone())
    }
}
