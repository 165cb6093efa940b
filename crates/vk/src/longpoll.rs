use std::{sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::events::{EventContext, EventDispatcher, VkEnvelope, VkEvent};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport failed to connect: {0}")]
    Connect(String),
    #[error("transport read failed: {0}")]
    Receive(String),
    #[error("transport disconnect failed: {0}")]
    Disconnect(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self { max_retries: 8, base_delay_ms: 500, max_delay_ms: 30_000 }
    }
}

impl ReconnectPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(16);
        let multiplier = 1_u64 << exponent;
        let delay_ms = self.base_delay_ms.saturating_mul(multiplier).min(self.max_delay_ms);
        Duration::from_millis(delay_ms)
    }
}

/// Source of long-poll batches. `Ok(None)` means the stream ended for good.
#[async_trait]
pub trait LongPollTransport: Send + Sync {
    async fn connect(&self) -> Result<(), TransportError>;
    async fn next_batch(&self) -> Result<Option<Vec<VkEnvelope>>, TransportError>;
    async fn disconnect(&self) -> Result<(), TransportError>;
}

#[derive(Default)]
pub struct NoopLongPollTransport;

#[async_trait]
impl LongPollTransport for NoopLongPollTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn next_batch(&self) -> Result<Option<Vec<VkEnvelope>>, TransportError> {
        Ok(None)
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

pub struct LongPollRunner {
    transport: Arc<dyn LongPollTransport>,
    dispatcher: EventDispatcher,
    reconnect_policy: ReconnectPolicy,
}

impl Default for LongPollRunner {
    fn default() -> Self {
        Self {
            transport: Arc::new(NoopLongPollTransport),
            dispatcher: EventDispatcher::default(),
            reconnect_policy: ReconnectPolicy::default(),
        }
    }
}

impl LongPollRunner {
    pub fn new(
        transport: Arc<dyn LongPollTransport>,
        dispatcher: EventDispatcher,
        reconnect_policy: ReconnectPolicy,
    ) -> Self {
        Self { transport, dispatcher, reconnect_policy }
    }

    /// Pumps events until the stream closes or retries are exhausted. A session that
    /// delivered at least one batch resets the retry budget.
    pub async fn start(&self) -> Result<()> {
        let mut attempt = 0_u32;
        loop {
            let mut delivered = 0_usize;
            let transport_error = match self.connect_and_pump(attempt, &mut delivered).await {
                Ok(()) => return Ok(()),
                Err(error) => error,
            };
            if delivered > 0 {
                attempt = 0;
            }

            warn!(
                attempt,
                max_retries = self.reconnect_policy.max_retries,
                error = %transport_error,
                "long poll transport failed"
            );

            if attempt >= self.reconnect_policy.max_retries {
                warn!(
                    max_retries = self.reconnect_policy.max_retries,
                    "long poll retries exhausted; stopping event loop"
                );
                return Ok(());
            }

            let delay = self.reconnect_policy.backoff(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            attempt += 1;
        }
    }

    async fn connect_and_pump(
        &self,
        attempt: u32,
        delivered: &mut usize,
    ) -> Result<(), TransportError> {
        info!(attempt, "opening vk long poll session");
        self.transport.connect().await?;
        info!(attempt, "vk long poll session established");

        loop {
            let Some(batch) = self.transport.next_batch().await? else {
                info!(attempt, "vk long poll stream closed");
                self.transport.disconnect().await?;
                return Ok(());
            };
            *delivered += 1;

            for envelope in &batch {
                self.dispatch_one(envelope).await;
            }
        }
    }

    async fn dispatch_one(&self, envelope: &VkEnvelope) {
        let user_id = sender_id(envelope);
        info!(
            event_name = "ingress.vk.event_received",
            event_id = %envelope.event_id,
            event_type = ?envelope.event.event_type(),
            correlation_id = %envelope.event_id,
            user_id = user_id.unwrap_or_default(),
            "received vk event"
        );

        let context = EventContext { correlation_id: envelope.event_id.clone() };
        match self.dispatcher.dispatch(envelope, &context).await {
            Ok(result) => debug!(
                event_id = %envelope.event_id,
                correlation_id = %envelope.event_id,
                result = ?result,
                "vk event dispatched"
            ),
            Err(error) => warn!(
                event_id = %envelope.event_id,
                correlation_id = %envelope.event_id,
                user_id = user_id.unwrap_or_default(),
                error = %error,
                "event dispatch failed; continuing long poll loop"
            ),
        }
    }
}

fn sender_id(envelope: &VkEnvelope) -> Option<i64> {
    match &envelope.event {
        VkEvent::MessageNew(message) => Some(message.from_id),
        VkEvent::MessageTypingState(event) => Some(event.from_id),
        VkEvent::Unsupported { .. } => None,
    }
}
