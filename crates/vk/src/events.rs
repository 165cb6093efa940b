use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::info;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VkEnvelope {
    pub event_id: String,
    pub event: VkEvent,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VkEvent {
    MessageNew(MessageNewEvent),
    MessageTypingState(TypingStateEvent),
    Unsupported { event_type: String },
}

impl VkEvent {
    pub fn event_type(&self) -> VkEventType {
        match self {
            Self::MessageNew(_) => VkEventType::MessageNew,
            Self::MessageTypingState(_) => VkEventType::MessageTypingState,
            Self::Unsupported { .. } => VkEventType::Unsupported,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum VkEventType {
    MessageNew,
    MessageTypingState,
    Unsupported,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct MessageNewEvent {
    #[serde(default, rename = "id")]
    pub message_id: i64,
    #[serde(default)]
    pub peer_id: i64,
    pub from_id: i64,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub date: i64,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct TypingStateEvent {
    pub from_id: i64,
    #[serde(default)]
    pub to_id: i64,
    #[serde(default)]
    pub state: String,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventDecodeError {
    #[error("update is not an object with a `type` field: {0}")]
    Shape(String),
    #[error("`{event_type}` update has a malformed object: {message}")]
    Object { event_type: String, message: String },
}

#[derive(Deserialize)]
struct RawUpdate {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    object: Value,
    #[serde(default)]
    event_id: Option<String>,
}

impl VkEnvelope {
    /// Decodes one Bots Long Poll update. Updates without an `event_id` get `fallback_id`.
    pub fn decode(update: &Value, fallback_id: &str) -> Result<Self, EventDecodeError> {
        let raw = RawUpdate::deserialize(update)
            .map_err(|error| EventDecodeError::Shape(error.to_string()))?;
        let event_id = raw.event_id.unwrap_or_else(|| fallback_id.to_owned());

        let event = match raw.event_type.as_str() {
            "message_new" => {
                // API 5.103 wraps the message next to `client_info`; older versions send it bare.
                let mut object = raw.object;
                let message = object.get_mut("message").map(Value::take).unwrap_or(object);
                VkEvent::MessageNew(decode_object(&raw.event_type, message)?)
            }
            "message_typing_state" => {
                VkEvent::MessageTypingState(decode_object(&raw.event_type, raw.object)?)
            }
            _ => VkEvent::Unsupported { event_type: raw.event_type },
        };

        Ok(Self { event_id, event })
    }
}

fn decode_object<T>(event_type: &str, object: Value) -> Result<T, EventDecodeError>
where
    T: for<'de> Deserialize<'de>,
{
    serde_json::from_value(object).map_err(|error| EventDecodeError::Object {
        event_type: event_type.to_owned(),
        message: error.to_string(),
    })
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventContext {
    pub correlation_id: String,
}

impl Default for EventContext {
    fn default() -> Self {
        Self { correlation_id: "unknown-correlation-id".to_owned() }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandlerResult {
    Processed,
    Ignored,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventHandlerError {
    #[error("conversation turn failed: {0}")]
    Conversation(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error(transparent)]
    Handler(#[from] EventHandlerError),
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    fn event_type(&self) -> VkEventType;
    async fn handle(
        &self,
        envelope: &VkEnvelope,
        ctx: &EventContext,
    ) -> Result<HandlerResult, EventHandlerError>;
}

#[derive(Default)]
pub struct EventDispatcher {
    handlers: HashMap<VkEventType, Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H>(&mut self, handler: H)
    where
        H: EventHandler + 'static,
    {
        self.handlers.insert(handler.event_type(), Arc::new(handler));
    }

    pub async fn dispatch(
        &self,
        envelope: &VkEnvelope,
        ctx: &EventContext,
    ) -> Result<HandlerResult, DispatchError> {
        let Some(handler) = self.handlers.get(&envelope.event.event_type()) else {
            return Ok(HandlerResult::Ignored);
        };

        handler.handle(envelope, ctx).await.map_err(DispatchError::from)
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}

/// Dispatcher with the message handler bound to `service` and the typing logger.
pub fn conversation_dispatcher<S>(service: S) -> EventDispatcher
where
    S: ConversationService + 'static,
{
    let mut dispatcher = EventDispatcher::new();
    dispatcher.register(MessageNewHandler::new(service));
    dispatcher.register(TypingStateHandler);
    dispatcher
}

/// Runs one conversation turn for an incoming message.
#[async_trait]
pub trait ConversationService: Send + Sync {
    async fn handle_message(
        &self,
        message: &MessageNewEvent,
        ctx: &EventContext,
    ) -> Result<(), EventHandlerError>;
}

#[async_trait]
impl<S> ConversationService for Arc<S>
where
    S: ConversationService + ?Sized,
{
    async fn handle_message(
        &self,
        message: &MessageNewEvent,
        ctx: &EventContext,
    ) -> Result<(), EventHandlerError> {
        (**self).handle_message(message, ctx).await
    }
}

pub struct MessageNewHandler<S> {
    service: S,
}

impl<S> MessageNewHandler<S>
where
    S: ConversationService,
{
    pub fn new(service: S) -> Self {
        Self { service }
    }
}

#[async_trait]
impl<S> EventHandler for MessageNewHandler<S>
where
    S: ConversationService + 'static,
{
    fn event_type(&self) -> VkEventType {
        VkEventType::MessageNew
    }

    async fn handle(
        &self,
        envelope: &VkEnvelope,
        ctx: &EventContext,
    ) -> Result<HandlerResult, EventHandlerError> {
        let VkEvent::MessageNew(message) = &envelope.event else {
            return Ok(HandlerResult::Ignored);
        };
        // Community-authored messages echo back with a negative sender id.
        if message.from_id <= 0 {
            return Ok(HandlerResult::Ignored);
        }

        self.service.handle_message(message, ctx).await?;
        Ok(HandlerResult::Processed)
    }
}

pub struct TypingStateHandler;

#[async_trait]
impl EventHandler for TypingStateHandler {
    fn event_type(&self) -> VkEventType {
        VkEventType::MessageTypingState
    }

    async fn handle(
        &self,
        envelope: &VkEnvelope,
        ctx: &EventContext,
    ) -> Result<HandlerResult, EventHandlerError> {
        let VkEvent::MessageTypingState(event) = &envelope.event else {
            return Ok(HandlerResult::Ignored);
        };

        info!(
            event_name = "ingress.vk.typing_state",
            correlation_id = %ctx.correlation_id,
            user_id = event.from_id,
            "user is typing"
        );
        Ok(HandlerResult::Processed)
    }
}
