//! VK community transport for meetbot.
//!
//! - **Long Poll** (`longpoll`): Bots Long Poll loop with reconnection logic
//! - **Events** (`events`): update decoding and dispatch to handlers
//! - **API** (`api`): `messages.send`, photo and document uploads, `users.get`
//!
//! ```text
//! VK Long Poll -> LongPollRunner -> EventDispatcher -> MessageNewHandler -> AgentRuntime
//!                                                                  |
//!                                  VkApiClient (OutboundChannel) <-+
//! ```

pub mod api;
pub mod events;
pub mod longpoll;

pub use api::{VkApiClient, VkApiError, VkLongPollTransport};
pub use events::{
    ConversationService, EventContext, EventDispatcher, EventHandler, EventHandlerError,
    HandlerResult, MessageNewEvent, MessageNewHandler, TypingStateHandler, VkEnvelope, VkEvent,
    VkEventType,
};
pub use longpoll::{LongPollRunner, LongPollTransport, ReconnectPolicy, TransportError};
