//! Conversation runtime for meetbot.
//!
//! Each inbound utterance runs one turn:
//! 1. **Normalize** whitespace and load the user's session
//! 2. **Decide**: advance the active scenario, or route the utterance through the intent catalog
//! 3. **Deliver** images and the text reply through the outbound channel
//! 4. **Persist** the session, then enrich the profile when the display name is unknown
//!
//! `capabilities` holds the concrete validators, responders and the ticket producer the
//! built-in catalog refers to by name.

pub mod capabilities;
pub mod runtime;
pub mod ticket;

pub use capabilities::{default_registry, CapabilitySettings, Clock, FixedClock, SystemClock};
pub use runtime::{AgentRuntime, TurnError, TurnReport};
