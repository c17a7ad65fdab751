//! Transport-independent chat logic
//!
//! HTTP and WebSocket handlers are thin wrappers over these types.

pub mod messaging;

pub use messaging::{ChatSession, ClientEvent, EventCodec, MessageService, ServerEvent, StreamMessage};
