pub mod id;
pub mod message;

pub use id::{generate_id, ConnectionId};
pub use message::{display_time, Message, SYSTEM_SENDER};
