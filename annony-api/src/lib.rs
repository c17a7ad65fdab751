// Annony API Library
//
// HTTP and WebSocket surface of a chat instance

pub mod http;
pub mod impls;

pub use http::{create_router, AppState};
pub use impls::MessageService;
