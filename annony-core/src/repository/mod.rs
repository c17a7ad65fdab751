pub mod history;

pub use history::{HistoryStore, MemoryHistoryStore, PgHistoryStore};
