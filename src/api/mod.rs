pub mod client;
pub mod error;
pub mod types;

pub use client::AgentClient;
pub use error::ApiError;
pub use types::{SERVER_ONLINE_KEY, ServerOnlineState};
