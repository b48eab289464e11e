//! HTTP and WebSocket transport for the orchestrator.

pub mod bridge;
pub mod client;
pub mod handlers;
pub mod rpc;
pub mod server;
pub mod wire;

pub use handlers::HandlerState;
pub use server::{start, ServerConfig, ServerHandle};
