//! Tierpool daemon - runs the tiering engine and serves the JSON-RPC admin
//! surface.

pub mod handler;
pub mod server;

pub use server::{build_router, start_server, AppState, ServerHandle};
