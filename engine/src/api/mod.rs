//! HTTP trigger: lets an external scheduler invoke `run()` over HTTP.

pub mod server;
pub mod types;

pub use server::{router, start_server, AppState};
pub use types::*;
