//! OpenChamber Protocol
//!
//! Shared types for communication between the OpenChamber host process and
//! browser clients. These types are serialized as JSON over HTTP and SSE.

use uuid::Uuid;

// Re-exports
pub mod client;
pub mod server;
pub mod types;

pub use client::*;
pub use server::*;
pub use types::*;

/// Generate a new unique ID
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
