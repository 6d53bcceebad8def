//! Event payloads crossing the state manager's boundary.

pub mod payloads;

pub use payloads::StateUpdatePayload;
