//! Domain services behind the HTTP handlers.
//!
//! Handlers stay thin: they authenticate, deserialize, and delegate here.
//! Services own the ordering of store operations, PKI calls, and audit
//! events for each operation.

pub mod dispatch;
pub mod enrollment;
pub mod heartbeat;
