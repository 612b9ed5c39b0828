//! Per-process connection registry and realtime transport.

pub mod frames;
pub mod presence;
pub mod registry;
pub mod server;
pub mod subscriber;
