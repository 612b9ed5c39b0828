//! Message persistence, fleet-wide broadcast, and offline notification.

pub mod dispatch;
pub mod lifecycle;
pub mod notify;

pub use dispatch::dispatch_message;
