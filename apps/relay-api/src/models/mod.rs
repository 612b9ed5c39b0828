pub mod group;
pub mod message;
pub mod push;
pub mod reservation;

pub use group::Group;
pub use message::NewMessage;
pub use push::{NewPushReceipt, PushReceipt};
pub use reservation::GroupReservation;
