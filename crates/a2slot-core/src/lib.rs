pub mod bus;
pub mod host;
pub mod mouse;
pub mod uthernet2;

pub use bus::{Card, Slot};
pub use mouse::MouseCard;
pub use uthernet2::Uthernet2;
