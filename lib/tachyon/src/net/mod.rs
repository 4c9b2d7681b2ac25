//! The networking modules handle all communication between the client and
//! the game service: frame buffering, packet encoding and the non-blocking
//! socket driver.

pub mod buffer;
pub mod codec;
pub mod driver;
pub mod packet;
pub mod support;
