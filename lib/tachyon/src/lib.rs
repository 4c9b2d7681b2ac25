//! Client core for a session-oriented, channel-based messaging service used
//! by interactive multiplayer applications.
//!
//! A [`session::Session`] establishes an authenticated connection with a
//! named game service, then exchanges reliable and unreliable datagrams with
//! the server and with peers grouped into named channels. The stack is
//! layered leaves-first: length-tagged identifiers and cursor byte buffers,
//! the binary packet codec, the framed non-blocking transport driver, the
//! session state machine and the channel registry on top.
//!
//! Everything runs on one thread of control: the application pumps
//! [`session::Session::update`] from its own loop and receives events
//! through listener traits. Listener callbacks may send synchronously
//! through the [`session::Link`] they are handed; sends enqueue onto the
//! outbound frame queue and never block.

pub mod discovery;
pub mod id;
pub mod net;
pub mod prelude;
pub mod session;
