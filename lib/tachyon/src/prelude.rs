pub use crate::discovery::{Endpoint, EndpointPolicy, Locator, StaticLocator, UniformPolicy};
pub use crate::id::{ChannelId, Id, ReconnectKey, UserId};
pub use crate::net::codec::Callback;
pub use crate::session::channel::{ChannelHandle, ChannelListener, ChannelRef, Origin};
pub use crate::session::{
    ConnState, Link, Session, SessionConfig, SessionError, SessionListener,
};
