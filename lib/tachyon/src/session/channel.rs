//! Channel handles and the registry that multiplexes per-channel traffic
//! over the single session transport. Channels are entries in a session-owned
//! map; application code addresses them through copyable handles and borrows
//! a [`ChannelRef`] for the duration of an operation.

use crate::id::{ChannelId, UserId};
use crate::session::{Link, SessionError};
use indexmap::IndexMap;
use quark::logging::{self, debug, Logger};

/// Who sent a channel message. The server's own traffic is tagged
/// distinctly so applications can separate authoritative messages from
/// peer chatter.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Origin {
    Server,
    Peer(UserId),
}

/// Sink for the events of one channel. Callbacks receive a [`ChannelRef`]
/// and may send on the channel (or leave it) from within the callback.
pub trait ChannelListener {
    fn on_player_joined(&mut self, _chan: &mut ChannelRef, _user: &UserId) {}

    fn on_player_left(&mut self, _chan: &mut ChannelRef, _user: &UserId) {}

    fn on_data_arrived(
        &mut self,
        _chan: &mut ChannelRef,
        _from: &Origin,
        _data: &[u8],
        _reliable: bool,
    ) {
    }

    /// The channel is gone; the handle is invalid once this returns.
    fn on_channel_closed(&mut self, _name: &str) {}
}

/// Listener installed on channels the application declined to observe.
pub struct NopChannelListener;

impl ChannelListener for NopChannelListener {}

/// A copyable key addressing a channel in the session's registry. Valid
/// only while the channel id is present in the registry.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ChannelHandle(pub(crate) ChannelId);

impl ChannelHandle {
    #[inline]
    pub fn id(&self) -> &ChannelId {
        &self.0
    }
}

pub(crate) struct ChannelEntry {
    pub(crate) id: ChannelId,
    pub(crate) name: String,
    pub(crate) listener: Box<dyn ChannelListener>,
}

/// A borrowed view of one live channel, combining its registry entry with
/// the session's transmitter half so sends can be issued.
pub struct ChannelRef<'a> {
    pub(crate) link: &'a mut Link,
    pub(crate) id: &'a ChannelId,
    pub(crate) name: &'a str,
}

impl<'a> ChannelRef<'a> {
    #[inline]
    pub fn id(&self) -> &ChannelId {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        self.name
    }

    #[inline]
    pub fn handle(&self) -> ChannelHandle {
        ChannelHandle(*self.id)
    }

    /// Sends to a single peer on this channel.
    #[inline]
    pub fn send_unicast(
        &mut self,
        to: &UserId,
        data: &[u8],
        reliable: bool,
    ) -> Result<(), SessionError> {
        self.link.send_unicast(self.id, to, data, reliable)
    }

    /// Sends to an explicit recipient list (at most 255 peers).
    #[inline]
    pub fn send_multicast(
        &mut self,
        to: &[UserId],
        data: &[u8],
        reliable: bool,
    ) -> Result<(), SessionError> {
        self.link.send_multicast(self.id, to, data, reliable)
    }

    /// Sends to every member of this channel.
    #[inline]
    pub fn send_broadcast(&mut self, data: &[u8], reliable: bool) -> Result<(), SessionError> {
        self.link.send_broadcast(self.id, data, reliable)
    }

    /// Requests to leave the channel. The registry entry is removed when
    /// the server confirms with its channel-left notification.
    #[inline]
    pub fn close(&mut self) -> Result<(), SessionError> {
        self.link.leave_channel(self.id)
    }
}

/// The channel-id to channel-entry map. Mutated only from the session's
/// dispatch context; iteration order is insertion order so teardown is
/// deterministic.
pub(crate) struct Registry {
    map: IndexMap<ChannelId, ChannelEntry>,
    log: Logger,
}

impl Registry {
    #[inline]
    pub(crate) fn new(log: &Logger) -> Registry {
        Registry {
            map: IndexMap::new(),
            log: logging::child(log),
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }

    #[inline]
    pub(crate) fn get(&self, id: &ChannelId) -> Option<&ChannelEntry> {
        self.map.get(id)
    }

    #[inline]
    pub(crate) fn get_mut(&mut self, id: &ChannelId) -> Option<&mut ChannelEntry> {
        self.map.get_mut(id)
    }

    /// Registers a newly joined channel. Returns false when the id is
    /// already present (a server replay), leaving the existing entry
    /// untouched.
    pub(crate) fn insert(&mut self, id: ChannelId, name: String) -> bool {
        if self.map.contains_key(&id) {
            return false;
        }

        debug!(self.log, "channel registered"; "channel" => %id, "name" => name.as_str());
        self.map.insert(
            id,
            ChannelEntry {
                id,
                name,
                listener: Box::new(NopChannelListener),
            },
        );
        true
    }

    #[inline]
    pub(crate) fn remove(&mut self, id: &ChannelId) -> Option<ChannelEntry> {
        let entry = self.map.shift_remove(id);

        if entry.is_some() {
            debug!(self.log, "channel removed"; "channel" => %id);
        }

        entry
    }

    /// Drops every channel, notifying each close listener. Used on session
    /// teardown; fail-over keeps the registry intact.
    pub(crate) fn teardown(&mut self) {
        for (_, mut entry) in self.map.drain(..) {
            entry.listener.on_channel_closed(&entry.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quark::logging::{o, Discard};
    use std::cell::Cell;
    use std::rc::Rc;

    fn log() -> Logger {
        Logger::root(Discard, o!())
    }

    fn channel_id(bytes: &[u8]) -> ChannelId {
        ChannelId::from_wire(bytes).unwrap()
    }

    struct CloseProbe {
        closed: Rc<Cell<bool>>,
    }

    impl ChannelListener for CloseProbe {
        fn on_channel_closed(&mut self, name: &str) {
            assert_eq!(name, "hello");
            self.closed.set(true);
        }
    }

    #[test]
    fn test_insert_and_lookup() {
        let mut registry = Registry::new(&log());
        let id = channel_id(&[0xBE, 0xEF]);

        assert!(registry.insert(id, "hello".to_owned()));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(&id).unwrap().name, "hello");
    }

    #[test]
    fn test_duplicate_insert_ignored() {
        let mut registry = Registry::new(&log());
        let id = channel_id(&[0xBE, 0xEF]);

        assert!(registry.insert(id, "hello".to_owned()));
        assert!(!registry.insert(id, "imposter".to_owned()));

        // The original entry survives.
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(&id).unwrap().name, "hello");
    }

    #[test]
    fn test_remove() {
        let mut registry = Registry::new(&log());
        let id = channel_id(&[0xBE, 0xEF]);

        registry.insert(id, "hello".to_owned());
        let entry = registry.remove(&id).unwrap();

        assert_eq!(entry.name, "hello");
        assert_eq!(registry.len(), 0);
        assert!(registry.remove(&id).is_none());
    }

    #[test]
    fn test_teardown_fires_close_listeners() {
        let mut registry = Registry::new(&log());
        let id = channel_id(&[0xBE, 0xEF]);
        let closed = Rc::new(Cell::new(false));

        registry.insert(id, "hello".to_owned());
        registry.get_mut(&id).unwrap().listener = Box::new(CloseProbe {
            closed: Rc::clone(&closed),
        });

        registry.teardown();

        assert!(closed.get());
        assert_eq!(registry.len(), 0);
    }
}
