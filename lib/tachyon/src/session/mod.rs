//! The session state machine: connect, login, established traffic,
//! reconnection after transient failure, fail-over to alternate endpoints,
//! and logout. One session owns one transport, one channel registry and one
//! listener; everything runs cooperatively on the caller's thread via
//! [`Session::update`].

pub mod channel;

use crate::discovery::{EndpointPolicy, Locator};
use crate::id::{ChannelId, ReconnectKey, UserId};
use crate::net::buffer::IngressEnd;
use crate::net::codec::{self, Callback, Event};
use crate::net::driver::{Driver, MAX_FRAME_SIZE};
use crate::net::packet::{PacketBuffer, PacketPool};
use crate::net::support::{ErrorType, ErrorUtils, NetworkError, NetworkResult};
use crate::session::channel::{
    ChannelHandle, ChannelListener, ChannelRef, NopChannelListener, Origin, Registry,
};
use mio::net::TcpStream;
use quark::logging::{self, debug, trace, warn, Logger};
use quark::time::timestamp_ms;
use serde_derive::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;
use std::io;
use std::mem;
use std::net::ToSocketAddrs;
use std::path::Path;
use std::thread;
use std::time::Duration;

const DRIVER_TOKEN: mio::Token = mio::Token(0);
const ZERO_TIME: Duration = Duration::from_millis(0);

// Headers without variable-length string or recipient-list content fit
// comfortably in the smallest pool class.
const SMALL_HEADER: usize = 64;

/// Session tunables. Loadable from a TOML file the same way the rest of the
/// stack loads its configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SessionConfig {
    /// Connect attempts per connect or fail-over cycle.
    pub connect_attempts: u32,
    /// Wait between consecutive attempts, in milliseconds.
    pub connect_wait_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> SessionConfig {
        SessionConfig {
            connect_attempts: 10,
            connect_wait_ms: 100,
        }
    }
}

impl SessionConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> SessionConfig {
        serdeconv::from_toml_file(path).expect("Error loading session configuration file")
    }
}

/// Connection state of the session transport.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
}

/// Errors returned synchronously from session operations. None of these
/// have side effects on the session state.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum SessionError {
    /// Connect was called on a live session.
    AlreadyConnected,
    /// The operation requires an established session.
    NotConnected,
    /// Discovery offered no endpoint for the requested client class.
    NoEndpoints,
    /// The chosen endpoint's hostname did not resolve.
    HostUnresolved,
    /// The addressed channel is not (or no longer) joined.
    UnknownChannel,
    /// Payload too large for a single protocol frame.
    PayloadTooLarge,
    /// A multicast named more recipients than a packet can describe.
    TooManyRecipients,
    /// Channel names are limited to 255 UTF-8 bytes on the wire.
    NameTooLong,
    Io(io::ErrorKind),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SessionError::AlreadyConnected => write!(f, "session is already connected"),
            SessionError::NotConnected => write!(f, "session is not connected"),
            SessionError::NoEndpoints => write!(f, "no matching endpoint discovered"),
            SessionError::HostUnresolved => write!(f, "endpoint hostname did not resolve"),
            SessionError::UnknownChannel => write!(f, "channel is not joined"),
            SessionError::PayloadTooLarge => write!(f, "payload exceeds frame size"),
            SessionError::TooManyRecipients => write!(f, "too many multicast recipients"),
            SessionError::NameTooLong => write!(f, "channel name exceeds 255 bytes"),
            SessionError::Io(kind) => write!(f, "socket error: {:?}", kind),
        }
    }
}

impl Error for SessionError {}

#[inline]
fn translate_send_error(err: NetworkError) -> SessionError {
    match err {
        NetworkError::Fatal(ErrorType::FrameTooLarge)
        | NetworkError::Fatal(ErrorType::Overflow) => SessionError::PayloadTooLarge,
        NetworkError::Fatal(ErrorType::OversizeArray) => SessionError::TooManyRecipients,
        NetworkError::Wait => SessionError::Io(io::ErrorKind::WouldBlock),
        NetworkError::Fatal(_) => SessionError::Io(io::ErrorKind::Other),
    }
}

/// Sink for session-level events. Callbacks that may reasonably want to
/// answer (validation, connection, channel joins) receive the session's
/// [`Link`] and can send through it synchronously.
pub trait SessionListener {
    /// The server requests credentials. Fill in the callback values and
    /// answer with [`Link::send_validation_response`], now or later.
    fn on_validation_request(&mut self, _link: &mut Link, _callbacks: Vec<Callback>) {}

    /// Login completed; `user` is this session's identity.
    fn on_connected(&mut self, link: &mut Link, user: &UserId);

    /// The server rejected the login.
    fn on_connection_refused(&mut self, _reason: &str) {}

    /// The transport dropped but the reconnect key is valid; a reconnect
    /// cycle is starting.
    fn on_fail_over_in_progress(&mut self) {}

    /// A reconnect cycle completed and the session resumed.
    fn on_reconnected(&mut self, _link: &mut Link) {}

    /// The session ended. Channels are gone by the time this fires.
    fn on_disconnected(&mut self);

    fn on_user_joined(&mut self, _user: &UserId) {}

    fn on_user_left(&mut self, _user: &UserId) {}

    /// A join or leave request bounced off a locked channel.
    fn on_channel_locked(&mut self, _name: &str, _user: &UserId) {}

    /// The session joined a channel. Return a listener to install on it,
    /// or `None` to leave the channel unobserved.
    fn on_joined_channel(
        &mut self,
        _link: &mut Link,
        _channel: &ChannelHandle,
        _name: &str,
    ) -> Option<Box<dyn ChannelListener>> {
        None
    }
}

/// The transmitter half of a session: the transport driver plus the packet
/// pool outbound headers are composed from. Handed to listener callbacks so
/// nested sends enqueue synchronously without touching session state.
pub struct Link {
    driver: Driver,
    pool: PacketPool,
    log: Logger,
}

impl Link {
    #[inline]
    fn new(log: &Logger) -> Link {
        Link {
            driver: Driver::new(log),
            pool: PacketPool::new(),
            log: logging::child(log),
        }
    }

    /// Composes and emits one packet: header from the pool, payload carried
    /// as the second byte range of the scatter-gather pair.
    fn emit(&mut self, packet: PacketBuffer, payload: &[u8]) -> Result<(), SessionError> {
        let result = match payload.is_empty() {
            true => self.driver.enqueue(&[packet.read_slice()]),
            false => self.driver.enqueue(&[packet.read_slice(), payload]),
        };

        self.pool.release(packet);
        result.map_err(translate_send_error)
    }

    fn compose<F>(&mut self, capacity: usize, encode: F) -> Result<PacketBuffer, SessionError>
    where
        F: FnOnce(&mut PacketBuffer) -> NetworkResult<()>,
    {
        let mut packet = self.pool.acquire(capacity);

        match encode(&mut packet) {
            Ok(()) => Ok(packet),
            Err(err) => {
                self.pool.release(packet);
                Err(translate_send_error(err))
            }
        }
    }

    /// Sends an uninterpreted message straight to the server logic.
    pub fn send_server(&mut self, data: &[u8], reliable: bool) -> Result<(), SessionError> {
        let packet = self.compose(SMALL_HEADER, |packet| codec::server_msg(packet, reliable))?;
        self.emit(packet, data)
    }

    /// Answers a validation request with the (mutated) callback list.
    pub fn send_validation_response(
        &mut self,
        callbacks: &[Callback],
    ) -> Result<(), SessionError> {
        let capacity = codec::validation_response_len(callbacks);
        let packet =
            self.compose(capacity, |packet| codec::validation_response(packet, callbacks))?;
        self.emit(packet, &[])
    }

    /// Asks the server to add this session to the named channel. The join
    /// is confirmed later through `on_joined_channel`.
    pub fn join_channel(&mut self, name: &str) -> Result<(), SessionError> {
        if name.len() > u8::max_value() as usize {
            return Err(SessionError::NameTooLong);
        }

        let packet = self.compose(2 + name.len(), |packet| codec::join_channel(packet, name))?;
        self.emit(packet, &[])
    }

    pub(crate) fn leave_channel(&mut self, channel: &ChannelId) -> Result<(), SessionError> {
        let packet = self.compose(SMALL_HEADER, |packet| codec::leave_channel(packet, channel))?;
        self.emit(packet, &[])
    }

    pub(crate) fn send_unicast(
        &mut self,
        channel: &ChannelId,
        to: &UserId,
        data: &[u8],
        reliable: bool,
    ) -> Result<(), SessionError> {
        let packet = self.compose(SMALL_HEADER, |packet| {
            codec::unicast(packet, channel, to, reliable)
        })?;
        self.emit(packet, data)
    }

    pub(crate) fn send_multicast(
        &mut self,
        channel: &ChannelId,
        to: &[UserId],
        data: &[u8],
        reliable: bool,
    ) -> Result<(), SessionError> {
        if to.len() > u8::max_value() as usize {
            return Err(SessionError::TooManyRecipients);
        }

        let capacity = SMALL_HEADER + to.len() * 24;
        let packet = self.compose(capacity, |packet| {
            codec::multicast(packet, channel, to, reliable)
        })?;
        self.emit(packet, data)
    }

    pub(crate) fn send_broadcast(
        &mut self,
        channel: &ChannelId,
        data: &[u8],
        reliable: bool,
    ) -> Result<(), SessionError> {
        let packet = self.compose(SMALL_HEADER, |packet| {
            codec::broadcast(packet, channel, reliable)
        })?;
        self.emit(packet, data)
    }

    fn send_login(&mut self) -> Result<(), SessionError> {
        trace!(self.log, "sending login request");
        let packet = self.compose(SMALL_HEADER, codec::login)?;
        self.emit(packet, &[])
    }

    fn send_reconnect(
        &mut self,
        user: &UserId,
        key: &ReconnectKey,
    ) -> Result<(), SessionError> {
        trace!(self.log, "sending reconnect request"; "user" => %user);
        let packet = self.compose(SMALL_HEADER, |packet| codec::reconnect(packet, user, key))?;
        self.emit(packet, &[])
    }
}

/// Mutable state bits of the machine, kept apart from the collaborators so
/// dispatch can borrow them independently.
struct SessionState {
    conn: ConnState,
    expecting_disconnect: bool,
    reconnecting: bool,
    attempts_remaining: u32,
    wait_between_attempts_ms: u64,
    class_name: String,
    self_id: Option<UserId>,
    server_id: Option<UserId>,
    key: Option<ReconnectKey>,
    key_expiry_ms: u64,
}

impl SessionState {
    fn new() -> SessionState {
        SessionState {
            conn: ConnState::Disconnected,
            expecting_disconnect: false,
            reconnecting: false,
            attempts_remaining: 0,
            wait_between_attempts_ms: 0,
            class_name: String::new(),
            self_id: None,
            server_id: None,
            key: None,
            key_expiry_ms: 0,
        }
    }

    /// True while the stored key still authorizes a session resume.
    #[inline]
    fn key_valid(&self, now_ms: u64) -> bool {
        self.key.is_some() && self.self_id.is_some() && now_ms < self.key_expiry_ms
    }
}

/// A client session. Owns the transport, the channel registry and the
/// listener; driven by calling [`update`](Session::update) from the
/// application loop.
pub struct Session<L: SessionListener> {
    game: String,
    locator: Box<dyn Locator>,
    policy: Box<dyn EndpointPolicy>,
    config: SessionConfig,
    poll: mio::Poll,
    events: mio::Events,
    scratch: PacketBuffer,
    link: Link,
    channels: Registry,
    state: SessionState,
    listener: L,
    log: Logger,
}

impl<L: SessionListener> Session<L> {
    pub fn new<'a, G: Into<Option<&'a Logger>>>(
        game: &str,
        locator: Box<dyn Locator>,
        policy: Box<dyn EndpointPolicy>,
        config: SessionConfig,
        listener: L,
        log: G,
    ) -> NetworkResult<Session<L>> {
        let log = logging::child(log);

        Ok(Session {
            game: game.to_owned(),
            locator,
            policy,
            config,
            poll: mio::Poll::new()?,
            events: mio::Events::with_capacity(64),
            scratch: PacketBuffer::with_capacity(MAX_FRAME_SIZE),
            link: Link::new(&log),
            channels: Registry::new(&log),
            state: SessionState::new(),
            listener,
            log,
        })
    }

    /// Connects using the configured attempt count and wait interval.
    pub fn connect(&mut self, class_name: &str) -> Result<(), SessionError> {
        let (attempts, wait_ms) = (self.config.connect_attempts, self.config.connect_wait_ms);
        self.connect_with(class_name, attempts, wait_ms)
    }

    /// Connects to one endpoint of the named client class, retrying up to
    /// `attempts` times with `wait_ms` between attempts. Completion is
    /// asynchronous: the login handshake runs through `update` and ends in
    /// `on_connected` or `on_connection_refused`.
    pub fn connect_with(
        &mut self,
        class_name: &str,
        attempts: u32,
        wait_ms: u64,
    ) -> Result<(), SessionError> {
        if self.state.conn != ConnState::Disconnected {
            return Err(SessionError::AlreadyConnected);
        }

        self.state.class_name = class_name.to_owned();
        self.state.attempts_remaining = attempts;
        self.state.wait_between_attempts_ms = wait_ms;
        self.state.reconnecting = false;

        self.retry_connect()
    }

    /// Ends the session. A graceful disconnect pushes queued frames to the
    /// socket best-effort so the server observes a clean exit; otherwise
    /// the queue is dropped on the floor.
    pub fn disconnect(&mut self, graceful: bool) {
        if self.state.conn == ConnState::Disconnected {
            return;
        }

        debug!(self.log, "disconnect requested"; "graceful" => graceful);
        self.state.expecting_disconnect = true;

        if graceful {
            drop(self.link.driver.flush());
        }

        self.teardown_transport();
        self.drop_session();
    }

    /// Sends an uninterpreted message to the server logic.
    pub fn send_server(&mut self, data: &[u8], reliable: bool) -> Result<(), SessionError> {
        self.ensure_established()?;
        self.link.send_server(data, reliable)
    }

    /// Answers an outstanding validation request.
    pub fn send_validation_response(
        &mut self,
        callbacks: &[Callback],
    ) -> Result<(), SessionError> {
        self.ensure_established()?;
        self.link.send_validation_response(callbacks)
    }

    /// Requests membership of the named channel; the handle arrives through
    /// `on_joined_channel`.
    pub fn open_channel(&mut self, name: &str) -> Result<(), SessionError> {
        self.ensure_established()?;
        self.link.join_channel(name)
    }

    /// Borrows a live channel for sends. Returns `None` once the channel
    /// has left the registry.
    pub fn channel(&mut self, handle: &ChannelHandle) -> Option<ChannelRef> {
        let Session { link, channels, .. } = self;

        channels.get(&handle.0).map(move |entry| ChannelRef {
            link,
            id: &entry.id,
            name: &entry.name,
        })
    }

    /// True in case `user` is the server's own identity: either the learned
    /// server id or the reserved one-byte zero sentinel.
    pub fn is_server_id(&self, user: &UserId) -> bool {
        self.state.server_id.map_or(false, |server| server == *user) || user.0.is_server_sentinel()
    }

    /// Distinct client-class names the discovery result currently offers.
    pub fn client_classes(&mut self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();

        for endpoint in self.locator.locate(&self.game) {
            if !names.contains(&endpoint.client_class) {
                names.push(endpoint.client_class);
            }
        }

        names
    }

    #[inline]
    pub fn connection_state(&self) -> ConnState {
        self.state.conn
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.state.conn == ConnState::Connected
    }

    /// This session's identity, once login has been accepted.
    #[inline]
    pub fn self_id(&self) -> Option<&UserId> {
        self.state.self_id.as_ref()
    }

    #[inline]
    pub fn listener(&self) -> &L {
        &self.listener
    }

    #[inline]
    pub fn listener_mut(&mut self) -> &mut L {
        &mut self.listener
    }

    /// Pumps the session once: polls the socket with zero timeout, finishes
    /// an in-flight connect, decodes and dispatches inbound frames, and
    /// flushes outbound frames. Never blocks; call it from the application
    /// loop whenever the socket may be ready.
    pub fn update(&mut self) {
        if !self.link.driver.is_open() {
            return;
        }

        self.poll
            .poll(&mut self.events, Some(ZERO_TIME))
            .expect("Session poll failed");

        let mut readable = false;
        let mut writable = false;

        for event in &self.events {
            if event.token() == DRIVER_TOKEN {
                let readiness = event.readiness();
                readable |= readiness.is_readable();
                writable |= readiness.is_writable();
            }
        }

        if self.state.conn == ConnState::Connecting && (readable || writable) {
            self.finish_connect();
        }

        // A completed connect falls through: the edge that reported the
        // connect can also carry the first inbound bytes, and an
        // edge-triggered poll will not repeat it.
        if self.state.conn == ConnState::Connected {
            if writable && self.link.driver.flush().has_failed() {
                self.handle_close(false);
                return;
            }

            if readable {
                if let Err(NetworkError::Fatal(kind)) = self.pump_read() {
                    warn!(self.log, "session failed"; "error" => %kind);
                    let transport_error = matches!(kind, ErrorType::Io | ErrorType::PeerClosed);
                    self.handle_close(!transport_error);
                    return;
                }
            }

            if self.link.driver.peer_closed() {
                self.handle_close(false);
            }
        }
    }

    #[inline]
    fn ensure_established(&self) -> Result<(), SessionError> {
        match self.state.conn {
            ConnState::Connected => Ok(()),
            _ => Err(SessionError::NotConnected),
        }
    }

    /// Runs the bounded attempt loop until a connect is in flight or the
    /// budget is exhausted.
    fn retry_connect(&mut self) -> Result<(), SessionError> {
        loop {
            if self.state.attempts_remaining == 0 {
                self.state.conn = ConnState::Disconnected;
                return Err(SessionError::NoEndpoints);
            }

            self.state.attempts_remaining -= 1;

            match self.start_connect() {
                Ok(()) => {
                    self.state.conn = ConnState::Connecting;
                    return Ok(());
                }
                Err(err) => {
                    warn!(self.log, "connect attempt failed";
                          "error" => %err,
                          "attempts_remaining" => self.state.attempts_remaining);

                    if self.state.attempts_remaining == 0 {
                        self.state.conn = ConnState::Disconnected;
                        return Err(err);
                    }

                    thread::sleep(Duration::from_millis(self.state.wait_between_attempts_ms));
                }
            }
        }
    }

    /// One connect attempt: choose an endpoint, resolve, open a
    /// non-blocking stream and register it.
    fn start_connect(&mut self) -> Result<(), SessionError> {
        let endpoints = self.locator.locate(&self.game);
        let endpoint = self
            .policy
            .choose(&endpoints, &self.state.class_name)
            .ok_or(SessionError::NoEndpoints)?;

        debug!(self.log, "connecting";
               "host" => endpoint.host.as_str(),
               "port" => endpoint.port,
               "class" => endpoint.client_class.as_str(),
               "reconnecting" => self.state.reconnecting);

        let addr = (endpoint.host.as_str(), endpoint.port)
            .to_socket_addrs()
            .map_err(|err| SessionError::Io(err.kind()))?
            .next()
            .ok_or(SessionError::HostUnresolved)?;

        let stream = TcpStream::connect(&addr).map_err(|err| SessionError::Io(err.kind()))?;

        self.poll
            .register(
                &stream,
                DRIVER_TOKEN,
                mio::Ready::readable() | mio::Ready::writable(),
                mio::PollOpt::edge(),
            )
            .map_err(|err| SessionError::Io(err.kind()))?;

        self.link.driver.open(stream);
        self.state.expecting_disconnect = false;

        Ok(())
    }

    /// Resolves an in-flight non-blocking connect to success or failure.
    fn finish_connect(&mut self) {
        let outcome = match self.link.driver.stream() {
            Some(stream) => match stream.take_error() {
                Ok(None) => stream.peer_addr().map(|_| ()),
                Ok(Some(err)) | Err(err) => Err(err),
            },
            None => return,
        };

        match outcome {
            Ok(()) => self.socket_connected(),
            Err(err) => {
                warn!(self.log, "connect failed"; "error" => %err);
                self.connection_failed();
            }
        }
    }

    /// The transport is up: log in, or resume with the stored key when this
    /// is a reconnect cycle and the key has not expired.
    fn socket_connected(&mut self) {
        self.state.conn = ConnState::Connected;

        let resume = self.state.reconnecting && self.state.key_valid(timestamp_ms());

        let result = if resume {
            let (user, key) = match (self.state.self_id, self.state.key) {
                (Some(user), Some(key)) => (user, key),
                _ => unreachable!("key_valid implies identity and key"),
            };
            self.link.send_reconnect(&user, &key)
        } else {
            self.link.send_login()
        };

        if let Err(err) = result {
            warn!(self.log, "handshake send failed"; "error" => %err);
        }
    }

    /// A connect attempt failed after the socket was opened. Retries while
    /// the attempt budget lasts, otherwise reports the session down.
    fn connection_failed(&mut self) {
        self.teardown_transport();

        if self.state.attempts_remaining > 0 {
            thread::sleep(Duration::from_millis(self.state.wait_between_attempts_ms));
            if self.retry_connect().is_err() {
                self.drop_session();
            }
        } else {
            self.drop_session();
        }
    }

    /// The established transport closed. Protocol errors and requested
    /// exits end the session; a transport loss with a valid key starts a
    /// fail-over cycle instead.
    fn handle_close(&mut self, protocol_error: bool) {
        self.teardown_transport();

        let fail_over = !protocol_error
            && !self.state.expecting_disconnect
            && self.state.key_valid(timestamp_ms());

        if fail_over {
            debug!(self.log, "failing over";
                   "attempts" => self.config.connect_attempts);
            self.listener.on_fail_over_in_progress();
            self.state.reconnecting = true;
            self.state.attempts_remaining = self.config.connect_attempts;
            self.state.wait_between_attempts_ms = self.config.connect_wait_ms;

            if self.retry_connect().is_err() {
                self.drop_session();
            }
        } else {
            self.drop_session();
        }
    }

    fn teardown_transport(&mut self) {
        if let Some(stream) = self.link.driver.stream() {
            drop(self.poll.deregister(stream));
        }
        self.link.driver.close();
    }

    /// Final teardown: the channel registry empties (notifying close
    /// listeners) and the application learns the session is gone.
    fn drop_session(&mut self) {
        debug!(self.log, "session ended"; "channels" => self.channels.len());

        self.state.conn = ConnState::Disconnected;
        self.state.reconnecting = false;
        self.channels.teardown();
        self.listener.on_disconnected();
    }

    /// Drains the socket and dispatches every complete frame. Loops while
    /// the inbound ring keeps filling so an edge-triggered poll never
    /// starves.
    fn pump_read(&mut self) -> NetworkResult<()> {
        loop {
            let end = self.link.driver.fill()?;
            self.pump_frames()?;

            match end {
                IngressEnd::Full => continue,
                _ => return Ok(()),
            }
        }
    }

    fn pump_frames(&mut self) -> NetworkResult<()> {
        loop {
            let Session {
                scratch,
                link,
                channels,
                state,
                listener,
                log,
                ..
            } = self;

            if !link.driver.next_frame(scratch)? {
                return Ok(());
            }

            if let Some(event) = codec::decode(scratch.read_slice(), log)? {
                Self::dispatch(state, link, channels, listener, log, event)?;
            }
        }
    }

    /// Applies one decoded event to the session and channel state and fans
    /// it out to the listeners.
    fn dispatch(
        state: &mut SessionState,
        link: &mut Link,
        channels: &mut Registry,
        listener: &mut L,
        log: &Logger,
        event: Event,
    ) -> NetworkResult<()> {
        match event {
            Event::LoginAccepted(user) => {
                state.self_id = Some(user);

                if state.reconnecting {
                    state.reconnecting = false;
                    debug!(log, "session resumed"; "user" => %user);
                    listener.on_reconnected(link);
                } else {
                    debug!(log, "login accepted"; "user" => %user);
                    listener.on_connected(link, &user);
                }
            }

            Event::LoginRejected(reason) => {
                debug!(log, "login rejected"; "reason" => reason.as_str());
                // The server closes the transport next; that close must not
                // trigger a fail-over.
                state.expecting_disconnect = true;
                listener.on_connection_refused(&reason);
            }

            Event::ValidationRequest(callbacks) => {
                trace!(log, "validation request"; "callbacks" => callbacks.len());
                listener.on_validation_request(link, callbacks);
            }

            Event::UserJoined(user) => listener.on_user_joined(&user),

            Event::UserLeft(user) => listener.on_user_left(&user),

            Event::UserDisconnected(user) => {
                // The server is dropping this session; treat the following
                // transport close as expected.
                debug!(log, "server disconnect notice"; "user" => %user);
                state.expecting_disconnect = true;
            }

            Event::UserJoinedChannel(id, user) => {
                Self::channel_event(link, channels, &id, |chan_listener, chan| {
                    chan_listener.on_player_joined(chan, &user)
                })?;
            }

            Event::UserLeftChannel(id, user) => {
                Self::channel_event(link, channels, &id, |chan_listener, chan| {
                    chan_listener.on_player_left(chan, &user)
                })?;
            }

            Event::JoinedChannel { channel, name } => {
                if !channels.insert(channel, name.clone()) {
                    warn!(log, "duplicate channel join ignored";
                          "channel" => %channel, "name" => name.as_str());
                    return Ok(());
                }

                let handle = ChannelHandle(channel);
                if let Some(chan_listener) = listener.on_joined_channel(link, &handle, &name) {
                    if let Some(entry) = channels.get_mut(&channel) {
                        entry.listener = chan_listener;
                    }
                }
            }

            Event::LeftChannel(id) => match channels.remove(&id) {
                Some(mut entry) => entry.listener.on_channel_closed(&entry.name),
                None => warn!(log, "left unknown channel ignored"; "channel" => %id),
            },

            Event::NewReconnectKey { key, ttl_secs } => {
                debug!(log, "reconnect key issued"; "ttl_secs" => ttl_secs);
                state.key = Some(key);
                state.key_expiry_ms = timestamp_ms() + ttl_secs.max(0) as u64 * 1000;
            }

            Event::ServerId(user) => {
                debug!(log, "server id learned"; "server" => %user);
                state.server_id = Some(user);
            }

            Event::ChannelLocked { name, user } => listener.on_channel_locked(&name, &user),

            Event::Unicast {
                reliable,
                channel,
                from,
                payload,
                ..
            } => Self::deliver_data(state, link, channels, &channel, from, payload, reliable)?,

            Event::Multicast {
                reliable,
                channel,
                from,
                payload,
                ..
            } => Self::deliver_data(state, link, channels, &channel, from, payload, reliable)?,

            Event::Broadcast {
                reliable,
                channel,
                from,
                payload,
            } => Self::deliver_data(state, link, channels, &channel, from, payload, reliable)?,

            Event::DisconnectRequest => {}
        }

        Ok(())
    }

    fn deliver_data(
        state: &SessionState,
        link: &mut Link,
        channels: &mut Registry,
        id: &ChannelId,
        from: UserId,
        payload: &[u8],
        reliable: bool,
    ) -> NetworkResult<()> {
        let from_server = state.server_id.map_or(false, |server| server == from)
            || from.0.is_server_sentinel();

        let origin = match from_server {
            true => Origin::Server,
            false => Origin::Peer(from),
        };

        Self::channel_event(link, channels, id, |chan_listener, chan| {
            chan_listener.on_data_arrived(chan, &origin, payload, reliable)
        })
    }

    /// Looks up a channel and runs `action` against its listener with a
    /// borrowed [`ChannelRef`]. The listener is parked outside the entry
    /// for the duration so the callback can send on the channel. A missing
    /// channel is a protocol error.
    fn channel_event<F>(
        link: &mut Link,
        channels: &mut Registry,
        id: &ChannelId,
        action: F,
    ) -> NetworkResult<()>
    where
        F: FnOnce(&mut dyn ChannelListener, &mut ChannelRef),
    {
        let entry = match channels.get_mut(id) {
            Some(entry) => entry,
            None => return Err(NetworkError::Fatal(ErrorType::UnknownChannel)),
        };

        let mut parked = mem::replace(&mut entry.listener, Box::new(NopChannelListener));

        {
            let mut chan = ChannelRef {
                link,
                id: &entry.id,
                name: &entry.name,
            };
            action(&mut *parked, &mut chan);
        }

        entry.listener = parked;
        Ok(())
    }

    /// Test hook: run one frame through the decode + dispatch path without
    /// a socket.
    #[cfg(test)]
    pub(crate) fn deliver(&mut self, frame: &[u8]) -> NetworkResult<()> {
        self.scratch.clear();
        self.scratch
            .put_raw(frame)
            .expect("test frame exceeds scratch capacity");

        let Session {
            scratch,
            link,
            channels,
            state,
            listener,
            log,
            ..
        } = self;

        match codec::decode(scratch.read_slice(), log)? {
            Some(event) => Self::dispatch(state, link, channels, listener, log, event),
            None => Ok(()),
        }
    }
}
