//! The binary packet codec: one opcode byte followed by opcode-specific
//! fields, stateless between packets. Inbound frames decode into a tagged
//! [`Event`]; outbound operations compose a header packet that travels
//! alongside the caller's payload as a scatter-gather pair.

use crate::id::{ChannelId, ReconnectKey, UserId};
use crate::net::packet::{PacketBuffer, PacketView};
use crate::net::support::{ErrorType, NetworkError, NetworkResult};
use quark::logging::{warn, Logger};

/// The closed opcode set. Numeric values are assigned by declaration order
/// starting at zero and are part of the wire contract; never reorder.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum Opcode {
    SendMulticast = 0,
    RcvMulticast,
    SendBroadcast,
    RcvBroadcast,
    SendUnicast,
    RcvUnicast,
    SendServerMsg,
    ConnectReq,
    ReconnectReq,
    DisconnectReq,
    ValidationReq,
    ValidationResp,
    UserAccepted,
    UserRejected,
    UserJoined,
    UserLeft,
    UserDisconnected,
    UserJoinedChan,
    UserLeftChan,
    RcvReconnectKey,
    ReqJoinChan,
    JoinedChan,
    ReqLeaveChan,
    LeftChan,
    ServerId,
    ChanLocked,
}

impl Opcode {
    pub fn from_u8(value: u8) -> Option<Opcode> {
        Some(match value {
            0 => Opcode::SendMulticast,
            1 => Opcode::RcvMulticast,
            2 => Opcode::SendBroadcast,
            3 => Opcode::RcvBroadcast,
            4 => Opcode::SendUnicast,
            5 => Opcode::RcvUnicast,
            6 => Opcode::SendServerMsg,
            7 => Opcode::ConnectReq,
            8 => Opcode::ReconnectReq,
            9 => Opcode::DisconnectReq,
            10 => Opcode::ValidationReq,
            11 => Opcode::ValidationResp,
            12 => Opcode::UserAccepted,
            13 => Opcode::UserRejected,
            14 => Opcode::UserJoined,
            15 => Opcode::UserLeft,
            16 => Opcode::UserDisconnected,
            17 => Opcode::UserJoinedChan,
            18 => Opcode::UserLeftChan,
            19 => Opcode::RcvReconnectKey,
            20 => Opcode::ReqJoinChan,
            21 => Opcode::JoinedChan,
            22 => Opcode::ReqLeaveChan,
            23 => Opcode::LeftChan,
            24 => Opcode::ServerId,
            25 => Opcode::ChanLocked,
            _ => return None,
        })
    }
}

/// A credential prompt/response record exchanged during login validation.
/// The server sends prompts; the application fills in the values and sends
/// the records back unchanged in shape.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Callback {
    Name {
        prompt: String,
        default_name: String,
        name: String,
    },
    Password {
        prompt: String,
        echo_on: bool,
        password: String,
    },
    TextInput {
        prompt: String,
        default_text: String,
        text: String,
    },
}

const CB_KIND_NAME: u8 = 1;
const CB_KIND_PASSWORD: u8 = 2;
const CB_KIND_TEXT_INPUT: u8 = 3;

/// One decoded inbound packet. Payload fields borrow from the frame being
/// decoded and must be consumed before the next frame overwrites it.
#[derive(Debug, Eq, PartialEq)]
pub enum Event<'a> {
    Unicast {
        reliable: bool,
        channel: ChannelId,
        from: UserId,
        to: UserId,
        payload: &'a [u8],
    },
    Multicast {
        reliable: bool,
        channel: ChannelId,
        from: UserId,
        to: Vec<UserId>,
        payload: &'a [u8],
    },
    Broadcast {
        reliable: bool,
        channel: ChannelId,
        from: UserId,
        payload: &'a [u8],
    },
    ValidationRequest(Vec<Callback>),
    LoginAccepted(UserId),
    LoginRejected(String),
    UserJoined(UserId),
    UserLeft(UserId),
    UserDisconnected(UserId),
    UserJoinedChannel(ChannelId, UserId),
    UserLeftChannel(ChannelId, UserId),
    JoinedChannel { channel: ChannelId, name: String },
    LeftChannel(ChannelId),
    NewReconnectKey { key: ReconnectKey, ttl_secs: i64 },
    ServerId(UserId),
    ChannelLocked { name: String, user: UserId },
    /// The server's logout acknowledgement carries no fields and requires
    /// no action beyond the transport close that follows it.
    DisconnectRequest,
}

#[inline]
fn get_user(view: &mut PacketView) -> NetworkResult<UserId> {
    UserId::from_wire(view.get_array()?)
}

#[inline]
fn get_channel(view: &mut PacketView) -> NetworkResult<ChannelId> {
    ChannelId::from_wire(view.get_array()?)
}

/// Decodes one frame into its event. Returns `None` for opcodes this client
/// does not consume (unknown values and client-to-server opcodes echoed
/// back), which are logged and ignored per the protocol. Truncation of a
/// known opcode is fatal.
pub fn decode<'a>(frame: &'a [u8], log: &Logger) -> NetworkResult<Option<Event<'a>>> {
    let mut view = PacketView::wrap(frame);

    let raw_op = view.get_u8()?;
    let op = match Opcode::from_u8(raw_op) {
        Some(op) => op,
        None => {
            warn!(log, "unknown opcode ignored"; "opcode" => raw_op);
            return Ok(None);
        }
    };

    let event = match op {
        Opcode::RcvUnicast => {
            let reliable = view.get_bool()?;
            let channel = get_channel(&mut view)?;
            let from = get_user(&mut view)?;
            let to = get_user(&mut view)?;

            Event::Unicast {
                reliable,
                channel,
                from,
                to,
                payload: view.get_remaining_as_array(),
            }
        }

        Opcode::RcvMulticast => {
            let reliable = view.get_bool()?;
            let channel = get_channel(&mut view)?;
            let from = get_user(&mut view)?;

            let to_count = view.get_u8()? as usize;
            let mut to = Vec::with_capacity(to_count);
            for _ in 0..to_count {
                to.push(get_user(&mut view)?);
            }

            Event::Multicast {
                reliable,
                channel,
                from,
                to,
                payload: view.get_remaining_as_array(),
            }
        }

        Opcode::RcvBroadcast => {
            let reliable = view.get_bool()?;
            let channel = get_channel(&mut view)?;
            let from = get_user(&mut view)?;

            Event::Broadcast {
                reliable,
                channel,
                from,
                payload: view.get_remaining_as_array(),
            }
        }

        Opcode::ValidationReq => Event::ValidationRequest(decode_callbacks(&mut view, log)?),

        Opcode::UserAccepted => Event::LoginAccepted(get_user(&mut view)?),

        Opcode::UserRejected => Event::LoginRejected(view.get_string()?),

        Opcode::UserJoined => Event::UserJoined(get_user(&mut view)?),

        Opcode::UserLeft => Event::UserLeft(get_user(&mut view)?),

        Opcode::UserDisconnected => Event::UserDisconnected(get_user(&mut view)?),

        Opcode::UserJoinedChan => {
            Event::UserJoinedChannel(get_channel(&mut view)?, get_user(&mut view)?)
        }

        Opcode::UserLeftChan => {
            Event::UserLeftChannel(get_channel(&mut view)?, get_user(&mut view)?)
        }

        Opcode::JoinedChan => {
            let channel = get_channel(&mut view)?;
            Event::JoinedChannel {
                channel,
                name: view.get_string()?,
            }
        }

        Opcode::LeftChan => Event::LeftChannel(get_channel(&mut view)?),

        Opcode::RcvReconnectKey => {
            // The user field duplicates the session's own identity and is
            // discarded after validation.
            let _user = get_user(&mut view)?;
            let key = ReconnectKey::from_wire(view.get_array()?)?;
            let ttl_secs = view.get_i64()?;

            Event::NewReconnectKey { key, ttl_secs }
        }

        Opcode::ServerId => Event::ServerId(get_user(&mut view)?),

        Opcode::ChanLocked => {
            let name = view.get_string()?;
            let user = get_user(&mut view)?;

            Event::ChannelLocked { name, user }
        }

        Opcode::DisconnectReq => Event::DisconnectRequest,

        // Client-to-server opcodes have no business arriving here.
        Opcode::SendMulticast
        | Opcode::SendBroadcast
        | Opcode::SendUnicast
        | Opcode::SendServerMsg
        | Opcode::ConnectReq
        | Opcode::ReconnectReq
        | Opcode::ValidationResp
        | Opcode::ReqJoinChan
        | Opcode::ReqLeaveChan => {
            warn!(log, "outbound opcode received, ignored"; "opcode" => raw_op);
            return Ok(None);
        }
    };

    Ok(Some(event))
}

fn decode_callbacks(view: &mut PacketView, log: &Logger) -> NetworkResult<Vec<Callback>> {
    let count = view.get_i32()?;
    if count < 0 {
        return Err(NetworkError::Fatal(ErrorType::TruncatedPacket));
    }

    // The count is untrusted; reserve conservatively and let pushes grow.
    let mut callbacks = Vec::with_capacity(count.min(8) as usize);

    for _ in 0..count {
        let kind = view.get_u8()?;
        match kind {
            CB_KIND_NAME => callbacks.push(Callback::Name {
                prompt: view.get_string()?,
                default_name: view.get_string()?,
                name: view.get_string()?,
            }),
            CB_KIND_PASSWORD => callbacks.push(Callback::Password {
                prompt: view.get_string()?,
                echo_on: view.get_bool()?,
                password: view.get_string()?,
            }),
            CB_KIND_TEXT_INPUT => callbacks.push(Callback::TextInput {
                prompt: view.get_string()?,
                default_text: view.get_string()?,
                text: view.get_string()?,
            }),
            _ => {
                // The record layout of an unknown kind is unknowable, so the
                // remainder of the list cannot be parsed either.
                warn!(log, "unknown validation callback kind, remainder skipped";
                      "kind" => kind);
                break;
            }
        }
    }

    Ok(callbacks)
}

fn encode_callbacks(packet: &mut PacketBuffer, callbacks: &[Callback]) -> NetworkResult<()> {
    packet.put_i32(callbacks.len() as i32)?;

    for callback in callbacks {
        match callback {
            Callback::Name {
                prompt,
                default_name,
                name,
            } => {
                packet.put_u8(CB_KIND_NAME)?;
                packet.put_string(prompt)?;
                packet.put_string(default_name)?;
                packet.put_string(name)?;
            }
            Callback::Password {
                prompt,
                echo_on,
                password,
            } => {
                packet.put_u8(CB_KIND_PASSWORD)?;
                packet.put_string(prompt)?;
                packet.put_bool(*echo_on)?;
                packet.put_string(password)?;
            }
            Callback::TextInput {
                prompt,
                default_text,
                text,
            } => {
                packet.put_u8(CB_KIND_TEXT_INPUT)?;
                packet.put_string(prompt)?;
                packet.put_string(default_text)?;
                packet.put_string(text)?;
            }
        }
    }

    Ok(())
}

/// Composes a login request header.
pub fn login(packet: &mut PacketBuffer) -> NetworkResult<()> {
    packet.put_u8(Opcode::ConnectReq as u8)
}

/// Composes a resume-session request carrying the stored identity and key.
pub fn reconnect(
    packet: &mut PacketBuffer,
    user: &UserId,
    key: &ReconnectKey,
) -> NetworkResult<()> {
    packet.put_u8(Opcode::ReconnectReq as u8)?;
    packet.put_array(user.as_bytes())?;
    packet.put_array(key.as_bytes())
}

/// Composes a unicast header; the payload follows as a second byte range.
pub fn unicast(
    packet: &mut PacketBuffer,
    channel: &ChannelId,
    to: &UserId,
    reliable: bool,
) -> NetworkResult<()> {
    packet.put_u8(Opcode::SendUnicast as u8)?;
    packet.put_bool(reliable)?;
    packet.put_array(channel.as_bytes())?;
    packet.put_array(to.as_bytes())
}

/// Composes a multicast header listing up to 255 recipients.
pub fn multicast(
    packet: &mut PacketBuffer,
    channel: &ChannelId,
    to: &[UserId],
    reliable: bool,
) -> NetworkResult<()> {
    if to.len() > u8::max_value() as usize {
        return Err(NetworkError::Fatal(ErrorType::OversizeArray));
    }

    packet.put_u8(Opcode::SendMulticast as u8)?;
    packet.put_bool(reliable)?;
    packet.put_array(channel.as_bytes())?;
    packet.put_u8(to.len() as u8)?;
    for user in to {
        packet.put_array(user.as_bytes())?;
    }
    Ok(())
}

/// Composes a broadcast header for a channel.
pub fn broadcast(
    packet: &mut PacketBuffer,
    channel: &ChannelId,
    reliable: bool,
) -> NetworkResult<()> {
    packet.put_u8(Opcode::SendBroadcast as u8)?;
    packet.put_bool(reliable)?;
    packet.put_array(channel.as_bytes())
}

/// Composes a direct-to-server message header.
pub fn server_msg(packet: &mut PacketBuffer, reliable: bool) -> NetworkResult<()> {
    packet.put_u8(Opcode::SendServerMsg as u8)?;
    packet.put_bool(reliable)
}

/// Exact wire size of a validation response: opcode, record count, and the
/// per-record kind tags and length prefixes around the UTF-8 contents.
pub(crate) fn validation_response_len(callbacks: &[Callback]) -> usize {
    let mut total = 5;

    for callback in callbacks {
        total += match callback {
            Callback::Name {
                prompt,
                default_name,
                name,
            } => 13 + prompt.len() + default_name.len() + name.len(),
            Callback::Password {
                prompt, password, ..
            } => 10 + prompt.len() + password.len(),
            Callback::TextInput {
                prompt,
                default_text,
                text,
            } => 13 + prompt.len() + default_text.len() + text.len(),
        };
    }

    total
}

/// Composes the response to a validation request.
pub fn validation_response(
    packet: &mut PacketBuffer,
    callbacks: &[Callback],
) -> NetworkResult<()> {
    packet.put_u8(Opcode::ValidationResp as u8)?;
    encode_callbacks(packet, callbacks)
}

/// Composes a join-channel request. Channel names travel behind a one-byte
/// length and are limited to 255 UTF-8 bytes.
pub fn join_channel(packet: &mut PacketBuffer, name: &str) -> NetworkResult<()> {
    packet.put_u8(Opcode::ReqJoinChan as u8)?;
    packet.put_string_byte_len(name)
}

/// Composes a leave-channel request.
pub fn leave_channel(packet: &mut PacketBuffer, channel: &ChannelId) -> NetworkResult<()> {
    packet.put_u8(Opcode::ReqLeaveChan as u8)?;
    packet.put_array(channel.as_bytes())
}
