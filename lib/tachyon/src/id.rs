//! Opaque, length-tagged identifiers assigned by the server. One inline
//! representation backs the three roles the protocol distinguishes: users,
//! channels and reconnection keys.

use crate::net::support::{ErrorType, NetworkError, NetworkResult};
use std::cmp::Ordering;
use std::fmt;

/// Longest identifier the service issues.
pub const MAX_ID_LEN: usize = 23;

/// A 0-23 byte opaque identifier. Ordering is by length first, then by byte
/// contents, so identifiers of different lengths never interleave.
#[derive(Copy, Clone, Eq, Hash, PartialEq)]
pub struct Id {
    len: u8,
    data: [u8; MAX_ID_LEN],
}

impl Id {
    /// Builds an identifier from its wire bytes. Lengths beyond
    /// [`MAX_ID_LEN`] are a protocol violation.
    #[inline]
    pub fn from_wire(bytes: &[u8]) -> NetworkResult<Id> {
        if bytes.len() > MAX_ID_LEN {
            return Err(NetworkError::Fatal(ErrorType::IdTooLong));
        }

        let mut data = [0u8; MAX_ID_LEN];
        data[..bytes.len()].copy_from_slice(bytes);

        Ok(Id {
            len: bytes.len() as u8,
            data,
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The identifier's byte contents, as they appear on the wire after the
    /// one-byte length tag.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len()]
    }

    /// True for the one-byte zero identifier the service reserves for
    /// itself.
    #[inline]
    pub fn is_server_sentinel(&self) -> bool {
        self.len == 1 && self.data[0] == 0
    }
}

impl Ord for Id {
    #[inline]
    fn cmp(&self, other: &Id) -> Ordering {
        self.len
            .cmp(&other.len)
            .then_with(|| self.as_bytes().cmp(other.as_bytes()))
    }
}

impl PartialOrd for Id {
    #[inline]
    fn partial_cmp(&self, other: &Id) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for byte in self.as_bytes() {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Id({})", self)
    }
}

macro_rules! role_id {
    ($(#[$doc:meta])* $name: ident) => {
        $(#[$doc])*
        #[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
        #[repr(transparent)]
        pub struct $name(pub Id);

        impl $name {
            #[inline]
            pub fn from_wire(bytes: &[u8]) -> NetworkResult<$name> {
                Ok($name(Id::from_wire(bytes)?))
            }

            #[inline]
            pub fn as_bytes(&self) -> &[u8] {
                self.0.as_bytes()
            }
        }

        impl fmt::Display for $name {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

role_id! {
    /// Identifies a logged-in user, including this session's own identity.
    UserId
}
role_id! {
    /// Identifies a server-managed communication channel.
    ChannelId
}
role_id! {
    /// Opaque token authorizing resumption of an existing server-side
    /// session, valid until its TTL elapses.
    ReconnectKey
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let id = Id::from_wire(&[0xBE, 0xEF]).unwrap();

        assert_eq!(id.len(), 2);
        assert_eq!(id.as_bytes(), &[0xBE, 0xEF]);
    }

    #[test]
    fn test_empty() {
        let id = Id::from_wire(&[]).unwrap();

        assert_eq!(id.len(), 0);
        assert!(id.is_empty());
        assert_eq!(id.as_bytes(), &[] as &[u8]);
    }

    #[test]
    fn test_too_long() {
        let result = Id::from_wire(&[1u8; MAX_ID_LEN + 1]);

        assert_eq!(result.unwrap_err(), NetworkError::Fatal(ErrorType::IdTooLong));
    }

    #[test]
    fn test_max_length() {
        let id = Id::from_wire(&[7u8; MAX_ID_LEN]).unwrap();

        assert_eq!(id.len(), MAX_ID_LEN);
    }

    #[test]
    fn test_equality_is_byte_equality() {
        let a = Id::from_wire(&[1, 2, 3]).unwrap();
        let b = Id::from_wire(&[1, 2, 3]).unwrap();
        let c = Id::from_wire(&[1, 2, 4]).unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_ordering_length_first() {
        // A shorter identifier sorts before a longer one regardless of the
        // byte contents.
        let short = Id::from_wire(&[0xFF]).unwrap();
        let long = Id::from_wire(&[0x00, 0x00]).unwrap();

        assert!(short < long);

        // Same length falls back to lexicographic bytes.
        let a = Id::from_wire(&[0x01, 0x02]).unwrap();
        let b = Id::from_wire(&[0x01, 0x03]).unwrap();

        assert!(a < b);
    }

    #[test]
    fn test_server_sentinel() {
        assert!(Id::from_wire(&[0]).unwrap().is_server_sentinel());
        assert!(!Id::from_wire(&[]).unwrap().is_server_sentinel());
        assert!(!Id::from_wire(&[0, 0]).unwrap().is_server_sentinel());
        assert!(!Id::from_wire(&[1]).unwrap().is_server_sentinel());
    }

    #[test]
    fn test_display_hex() {
        let user = UserId::from_wire(&[0xBE, 0xEF]).unwrap();

        assert_eq!(user.to_string(), "beef");
    }
}
