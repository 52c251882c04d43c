//! STUN messages as used by ICE connectivity checks.
//!
//! Covers the Binding method, the short-term credential mechanism
//! (MESSAGE-INTEGRITY with HMAC-SHA1), FINGERPRINT and the ICE attributes
//! from [RFC5245](https://datatracker.ietf.org/doc/html/rfc5245#section-19.1).

use byteorder::ReadBytesExt;
use header::MessageHead;
use std::io::{self, Cursor};
use std::num::TryFromIntError;
use std::str::Utf8Error;

pub mod attributes;
pub mod builder;
pub mod header;
mod integrity;
pub mod parse;

pub use attributes::{Attribute, ErrorCode};
pub use builder::MessageBuilder;
pub use header::{Class, Method};
pub use parse::Message;

type NE = byteorder::NetworkEndian;

const COOKIE: u32 = 0x2112A442;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid input data, {0}")]
    InvalidData(&'static str),
    #[error("failed to convert integer")]
    TryFromInt(#[from] TryFromIntError),
    #[error(transparent)]
    Utf8(#[from] Utf8Error),
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::UnexpectedEof => Self::InvalidData("buffer seems incomplete"),
            _ => Self::InvalidData("failed to read from buffer"),
        }
    }
}

fn padding_usize(n: usize) -> usize {
    (4 - n % 4) % 4
}

/// 96 bit STUN transaction id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId(pub [u8; 12]);

impl TransactionId {
    pub fn new(v: [u8; 12]) -> Self {
        Self(v)
    }

    pub fn random() -> Self {
        Self(rand::random())
    }

    /// Magic cookie followed by the transaction id, used to xor IPv6 addresses
    pub(crate) fn xor_key(&self) -> u128 {
        let mut id = [0u8; 16];
        id[..4].copy_from_slice(&COOKIE.to_be_bytes());
        id[4..].copy_from_slice(&self.0);
        u128::from_be_bytes(id)
    }
}

/// Inspect the given input to find out if it starts with a STUN message.
///
/// Used to demultiplex STUN from application data arriving on the same socket.
pub fn is_stun_message(i: &[u8]) -> bool {
    if i.len() < header::STUN_HEADER_LENGTH {
        return false;
    }

    let mut cursor = Cursor::new(i);

    let Ok(head) = cursor.read_u32::<NE>() else {
        return false;
    };
    let Ok(cookie) = cursor.read_u32::<NE>() else {
        return false;
    };

    let head = MessageHead(head);

    head.z() == 0 && cookie == COOKIE && usize::from(head.len()) % 4 == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn demux_stun_and_data() {
        let msg = MessageBuilder::new(Class::Request, Method::Binding, TransactionId::random())
            .finish();

        assert!(is_stun_message(&msg));

        // RTP version 2 header
        let mut rtp = vec![0x80, 0x00, 0x00, 0x01];
        rtp.extend_from_slice(&[0; 20]);
        assert!(!is_stun_message(&rtp));

        assert!(!is_stun_message(&msg[..10]));
    }

    #[test]
    fn padding() {
        assert_eq!(padding_usize(0), 0);
        assert_eq!(padding_usize(1), 3);
        assert_eq!(padding_usize(2), 2);
        assert_eq!(padding_usize(3), 1);
        assert_eq!(padding_usize(8), 0);
    }
}
