use crate::{COOKIE, Error, NE, TransactionId};
use byteorder::ReadBytesExt;
use bytes::BufMut;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::str::from_utf8;

pub(crate) const ATTRIBUTE_HEADER_LEN: usize = 4;

pub(crate) const USERNAME: u16 = 0x0006;
pub(crate) const MESSAGE_INTEGRITY: u16 = 0x0008;
pub(crate) const ERROR_CODE: u16 = 0x0009;
pub(crate) const XOR_MAPPED_ADDRESS: u16 = 0x0020;
pub(crate) const PRIORITY: u16 = 0x0024;
pub(crate) const USE_CANDIDATE: u16 = 0x0025;
pub(crate) const FINGERPRINT: u16 = 0x8028;
pub(crate) const ICE_CONTROLLED: u16 = 0x8029;
pub(crate) const ICE_CONTROLLING: u16 = 0x802A;

const XOR16: u16 = (COOKIE >> 16) as u16;

/// Attributes understood by this crate.
///
/// MESSAGE-INTEGRITY and FINGERPRINT are not part of this enum, they are added
/// by the [`MessageBuilder`](crate::MessageBuilder) and checked on the parsed [`Message`](crate::Message).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attribute {
    /// [RFC8489](https://datatracker.ietf.org/doc/html/rfc8489#section-14.3)
    Username(String),
    /// [RFC8445](https://datatracker.ietf.org/doc/html/rfc8445#section-16.1)
    Priority(u32),
    /// [RFC8445](https://datatracker.ietf.org/doc/html/rfc8445#section-16.1)
    UseCandidate,
    /// [RFC8445](https://datatracker.ietf.org/doc/html/rfc8445#section-16.1)
    IceControlled(u64),
    /// [RFC8445](https://datatracker.ietf.org/doc/html/rfc8445#section-16.1)
    IceControlling(u64),
    /// [RFC8489](https://datatracker.ietf.org/doc/html/rfc8489#section-14.2)
    XorMappedAddress(SocketAddr),
    /// [RFC8489](https://datatracker.ietf.org/doc/html/rfc8489#section-14.8)
    ErrorCode(ErrorCode),
}

/// Value of the ERROR-CODE attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorCode {
    pub number: u16,
    pub reason: String,
}

impl ErrorCode {
    pub const BAD_REQUEST: u16 = 400;
    pub const UNAUTHORIZED: u16 = 401;
    pub const ROLE_CONFLICT: u16 = 487;
    pub const SERVER_ERROR: u16 = 500;

    pub fn new(number: u16, reason: impl Into<String>) -> Self {
        Self {
            number,
            reason: reason.into(),
        }
    }
}

impl Attribute {
    /// Attribute type as written on the wire
    pub fn typ(&self) -> u16 {
        match self {
            Attribute::Username(_) => USERNAME,
            Attribute::Priority(_) => PRIORITY,
            Attribute::UseCandidate => USE_CANDIDATE,
            Attribute::IceControlled(_) => ICE_CONTROLLED,
            Attribute::IceControlling(_) => ICE_CONTROLLING,
            Attribute::XorMappedAddress(_) => XOR_MAPPED_ADDRESS,
            Attribute::ErrorCode(_) => ERROR_CODE,
        }
    }

    /// Length of the value without padding
    pub(crate) fn encode_len(&self) -> usize {
        match self {
            Attribute::Username(s) => s.len(),
            Attribute::Priority(_) => 4,
            Attribute::UseCandidate => 0,
            Attribute::IceControlled(_) | Attribute::IceControlling(_) => 8,
            Attribute::XorMappedAddress(SocketAddr::V4(_)) => 8,
            Attribute::XorMappedAddress(SocketAddr::V6(_)) => 20,
            Attribute::ErrorCode(code) => 4 + code.reason.len(),
        }
    }

    pub(crate) fn encode(&self, transaction_id: &TransactionId, buf: &mut Vec<u8>) {
        match self {
            Attribute::Username(s) => buf.put_slice(s.as_bytes()),
            Attribute::Priority(priority) => buf.put_u32(*priority),
            Attribute::UseCandidate => {}
            Attribute::IceControlled(tie_breaker) | Attribute::IceControlling(tie_breaker) => {
                buf.put_u64(*tie_breaker)
            }
            Attribute::XorMappedAddress(addr) => encode_xor_addr(*addr, transaction_id, buf),
            Attribute::ErrorCode(code) => {
                buf.put_u16(0);
                buf.put_u8((code.number / 100) as u8);
                buf.put_u8((code.number % 100) as u8);
                buf.put_slice(code.reason.as_bytes());
            }
        }
    }

    /// Decode the value of an attribute, returns `None` for attribute types this crate doesn't know
    pub(crate) fn decode(
        typ: u16,
        mut value: &[u8],
        transaction_id: &TransactionId,
    ) -> Option<Result<Self, Error>> {
        let attr = match typ {
            USERNAME => from_utf8(value)
                .map(|s| Attribute::Username(s.to_owned()))
                .map_err(Error::from),
            PRIORITY => value
                .read_u32::<NE>()
                .map(Attribute::Priority)
                .map_err(Error::from),
            USE_CANDIDATE => Ok(Attribute::UseCandidate),
            ICE_CONTROLLED => value
                .read_u64::<NE>()
                .map(Attribute::IceControlled)
                .map_err(Error::from),
            ICE_CONTROLLING => value
                .read_u64::<NE>()
                .map(Attribute::IceControlling)
                .map_err(Error::from),
            XOR_MAPPED_ADDRESS => decode_xor_addr(value, transaction_id).map(Attribute::XorMappedAddress),
            ERROR_CODE => decode_error_code(value).map(Attribute::ErrorCode),
            _ => return None,
        };

        Some(attr)
    }
}

fn decode_error_code(mut value: &[u8]) -> Result<ErrorCode, Error> {
    let _reserved = value.read_u16::<NE>()?;
    let class = u16::from(value.read_u8()? & 0x7);
    let number = u16::from(value.read_u8()?);

    if !(3..=6).contains(&class) || number > 99 {
        return Err(Error::InvalidData("invalid error code"));
    }

    Ok(ErrorCode {
        number: class * 100 + number,
        reason: from_utf8(value)?.to_owned(),
    })
}

fn decode_xor_addr(mut buf: &[u8], transaction_id: &TransactionId) -> Result<SocketAddr, Error> {
    if buf.read_u8()? != 0 {
        return Err(Error::InvalidData("first byte must be zero"));
    }

    let family = buf.read_u8()?;
    let port = buf.read_u16::<NE>()? ^ XOR16;

    match family {
        1 => {
            let ip = buf.read_u32::<NE>()? ^ COOKIE;
            Ok(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(ip), port)))
        }
        2 => {
            let ip = buf.read_u128::<NE>()? ^ transaction_id.xor_key();
            Ok(SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::from(ip), port, 0, 0)))
        }
        _ => Err(Error::InvalidData("invalid address family")),
    }
}

fn encode_xor_addr(addr: SocketAddr, transaction_id: &TransactionId, buf: &mut Vec<u8>) {
    buf.put_u8(0);

    match addr {
        SocketAddr::V4(addr) => {
            buf.put_u8(1);
            buf.put_u16(addr.port() ^ XOR16);
            buf.put_u32(u32::from(*addr.ip()) ^ COOKIE);
        }
        SocketAddr::V6(addr) => {
            buf.put_u8(2);
            buf.put_u16(addr.port() ^ XOR16);
            buf.put_u128(u128::from(*addr.ip()) ^ transaction_id.xor_key());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xor_mapped_address_v4_wire_format() {
        let tsx = TransactionId::new([0; 12]);
        let addr: SocketAddr = "192.0.2.1:32853".parse().unwrap();

        let mut buf = vec![];
        Attribute::XorMappedAddress(addr).encode(&tsx, &mut buf);

        // RFC 5769 section 2.2
        assert_eq!(buf, [0x00, 0x01, 0xa1, 0x47, 0xe1, 0x12, 0xa6, 0x43]);

        let decoded = Attribute::decode(XOR_MAPPED_ADDRESS, &buf, &tsx)
            .unwrap()
            .unwrap();
        assert_eq!(decoded, Attribute::XorMappedAddress(addr));
    }

    #[test]
    fn xor_mapped_address_v6_uses_transaction_id() {
        let tsx = TransactionId::new([
            0xb7, 0xe7, 0xa7, 0x01, 0xbc, 0x34, 0xd6, 0x86, 0xfa, 0x87, 0xdf, 0xae,
        ]);
        let addr: SocketAddr = "[2001:db8:1234:5678:11:2233:4455:6677]:32853"
            .parse()
            .unwrap();

        let mut buf = vec![];
        Attribute::XorMappedAddress(addr).encode(&tsx, &mut buf);
        assert_eq!(buf.len(), 20);

        let other_tsx = TransactionId::new([1; 12]);
        let wrong = Attribute::decode(XOR_MAPPED_ADDRESS, &buf, &other_tsx)
            .unwrap()
            .unwrap();
        assert_ne!(wrong, Attribute::XorMappedAddress(addr));

        let right = Attribute::decode(XOR_MAPPED_ADDRESS, &buf, &tsx)
            .unwrap()
            .unwrap();
        assert_eq!(right, Attribute::XorMappedAddress(addr));
    }

    #[test]
    fn error_code_class_and_number() {
        let tsx = TransactionId::new([0; 12]);

        let mut buf = vec![];
        Attribute::ErrorCode(ErrorCode::new(487, "Role Conflict")).encode(&tsx, &mut buf);
        assert_eq!(&buf[..4], &[0, 0, 4, 87]);

        let Attribute::ErrorCode(code) = Attribute::decode(ERROR_CODE, &buf, &tsx).unwrap().unwrap()
        else {
            panic!("expected error code");
        };

        assert_eq!(code.number, ErrorCode::ROLE_CONFLICT);
        assert_eq!(code.reason, "Role Conflict");
    }

    #[test]
    fn invalid_error_code_class() {
        let tsx = TransactionId::new([0; 12]);

        assert!(Attribute::decode(ERROR_CODE, &[0, 0, 7, 1], &tsx).unwrap().is_err());
        assert!(Attribute::decode(ERROR_CODE, &[0, 0, 4], &tsx).unwrap().is_err());
    }

    #[test]
    fn unknown_attribute_is_skipped() {
        let tsx = TransactionId::new([0; 12]);

        assert!(Attribute::decode(0x8023, &[0; 8], &tsx).is_none());
        // SOFTWARE is comprehension-optional and not decoded
        assert!(Attribute::decode(0x8022, b"agent", &tsx).is_none());
    }
}
