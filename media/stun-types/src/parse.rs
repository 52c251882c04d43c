use crate::attributes::{ATTRIBUTE_HEADER_LEN, Attribute, ErrorCode, FINGERPRINT, MESSAGE_INTEGRITY};
use crate::header::{Class, MessageHead, Method, STUN_HEADER_LENGTH};
use crate::integrity::{FINGERPRINT_LEN, INTEGRITY_LEN, fingerprint, hmac_sha1};
use crate::{COOKIE, Error, NE, TransactionId, padding_usize};
use byteorder::ReadBytesExt;
use bytes::Buf;
use std::convert::TryFrom;
use std::io::{Cursor, Read};
use std::net::SocketAddr;

#[derive(Debug, Clone, Copy)]
struct AttrSpan {
    /// Index where the attribute's value begins
    begin: usize,

    /// Index of end of the attribute's value
    end: usize,
}

impl AttrSpan {
    fn get_value<'b>(&self, buf: &'b [u8]) -> &'b [u8] {
        &buf[self.begin..self.end]
    }
}

/// A parsed STUN message
///
/// Attributes after MESSAGE-INTEGRITY (except FINGERPRINT) are ignored as required by RFC 8489.
#[derive(Debug)]
pub struct Message {
    buffer: Vec<u8>,

    head: MessageHead,

    class: Class,
    method: Method,
    transaction_id: TransactionId,

    attributes: Vec<Attribute>,

    integrity: Option<AttrSpan>,
    fingerprint: Option<AttrSpan>,
}

impl Message {
    pub fn class(&self) -> Class {
        self.class
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.transaction_id
    }

    pub fn parse(buffer: impl Into<Vec<u8>>) -> Result<Message, Error> {
        let mut cursor = Cursor::new(buffer.into());

        let head = MessageHead(cursor.read_u32::<NE>()?);

        if head.z() != 0 {
            return Err(Error::InvalidData("not a stun message"));
        }

        if cursor.read_u32::<NE>()? != COOKIE {
            return Err(Error::InvalidData("not a stun message"));
        }

        let mut transaction_id = [0u8; 12];
        cursor.read_exact(&mut transaction_id)?;
        let transaction_id = TransactionId(transaction_id);

        if usize::from(head.len()) + STUN_HEADER_LENGTH != cursor.get_ref().len() {
            return Err(Error::InvalidData("message length does not match header"));
        }

        let class = Class::try_from(head.typ())?;
        let method = Method::from(head.typ());

        let mut attributes = vec![];
        let mut integrity = None;
        let mut fingerprint = None;

        while cursor.has_remaining() {
            if fingerprint.is_some() {
                return Err(Error::InvalidData("FINGERPRINT must be the last attribute"));
            }

            let attr_typ = cursor.read_u16::<NE>()?;
            let attr_len = usize::from(cursor.read_u16::<NE>()?);

            let begin = usize::try_from(cursor.position())?;
            let end = begin + attr_len;
            let padding_end = end + padding_usize(attr_len);

            if padding_end > cursor.get_ref().len() {
                return Err(Error::InvalidData(
                    "Invalid attribute length in STUN message",
                ));
            }

            let span = AttrSpan { begin, end };

            match attr_typ {
                MESSAGE_INTEGRITY if integrity.is_none() => {
                    if attr_len != INTEGRITY_LEN {
                        return Err(Error::InvalidData("invalid MESSAGE-INTEGRITY length"));
                    }

                    integrity = Some(span);
                }
                FINGERPRINT => {
                    if attr_len != FINGERPRINT_LEN {
                        return Err(Error::InvalidData("invalid FINGERPRINT length"));
                    }

                    fingerprint = Some(span);
                }
                _ if integrity.is_some() => {
                    // ignore everything between integrity and fingerprint
                }
                _ => {
                    let value = span.get_value(cursor.get_ref());

                    if let Some(attr) = Attribute::decode(attr_typ, value, &transaction_id) {
                        attributes.push(attr?);
                    }
                }
            }

            cursor.set_position(u64::try_from(padding_end)?);
        }

        Ok(Message {
            buffer: cursor.into_inner(),
            head,
            class,
            method,
            transaction_id,
            attributes,
            integrity,
            fingerprint,
        })
    }

    pub fn username(&self) -> Option<&str> {
        self.attributes.iter().find_map(|attr| match attr {
            Attribute::Username(username) => Some(username.as_str()),
            _ => None,
        })
    }

    pub fn priority(&self) -> Option<u32> {
        self.attributes.iter().find_map(|attr| match attr {
            Attribute::Priority(priority) => Some(*priority),
            _ => None,
        })
    }

    pub fn use_candidate(&self) -> bool {
        self.attributes
            .iter()
            .any(|attr| matches!(attr, Attribute::UseCandidate))
    }

    pub fn ice_controlling(&self) -> Option<u64> {
        self.attributes.iter().find_map(|attr| match attr {
            Attribute::IceControlling(tie_breaker) => Some(*tie_breaker),
            _ => None,
        })
    }

    pub fn ice_controlled(&self) -> Option<u64> {
        self.attributes.iter().find_map(|attr| match attr {
            Attribute::IceControlled(tie_breaker) => Some(*tie_breaker),
            _ => None,
        })
    }

    pub fn xor_mapped_address(&self) -> Option<SocketAddr> {
        self.attributes.iter().find_map(|attr| match attr {
            Attribute::XorMappedAddress(addr) => Some(*addr),
            _ => None,
        })
    }

    pub fn error_code(&self) -> Option<&ErrorCode> {
        self.attributes.iter().find_map(|attr| match attr {
            Attribute::ErrorCode(code) => Some(code),
            _ => None,
        })
    }

    pub fn has_integrity(&self) -> bool {
        self.integrity.is_some()
    }

    pub fn has_fingerprint(&self) -> bool {
        self.fingerprint.is_some()
    }

    /// Verify MESSAGE-INTEGRITY with the given key
    pub fn verify_integrity(&self, key: &[u8]) -> Result<(), Error> {
        let Some(span) = self.integrity else {
            return Err(Error::InvalidData("missing MESSAGE-INTEGRITY"));
        };

        // The text used as input to HMAC is the STUN message, up to and
        // including the attribute preceding the MESSAGE-INTEGRITY attribute.
        // The Length field of the STUN message header is adjusted to point to
        // the end of the MESSAGE-INTEGRITY attribute.
        let head = self.head_with_len(span.end - STUN_HEADER_LENGTH)?;
        let rest = &self.buffer[4..span.begin - ATTRIBUTE_HEADER_LEN];

        let calculated = hmac_sha1(key, &[head.as_slice(), rest]);

        if calculated.as_slice() != span.get_value(&self.buffer) {
            return Err(Error::InvalidData("failed to verify message integrity"));
        }

        Ok(())
    }

    /// Verify the FINGERPRINT attribute, fails if it is missing
    pub fn verify_fingerprint(&self) -> Result<(), Error> {
        let Some(span) = self.fingerprint else {
            return Err(Error::InvalidData("missing FINGERPRINT"));
        };

        let head = self.head_with_len(span.end - STUN_HEADER_LENGTH)?;
        let rest = &self.buffer[4..span.begin - ATTRIBUTE_HEADER_LEN];

        let mut received = span.get_value(&self.buffer);
        let received = received.read_u32::<NE>()?;

        if fingerprint(&[head.as_slice(), rest]) != received {
            return Err(Error::InvalidData("fingerprint mismatch"));
        }

        Ok(())
    }

    fn head_with_len(&self, len: usize) -> Result<[u8; 4], Error> {
        let mut head = MessageHead(self.head.0);
        head.set_len(u16::try_from(len)?);
        Ok(head.0.to_be_bytes())
    }
}
