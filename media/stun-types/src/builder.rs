use crate::attributes::{ATTRIBUTE_HEADER_LEN, Attribute, FINGERPRINT, MESSAGE_INTEGRITY};
use crate::header::{Class, MessageHead, Method, STUN_HEADER_LENGTH};
use crate::integrity::{FINGERPRINT_LEN, INTEGRITY_LEN, fingerprint, hmac_sha1};
use crate::{COOKIE, TransactionId, padding_usize};
use bytes::BufMut;

/// Builder for a STUN message
///
/// Attributes are written in the order they are added. MESSAGE-INTEGRITY and FINGERPRINT
/// must be added last, in that order.
pub struct MessageBuilder {
    head: MessageHead,
    transaction_id: TransactionId,

    buffer: Vec<u8>,
}

impl MessageBuilder {
    /// Create a new message builder.
    pub fn new(class: Class, method: Method, transaction_id: TransactionId) -> Self {
        let mut buffer = Vec::with_capacity(128);

        let mut typ = 0;
        method.set_bits(&mut typ);
        class.set_bits(&mut typ);

        let mut head = MessageHead(0);
        head.set_typ(typ);
        buffer.put_u32(head.0);

        buffer.put_u32(COOKIE);
        buffer.put_slice(&transaction_id.0);

        Self {
            head,
            transaction_id,
            buffer,
        }
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.transaction_id
    }

    /// Set the length of the message, excluding the header
    fn set_len(&mut self, len: usize) {
        self.head.set_len(
            len.try_into()
                .expect("stun messages must fit within 65535 bytes"),
        );

        self.buffer[..4].copy_from_slice(&self.head.0.to_be_bytes());
    }

    /// Serialize the attribute into the builder
    pub fn add_attr(&mut self, attr: Attribute) {
        let len = attr.encode_len();

        self.buffer.put_u16(attr.typ());
        self.buffer.put_u16(
            len.try_into()
                .expect("attribute values must fit within 65535 bytes"),
        );

        attr.encode(&self.transaction_id, &mut self.buffer);

        self.buffer
            .extend(std::iter::repeat_n(0, padding_usize(len)));
    }

    /// Add MESSAGE-INTEGRITY using the given key (for short-term credentials the password)
    pub fn add_message_integrity(&mut self, key: &[u8]) {
        // The header length must already include the integrity attribute
        self.set_len(self.buffer.len() - STUN_HEADER_LENGTH + ATTRIBUTE_HEADER_LEN + INTEGRITY_LEN);

        let digest = hmac_sha1(key, &[self.buffer.as_slice()]);

        self.buffer.put_u16(MESSAGE_INTEGRITY);
        self.buffer.put_u16(INTEGRITY_LEN as u16);
        self.buffer.put_slice(&digest);
    }

    /// Add FINGERPRINT, must be the last attribute
    pub fn add_fingerprint(&mut self) {
        self.set_len(self.buffer.len() - STUN_HEADER_LENGTH + ATTRIBUTE_HEADER_LEN + FINGERPRINT_LEN);

        let crc = fingerprint(&[self.buffer.as_slice()]);

        self.buffer.put_u16(FINGERPRINT);
        self.buffer.put_u16(FINGERPRINT_LEN as u16);
        self.buffer.put_u32(crc);
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.set_len(self.buffer.len() - STUN_HEADER_LENGTH);
        self.buffer
    }
}
