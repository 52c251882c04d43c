use crate::Error;
use bitfield::bitfield;
use std::convert::TryFrom;

pub(crate) const STUN_HEADER_LENGTH: usize = 20;

bitfield! {
    /// First 32 bits of every STUN message
    pub struct MessageHead(u32);
    impl Debug;

    u8;
    pub z, _: 31, 30;

    u16;
    pub typ, set_typ: 29, 16;

    #[allow(clippy::len_without_is_empty)]
    pub len, set_len: 15, 0;
}

/// STUN class
#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub enum Class {
    Request,
    Indication,
    Success,
    Error,
}

impl Class {
    const MASK: u16 = 0x110;

    const REQUEST: u16 = 0x000;
    const INDICATION: u16 = 0x010;
    const SUCCESS: u16 = 0x100;
    const ERROR: u16 = 0x110;

    pub(crate) fn set_bits(&self, typ: &mut u16) {
        *typ &= Method::MASK;

        *typ |= match self {
            Class::Request => Self::REQUEST,
            Class::Indication => Self::INDICATION,
            Class::Success => Self::SUCCESS,
            Class::Error => Self::ERROR,
        };
    }
}

impl TryFrom<u16> for Class {
    type Error = Error;

    fn try_from(value: u16) -> Result<Self, Error> {
        match value & Self::MASK {
            Self::REQUEST => Ok(Self::Request),
            Self::INDICATION => Ok(Self::Indication),
            Self::SUCCESS => Ok(Self::Success),
            Self::ERROR => Ok(Self::Error),
            _ => Err(Error::InvalidData("unknown class")),
        }
    }
}

/// STUN method
///
/// ICE only ever sends Binding, everything else is kept around so it can be rejected properly.
#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub enum Method {
    Binding,
    Other(u16),
}

impl Method {
    const MASK: u16 = 0x3EEF;

    const BINDING: u16 = 0x1;

    pub(crate) fn set_bits(&self, typ: &mut u16) {
        *typ &= Class::MASK;

        *typ |= match self {
            Method::Binding => Self::BINDING,
            Method::Other(bits) => bits & Self::MASK,
        };
    }
}

impl From<u16> for Method {
    fn from(value: u16) -> Self {
        match value & Self::MASK {
            Self::BINDING => Self::Binding,
            other => Self::Other(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_and_method_bits() {
        let mut typ = 0;
        Method::Binding.set_bits(&mut typ);
        Class::Success.set_bits(&mut typ);
        assert_eq!(typ, 0x0101);

        Class::Error.set_bits(&mut typ);
        assert_eq!(typ, 0x0111);

        assert_eq!(Class::try_from(0x0111).unwrap(), Class::Error);
        assert_eq!(Method::from(0x0111), Method::Binding);

        // TURN Allocate
        assert_eq!(Method::from(0x0003), Method::Other(0x0003));
    }
}
