use crc::{CRC_32_ISO_HDLC, Crc};
use hmac::{Hmac, Mac};
use sha1::Sha1;

pub(crate) const INTEGRITY_LEN: usize = 20;
pub(crate) const FINGERPRINT_LEN: usize = 4;

const FINGERPRINT_XOR: u32 = 0x5354_554e;
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// HMAC-SHA1 over the concatenation of `parts`
pub(crate) fn hmac_sha1(key: &[u8], parts: &[&[u8]]) -> [u8; INTEGRITY_LEN] {
    let mut hmac = Hmac::<Sha1>::new_from_slice(key).expect("any key length is valid");

    for part in parts {
        hmac.update(part);
    }

    let mut digest = [0u8; INTEGRITY_LEN];
    digest.copy_from_slice(&hmac.finalize().into_bytes());
    digest
}

/// CRC-32 of the concatenation of `parts` xor'ed with 0x5354554e
pub(crate) fn fingerprint(parts: &[&[u8]]) -> u32 {
    let mut digest = CRC32.digest();

    for part in parts {
        digest.update(part);
    }

    digest.finalize() ^ FINGERPRINT_XOR
}
