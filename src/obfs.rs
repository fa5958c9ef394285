//! XOR obfuscator
//!
//! Every byte on an ET connection is XORed with the configured data key.
//! This de-synchronizes protocol framing for naive middleboxes; it is not
//! confidentiality. Key 0 is the identity.

/// Default obfuscation key when `data-key` is not configured.
pub const DEFAULT_KEY: u8 = 0x22;

/// XOR `buf` in place with `key`. Self-inverse.
pub fn xor_obfuscate(buf: &mut [u8], key: u8) {
    if key == 0 {
        return;
    }
    for b in buf.iter_mut() {
        *b ^= key;
    }
}

/// Encrypt a buffer in place.
pub fn encrypt(buf: &mut [u8], key: u8) {
    xor_obfuscate(buf, key);
}

/// Decrypt a buffer in place.
pub fn decrypt(buf: &mut [u8], key: u8) {
    xor_obfuscate(buf, key);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_all_keys() {
        let original: Vec<u8> = (0u8..=255).collect();
        for key in [0u8, 1, 0x22, 0x7f, 0xff] {
            let mut buf = original.clone();
            encrypt(&mut buf, key);
            decrypt(&mut buf, key);
            assert_eq!(buf, original, "key {:#x}", key);
        }
    }

    #[test]
    fn zero_key_is_identity() {
        let mut buf = b"plaintext".to_vec();
        encrypt(&mut buf, 0);
        assert_eq!(&buf, b"plaintext");
    }

    #[test]
    fn nonzero_key_changes_bytes() {
        let mut buf = b"plaintext".to_vec();
        encrypt(&mut buf, DEFAULT_KEY);
        assert_ne!(&buf, b"plaintext");
    }
}
