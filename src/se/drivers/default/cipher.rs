//! AES-128 block encryption and AES-CMAC
//!
//! Everything else in the driver is built on these two functions.

use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use aes::Aes128;
use cmac::{Cmac, Mac};
use subtle::ConstantTimeEq;

use crate::se::Key;

/// One AES block
pub type Block = [u8; 16];

/// Encrypt a single block. Pure; a 16-byte key and block always succeed.
pub fn aes128_encrypt(key: &Key, input: &Block) -> Block {
    let cipher = Aes128::new(GenericArray::from_slice(key.as_bytes()));
    let mut block = GenericArray::clone_from_slice(input);
    cipher.encrypt_block(&mut block);
    block.into()
}

/// AES-CMAC over the concatenation of `parts`
pub fn cmac(key: &Key, parts: &[&[u8]]) -> Block {
    let mut mac = <Cmac<Aes128> as KeyInit>::new(GenericArray::from_slice(key.as_bytes()));
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().into()
}

/// Compare a computed MIC against received bytes in constant time.
pub fn mic_matches(expected: &[u8; 4], received: &[u8]) -> bool {
    expected[..].ct_eq(received).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(hex_key: &str) -> Key {
        Key::try_from(hex::decode(hex_key).unwrap().as_slice()).unwrap()
    }

    #[test]
    fn test_fips197_vector() {
        let k = key("000102030405060708090a0b0c0d0e0f");
        let input: Block = hex::decode("00112233445566778899aabbccddeeff")
            .unwrap()
            .try_into()
            .unwrap();
        assert_eq!(
            hex::encode(aes128_encrypt(&k, &input)),
            "69c4e0d86a7b0430d8cdb78070b4c55a"
        );
    }

    #[test]
    fn test_rfc4493_cmac_vectors() {
        let k = key("2b7e151628aed2a6abf7158809cf4f3c");
        assert_eq!(
            hex::encode(cmac(&k, &[])),
            "bb1d6929e95937287fa37d129b756746"
        );
        let msg = hex::decode("6bc1bee22e409f96e93d7e117393172a").unwrap();
        assert_eq!(
            hex::encode(cmac(&k, &[&msg])),
            "070a16b46b4d4144f79bdd9dd04a287c"
        );
        // Split input gives the same tag
        assert_eq!(cmac(&k, &[&msg[..5], &msg[5..]]), cmac(&k, &[&msg]));
    }

    #[test]
    fn test_mic_matches() {
        assert!(mic_matches(&[1, 2, 3, 4], &[1, 2, 3, 4]));
        assert!(!mic_matches(&[1, 2, 3, 4], &[1, 2, 3, 5]));
        assert!(!mic_matches(&[1, 2, 3, 4], &[1, 2, 3]));
        assert!(!mic_matches(&[1, 2, 3, 4], &[1, 2, 3, 4, 5]));
        assert!(!mic_matches(&[1, 2, 3, 4], &[0x81, 2, 3, 4]));
    }
}
