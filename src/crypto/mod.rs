//! LoRaWAN cryptographic operations
//!
//! The MAC consumes cryptography through the [`Crypto`] trait so tests and
//! hardware accelerators can substitute their own primitives. [`LoRaMacCrypto`]
//! is the software implementation built on `aes` and `cmac`:
//! - Message Integrity Code (MIC) computation
//! - Payload encryption/decryption
//! - Join accept decryption
//! - Session key derivation

use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use aes::Aes128;
use cmac::{Cmac, Mac};

use crate::config::device::{AESKey, DevAddr};

/// MIC size in bytes
pub const MIC_SIZE: usize = 4;

/// Block size for AES-128
const BLOCK_SIZE: usize = 16;

/// Direction identifiers for cryptographic operations
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Direction {
    /// Uplink (device to network)
    Up = 0,
    /// Downlink (network to device)
    Down = 1,
}

/// Failure reported by a crypto collaborator
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CryptoError {
    /// Key could not be loaded
    InvalidKey,
    /// Input length unsupported by the operation
    InvalidLength,
}

/// Cryptographic collaborator used by the MAC
pub trait Crypto {
    /// Compute the MIC of a data frame (`msg` is MHDR..FRMPayload)
    fn compute_mic(
        &self,
        key: &AESKey,
        msg: &[u8],
        dev_addr: DevAddr,
        dir: Direction,
        fcnt: u32,
    ) -> Result<[u8; MIC_SIZE], CryptoError>;

    /// Encrypt or decrypt FRMPayload in place
    fn encrypt_payload(
        &self,
        key: &AESKey,
        dev_addr: DevAddr,
        dir: Direction,
        fcnt: u32,
        payload: &mut [u8],
    ) -> Result<(), CryptoError>;

    /// Compute the MIC of a join request or of a decrypted join accept
    fn compute_join_mic(&self, key: &AESKey, msg: &[u8]) -> Result<[u8; MIC_SIZE], CryptoError>;

    /// Decrypt a join accept body (everything after MHDR, MIC included) in place
    fn decrypt_join_accept(&self, key: &AESKey, buf: &mut [u8]) -> Result<(), CryptoError>;

    /// Derive `(NwkSKey, AppSKey)` from join accept nonces
    fn derive_session_keys(
        &self,
        app_key: &AESKey,
        app_nonce: &[u8; 3],
        net_id: &[u8; 3],
        dev_nonce: u16,
    ) -> Result<(AESKey, AESKey), CryptoError>;
}

/// Software implementation of [`Crypto`]
#[derive(Debug, Clone, Copy, Default)]
pub struct LoRaMacCrypto;

impl LoRaMacCrypto {
    /// Create the software crypto collaborator
    pub const fn new() -> Self {
        Self
    }
}

fn cipher(key: &AESKey) -> Result<Aes128, CryptoError> {
    <Aes128 as KeyInit>::new_from_slice(key.as_bytes()).map_err(|_| CryptoError::InvalidKey)
}

fn cmac(key: &AESKey, parts: &[&[u8]]) -> Result<[u8; MIC_SIZE], CryptoError> {
    let mut mac =
        <Cmac<Aes128> as Mac>::new_from_slice(key.as_bytes()).map_err(|_| CryptoError::InvalidKey)?;
    for part in parts {
        mac.update(part);
    }
    let tag = mac.finalize().into_bytes();
    let mut mic = [0u8; MIC_SIZE];
    mic.copy_from_slice(&tag[..MIC_SIZE]);
    Ok(mic)
}

/// Build the A/B block shared by MIC and payload encryption
fn block(tag: u8, dir: Direction, dev_addr: DevAddr, fcnt: u32, last: u8) -> [u8; BLOCK_SIZE] {
    let mut b = [0u8; BLOCK_SIZE];
    b[0] = tag;
    b[5] = dir as u8;
    b[6..10].copy_from_slice(&dev_addr.to_le_bytes());
    b[10..14].copy_from_slice(&fcnt.to_le_bytes());
    b[15] = last;
    b
}

fn derive_key(cipher: &Aes128, tag: u8, app_nonce: &[u8; 3], net_id: &[u8; 3], dev_nonce: u16) -> AESKey {
    let mut key = [0u8; BLOCK_SIZE];
    key[0] = tag;
    key[1..4].copy_from_slice(app_nonce);
    key[4..7].copy_from_slice(net_id);
    key[7..9].copy_from_slice(&dev_nonce.to_le_bytes());
    cipher.encrypt_block(GenericArray::from_mut_slice(&mut key));
    AESKey::new(key)
}

impl Crypto for LoRaMacCrypto {
    fn compute_mic(
        &self,
        key: &AESKey,
        msg: &[u8],
        dev_addr: DevAddr,
        dir: Direction,
        fcnt: u32,
    ) -> Result<[u8; MIC_SIZE], CryptoError> {
        let len = u8::try_from(msg.len()).map_err(|_| CryptoError::InvalidLength)?;
        let b0 = block(0x49, dir, dev_addr, fcnt, len);
        cmac(key, &[&b0, msg])
    }

    fn encrypt_payload(
        &self,
        key: &AESKey,
        dev_addr: DevAddr,
        dir: Direction,
        fcnt: u32,
        payload: &mut [u8],
    ) -> Result<(), CryptoError> {
        let cipher = cipher(key)?;
        for (i, chunk) in payload.chunks_mut(BLOCK_SIZE).enumerate() {
            // Block counter starts at 1.
            let mut s = block(0x01, dir, dev_addr, fcnt, (i + 1) as u8);
            cipher.encrypt_block(GenericArray::from_mut_slice(&mut s));
            for (byte, key_byte) in chunk.iter_mut().zip(s.iter()) {
                *byte ^= key_byte;
            }
        }
        Ok(())
    }

    fn compute_join_mic(&self, key: &AESKey, msg: &[u8]) -> Result<[u8; MIC_SIZE], CryptoError> {
        cmac(key, &[msg])
    }

    fn decrypt_join_accept(&self, key: &AESKey, buf: &mut [u8]) -> Result<(), CryptoError> {
        if buf.len() % BLOCK_SIZE != 0 {
            return Err(CryptoError::InvalidLength);
        }
        // The network encrypts join accepts with AES decrypt, so the device encrypts.
        let cipher = cipher(key)?;
        for chunk in buf.chunks_mut(BLOCK_SIZE) {
            cipher.encrypt_block(GenericArray::from_mut_slice(chunk));
        }
        Ok(())
    }

    fn derive_session_keys(
        &self,
        app_key: &AESKey,
        app_nonce: &[u8; 3],
        net_id: &[u8; 3],
        dev_nonce: u16,
    ) -> Result<(AESKey, AESKey), CryptoError> {
        let cipher = cipher(app_key)?;
        let nwk_skey = derive_key(&cipher, 0x01, app_nonce, net_id, dev_nonce);
        let app_skey = derive_key(&cipher, 0x02, app_nonce, net_id, dev_nonce);
        Ok((nwk_skey, app_skey))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_encryption_is_symmetric() {
        let crypto = LoRaMacCrypto::new();
        let key = AESKey::new([0x2B; 16]);
        let addr = DevAddr::new(0x2601_1234);
        let mut data = *b"Hello LoRaWAN, longer than a block";
        crypto.encrypt_payload(&key, addr, Direction::Up, 7, &mut data).unwrap();
        assert_ne!(&data, b"Hello LoRaWAN, longer than a block");
        crypto.encrypt_payload(&key, addr, Direction::Up, 7, &mut data).unwrap();
        assert_eq!(&data, b"Hello LoRaWAN, longer than a block");
    }

    #[test]
    fn mic_depends_on_direction_and_counter() {
        let crypto = LoRaMacCrypto::new();
        let key = AESKey::new([0x01; 16]);
        let addr = DevAddr::new(1);
        let up = crypto.compute_mic(&key, b"frame", addr, Direction::Up, 1).unwrap();
        let down = crypto.compute_mic(&key, b"frame", addr, Direction::Down, 1).unwrap();
        let next = crypto.compute_mic(&key, b"frame", addr, Direction::Up, 2).unwrap();
        assert_ne!(up, down);
        assert_ne!(up, next);
    }

    #[test]
    fn join_accept_needs_whole_blocks() {
        let crypto = LoRaMacCrypto::new();
        let key = AESKey::new([0x01; 16]);
        let mut short = [0u8; 15];
        assert_eq!(
            crypto.decrypt_join_accept(&key, &mut short),
            Err(CryptoError::InvalidLength)
        );
    }

    #[test]
    fn session_keys_differ() {
        let crypto = LoRaMacCrypto::new();
        let (nwk, app) = crypto
            .derive_session_keys(&AESKey::new([0x01; 16]), &[1, 2, 3], &[4, 5, 6], 0x0708)
            .unwrap();
        assert_ne!(nwk, app);
    }
}
