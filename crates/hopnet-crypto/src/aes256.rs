//! AES-256 tunnel layer cipher.
//!
//! One hop's layer over a buffer laid out as `IV (16) | body (n * 16)`:
//!
//! 1. the IV is encrypted in place with the IV key (single block),
//! 2. the body is CBC-encrypted with the layer key, chained from that IV,
//! 3. the IV is encrypted with the IV key a second time.
//!
//! [`LayerCipher::decrypt`] is the exact inverse. Scrambling the IV on both
//! sides of the body pass keeps colluding hops from matching a cell by its IV.

use ::aes::cipher::generic_array::GenericArray;
use ::aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use ::aes::Aes256;

use crate::keys::SessionKey;
use crate::{CryptoError, Result, BLOCK_SIZE, IV_SIZE};

/// Expanded AES-256 key schedules for one hop's layer.
#[derive(Clone)]
pub struct LayerCipher {
    layer: Aes256,
    iv: Aes256,
}

impl LayerCipher {
    /// Expand the layer key and IV key of one hop.
    pub fn new(layer_key: &SessionKey, iv_key: &SessionKey) -> Self {
        Self {
            layer: Aes256::new(GenericArray::from_slice(layer_key.as_bytes())),
            iv: Aes256::new(GenericArray::from_slice(iv_key.as_bytes())),
        }
    }

    /// Add this layer to `buf` (`IV | body`) in place.
    ///
    /// # Errors
    ///
    /// - [`CryptoError::UnalignedBuffer`] if `buf` is not an IV followed by whole blocks
    pub fn encrypt(&self, buf: &mut [u8]) -> Result<()> {
        let (iv, body) = split_iv(buf)?;
        self.iv.encrypt_block(GenericArray::from_mut_slice(iv));
        cbc_encrypt(&self.layer, iv, body);
        self.iv.encrypt_block(GenericArray::from_mut_slice(iv));
        Ok(())
    }

    /// Remove this layer from `buf` (`IV | body`) in place.
    ///
    /// # Errors
    ///
    /// - [`CryptoError::UnalignedBuffer`] if `buf` is not an IV followed by whole blocks
    pub fn decrypt(&self, buf: &mut [u8]) -> Result<()> {
        let (iv, body) = split_iv(buf)?;
        self.iv.decrypt_block(GenericArray::from_mut_slice(iv));
        cbc_decrypt(&self.layer, iv, body);
        self.iv.decrypt_block(GenericArray::from_mut_slice(iv));
        Ok(())
    }
}

/// Encrypt a single block with AES-256.
pub fn encrypt_block(key: &SessionKey, block: &mut [u8; BLOCK_SIZE]) {
    let cipher = Aes256::new(GenericArray::from_slice(key.as_bytes()));
    cipher.encrypt_block(GenericArray::from_mut_slice(block));
}

/// Decrypt a single block with AES-256.
pub fn decrypt_block(key: &SessionKey, block: &mut [u8; BLOCK_SIZE]) {
    let cipher = Aes256::new(GenericArray::from_slice(key.as_bytes()));
    cipher.decrypt_block(GenericArray::from_mut_slice(block));
}

fn split_iv(buf: &mut [u8]) -> Result<(&mut [u8], &mut [u8])> {
    if buf.len() < IV_SIZE || (buf.len() - IV_SIZE) % BLOCK_SIZE != 0 {
        return Err(CryptoError::UnalignedBuffer { len: buf.len() });
    }
    Ok(buf.split_at_mut(IV_SIZE))
}

fn cbc_encrypt(cipher: &Aes256, iv: &[u8], body: &mut [u8]) {
    let mut prev = [0u8; BLOCK_SIZE];
    prev.copy_from_slice(iv);
    for block in body.chunks_exact_mut(BLOCK_SIZE) {
        xor_in_place(block, &prev);
        cipher.encrypt_block(GenericArray::from_mut_slice(block));
        prev.copy_from_slice(block);
    }
}

fn cbc_decrypt(cipher: &Aes256, iv: &[u8], body: &mut [u8]) {
    let mut prev = [0u8; BLOCK_SIZE];
    prev.copy_from_slice(iv);
    let mut saved = [0u8; BLOCK_SIZE];
    for block in body.chunks_exact_mut(BLOCK_SIZE) {
        saved.copy_from_slice(block);
        cipher.decrypt_block(GenericArray::from_mut_slice(block));
        xor_in_place(block, &prev);
        prev = saved;
    }
}

fn xor_in_place(dst: &mut [u8], src: &[u8; BLOCK_SIZE]) {
    for (d, s) in dst.iter_mut().zip(src.iter()) {
        *d ^= s;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    fn test_cipher() -> LayerCipher {
        LayerCipher::new(
            &SessionKey::from_bytes([0x11; 32]),
            &SessionKey::from_bytes([0x22; 32]),
        )
    }

    #[test]
    fn test_aes256_known_answer() {
        // FIPS-197 appendix C.3
        let key = SessionKey::from_bytes(hex!(
            "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f"
        ));
        let mut block = hex!("00112233445566778899aabbccddeeff");
        encrypt_block(&key, &mut block);
        assert_eq!(block, hex!("8ea2b7ca516745bfeafc49904b496089"));
        decrypt_block(&key, &mut block);
        assert_eq!(block, hex!("00112233445566778899aabbccddeeff"));
    }

    #[test]
    fn test_layer_roundtrip() {
        let cipher = test_cipher();
        let original: Vec<u8> = (0..1024u32).map(|i| (i % 251) as u8).collect();
        let mut buf = original.clone();

        cipher.encrypt(&mut buf).expect("encrypt");
        assert_ne!(buf, original);
        cipher.decrypt(&mut buf).expect("decrypt");
        assert_eq!(buf, original);
    }

    #[test]
    fn test_iv_changes_every_block() {
        let cipher = test_cipher();
        let mut a = vec![0u8; 64];
        let mut b = vec![0u8; 64];
        b[0] = 1;
        cipher.encrypt(&mut a).expect("encrypt");
        cipher.encrypt(&mut b).expect("encrypt");
        for i in 0..4 {
            let range = i * BLOCK_SIZE..(i + 1) * BLOCK_SIZE;
            assert_ne!(a[range.clone()], b[range]);
        }
    }

    #[test]
    fn test_cbc_chaining_propagates() {
        let cipher = test_cipher();
        let mut a = vec![0u8; 80];
        let mut b = vec![0u8; 80];
        b[IV_SIZE] = 0xFF;
        cipher.encrypt(&mut a).expect("encrypt");
        cipher.encrypt(&mut b).expect("encrypt");
        // IV untouched by body changes, every later body block differs
        assert_eq!(a[..IV_SIZE], b[..IV_SIZE]);
        assert_ne!(a[64..], b[64..]);
    }

    #[test]
    fn test_unaligned_rejected() {
        let cipher = test_cipher();
        assert!(cipher.encrypt(&mut [0u8; 15]).is_err());
        assert!(cipher.encrypt(&mut [0u8; 33]).is_err());
        assert!(cipher.decrypt(&mut [0u8; 40]).is_err());
        // An IV with an empty body is valid.
        assert!(cipher.encrypt(&mut [0u8; 16]).is_ok());
    }
}
