//! Software cipher backend.

use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::{Aes128, Aes192, Aes256, Block};
use sha2::{Digest, Sha256};

use super::{AesKey, CipherEngine, CryptoError, AES_BLOCK_SIZE, DIGEST_SIZE, KEY_SLOTS};

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes192CbcEnc = cbc::Encryptor<Aes192>;
type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;
type Aes192CbcDec = cbc::Decryptor<Aes192>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// CPU implementation of [`CipherEngine`].
///
/// Keys live in ordinary memory here; they are wiped when unloaded or when
/// the engine is dropped.
pub struct SoftCipherEngine {
    keys: [Option<AesKey>; KEY_SLOTS],
}

impl SoftCipherEngine {
    pub fn new() -> Self {
        SoftCipherEngine {
            keys: core::array::from_fn(|_| None),
        }
    }

    fn key(&self, slot: usize) -> Result<&AesKey, CryptoError> {
        if slot >= KEY_SLOTS {
            return Err(CryptoError::SlotOutOfRange(slot));
        }
        self.keys[slot].as_ref().ok_or(CryptoError::SlotVacant(slot))
    }

    fn check_cbc_buffers(src: &[u8], dst: &[u8]) -> Result<(), CryptoError> {
        if src.len() != dst.len() || src.len() % AES_BLOCK_SIZE != 0 {
            return Err(CryptoError::BadLength);
        }
        Ok(())
    }
}

impl Default for SoftCipherEngine {
    fn default() -> Self {
        SoftCipherEngine::new()
    }
}

macro_rules! cbc_apply {
    ($mode:ty, $key:expr, $iv:expr, $buf:expr, $method:ident) => {{
        let mut mode = <$mode>::new_from_slices($key, $iv).map_err(|_| CryptoError::Engine)?;
        for chunk in $buf.chunks_exact_mut(AES_BLOCK_SIZE) {
            mode.$method(Block::from_mut_slice(chunk));
        }
    }};
}

impl CipherEngine for SoftCipherEngine {
    fn load_key(&mut self, slot: usize, key: &AesKey) -> Result<(), CryptoError> {
        if slot >= KEY_SLOTS {
            return Err(CryptoError::SlotOutOfRange(slot));
        }
        self.keys[slot] = Some(key.clone());
        Ok(())
    }

    fn unload_key(&mut self, slot: usize) -> Result<(), CryptoError> {
        if slot >= KEY_SLOTS {
            return Err(CryptoError::SlotOutOfRange(slot));
        }
        self.keys[slot] = None;
        Ok(())
    }

    fn encrypt_cbc(
        &mut self,
        slot: usize,
        iv: &[u8; AES_BLOCK_SIZE],
        src: &[u8],
        dst: &mut [u8],
    ) -> Result<(), CryptoError> {
        Self::check_cbc_buffers(src, dst)?;
        let key = self.key(slot)?;
        dst.copy_from_slice(src);
        match key {
            AesKey::Aes128(k) => cbc_apply!(Aes128CbcEnc, k, iv, dst, encrypt_block_mut),
            AesKey::Aes192(k) => cbc_apply!(Aes192CbcEnc, k, iv, dst, encrypt_block_mut),
            AesKey::Aes256(k) => cbc_apply!(Aes256CbcEnc, k, iv, dst, encrypt_block_mut),
        }
        Ok(())
    }

    fn decrypt_cbc(
        &mut self,
        slot: usize,
        iv: &[u8; AES_BLOCK_SIZE],
        src: &[u8],
        dst: &mut [u8],
    ) -> Result<(), CryptoError> {
        Self::check_cbc_buffers(src, dst)?;
        let key = self.key(slot)?;
        dst.copy_from_slice(src);
        match key {
            AesKey::Aes128(k) => cbc_apply!(Aes128CbcDec, k, iv, dst, decrypt_block_mut),
            AesKey::Aes192(k) => cbc_apply!(Aes192CbcDec, k, iv, dst, decrypt_block_mut),
            AesKey::Aes256(k) => cbc_apply!(Aes256CbcDec, k, iv, dst, decrypt_block_mut),
        }
        Ok(())
    }

    fn sha256(&mut self, data: &[u8], digest: &mut [u8; DIGEST_SIZE]) -> Result<(), CryptoError> {
        let mut hasher = Sha256::new();
        hasher.update(data);
        digest.copy_from_slice(&hasher.finalize());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_with(key: &[u8]) -> SoftCipherEngine {
        let mut engine = SoftCipherEngine::new();
        engine.load_key(0, &AesKey::from_bytes(key).unwrap()).unwrap();
        engine
    }

    // NIST SP 800-38A F.2.1: AES-128-CBC encryption, first block.
    #[test]
    fn aes128_cbc_matches_nist_vector() {
        let key = [
            0x2b, 0x7e, 0x15, 0x16, 0x28, 0xae, 0xd2, 0xa6, 0xab, 0xf7, 0x15, 0x88, 0x09, 0xcf,
            0x4f, 0x3c,
        ];
        let iv = [
            0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d,
            0x0e, 0x0f,
        ];
        let plain = [
            0x6b, 0xc1, 0xbe, 0xe2, 0x2e, 0x40, 0x9f, 0x96, 0xe9, 0x3d, 0x7e, 0x11, 0x73, 0x93,
            0x17, 0x2a,
        ];
        let expected = [
            0x76, 0x49, 0xab, 0xac, 0x81, 0x19, 0xb2, 0x46, 0xce, 0xe9, 0x8e, 0x9b, 0x12, 0xe9,
            0x19, 0x7d,
        ];
        let mut engine = engine_with(&key);
        let mut cipher = [0u8; 16];
        engine.encrypt_cbc(0, &iv, &plain, &mut cipher).unwrap();
        assert_eq!(cipher, expected);

        let mut back = [0u8; 16];
        engine.decrypt_cbc(0, &iv, &cipher, &mut back).unwrap();
        assert_eq!(back, plain);
    }

    #[test]
    fn chaining_runs_across_blocks_within_one_call() {
        let mut engine = engine_with(&[9; 16]);
        let iv = [3; 16];
        let plain = [0x77u8; 48];
        let mut cipher = [0u8; 48];
        engine.encrypt_cbc(0, &iv, &plain, &mut cipher).unwrap();
        // Identical plaintext blocks must differ once chained.
        assert_ne!(cipher[..16], cipher[16..32]);
        assert_ne!(cipher[16..32], cipher[32..48]);
        let mut back = [0u8; 48];
        engine.decrypt_cbc(0, &iv, &cipher, &mut back).unwrap();
        assert_eq!(back, plain);
    }

    #[test]
    fn buffer_shape_is_validated() {
        let mut engine = engine_with(&[1; 16]);
        let iv = [0; 16];
        let mut out = [0u8; 16];
        assert_eq!(
            engine.encrypt_cbc(0, &iv, &[0; 20], &mut [0; 20]),
            Err(CryptoError::BadLength)
        );
        assert_eq!(
            engine.encrypt_cbc(0, &iv, &[0; 32], &mut out),
            Err(CryptoError::BadLength)
        );
    }

    #[test]
    fn all_key_widths_round_trip() {
        for width in [16usize, 24, 32] {
            let mut engine = engine_with(&alloc::vec![0xc3; width]);
            let iv = [0x51; 16];
            let plain = [0x0fu8; 32];
            let mut cipher = [0u8; 32];
            engine.encrypt_cbc(0, &iv, &plain, &mut cipher).unwrap();
            let mut back = [0u8; 32];
            engine.decrypt_cbc(0, &iv, &cipher, &mut back).unwrap();
            assert_eq!(back, plain, "key width {width}");
        }
    }
}
