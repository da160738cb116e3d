//! Cipher contexts, key slots and the buffer-level crypto operations.
//!
//! Content encryption is AES-CBC with a PKCS#7 tail. The ciphertext is laid
//! out as the block-aligned prefix of the input followed by one padding
//! block, and both segments are chained from the context IV independently.
//! Ciphertext is therefore always exactly one block longer than the aligned
//! input prefix, and a block-aligned input gains a full padding block.

use alloc::boxed::Box;
use alloc::vec::Vec;

use core::fmt;

use log::warn;
use spin::Mutex;
use thiserror::Error;
use zeroize::Zeroize;

mod soft;

pub use soft::SoftCipherEngine;

/// AES block and IV size in bytes.
pub const AES_BLOCK_SIZE: usize = 16;
/// SHA-256 digest size in bytes.
pub const DIGEST_SIZE: usize = 32;
/// Number of concurrently attachable cipher contexts.
pub const KEY_SLOTS: usize = 4;

/// Errors from the cipher layer.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    #[error("key slot {0} is out of range")]
    SlotOutOfRange(usize),
    #[error("key slot {0} is already attached")]
    SlotBusy(usize),
    #[error("key slot {0} has no key attached")]
    SlotVacant(usize),
    #[error("every key slot is attached")]
    TableFull,
    #[error("cipher engine failure")]
    Engine,
    #[error("invalid buffer length")]
    BadLength,
}

/// An AES key of any supported width. The material is wiped on drop.
#[derive(Clone, PartialEq, Eq)]
pub enum AesKey {
    Aes128([u8; 16]),
    Aes192([u8; 24]),
    Aes256([u8; 32]),
}

impl AesKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        match bytes.len() {
            16 => {
                let mut key = [0u8; 16];
                key.copy_from_slice(bytes);
                Ok(AesKey::Aes128(key))
            }
            24 => {
                let mut key = [0u8; 24];
                key.copy_from_slice(bytes);
                Ok(AesKey::Aes192(key))
            }
            32 => {
                let mut key = [0u8; 32];
                key.copy_from_slice(bytes);
                Ok(AesKey::Aes256(key))
            }
            _ => Err(CryptoError::BadLength),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            AesKey::Aes128(key) => key,
            AesKey::Aes192(key) => key,
            AesKey::Aes256(key) => key,
        }
    }

    pub fn bits(&self) -> usize {
        self.as_bytes().len() * 8
    }
}

impl Zeroize for AesKey {
    fn zeroize(&mut self) {
        match self {
            AesKey::Aes128(key) => key.zeroize(),
            AesKey::Aes192(key) => key.zeroize(),
            AesKey::Aes256(key) => key.zeroize(),
        }
    }
}

impl Drop for AesKey {
    fn drop(&mut self) {
        self.zeroize();
    }
}

impl fmt::Debug for AesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AesKey({} bits)", self.bits())
    }
}

/// A key, its IV, and the slot it wants to occupy.
#[derive(Clone)]
pub struct CryptoContext {
    pub key: AesKey,
    pub iv: [u8; AES_BLOCK_SIZE],
    pub slot: usize,
}

impl fmt::Debug for CryptoContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoContext")
            .field("key", &self.key)
            .field("slot", &self.slot)
            .finish_non_exhaustive()
    }
}

/// The primitive operations a cipher backend provides.
///
/// [`SoftCipherEngine`] computes everything on the CPU; a hardware-backed
/// implementation would drive an AES peripheral with the same contract.
/// `src` and `dst` of the CBC calls are equal-length block multiples, and
/// every call chains from the supplied IV.
pub trait CipherEngine: Send {
    fn load_key(&mut self, slot: usize, key: &AesKey) -> Result<(), CryptoError>;
    fn unload_key(&mut self, slot: usize) -> Result<(), CryptoError>;
    fn encrypt_cbc(
        &mut self,
        slot: usize,
        iv: &[u8; AES_BLOCK_SIZE],
        src: &[u8],
        dst: &mut [u8],
    ) -> Result<(), CryptoError>;
    fn decrypt_cbc(
        &mut self,
        slot: usize,
        iv: &[u8; AES_BLOCK_SIZE],
        src: &[u8],
        dst: &mut [u8],
    ) -> Result<(), CryptoError>;
    fn sha256(&mut self, data: &[u8], digest: &mut [u8; DIGEST_SIZE]) -> Result<(), CryptoError>;
}

struct SlotEntry {
    iv: [u8; AES_BLOCK_SIZE],
}

struct ServiceState {
    engine: Box<dyn CipherEngine>,
    slots: [Option<SlotEntry>; KEY_SLOTS],
}

/// Shared cipher service with exclusive key slots.
///
/// Several storage volumes can hold a reference to one service; each
/// attaches its own context to a free slot and all buffer operations are
/// serialized on the engine.
pub struct CryptoService {
    state: Mutex<ServiceState>,
}

impl CryptoService {
    pub fn new(engine: Box<dyn CipherEngine>) -> Self {
        CryptoService {
            state: Mutex::new(ServiceState {
                engine,
                slots: core::array::from_fn(|_| None),
            }),
        }
    }

    /// Service backed by the software engine.
    pub fn with_soft_engine() -> Self {
        CryptoService::new(Box::new(SoftCipherEngine::new()))
    }

    /// Attach `ctx` to its requested slot. Fails if the slot is occupied;
    /// a consumer owns its slot until it detaches.
    pub fn attach(&self, ctx: CryptoContext) -> Result<(), CryptoError> {
        if ctx.slot >= KEY_SLOTS {
            return Err(CryptoError::SlotOutOfRange(ctx.slot));
        }
        let mut state = self.state.lock();
        if state.slots[ctx.slot].is_some() {
            return Err(CryptoError::SlotBusy(ctx.slot));
        }
        state.engine.load_key(ctx.slot, &ctx.key)?;
        state.slots[ctx.slot] = Some(SlotEntry { iv: ctx.iv });
        Ok(())
    }

    /// Attach to the first vacant slot and return its index.
    pub fn attach_any(&self, key: AesKey, iv: [u8; AES_BLOCK_SIZE]) -> Result<usize, CryptoError> {
        let mut state = self.state.lock();
        let slot = state
            .slots
            .iter()
            .position(|entry| entry.is_none())
            .ok_or(CryptoError::TableFull)?;
        state.engine.load_key(slot, &key)?;
        state.slots[slot] = Some(SlotEntry { iv });
        Ok(slot)
    }

    /// Release a slot and drop its key from the engine.
    pub fn detach(&self, slot: usize) -> Result<(), CryptoError> {
        if slot >= KEY_SLOTS {
            return Err(CryptoError::SlotOutOfRange(slot));
        }
        let mut state = self.state.lock();
        if state.slots[slot].is_none() {
            return Err(CryptoError::SlotVacant(slot));
        }
        state.engine.unload_key(slot)?;
        state.slots[slot] = None;
        Ok(())
    }

    pub fn is_attached(&self, slot: usize) -> bool {
        slot < KEY_SLOTS && self.state.lock().slots[slot].is_some()
    }

    /// Encrypt `plain` with the context attached to `slot`.
    ///
    /// The output holds the CBC encryption of the block-aligned input prefix
    /// followed by the encryption of one PKCS#7 padding block, so it is
    /// always a block multiple and always longer than the input.
    pub fn encrypt(&self, slot: usize, plain: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if plain.is_empty() {
            return Err(CryptoError::BadLength);
        }
        let aligned = plain.len() - plain.len() % AES_BLOCK_SIZE;
        let mut out = alloc::vec![0u8; aligned + AES_BLOCK_SIZE];

        let mut state = self.state.lock();
        let ServiceState { engine, slots } = &mut *state;
        let iv = Self::slot_iv(slots, slot)?;
        if aligned > 0 {
            engine.encrypt_cbc(slot, &iv, &plain[..aligned], &mut out[..aligned])?;
        }

        let tail = plain.len() - aligned;
        let pad = (AES_BLOCK_SIZE - tail) as u8;
        let mut last = [pad; AES_BLOCK_SIZE];
        last[..tail].copy_from_slice(&plain[aligned..]);
        let result = engine.encrypt_cbc(slot, &iv, &last, &mut out[aligned..]);
        last.zeroize();
        result?;
        Ok(out)
    }

    /// Decrypt `cipher` with the context attached to `slot`.
    ///
    /// The final block is decrypted first so the padding can be inspected.
    /// A malformed padding byte does not fail the call: the whole decrypted
    /// buffer is returned as content, which lets callers with an outer
    /// integrity check see exactly what was stored.
    pub fn decrypt(&self, slot: usize, cipher: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if cipher.is_empty() || cipher.len() % AES_BLOCK_SIZE != 0 {
            return Err(CryptoError::BadLength);
        }
        let prefix = cipher.len() - AES_BLOCK_SIZE;
        let mut out = alloc::vec![0u8; cipher.len()];

        let mut state = self.state.lock();
        let ServiceState { engine, slots } = &mut *state;
        let iv = Self::slot_iv(slots, slot)?;

        engine.decrypt_cbc(slot, &iv, &cipher[prefix..], &mut out[prefix..])?;
        let pad = Self::padding_len(&out[prefix..]);
        if prefix > 0 {
            engine.decrypt_cbc(slot, &iv, &cipher[..prefix], &mut out[..prefix])?;
        }
        out.truncate(cipher.len() - pad);
        Ok(out)
    }

    /// SHA-256 of `data`.
    pub fn sha256(&self, data: &[u8]) -> Result<[u8; DIGEST_SIZE], CryptoError> {
        let mut digest = [0u8; DIGEST_SIZE];
        self.state.lock().engine.sha256(data, &mut digest)?;
        Ok(digest)
    }

    fn slot_iv(
        slots: &[Option<SlotEntry>; KEY_SLOTS],
        slot: usize,
    ) -> Result<[u8; AES_BLOCK_SIZE], CryptoError> {
        if slot >= KEY_SLOTS {
            return Err(CryptoError::SlotOutOfRange(slot));
        }
        slots[slot]
            .as_ref()
            .map(|entry| entry.iv)
            .ok_or(CryptoError::SlotVacant(slot))
    }

    /// PKCS#7 padding length of a decrypted final block, walking the pad
    /// bytes from the back. A value that does not check out yields zero and
    /// a warning, keeping the full block as content.
    fn padding_len(last_block: &[u8]) -> usize {
        let pad = last_block[AES_BLOCK_SIZE - 1] as usize;
        let plausible = pad >= 1
            && pad <= AES_BLOCK_SIZE
            && last_block[AES_BLOCK_SIZE - pad..]
                .iter()
                .all(|b| *b as usize == pad);
        if plausible {
            pad
        } else {
            warn!("pkcs7 padding mismatch, treating final block as content");
            0
        }
    }
}
