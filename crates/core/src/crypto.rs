//! LoRaWAN 1.0 MAC cryptography: MIC, FRMPayload cipher and join key derivation
//!
//! Every function takes its key material as an argument and keeps nothing
//! between calls.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use cmac::{Cmac, Mac};

use crate::MacError;

pub const KEY_LEN: usize = 16;
pub const BLOCK_LEN: usize = 16;

/// Largest buffer the B0/A blocks can describe (length is a single byte)
pub const MAX_BUFFER_LEN: usize = 255;

/// Join-accept bodies are one or two AES blocks
pub const MAX_JOIN_BUFFER_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Uplink = 0,
    Downlink = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionKeys {
    pub nwk_s_key: [u8; KEY_LEN],
    pub app_s_key: [u8; KEY_LEN],
}

/// Parse a 32 hex digit key as stored by provisioning tools.
pub fn key_from_hex(hex_key: &str) -> Result<[u8; KEY_LEN], MacError> {
    let bytes = hex::decode(hex_key.trim()).map_err(|e| MacError::InvalidHexKey(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|v: Vec<u8>| MacError::InvalidKeyLength(v.len()))
}

fn block_cipher(key: &[u8]) -> Result<Aes128, MacError> {
    Aes128::new_from_slice(key).map_err(|_| MacError::InvalidKeyLength(key.len()))
}

fn check_buffer(buffer: &[u8]) -> Result<(), MacError> {
    if buffer.len() > MAX_BUFFER_LEN {
        return Err(MacError::BufferTooLong {
            len: buffer.len(),
            max: MAX_BUFFER_LEN,
        });
    }
    Ok(())
}

fn check_join_buffer(buffer: &[u8]) -> Result<(), MacError> {
    if buffer.len() > MAX_JOIN_BUFFER_LEN {
        return Err(MacError::BufferTooLong {
            len: buffer.len(),
            max: MAX_JOIN_BUFFER_LEN,
        });
    }
    if buffer.len() % BLOCK_LEN != 0 {
        return Err(MacError::UnalignedJoinBuffer(buffer.len()));
    }
    Ok(())
}

/// B0 for MIC and A_i for the keystream share everything but the first
/// byte and the trailing length/counter byte.
fn nonce_block(tag: u8, address: u32, dir: Direction, counter: u32, last: u8) -> [u8; BLOCK_LEN] {
    let mut block = [0u8; BLOCK_LEN];
    block[0] = tag;
    block[5] = dir as u8;
    block[6..10].copy_from_slice(&address.to_le_bytes());
    block[10..14].copy_from_slice(&counter.to_le_bytes());
    block[15] = last;
    block
}

fn cmac_prefix(key: &[u8], parts: &[&[u8]]) -> Result<u32, MacError> {
    let mut mac = <Cmac<Aes128> as KeyInit>::new_from_slice(key)
        .map_err(|_| MacError::InvalidKeyLength(key.len()))?;
    for part in parts {
        mac.update(part);
    }
    let tag = mac.finalize().into_bytes();
    Ok(u32::from_le_bytes([tag[0], tag[1], tag[2], tag[3]]))
}

/// Data frame MIC: first four bytes of CMAC(key, B0 | buffer), little-endian.
pub fn compute_mic(
    buffer: &[u8],
    key: &[u8],
    address: u32,
    dir: Direction,
    counter: u32,
) -> Result<u32, MacError> {
    check_buffer(buffer)?;
    let b0 = nonce_block(0x49, address, dir, counter, buffer.len() as u8);
    cmac_prefix(key, &[&b0[..], buffer])
}

/// FRMPayload cipher. The keystream is AES(key, A_i) for i starting at 1,
/// the last block may be partial.
pub fn encrypt(
    buffer: &[u8],
    key: &[u8],
    address: u32,
    dir: Direction,
    counter: u32,
) -> Result<Vec<u8>, MacError> {
    check_buffer(buffer)?;
    let cipher = block_cipher(key)?;

    let mut out = Vec::with_capacity(buffer.len());
    for (i, chunk) in buffer.chunks(BLOCK_LEN).enumerate() {
        let a = nonce_block(0x01, address, dir, counter, (i + 1) as u8);
        let mut s = GenericArray::clone_from_slice(&a);
        cipher.encrypt_block(&mut s);
        out.extend(chunk.iter().zip(s.iter()).map(|(b, k)| b ^ k));
    }
    Ok(out)
}

/// Counter mode is its own inverse.
pub fn decrypt(
    buffer: &[u8],
    key: &[u8],
    address: u32,
    dir: Direction,
    counter: u32,
) -> Result<Vec<u8>, MacError> {
    encrypt(buffer, key, address, dir, counter)
}

/// Join-request / join-accept MIC: plain CMAC, no B0 block.
pub fn join_compute_mic(buffer: &[u8], key: &[u8]) -> Result<u32, MacError> {
    check_buffer(buffer)?;
    cmac_prefix(key, &[buffer])
}

/// Produce the on-air join-accept body. The network side applies the AES
/// decrypt primitive so that devices only need the encrypt direction.
pub fn join_encrypt(buffer: &[u8], key: &[u8]) -> Result<Vec<u8>, MacError> {
    check_join_buffer(buffer)?;
    let cipher = block_cipher(key)?;
    let mut out = buffer.to_vec();
    for chunk in out.chunks_mut(BLOCK_LEN) {
        cipher.decrypt_block(GenericArray::from_mut_slice(chunk));
    }
    Ok(out)
}

/// Recover a join-accept body from its on-air form.
pub fn join_decrypt(buffer: &[u8], key: &[u8]) -> Result<Vec<u8>, MacError> {
    check_join_buffer(buffer)?;
    let cipher = block_cipher(key)?;
    let mut out = buffer.to_vec();
    for chunk in out.chunks_mut(BLOCK_LEN) {
        cipher.encrypt_block(GenericArray::from_mut_slice(chunk));
    }
    Ok(out)
}

/// Derive NwkSKey and AppSKey from the root key.
///
/// `app_nonce` is AppNonce followed by NetID, exactly as they appear in the
/// decrypted join-accept.
pub fn derive_session_keys(
    key: &[u8],
    app_nonce: &[u8; 6],
    dev_nonce: u16,
) -> Result<SessionKeys, MacError> {
    let cipher = block_cipher(key)?;

    let derive = |prefix: u8| {
        let mut nonce = [0u8; BLOCK_LEN];
        nonce[0] = prefix;
        nonce[1..7].copy_from_slice(app_nonce);
        nonce[7..9].copy_from_slice(&dev_nonce.to_le_bytes());
        let mut block = GenericArray::clone_from_slice(&nonce);
        cipher.encrypt_block(&mut block);
        let mut out = [0u8; KEY_LEN];
        out.copy_from_slice(&block);
        out
    };

    Ok(SessionKeys {
        nwk_s_key: derive(0x01),
        app_s_key: derive(0x02),
    })
}
