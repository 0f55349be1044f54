//! Westwood header encryption.
//!
//! Encrypted Mix archives carry an 80-byte key block that is run through a
//! small public-key transform to recover a 56-byte Blowfish key. Blowfish
//! (little-endian halves, ECB) then decrypts the header. Payloads are never
//! encrypted.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use blowfish::Blowfish;
use byteorder::LE;
use cipher::generic_array::GenericArray;
use cipher::{BlockDecrypt, KeyInit};
use num_bigint::BigUint;

use crate::{Error, Result};

/// Size of the key block stored after the Mix flags.
pub const KEY_BLOCK_SIZE: usize = 80;

/// Size of the recovered Blowfish key.
pub const BLOWFISH_KEY_SIZE: usize = 56;

/// Blowfish block size.
pub const BLOCK_SIZE: usize = 8;

/// The public modulus, DER INTEGER encoded.
const PUBLIC_KEY: &str = "AihRvNoIbTn85FZRYNZRcT+i6KpU+maCsEqr3Q5q+LDB5tH7Tz2qQ38V";

const PUBLIC_EXPONENT: u32 = 0x10001;

struct PublicKey {
    modulus: BigUint,
    exponent: BigUint,
    /// Bytes produced per transformed chunk; each input chunk is one longer.
    output_len: usize,
}

impl PublicKey {
    fn westwood() -> Result<Self> {
        let der = STANDARD
            .decode(PUBLIC_KEY)
            .map_err(|e| Error::Decryption(format!("bad public key encoding: {e}")))?;
        let magnitude = der_integer(&der)?;

        let modulus = BigUint::from_bytes_be(magnitude);
        let bits = modulus.bits() as usize;
        if bits < 10 {
            return Err(Error::Decryption("public modulus too small".into()));
        }

        Ok(Self {
            modulus,
            exponent: BigUint::from(PUBLIC_EXPONENT),
            output_len: (bits - 2) / 8,
        })
    }
}

/// Magnitude bytes of a DER INTEGER (tag `0x02`, short or long form length).
fn der_integer(der: &[u8]) -> Result<&[u8]> {
    let bad = || Error::Decryption("public key is not a DER integer".into());

    let (&tag, rest) = der.split_first().ok_or_else(bad)?;
    if tag != 0x02 {
        return Err(bad());
    }

    let (&first, rest) = rest.split_first().ok_or_else(bad)?;
    let (len, rest) = if first & 0x80 == 0 {
        (first as usize, rest)
    } else {
        let width = (first & 0x7f) as usize;
        if width == 0 || width > 4 || rest.len() < width {
            return Err(bad());
        }
        let len = rest[..width]
            .iter()
            .fold(0usize, |acc, &b| (acc << 8) | b as usize);
        (len, &rest[width..])
    };

    rest.get(..len).ok_or_else(bad)
}

/// Recover the Blowfish key from an 80-byte key block.
pub fn decrypt_key(key_block: &[u8]) -> Result<[u8; BLOWFISH_KEY_SIZE]> {
    if key_block.len() < KEY_BLOCK_SIZE {
        return Err(Error::Decryption(format!(
            "key block is {} bytes, expected {KEY_BLOCK_SIZE}",
            key_block.len()
        )));
    }

    let key = PublicKey::westwood()?;
    let chunk_len = key.output_len + 1;
    let chunks = BLOWFISH_KEY_SIZE.saturating_sub(1) / key.output_len + 1;

    let mut out = Vec::with_capacity(chunks * key.output_len);
    for chunk in key_block.chunks(chunk_len).take(chunks) {
        let value = BigUint::from_bytes_le(chunk).modpow(&key.exponent, &key.modulus);
        let mut bytes = value.to_bytes_le();
        bytes.resize(key.output_len, 0);
        out.extend_from_slice(&bytes);
    }

    out.get(..BLOWFISH_KEY_SIZE)
        .and_then(|k| k.try_into().ok())
        .ok_or_else(|| Error::Decryption("key transform produced too few bytes".into()))
}

/// Blowfish over little-endian 32-bit halves, as used for Mix headers.
pub struct HeaderCipher {
    cipher: Blowfish<LE>,
}

impl HeaderCipher {
    /// Build a cipher from a raw Blowfish key (4 to 56 bytes).
    pub fn new(key: &[u8]) -> Result<Self> {
        let cipher = Blowfish::<LE>::new_from_slice(key)
            .map_err(|_| Error::Decryption(format!("invalid key length {}", key.len())))?;
        Ok(Self { cipher })
    }

    /// Build a cipher from the key block stored in an encrypted archive.
    pub fn from_key_block(key_block: &[u8]) -> Result<Self> {
        Self::new(&decrypt_key(key_block)?)
    }

    /// Decrypt whole blocks in place. A trailing partial block is left as is.
    pub fn decrypt(&self, data: &mut [u8]) {
        for block in data.chunks_exact_mut(BLOCK_SIZE) {
            self.cipher.decrypt_block(GenericArray::from_mut_slice(block));
        }
    }
}
