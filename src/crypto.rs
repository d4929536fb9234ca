//! Cipher surface.
//!
//! This module provides the AEAD capability consumed by the stream and
//! datagram layers: a [`Cipher`] bound to a master key, from which
//! per-connection [`Aead`] instances are derived with the salt carried on
//! the wire.

use core::fmt::{Debug, Formatter};

use aws_lc_rs::{
    aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_128_GCM, AES_256_GCM, CHACHA20_POLY1305},
    hkdf,
};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::Error;

/// Info string for the salt-to-subkey derivation.
const SUBKEY_INFO: &[u8] = b"ss-subkey";

/// Authenticated Encryption with Associated Data (AEAD) cipher suites
/// supported by [`Cipher`].
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum CipherKind {
    /// ChaCha20-Poly1305-IETF with 128-bit tags and 96-bit nonces.
    ///
    /// This is the default cipher.
    #[default]
    ChaCha20Poly1305,

    /// AES-128 in GCM mode with 128-bit tags and 96-bit nonces.
    Aes128Gcm,

    /// AES-256 in GCM mode with 128-bit tags and 96-bit nonces.
    Aes256Gcm,
}

impl CipherKind {
    /// The master key length in bytes.
    pub fn key_size(&self) -> usize {
        match self {
            CipherKind::ChaCha20Poly1305 | CipherKind::Aes256Gcm => 32,
            CipherKind::Aes128Gcm => 16,
        }
    }

    /// The per-connection salt length in bytes. Equal to the key length.
    pub fn salt_size(&self) -> usize {
        self.key_size()
    }

    fn algorithm(&self) -> &'static aws_lc_rs::aead::Algorithm {
        match self {
            CipherKind::ChaCha20Poly1305 => &CHACHA20_POLY1305,
            CipherKind::Aes128Gcm => &AES_128_GCM,
            CipherKind::Aes256Gcm => &AES_256_GCM,
        }
    }
}

/// The long-lived master key a [`Cipher`] derives session subkeys from.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
struct MasterKey(Vec<u8>);

impl Debug for MasterKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("MasterKey").field(&"*****").finish()
    }
}

/// An AEAD cipher bound to a master key.
///
/// A `Cipher` is cheap to clone and shared between the read and write
/// halves of a connection. It never encrypts directly; [`encrypter`] and
/// [`decrypter`] derive a fresh [`Aead`] from the per-connection salt.
///
/// [`encrypter`]: Cipher::encrypter
/// [`decrypter`]: Cipher::decrypter
#[derive(Clone, Debug)]
pub struct Cipher {
    kind: CipherKind,
    key: MasterKey,
}

impl Cipher {
    /// Creates a `Cipher` from a master key of exactly
    /// [`CipherKind::key_size`] bytes.
    pub fn new(kind: CipherKind, key: &[u8]) -> Result<Self, Error> {
        if key.len() != kind.key_size() {
            return Err(Error::InvalidKeyLength {
                expected: kind.key_size(),
                received: key.len(),
            });
        }
        Ok(Self {
            kind,
            key: MasterKey(key.to_vec()),
        })
    }

    /// The cipher suite this `Cipher` was created with.
    pub fn kind(&self) -> CipherKind {
        self.kind
    }

    /// The per-connection salt length in bytes.
    pub fn salt_size(&self) -> usize {
        self.kind.salt_size()
    }

    /// Derives the [`Aead`] that seals a stream opened with `salt`.
    pub fn encrypter(&self, salt: &[u8]) -> Result<Aead, Error> {
        self.session_aead(salt)
    }

    /// Derives the [`Aead`] that opens a stream received with `salt`.
    pub fn decrypter(&self, salt: &[u8]) -> Result<Aead, Error> {
        self.session_aead(salt)
    }

    fn session_aead(&self, salt: &[u8]) -> Result<Aead, Error> {
        if salt.len() != self.salt_size() {
            return Err(Error::InvalidSaltLength {
                expected: self.salt_size(),
                received: salt.len(),
            });
        }
        let mut subkey = Subkey(vec![0u8; self.kind.key_size()]);
        // Both lengths are fixed and far below the HKDF output bound,
        // so expansion cannot fail.
        hkdf::Salt::new(hkdf::HKDF_SHA1_FOR_LEGACY_USE_ONLY, salt)
            .extract(&self.key.0)
            .expand(&[SUBKEY_INFO], SubkeyLen(self.kind.key_size()))
            .expect("subkey expansion failed")
            .fill(&mut subkey.0)
            .expect("subkey fill failed");
        let key = UnboundKey::new(self.kind.algorithm(), &subkey.0)
            .expect("subkey length matches the cipher");
        Ok(Aead {
            key: LessSafeKey::new(key),
        })
    }
}

/// A derived session subkey, wiped as soon as it is bound.
#[derive(Zeroize, ZeroizeOnDrop)]
struct Subkey(Vec<u8>);

struct SubkeyLen(usize);

impl hkdf::KeyType for SubkeyLen {
    fn len(&self) -> usize {
        self.0
    }
}

/// A per-connection AEAD derived from a salt.
///
/// Sealing writes the authentication tag in place immediately after the
/// plaintext; opening consumes it from the same position.
pub struct Aead {
    key: LessSafeKey,
}

impl Aead {
    /// The authentication-tag length appended to every sealed buffer.
    pub fn overhead(&self) -> usize {
        self.key.algorithm().tag_len()
    }

    /// The nonce length in bytes.
    pub fn nonce_size(&self) -> usize {
        self.key.algorithm().nonce_len()
    }

    /// Seals `in_out` in place: the plaintext occupies all but the final
    /// [`overhead`] bytes, which receive the tag.
    ///
    /// [`overhead`]: Aead::overhead
    pub fn seal(&self, nonce: &[u8], in_out: &mut [u8]) {
        let nonce = Nonce::try_assume_unique_for_key(nonce).expect("nonce length matches the cipher");
        let (in_out, tag) = in_out.split_at_mut(in_out.len() - self.overhead());
        let t = self
            .key
            .seal_in_place_separate_tag(nonce, Aad::empty(), in_out)
            .expect("encrypt failed, this should never happen");
        tag.copy_from_slice(t.as_ref());
    }

    /// Opens `in_out` in place and returns the plaintext slice, which is
    /// [`overhead`] bytes shorter than the input.
    ///
    /// [`overhead`]: Aead::overhead
    pub fn open<'a>(&self, nonce: &[u8], in_out: &'a mut [u8]) -> Result<&'a [u8], Error> {
        let nonce = Nonce::try_assume_unique_for_key(nonce).expect("nonce length matches the cipher");
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::empty(), in_out)
            .map_err(|_| Error::DecryptFailed)?;
        Ok(plaintext)
    }
}

impl Debug for Aead {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Aead").finish_non_exhaustive()
    }
}
