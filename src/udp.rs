//! Single-datagram sealing.
//!
//! Datagram transports carry one salt per packet instead of one per
//! stream: a packet is `salt ‖ sealed payload`, sealed under the zero
//! nonce with the key derived from that salt. There is no chunking, no
//! counter, and no state between packets.

use rand::{rngs::OsRng, TryRngCore};

use crate::{crypto::Cipher, error::Error};

/// Seals `plaintext` into `dst` as one datagram and returns the packet
/// slice.
///
/// `dst` must hold the salt, the plaintext, and the authentication tag.
pub fn pack<'a>(dst: &'a mut [u8], plaintext: &[u8], cipher: &Cipher) -> Result<&'a [u8], Error> {
    let salt_size = cipher.salt_size();
    if dst.len() < salt_size + plaintext.len() {
        return Err(Error::DatagramTooShort { received: dst.len() });
    }
    let (salt, body) = dst.split_at_mut(salt_size);
    OsRng
        .try_fill_bytes(salt)
        .map_err(|_| Error::EntropySource)?;
    let aead = cipher.encrypter(salt)?;
    let sealed_len = plaintext.len() + aead.overhead();
    if body.len() < sealed_len {
        return Err(Error::DatagramTooShort {
            received: salt_size + body.len(),
        });
    }
    body[..plaintext.len()].copy_from_slice(plaintext);
    let nonce = vec![0u8; aead.nonce_size()];
    aead.seal(&nonce, &mut body[..sealed_len]);
    Ok(&dst[..salt_size + sealed_len])
}

/// Opens one datagram from `packet` into `dst` and returns the plaintext
/// slice.
pub fn unpack<'a>(dst: &'a mut [u8], packet: &[u8], cipher: &Cipher) -> Result<&'a [u8], Error> {
    let salt_size = cipher.salt_size();
    if packet.len() < salt_size {
        return Err(Error::DatagramTooShort {
            received: packet.len(),
        });
    }
    let (salt, body) = packet.split_at(salt_size);
    let aead = cipher.decrypter(salt)?;
    if body.len() < aead.overhead() {
        return Err(Error::DatagramTooShort {
            received: packet.len(),
        });
    }
    if dst.len() < body.len() {
        return Err(Error::DatagramTooShort { received: dst.len() });
    }
    dst[..body.len()].copy_from_slice(body);
    let nonce = vec![0u8; aead.nonce_size()];
    let plaintext_len = body.len() - aead.overhead();
    aead.open(&nonce, &mut dst[..body.len()])?;
    Ok(&dst[..plaintext_len])
}
