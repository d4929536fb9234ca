//! Saltwire is the core of a Shadowsocks-style proxy transport: an
//! AEAD-framed byte stream and a replay cache for the salts observed on
//! the wire.
//!
//! ## Quick Start
//!
//! Saltwire provides three surfaces:
//!
//! * [`StreamWriter`] and [`StreamReader`]
//!
//!   Wrappers around any [`Write`] sink or [`Read`] source (e.g. a
//!   [`TcpStream`]) that frame plaintext into length-prefixed AEAD
//!   records. Each direction of a connection carries its own one-time
//!   salt, from which the record key is derived.
//!
//!   ```
//!   use std::io::{Read, Write};
//!   use saltwire::{Cipher, CipherKind, StreamReader, StreamWriter};
//!
//!   # fn main() -> Result<(), Box<dyn std::error::Error>> {
//!   let cipher = Cipher::new(CipherKind::ChaCha20Poly1305, &[7u8; 32])?;
//!
//!   let mut wire = Vec::new();
//!   let mut writer = StreamWriter::new(&mut wire, cipher.clone());
//!   writer.write_all(b"attack at dawn")?;
//!   drop(writer);
//!
//!   let mut reader = StreamReader::new(&wire[..], cipher);
//!   let mut plaintext = Vec::new();
//!   reader.read_to_end(&mut plaintext)?;
//!   assert_eq!(plaintext, b"attack at dawn");
//!   # Ok(())
//!   # }
//!   ```
//!
//! * [`ReplayCache`]
//!
//!   A thread-safe, bounded-memory record of recently seen salts. A
//!   server feeds it the salt of every accepted stream; a repeated salt
//!   means the stream is a replay and must be dropped.
//!
//!   ```
//!   use saltwire::ReplayCache;
//!
//!   # fn main() -> Result<(), Box<dyn std::error::Error>> {
//!   let cache = ReplayCache::new(1024);
//!   let salt = [1u8; 32];
//!   assert!(cache.add(&salt)?, "first sighting");
//!   assert!(!cache.add(&salt)?, "replayed");
//!   # Ok(())
//!   # }
//!   ```
//!
//!   The cache can be file-backed ([`ReplayCache::with_files`]) to
//!   survive restarts; persist the hasher table alongside
//!   ([`TabulationHasher::to_bytes`]) or the files are garbage.
//!
//! * [`pack`] and [`unpack`]
//!
//!   One-shot datagram sealing for packet transports.
//!
//! ## Threading
//!
//! A stream half is single-owner and not internally synchronized. The
//! replay cache accepts concurrent [`add`] calls from any number of
//! threads. Neither suspends cooperatively; cancellation is done by
//! closing the underlying I/O handle, which surfaces as an error at the
//! next operation.
//!
//! [`Read`]: std::io::Read
//! [`Write`]: std::io::Write
//! [`TcpStream`]: std::net::TcpStream
//! [`add`]: ReplayCache::add
#![warn(missing_debug_implementations, missing_docs, unreachable_pub)]
#![forbid(unsafe_code)]

pub mod error;
pub mod pool;

mod crypto;
mod hash;
mod replay;
mod set64;
mod stream;
mod udp;

pub use crypto::{Aead, Cipher, CipherKind};
pub use error::Error;
pub use hash::{TabulationHasher, IV_LEN};
pub use replay::ReplayCache;
pub use set64::{FileIndex, Index64, MemIndex, Set64};
pub use stream::{StreamReader, StreamWriter};
pub use udp::{pack, unpack};
