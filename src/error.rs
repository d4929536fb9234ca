//! All possible non-I/O protocol and cache errors.
use core::{
    error,
    fmt::{Display, Formatter},
};
use std::io::{self, ErrorKind};

/// Enumeration of all errors produced by the framing layer, the cipher
/// surface, and the replay cache.
///
/// Stream operations surface these through [`io::Error`] with
/// [`ErrorKind::Other`]; use [`io::Error::downcast`] to recover the
/// original variant.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// The system entropy source failed while generating a salt.
    ///
    /// This error is fatal; the session must be abandoned. A failure while
    /// filling the tabulation-hash table panics instead, since no usable
    /// hasher can exist without entropy.
    EntropySource,

    /// An AEAD open failed: the data was truncated, tampered with, or
    /// sealed under a different key.
    ///
    /// This error is fatal for the stream it occurred on. No further
    /// detail is exposed.
    DecryptFailed,

    /// The cipher reports an authentication-tag overhead larger than the
    /// record layout reserves.
    ExcessiveCipherOverhead {
        /// The overhead reported by the cipher.
        overhead: usize,
    },

    /// The master key length does not match the cipher.
    InvalidKeyLength {
        /// The key length the cipher requires.
        expected: usize,
        /// The key length received.
        received: usize,
    },

    /// The salt length does not match the cipher.
    InvalidSaltLength {
        /// The salt length the cipher requires.
        expected: usize,
        /// The salt length received.
        received: usize,
    },

    /// A serialized tabulation-hash table has the wrong length.
    InvalidTableLength {
        /// The exact serialized table length.
        expected: usize,
        /// The length received.
        received: usize,
    },

    /// The destination or source buffer cannot hold a whole datagram.
    DatagramTooShort {
        /// The buffer length received.
        received: usize,
    },

    /// Zero was used as a set key. Zero marks empty cells and is never a
    /// valid key; hitting this is a caller contract violation.
    ZeroValue,

    /// An addition was attempted on a set that already holds
    /// `capacity` values.
    SetFull,

    /// A backing-store cell could only be partially read.
    ShortRead {
        /// The cell index at which the short read occurred.
        index: u64,
    },

    /// A backing-store cell could only be partially written, or the write
    /// fell outside the store.
    ShortWrite {
        /// The cell index at which the short write occurred.
        index: u64,
    },

    /// A backing store failed the recovery scan: its contents cannot have
    /// been produced by correct set operations.
    CorruptSet,

    /// A file-backed store's cell count is not a power of two of at
    /// least 8.
    BadCapacity {
        /// The cell count of the offered file.
        cells: u64,
    },

    /// A replay cache needs at least an active, an archive, and a spare
    /// generation.
    TooFewSets {
        /// The number of sets received.
        received: usize,
    },

    /// An I/O error from a file-backed store.
    Io(io::Error),
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::EntropySource => write!(f, "system entropy source failure"),
            Error::DecryptFailed => write!(f, "decryption failed"),
            Error::ExcessiveCipherOverhead { overhead } => {
                write!(f, "excessive cipher overhead ({overhead})")
            }
            Error::InvalidKeyLength { expected, received } => {
                write!(f, "invalid key length: expected {expected}, received {received}")
            }
            Error::InvalidSaltLength { expected, received } => {
                write!(f, "invalid salt length: expected {expected}, received {received}")
            }
            Error::InvalidTableLength { expected, received } => {
                write!(f, "invalid hash table length: expected {expected}, received {received}")
            }
            Error::DatagramTooShort { received } => {
                write!(f, "buffer too short for datagram: {received}")
            }
            Error::ZeroValue => write!(f, "0 is not an allowed value"),
            Error::SetFull => write!(f, "set is full"),
            Error::ShortRead { index } => write!(f, "short read at cell {index}"),
            Error::ShortWrite { index } => write!(f, "short write at cell {index}"),
            Error::CorruptSet => write!(f, "backing store is corrupt"),
            Error::BadCapacity { cells } => {
                write!(f, "capacity must be a power of two >= 8 cells, got {cells}")
            }
            Error::TooFewSets { received } => {
                write!(f, "need at least an active, an archive, and a spare set, got {received}")
            }
            Error::Io(err) => write!(f, "backing store I/O: {err}"),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(err) => err,
            err => io::Error::new(ErrorKind::Other, err),
        }
    }
}
