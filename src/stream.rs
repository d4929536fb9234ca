//! AEAD stream framing.
//!
//! A framed stream is a one-time random salt followed by records:
//!
//! ```text
//! stream := salt records
//! salt   := SaltSize bytes (random, per connection, per direction)
//! record := sealed_length(2B) tag | sealed_payload(L) tag
//! L      := payload length, 14 bits, big-endian, max 16383
//! ```
//!
//! Both seals use the key derived from the salt, with successive nonces
//! from a little-endian counter that starts at zero: the length seal
//! consumes one nonce, the payload seal the next.

use std::io::{self, ErrorKind, Read, Write};
use std::ops::Range;
use std::sync::LazyLock;

use rand::{rngs::OsRng, TryRngCore};

use crate::{
    crypto::{Aead, Cipher},
    error::Error,
    pool::{Lease, Pool},
};

/// The maximum size of a record's payload in bytes, and the mask applied
/// to every received length field.
const PAYLOAD_SIZE_MASK: usize = 0x3FFF; // 16*1024 - 1

/// Maximum allowed cipher overhead.
const MAX_CIPHER_OVERHEAD: usize = 16;

/// The largest buffer a single record can need.
const MAX_RECORD_LEN: usize = 2 + MAX_CIPHER_OVERHEAD + PAYLOAD_SIZE_MASK + MAX_CIPHER_OVERHEAD;

/// Buffer pool shared by every stream in the process.
static STREAM_POOL: LazyLock<Pool> = LazyLock::new(|| Pool::new(MAX_RECORD_LEN));

/// Increments a little-endian unsigned integer, wrapping around on
/// overflow.
fn increment(counter: &mut [u8]) {
    for byte in counter.iter_mut() {
        *byte = byte.wrapping_add(1);
        if *byte != 0 {
            return;
        }
    }
}

/// Reads one chunk from `source`, retrying interrupted reads. `Ok(0)`
/// means end of stream.
fn read_once<R: Read>(source: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        match source.read(buf) {
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            other => return other,
        }
    }
}

/// Reads exactly `buf.len()` bytes. Returns false when the stream ends
/// cleanly before the first byte; ending inside the buffer is an
/// [`ErrorKind::UnexpectedEof`] error.
fn read_full<R: Read>(source: &mut R, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "stream ended inside a record",
                ))
            }
            Ok(n) => filled += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(true)
}

/// Encrypts a plaintext stream into AEAD-framed records.
///
/// The salt is generated and written lazily on the first write, so a
/// `StreamWriter` that never carries data never touches the wire.
///
/// A writer is single-owner: it is not internally synchronized.
#[derive(Debug)]
pub struct StreamWriter<W> {
    sink: W,
    cipher: Cipher,
    // Lazily initialized by the first write:
    aead: Option<Aead>,
    // Nonce of the next seal.
    counter: Vec<u8>,
    // Holds the first byte of each record, read before the pooled record
    // buffer is acquired.
    first_byte: [u8; 1],
}

impl<W: Write> StreamWriter<W> {
    /// Creates a writer that frames everything written to it into `sink`.
    pub fn new(sink: W, cipher: Cipher) -> Self {
        Self {
            sink,
            cipher,
            aead: None,
            counter: Vec::new(),
            first_byte: [0u8],
        }
    }

    /// Generates and writes the salt, then derives the sealing key.
    fn init(&mut self) -> io::Result<()> {
        if self.aead.is_some() {
            return Ok(());
        }
        let mut salt = vec![0u8; self.cipher.salt_size()];
        OsRng
            .try_fill_bytes(&mut salt)
            .map_err(|_| Error::EntropySource)?;
        self.sink.write_all(&salt)?;
        let aead = self.cipher.encrypter(&salt)?;
        if aead.overhead() > MAX_CIPHER_OVERHEAD {
            return Err(Error::ExcessiveCipherOverhead {
                overhead: aead.overhead(),
            }
            .into());
        }
        self.counter = vec![0u8; aead.nonce_size()];
        self.aead = Some(aead);
        Ok(())
    }

    /// Drains `src` into the sink record by record until `src` reports
    /// end of stream, returning the total plaintext byte count.
    ///
    /// On failure, the error carries the plaintext byte count already
    /// transmitted before the failing record alongside the underlying
    /// error; the stream is broken at that point and must not be resumed.
    pub fn encrypt_from<R: Read>(&mut self, src: &mut R) -> Result<u64, (u64, io::Error)> {
        if let Err(err) = self.init() {
            return Err((0, err));
        }
        let mut written = 0u64;
        let mut lease = Lease::new(&STREAM_POOL);
        loop {
            // Read the first byte of a record separately from the rest.
            // This allows releasing the record buffer between records, so
            // an idle stream pins no large allocation.
            match read_once(src, &mut self.first_byte) {
                Ok(0) => return Ok(written),
                Ok(_) => {}
                Err(err) => return Err((written, err)),
            }
            let aead = self.aead.as_ref().expect("init sets the AEAD");
            let overhead = aead.overhead();
            let size_len = 2 + overhead;

            let buf = lease.acquire();
            buf[size_len] = self.first_byte[0];
            let (more, read_err) =
                match read_once(src, &mut buf[size_len + 1..size_len + PAYLOAD_SIZE_MASK]) {
                    Ok(n) => (n, None),
                    Err(err) => (0, Some(err)),
                };
            let plaintext_len = 1 + more;

            buf[..2].copy_from_slice(&(plaintext_len as u16).to_be_bytes());
            aead.seal(&self.counter, &mut buf[..size_len]);
            increment(&mut self.counter);
            aead.seal(
                &self.counter,
                &mut buf[size_len..size_len + plaintext_len + overhead],
            );
            increment(&mut self.counter);

            let record_len = size_len + plaintext_len + overhead;
            let sent = self.sink.write_all(&buf[..record_len]);
            // Don't hold onto the large buffer while waiting for the
            // next record.
            lease.release();
            if let Err(err) = sent {
                return Err((written, err));
            }
            written += plaintext_len as u64;
            if let Some(err) = read_err {
                return Err((written, err));
            }
        }
    }

    /// Unwraps the writer, returning the underlying sink.
    pub fn into_inner(self) -> W {
        self.sink
    }
}

impl<W: Write> Write for StreamWriter<W> {
    /// Writes all of `p` as a sequence of records and returns its length.
    ///
    /// A sink failure mid-stream is returned as the error and the partial
    /// count is discarded, per the `io::Write` contract; use
    /// [`encrypt_from`] to learn how many bytes a broken stream carried.
    ///
    /// [`encrypt_from`]: StreamWriter::encrypt_from
    fn write(&mut self, p: &[u8]) -> io::Result<usize> {
        let n = self.encrypt_from(&mut &p[..]).map_err(|(_, err)| err)?;
        Ok(n as usize)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.sink.flush()
    }
}

/// Decrypts an AEAD-framed stream back into plaintext.
///
/// The salt is consumed lazily on the first read. Decrypted payloads are
/// held in a pooled buffer that returns to the pool the moment the
/// caller has drained it.
///
/// A reader is single-owner: it is not internally synchronized.
#[derive(Debug)]
pub struct StreamReader<R> {
    source: R,
    cipher: Cipher,
    // Lazily initialized by the first read:
    aead: Option<Aead>,
    // Nonce of the next open.
    counter: Vec<u8>,
    // Buffer for the sealed length field. Sized in init().
    size_buf: Vec<u8>,
    // Holds the current record's payload while the caller drains it.
    payload: Lease<'static>,
    // The undelivered span of the decrypted payload.
    leftover: Range<usize>,
}

impl<R: Read> StreamReader<R> {
    /// Creates a reader that unframes everything read from `source`.
    pub fn new(source: R, cipher: Cipher) -> Self {
        Self {
            source,
            cipher,
            aead: None,
            counter: Vec::new(),
            size_buf: Vec::new(),
            payload: Lease::new(&STREAM_POOL),
            leftover: 0..0,
        }
    }

    /// Reads the salt and derives the opening key. Returns false when the
    /// source ends cleanly before any salt byte.
    fn init(&mut self) -> io::Result<bool> {
        if self.aead.is_some() {
            return Ok(true);
        }
        let mut salt = vec![0u8; self.cipher.salt_size()];
        if !read_full(&mut self.source, &mut salt)? {
            return Ok(false);
        }
        let aead = self.cipher.decrypter(&salt)?;
        if aead.overhead() > MAX_CIPHER_OVERHEAD {
            return Err(Error::ExcessiveCipherOverhead {
                overhead: aead.overhead(),
            }
            .into());
        }
        self.counter = vec![0u8; aead.nonce_size()];
        self.size_buf = vec![0u8; 2 + aead.overhead()];
        self.aead = Some(aead);
        Ok(true)
    }

    /// Ensures undelivered plaintext is available, decrypting records
    /// until one is nonempty. Returns false on a clean end of stream.
    fn fill(&mut self) -> io::Result<bool> {
        while self.leftover.is_empty() {
            if !self.init()? {
                return Ok(false);
            }
            // EOF on a record boundary ends the stream; anything shorter
            // than a whole record is truncation.
            if !read_full(&mut self.source, &mut self.size_buf)? {
                return Ok(false);
            }
            let aead = self.aead.as_ref().expect("init sets the AEAD");
            let overhead = aead.overhead();

            let opened = aead.open(&self.counter, &mut self.size_buf).map(|_| ());
            increment(&mut self.counter);
            opened?;
            let size =
                ((self.size_buf[0] as usize) << 8 | self.size_buf[1] as usize) & PAYLOAD_SIZE_MASK;

            let sealed_len = size + overhead;
            let buf = self.payload.acquire();
            let got = match read_full(&mut self.source, &mut buf[..sealed_len]) {
                Ok(true) => Ok(()),
                Ok(false) => Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "stream ended inside a record",
                )),
                Err(err) => Err(err),
            };
            if let Err(err) = got {
                self.payload.release();
                return Err(err);
            }
            let opened = aead.open(&self.counter, &mut buf[..sealed_len]).map(|_| ());
            increment(&mut self.counter);
            if let Err(err) = opened {
                self.payload.release();
                return Err(err.into());
            }
            self.leftover = 0..size;
        }
        Ok(true)
    }

    /// Consumes `n` bytes of leftover, releasing the pooled buffer when
    /// it is fully drained.
    fn drain(&mut self, n: usize) {
        self.leftover.start += n;
        if self.leftover.is_empty() {
            self.leftover = 0..0;
            self.payload.release();
        }
    }

    /// Drains every record's plaintext into `sink` until the source
    /// reports end of stream, returning the total byte count.
    pub fn decrypt_to<W: Write>(&mut self, sink: &mut W) -> io::Result<u64> {
        let mut written = 0u64;
        loop {
            if !self.fill()? {
                return Ok(written);
            }
            let n = sink.write(&self.payload.buf()[self.leftover.clone()])?;
            if n == 0 {
                return Err(ErrorKind::WriteZero.into());
            }
            written += n as u64;
            self.drain(n);
        }
    }

    /// Unwraps the reader, returning the underlying source.
    ///
    /// Any undelivered plaintext is discarded.
    pub fn into_inner(self) -> R {
        self.source
    }
}

impl<R: Read> Read for StreamReader<R> {
    /// Returns up to `buf.len()` bytes from the current record,
    /// decrypting the next record once the current one is exhausted.
    ///
    /// `Ok(0)` is only returned when the source ends cleanly at a record
    /// boundary (or `buf` is empty); a source that ends mid-record yields
    /// [`ErrorKind::UnexpectedEof`].
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || !self.fill()? {
            return Ok(0);
        }
        let leftover = &self.payload.buf()[self.leftover.clone()];
        let n = leftover.len().min(buf.len());
        buf[..n].copy_from_slice(&leftover[..n]);
        self.drain(n);
        Ok(n)
    }
}
