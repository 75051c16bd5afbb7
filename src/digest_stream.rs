//! Digest Stream Module
//!
//! Streaming MD5 envelopes for image I/O. On save, every byte written to the
//! image file passes through `DigestWriter` and the final hash is recorded in
//! the `VERSION` file. On load, `DigestReader` accumulates the same hash for
//! comparison against the recorded digest.

use md5::{Digest, Md5};
use std::fmt;
use std::io::{self, Read, Write};
use std::str::FromStr;
use thiserror::Error;

/// Errors raised for malformed digest strings.
#[derive(Error, Debug)]
pub enum DigestError {
    #[error("invalid image digest {digest:?}: expected 32 hex characters")]
    InvalidDigest { digest: String },
}

/// A 128-bit image content digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDigest([u8; 16]);

impl ImageDigest {
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Digest an entire byte slice in one shot.
    pub fn of(data: &[u8]) -> Self {
        let mut hasher = Md5::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    /// Digest everything a reader yields.
    pub fn of_reader<R: Read>(reader: &mut R) -> io::Result<Self> {
        let mut hasher = Md5::new();
        let mut buf = [0u8; 8192];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(Self(hasher.finalize().into()))
    }
}

impl fmt::Display for ImageDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl FromStr for ImageDigest {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 32 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(DigestError::InvalidDigest {
                digest: s.to_string(),
            });
        }
        let mut bytes = [0u8; 16];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hex = std::str::from_utf8(chunk).expect("validated ascii");
            bytes[i] = u8::from_str_radix(hex, 16).expect("validated hex");
        }
        Ok(Self(bytes))
    }
}

/// Writer envelope that hashes every byte passed through it.
pub struct DigestWriter<W: Write> {
    inner: W,
    hasher: Md5,
}

impl<W: Write> DigestWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Md5::new(),
        }
    }

    /// Consume the envelope, returning the accumulated digest and the sink.
    pub fn finish(self) -> (ImageDigest, W) {
        (ImageDigest(self.hasher.finalize().into()), self.inner)
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }
}

impl<W: Write> Write for DigestWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Reader envelope that hashes every byte passed through it.
pub struct DigestReader<R: Read> {
    inner: R,
    hasher: Md5,
}

impl<R: Read> DigestReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Md5::new(),
        }
    }

    pub fn finish(self) -> ImageDigest {
        ImageDigest(self.hasher.finalize().into())
    }
}

impl<R: Read> Read for DigestReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}
