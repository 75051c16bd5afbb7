//! Codec Registry Module
//!
//! Explicit registry of image compression codecs, keyed by the name stored in
//! the image prefix. Codecs wrap the digest stream: the digest always covers
//! the bytes as they land in the file, compressed or not. An image naming a
//! codec that is not registered fails to load.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::sync::Arc;

/// A compression writer that must be finished to flush its final frame.
pub trait FinishWrite<'a>: Write + 'a {
    fn finish(self: Box<Self>) -> io::Result<()>;
}

/// A named streaming compression codec.
pub trait ImageCodec: Send + Sync {
    fn name(&self) -> &'static str;

    /// Wrap a sink; body bytes written through the result come out compressed.
    fn encoder<'a>(&self, sink: &'a mut dyn Write) -> io::Result<Box<dyn FinishWrite<'a> + 'a>>;

    /// Wrap a source positioned at the start of the compressed body.
    fn decoder<'a>(&self, source: &'a mut dyn Read) -> io::Result<Box<dyn Read + 'a>>;
}

struct ZstdCodec;

struct ZstdWriter<'a>(zstd::stream::write::Encoder<'a, &'a mut dyn Write>);

impl<'a> Write for ZstdWriter<'a> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl<'a> FinishWrite<'a> for ZstdWriter<'a> {
    fn finish(self: Box<Self>) -> io::Result<()> {
        self.0.finish().map(|_| ())
    }
}

impl ImageCodec for ZstdCodec {
    fn name(&self) -> &'static str {
        "zstd"
    }

    fn encoder<'a>(&self, sink: &'a mut dyn Write) -> io::Result<Box<dyn FinishWrite<'a> + 'a>> {
        Ok(Box::new(ZstdWriter(zstd::stream::write::Encoder::new(
            sink, 0,
        )?)))
    }

    fn decoder<'a>(&self, source: &'a mut dyn Read) -> io::Result<Box<dyn Read + 'a>> {
        Ok(Box::new(zstd::stream::read::Decoder::new(source)?))
    }
}

struct Lz4Codec;

struct Lz4Writer<'a>(lz4_flex::frame::FrameEncoder<&'a mut dyn Write>);

impl<'a> Write for Lz4Writer<'a> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl<'a> FinishWrite<'a> for Lz4Writer<'a> {
    fn finish(self: Box<Self>) -> io::Result<()> {
        self.0
            .finish()
            .map(|_| ())
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }
}

impl ImageCodec for Lz4Codec {
    fn name(&self) -> &'static str {
        "lz4"
    }

    fn encoder<'a>(&self, sink: &'a mut dyn Write) -> io::Result<Box<dyn FinishWrite<'a> + 'a>> {
        Ok(Box::new(Lz4Writer(lz4_flex::frame::FrameEncoder::new(sink))))
    }

    fn decoder<'a>(&self, source: &'a mut dyn Read) -> io::Result<Box<dyn Read + 'a>> {
        Ok(Box::new(lz4_flex::frame::FrameDecoder::new(source)))
    }
}

/// All codecs known to this process, populated at startup.
#[derive(Clone)]
pub struct CodecRegistry {
    codecs: HashMap<&'static str, Arc<dyn ImageCodec>>,
}

impl CodecRegistry {
    /// Registry with the built-in codecs.
    pub fn with_defaults() -> Self {
        let mut registry = Self {
            codecs: HashMap::new(),
        };
        registry.register(Arc::new(ZstdCodec));
        registry.register(Arc::new(Lz4Codec));
        registry
    }

    pub fn register(&mut self, codec: Arc<dyn ImageCodec>) {
        self.codecs.insert(codec.name(), codec);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ImageCodec>> {
        self.codecs.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.codecs.keys().copied().collect()
    }
}

impl std::fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecRegistry")
            .field("codecs", &self.names())
            .finish()
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
