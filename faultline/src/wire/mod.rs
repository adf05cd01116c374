//! Wire encoding for endpoints and harness messages.
//!
//! All integers are little-endian. Sizes use the compact form: one byte for
//! values below 255, otherwise `0xFF` followed by an `i32`.
//!
//! Encapsulation format: `[size:4][major:1][minor:1][body:N]`
//!
//! - **size**: Total encapsulation length including the 6-byte header (i32)
//! - **major/minor**: Encoding version of the body
//!
//! A reader that does not understand an encapsulated body can step over it
//! with [`InputStream::skip_encapsulation`] using the size prefix alone.

use std::fmt;

/// Encapsulation header size: 4 (size) + 1 (major) + 1 (minor) = 6 bytes.
pub const ENCAPSULATION_HEADER_SIZE: usize = 6;

/// Encoding version written by [`OutputStream::start_encapsulation`].
pub const ENCODING_1_1: EncodingVersion = EncodingVersion { major: 1, minor: 1 };

/// Wire format error types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    /// Not enough data left in the stream (or the current encapsulation).
    #[error("unexpected end of stream: need {needed} bytes, have {have}")]
    UnexpectedEnd {
        /// Bytes required by the read.
        needed: usize,
        /// Bytes available before the current limit.
        have: usize,
    },

    /// Size field is negative or otherwise unusable.
    #[error("invalid size: {size}")]
    InvalidSize {
        /// The decoded size value.
        size: i32,
    },

    /// Encapsulation size is smaller than its own header.
    #[error("invalid encapsulation size: {size}")]
    InvalidEncapsulationSize {
        /// The decoded encapsulation size.
        size: i32,
    },

    /// Encapsulation uses an encoding this reader cannot decode.
    #[error("unsupported encoding {version}")]
    UnsupportedEncoding {
        /// Version found in the encapsulation header.
        version: EncodingVersion,
    },

    /// `end_encapsulation` called without a matching `start_encapsulation`.
    #[error("no open encapsulation")]
    NoOpenEncapsulation,

    /// String bytes are not valid UTF-8.
    #[error("invalid string: {message}")]
    InvalidString {
        /// Decoder error details.
        message: String,
    },

    /// Decoded endpoint type differs from the one the factory wraps.
    ///
    /// The stream is desynchronized; this is never recovered from.
    #[error("endpoint type mismatch: expected {expected}, found {found}")]
    EndpointTypeMismatch {
        /// Type the decoding factory wraps.
        expected: u16,
        /// Type read from the stream.
        found: u16,
    },

    /// Unknown message tag.
    #[error("unknown message tag {tag}")]
    UnknownTag {
        /// The tag byte read from the stream.
        tag: u8,
    },
}

/// Encoding version carried by an encapsulation header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EncodingVersion {
    /// Major version.
    pub major: u8,
    /// Minor version.
    pub minor: u8,
}

impl fmt::Display for EncodingVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Growable little-endian output buffer.
#[derive(Debug, Default)]
pub struct OutputStream {
    buf: Vec<u8>,
    /// Start offsets of the open encapsulations, innermost last.
    encaps: Vec<usize>,
}

impl OutputStream {
    /// Create an empty stream.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty stream with pre-allocated capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            encaps: Vec::new(),
        }
    }

    /// Write a single byte.
    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    /// Write a boolean as one byte.
    pub fn write_bool(&mut self, v: bool) {
        self.buf.push(u8::from(v));
    }

    /// Write a 16-bit unsigned integer.
    pub fn write_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Write a 32-bit signed integer.
    pub fn write_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Write a size in compact form.
    pub fn write_size(&mut self, size: usize) {
        if size < 255 {
            self.buf.push(size as u8);
        } else {
            self.buf.push(255);
            self.write_i32(size as i32);
        }
    }

    /// Write a UTF-8 string prefixed by its byte length.
    pub fn write_string(&mut self, s: &str) {
        self.write_size(s.len());
        self.buf.extend_from_slice(s.as_bytes());
    }

    /// Write a byte sequence prefixed by its length.
    pub fn write_byte_seq(&mut self, bytes: &[u8]) {
        self.write_size(bytes.len());
        self.buf.extend_from_slice(bytes);
    }

    /// Write raw bytes with no prefix.
    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Open an encapsulation using [`ENCODING_1_1`].
    pub fn start_encapsulation(&mut self) {
        self.start_encapsulation_with(ENCODING_1_1);
    }

    /// Open an encapsulation with an explicit encoding version.
    ///
    /// The size field is patched by [`end_encapsulation`](Self::end_encapsulation).
    pub fn start_encapsulation_with(&mut self, encoding: EncodingVersion) {
        self.encaps.push(self.buf.len());
        self.write_i32(0);
        self.buf.push(encoding.major);
        self.buf.push(encoding.minor);
    }

    /// Close the innermost encapsulation and patch its size.
    pub fn end_encapsulation(&mut self) -> Result<(), WireError> {
        let start = self.encaps.pop().ok_or(WireError::NoOpenEncapsulation)?;
        let size = (self.buf.len() - start) as i32;
        self.buf[start..start + 4].copy_from_slice(&size.to_le_bytes());
        Ok(())
    }

    /// Number of bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Borrow the encoded bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Consume the stream and return the encoded bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

struct ReadEncapsulation {
    end: usize,
    encoding: EncodingVersion,
}

/// Little-endian reader over a borrowed buffer.
///
/// Reads never cross the end of the innermost open encapsulation.
pub struct InputStream<'a> {
    data: &'a [u8],
    pos: usize,
    encaps: Vec<ReadEncapsulation>,
}

impl<'a> InputStream<'a> {
    /// Create a reader positioned at the start of `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            encaps: Vec::new(),
        }
    }

    fn limit(&self) -> usize {
        self.encaps.last().map_or(self.data.len(), |e| e.end)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        let have = self.limit().saturating_sub(self.pos);
        if n > have {
            return Err(WireError::UnexpectedEnd { needed: n, have });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Read a single byte.
    pub fn read_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    /// Read a one-byte boolean.
    pub fn read_bool(&mut self) -> Result<bool, WireError> {
        Ok(self.read_u8()? != 0)
    }

    /// Read a 16-bit unsigned integer.
    pub fn read_u16(&mut self) -> Result<u16, WireError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    /// Read a 32-bit signed integer.
    pub fn read_i32(&mut self) -> Result<i32, WireError> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read a compact size.
    pub fn read_size(&mut self) -> Result<usize, WireError> {
        match self.read_u8()? {
            255 => {
                let size = self.read_i32()?;
                usize::try_from(size).map_err(|_| WireError::InvalidSize { size })
            }
            small => Ok(small as usize),
        }
    }

    /// Read a length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> Result<String, WireError> {
        let len = self.read_size()?;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|e| WireError::InvalidString {
            message: e.to_string(),
        })
    }

    /// Read a length-prefixed byte sequence.
    pub fn read_byte_seq(&mut self) -> Result<Vec<u8>, WireError> {
        let len = self.read_size()?;
        Ok(self.take(len)?.to_vec())
    }

    fn read_encapsulation_header(&mut self) -> Result<(usize, EncodingVersion), WireError> {
        let start = self.pos;
        let size = self.read_i32()?;
        if size < ENCAPSULATION_HEADER_SIZE as i32 {
            return Err(WireError::InvalidEncapsulationSize { size });
        }
        let encoding = EncodingVersion {
            major: self.read_u8()?,
            minor: self.read_u8()?,
        };
        let end = start + size as usize;
        if end > self.limit() {
            return Err(WireError::UnexpectedEnd {
                needed: size as usize,
                have: self.limit() - start,
            });
        }
        Ok((end, encoding))
    }

    /// Enter an encapsulation; subsequent reads are bounded by its size.
    pub fn start_encapsulation(&mut self) -> Result<EncodingVersion, WireError> {
        let (end, encoding) = self.read_encapsulation_header()?;
        if encoding.major != ENCODING_1_1.major || encoding.minor > ENCODING_1_1.minor {
            return Err(WireError::UnsupportedEncoding { version: encoding });
        }
        self.encaps.push(ReadEncapsulation { end, encoding });
        Ok(encoding)
    }

    /// Leave the innermost encapsulation.
    ///
    /// Trailing bytes the reader did not consume are skipped, so a newer
    /// writer may append fields an older reader does not know about.
    pub fn end_encapsulation(&mut self) -> Result<(), WireError> {
        let encaps = self.encaps.pop().ok_or(WireError::NoOpenEncapsulation)?;
        if self.pos < encaps.end {
            tracing::trace!(
                skipped = encaps.end - self.pos,
                encoding = %encaps.encoding,
                "skipping unread encapsulation bytes"
            );
        }
        self.pos = encaps.end;
        Ok(())
    }

    /// Step over a whole encapsulation without decoding it.
    ///
    /// Returns the encoding and the raw body. Works for any encoding version.
    pub fn skip_encapsulation(&mut self) -> Result<(EncodingVersion, &'a [u8]), WireError> {
        let (end, encoding) = self.read_encapsulation_header()?;
        let body = &self.data[self.pos..end];
        self.pos = end;
        Ok((encoding, body))
    }

    /// Current read offset from the start of the buffer.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left before the current limit.
    pub fn remaining(&self) -> usize {
        self.limit().saturating_sub(self.pos)
    }
}
