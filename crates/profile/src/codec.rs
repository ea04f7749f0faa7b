//! Compact binary encoding for stack locations.
//!
//! The encoded form is the deduplication key used across the engine: two
//! locations with identical field values encode to byte-identical blobs, so
//! the blob can serve directly as a map key. All integers are unsigned
//! LEB128 varints; string fields are length-prefixed bytes. Signed values
//! (line numbers) are cast through `u64`.
//!
//! Layout:
//!
//! ```text
//! addr            uvarint
//! numLines        uvarint (0 if unsymbolized)
//! hasMapping      0x00 | 0x01
//!   buildID       length-prefixed bytes      (if hasMapping)
//!   filename      length-prefixed bytes
//!   mappingStart  uvarint
//!   mappingSize   uvarint (end - start, kept small)
//!   mappingOffset uvarint
//! numLines ×
//!   lineNumber    uvarint
//!   hasFunction   0x00 | 0x01
//!     startLine   uvarint                    (if hasFunction)
//!     name        length-prefixed bytes
//!     systemName  length-prefixed bytes
//!     filename    length-prefixed bytes
//! ```

use thiserror::Error;

use crate::model::{Function, Line, Location, Mapping};

/// Decoding hit truncated or malformed bytes. Fails the single location
/// being decoded; callers skip the frame or abort as they see fit.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unexpected end of input at byte {0}")]
    UnexpectedEof(usize),
    #[error("varint overflows u64 at byte {0}")]
    VarintOverflow(usize),
    #[error("invalid presence flag {value:#04x} at byte {offset}")]
    InvalidFlag { value: u8, offset: usize },
    #[error("string field is not valid UTF-8 at byte {0}")]
    InvalidUtf8(usize),
    #[error("{0} trailing bytes after location")]
    TrailingBytes(usize),
}

/// Exact number of bytes the encoder emits for `v` as a uvarint.
pub fn uvarint_len(mut v: u64) -> usize {
    let mut n = 1;
    while v >= 0x80 {
        v >>= 7;
        n += 1;
    }
    n
}

fn put_uvarint(buf: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        buf.push(v as u8 | 0x80);
        v >>= 7;
    }
    buf.push(v as u8);
}

fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    put_uvarint(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

fn bytes_len(bytes: &[u8]) -> usize {
    uvarint_len(bytes.len() as u64) + bytes.len()
}

/// Exact size in bytes of [`encode`]'s output for `location`.
pub fn encoded_len(location: &Location) -> usize {
    let mut n = uvarint_len(location.address) + uvarint_len(location.lines.len() as u64) + 1;
    if let Some(mapping) = &location.mapping {
        n += bytes_len(mapping.build_id.as_bytes())
            + bytes_len(mapping.file.as_bytes())
            + uvarint_len(mapping.start)
            + uvarint_len(mapping.end.saturating_sub(mapping.start))
            + uvarint_len(mapping.offset);
    }
    for line in &location.lines {
        n += uvarint_len(line.line as u64) + 1;
        if let Some(function) = &line.function {
            n += uvarint_len(function.start_line as u64)
                + bytes_len(function.name.as_bytes())
                + bytes_len(function.system_name.as_bytes())
                + bytes_len(function.filename.as_bytes());
        }
    }
    n
}

/// Append the encoding of `location` to `buf`.
///
/// Pure and deterministic: identical field values produce byte-identical
/// output. `is_folded` is not encoded.
pub fn encode_into(location: &Location, buf: &mut Vec<u8>) {
    put_uvarint(buf, location.address);
    put_uvarint(buf, location.lines.len() as u64);
    match &location.mapping {
        Some(mapping) => {
            buf.push(1);
            put_bytes(buf, mapping.build_id.as_bytes());
            put_bytes(buf, mapping.file.as_bytes());
            put_uvarint(buf, mapping.start);
            put_uvarint(buf, mapping.end.saturating_sub(mapping.start));
            put_uvarint(buf, mapping.offset);
        }
        None => buf.push(0),
    }
    for line in &location.lines {
        put_uvarint(buf, line.line as u64);
        match &line.function {
            Some(function) => {
                buf.push(1);
                put_uvarint(buf, function.start_line as u64);
                put_bytes(buf, function.name.as_bytes());
                put_bytes(buf, function.system_name.as_bytes());
                put_bytes(buf, function.filename.as_bytes());
            }
            None => buf.push(0),
        }
    }
}

/// Encode `location` into a fresh, exactly-sized buffer.
pub fn encode(location: &Location) -> Vec<u8> {
    let mut buf = Vec::with_capacity(encoded_len(location));
    encode_into(location, &mut buf);
    buf
}

/// Bounds-checked sequential reader over an encoded location.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn byte(&mut self) -> Result<u8, DecodeError> {
        let b = *self
            .buf
            .get(self.pos)
            .ok_or(DecodeError::UnexpectedEof(self.pos))?;
        self.pos += 1;
        Ok(b)
    }

    fn uvarint(&mut self) -> Result<u64, DecodeError> {
        let start = self.pos;
        let mut value: u64 = 0;
        let mut shift: u32 = 0;
        loop {
            let b = self.byte()?;
            if shift == 63 && b > 1 {
                return Err(DecodeError::VarintOverflow(start));
            }
            value |= u64::from(b & 0x7f) << shift;
            if b & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
            if shift > 63 {
                return Err(DecodeError::VarintOverflow(start));
            }
        }
    }

    fn flag(&mut self) -> Result<bool, DecodeError> {
        let offset = self.pos;
        match self.byte()? {
            0 => Ok(false),
            1 => Ok(true),
            value => Err(DecodeError::InvalidFlag { value, offset }),
        }
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let end = self
            .pos
            .checked_add(len)
            .ok_or(DecodeError::UnexpectedEof(self.pos))?;
        let slice = self
            .buf
            .get(self.pos..end)
            .ok_or(DecodeError::UnexpectedEof(self.pos))?;
        self.pos = end;
        Ok(slice)
    }

    fn string(&mut self) -> Result<&'a str, DecodeError> {
        let start = self.pos;
        let len = self.length()?;
        let raw = self.bytes(len)?;
        std::str::from_utf8(raw).map_err(|_| DecodeError::InvalidUtf8(start))
    }

    fn skip_string(&mut self) -> Result<(), DecodeError> {
        let len = self.length()?;
        self.bytes(len)?;
        Ok(())
    }

    fn length(&mut self) -> Result<usize, DecodeError> {
        let at = self.pos;
        usize::try_from(self.uvarint()?).map_err(|_| DecodeError::UnexpectedEof(at))
    }
}

/// Decode a full location from `buf`.
///
/// Every read is bounds-checked; truncated or malformed input yields a
/// [`DecodeError`], never a panic. Trailing bytes are rejected because blobs
/// act as exact content keys.
pub fn decode(buf: &[u8]) -> Result<Location, DecodeError> {
    let mut r = Reader::new(buf);
    let address = r.uvarint()?;
    let num_lines = r.uvarint()?;
    let mapping = if r.flag()? {
        let build_id = r.string()?.to_owned();
        let file = r.string()?.to_owned();
        let start = r.uvarint()?;
        let size = r.uvarint()?;
        let offset = r.uvarint()?;
        Some(Mapping {
            start,
            end: start.saturating_add(size),
            offset,
            file,
            build_id,
        })
    } else {
        None
    };
    // Cap the preallocation: num_lines is attacker-controlled until the
    // reads below prove the bytes are really there.
    let mut lines = Vec::with_capacity(num_lines.min(128) as usize);
    for _ in 0..num_lines {
        let line = r.uvarint()? as i64;
        let function = if r.flag()? {
            let start_line = r.uvarint()? as i64;
            let name = r.string()?.to_owned();
            let system_name = r.string()?.to_owned();
            let filename = r.string()?.to_owned();
            Some(Function {
                name,
                system_name,
                filename,
                start_line,
            })
        } else {
            None
        };
        lines.push(Line { line, function });
    }
    if r.pos != buf.len() {
        return Err(DecodeError::TrailingBytes(buf.len() - r.pos));
    }
    Ok(Location {
        address,
        mapping,
        lines,
        is_folded: false,
    })
}

/// Decode only the first line's function name, skipping everything else.
///
/// Filtering paths call this per stored location and never look at mapping
/// or line data, so a full decode would be wasted work. Returns `None` for
/// unsymbolized locations and lines without a function.
pub fn function_name(buf: &[u8]) -> Result<Option<&str>, DecodeError> {
    let mut r = Reader::new(buf);
    r.uvarint()?; // address
    let num_lines = r.uvarint()?;
    if r.flag()? {
        r.skip_string()?; // build id
        r.skip_string()?; // filename
        r.uvarint()?;
        r.uvarint()?;
        r.uvarint()?;
    }
    if num_lines == 0 {
        return Ok(None);
    }
    r.uvarint()?; // line number
    if !r.flag()? {
        return Ok(None);
    }
    r.uvarint()?; // start line
    Ok(Some(r.string()?))
}
