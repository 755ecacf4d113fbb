//! The compact trace format, roughly a tenth of the textual one.
//!
//! Every event is two or three varints: `size`, then the old tag,
//! then (only if `size != 0`) the new tag. Each varint is little-endian
//! base-128 and its *last* byte has the high bit set. Tags are stored
//! as deltas against the newest tag issued so far:
//!
//! - old tag `t` is written as `newest + 1 - t`, `0` meaning "none";
//! - new tag `t` is written as `t - newest`, since new tags only grow.
//!
//! So a `malloc` is `(size, 0, Δnew)`, a `free` is `(0, Δold)` and a
//! `realloc` is `(size, Δold, Δnew)`.
use crate::helpe::*;

/// A varint is at most this many bytes long.
pub const MAX_VARINT_LEN: usize = 4;
const VARINT_LIMIT: u64 = 1 << (7 * MAX_VARINT_LEN);

#[derive(Error, Debug)]
pub enum CmtError {
    #[error("cmt stream error: unterminated varint")]
    Unterminated,
    #[error("cmt stream error: {0} does not fit in a varint")]
    ValueTooLarge(u64),
    #[error("cmt stream error: {0}")]
    Inconsistent(&'static str),
    #[error("cmt stream error: event carries no tag")]
    Untagged,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A decoded event. Addresses are not part of the format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmtRecord {
    Malloc  { size: ByteSteps, tag: Tag },
    Free    { tag: Tag },
    Realloc { old_tag: Tag, size: ByteSteps, new_tag: Tag },
}

impl CmtRecord {
    /// `None` if any pointer of `e` lacks a tag.
    pub fn from_event(e: &Event) -> Option<Self> {
        Some(match *e {
            Event::Malloc { size, ptr } => CmtRecord::Malloc { size, tag: ptr.tag? },
            Event::Free { ptr } => CmtRecord::Free { tag: ptr.tag? },
            Event::Realloc { old_ptr, new_size, new_ptr } => CmtRecord::Realloc {
                old_tag:    old_ptr.tag?,
                size:       new_size,
                new_tag:    new_ptr.tag?,
            },
        })
    }
}

fn emit_x<W: Write>(out: &mut W, x: u64) -> Result<(), CmtError> {
    if x >= VARINT_LIMIT {
        return Err(CmtError::ValueTooLarge(x));
    }
    let mut x = x;
    loop {
        let mut b = (x & 0x7f) as u8;
        x >>= 7;
        if x == 0 {
            b |= 0x80;
        }
        out.write_all(&[b])?;
        if x == 0 { break; }
    }

    Ok(())
}

/// Writes [CmtRecord]s. One encoder per stream: it remembers
/// the newest tag to compute deltas.
#[derive(Debug)]
pub struct CmtEncoder<W: Write> {
    out:        W,
    newest:     Tag,
}

impl<W: Write> CmtEncoder<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            newest: 0,
        }
    }

    /// Encodes a tagged [Event], as produced by
    /// [Converter](crate::convert::Converter).
    pub fn encode_event(&mut self, e: &Event) -> Result<(), CmtError> {
        let rec = CmtRecord::from_event(e).ok_or(CmtError::Untagged)?;
        self.encode(&rec)
    }

    pub fn encode(&mut self, rec: &CmtRecord) -> Result<(), CmtError> {
        let (size, old_tag, new_tag) = match *rec {
            CmtRecord::Malloc { size, tag }                 => (size, None, Some(tag)),
            CmtRecord::Free { tag }                         => (0, Some(tag), None),
            CmtRecord::Realloc { old_tag, size, new_tag }   => (size, Some(old_tag), Some(new_tag)),
        };
        if new_tag.is_some() && size == 0 {
            return Err(CmtError::Inconsistent("size == 0"));
        }
        if let Some(t) = old_tag {
            if t == 0 || t > self.newest {
                return Err(CmtError::Inconsistent("old tag was never issued"));
            }
        }
        if let Some(t) = new_tag {
            if t <= self.newest {
                return Err(CmtError::Inconsistent("new tag does not increase"));
            }
        }

        emit_x(&mut self.out, size as u64)?;
        // `1 <= t <= newest`, so this cannot leave the tag range.
        emit_x(&mut self.out, old_tag.map_or(0, |t| (self.newest - t) as u64 + 1))?;
        if let Some(t) = new_tag {
            emit_x(&mut self.out, (t - self.newest) as u64)?;
            self.newest = t;
        }

        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), CmtError> {
        Ok(self.out.flush()?)
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

/// Reads [CmtRecord]s back.
pub struct CmtDecoder<R: Read> {
    input:      std::io::Bytes<R>,
    newest:     Tag,
}

impl<R: Read> CmtDecoder<R> {
    pub fn new(input: R) -> Self {
        Self {
            input:  input.bytes(),
            newest: 0,
        }
    }

    /// `Ok(None)` only at a clean end of stream (between records).
    fn parse_x(&mut self, first: bool) -> Result<Option<u64>, CmtError> {
        let mut x = 0;
        for i in 0..MAX_VARINT_LEN {
            let b = match self.input.next() {
                Some(b)                 => b?,
                None if first && i == 0 => { return Ok(None); },
                None                    => { return Err(CmtError::Unterminated); },
            };
            x |= ((b & 0x7f) as u64) << (7 * i);
            if b & 0x80 != 0 {
                return Ok(Some(x));
            }
        }

        Err(CmtError::Unterminated)
    }

    #[inline(always)]
    fn field(&mut self) -> Result<u64, CmtError> {
        self.parse_x(false)?.ok_or(CmtError::Unterminated)
    }

    pub fn next_record(&mut self) -> Result<Option<CmtRecord>, CmtError> {
        let size = match self.parse_x(true)? {
            Some(s) => s as ByteSteps,
            None    => { return Ok(None); },
        };
        let old_delta = self.field()?;
        let new_delta = if size != 0 { self.field()? } else { 0 };

        let old_tag = if old_delta != 0 {
            if old_delta > self.newest as u64 {
                return Err(CmtError::Inconsistent("old tag was never issued"));
            }
            Some(self.newest - (old_delta - 1) as Tag)
        } else { None };

        let new_tag = if new_delta != 0 {
            let t: Tag = (self.newest as u64 + new_delta)
                .try_into()
                .map_err(|_| CmtError::Inconsistent("tag overflow"))?;
            self.newest = t;
            Some(t)
        } else { None };

        match (old_tag, new_tag) {
            (Some(old_tag), Some(new_tag))  => Ok(Some(CmtRecord::Realloc { old_tag, size, new_tag })),
            (None, Some(tag))               => Ok(Some(CmtRecord::Malloc { size, tag })),
            (Some(tag), None) if size == 0  => Ok(Some(CmtRecord::Free { tag })),
            (Some(_), None)                 => Err(CmtError::Inconsistent("size != 0")),
            (None, None)                    => Err(CmtError::Inconsistent("event with no tags")),
        }
    }
}

impl<R: Read> Iterator for CmtDecoder<R> {
    type Item = Result<CmtRecord, CmtError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}
