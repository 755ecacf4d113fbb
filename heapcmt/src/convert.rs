//! From raw tracer output to something [parse_event] understands.
//!
//! The tracer logs one call per line, e.g.
//!
//! ```text
//! call-trace	1536334807907427983	50a0805 14	malloc	96	81d21e160
//! call-trace	1536334807907430218		free	81d2899c0
//! call-trace	1536334807907432412	50a07fa 14	malloc	20	81d2899c0
//! ```
//!
//! Pointers get recycled all the time, so every allocation is given
//! a fresh [Tag] to tell its incarnations apart.
use ahash::AHashMap;

use crate::helpe::*;

const MARKER: &str = "call-trace";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConvertError {
    #[error("can't parse: {text}")]
    Unparseable { text: String },
    #[error("{call} with zero size")]
    ZeroSize { call: &'static str },
    #[error("already have {address:x} as tag {tag}")]
    AlreadyTagged { address: ByteSteps, tag: Tag },
    #[error("no tag for {address:x}")]
    NoTag { address: ByteSteps },
    #[error("tag overflow")]
    TagOverflow,
}

/// Live pointers and the tags they were handed.
#[derive(Debug)]
pub struct TagBook {
    live:       AHashMap<ByteSteps, Tag>,
    next_tag:   Tag,
}

impl Default for TagBook {
    fn default() -> Self {
        Self::new()
    }
}

impl TagBook {
    pub fn new() -> Self {
        Self {
            live:       AHashMap::new(),
            next_tag:   1,
        }
    }

    pub fn tag_alloc(&mut self, address: ByteSteps) -> Result<Tag, ConvertError> {
        let tag = self.next_tag;
        if let Some(&old) = self.live.get(&address) {
            return Err(ConvertError::AlreadyTagged { address, tag: old });
        }
        self.next_tag = tag.checked_add(1).ok_or(ConvertError::TagOverflow)?;
        self.live.insert(address, tag);

        Ok(tag)
    }

    pub fn tag_free(&mut self, address: ByteSteps) -> Result<Tag, ConvertError> {
        self.live
            .remove(&address)
            .ok_or(ConvertError::NoTag { address })
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }
}

/// Reads raw tracer lines, one at a time, and emits tagged [Event]s.
#[derive(Debug, Default)]
pub struct Converter {
    tags:   TagBook,
}

impl Converter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tags(&self) -> &TagBook {
        &self.tags
    }

    /// Returns `None` for lines that carry no allocator event:
    /// `mmap` calls and anything not coming from the tracer.
    pub fn scan(&mut self, line: &str) -> Result<Option<Event>, ConvertError> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.first() != Some(&MARKER) {
            trace!("not a call-trace line, skipping: {:?}", line);
            return Ok(None);
        }
        let unparseable = || ConvertError::Unparseable { text: line.trim_end().to_string() };

        match fields.as_slice() {
            [_, ts, hex, n, "malloc", size, ptr] if header_ok(ts, hex, n) => {
                let size = dec(size).ok_or_else(unparseable)?;
                let address = hex_addr(ptr).ok_or_else(unparseable)?;
                if size == 0 {
                    return Err(ConvertError::ZeroSize { call: "malloc" });
                }
                let tag = self.tags.tag_alloc(address)?;

                Ok(Some(Event::Malloc { size, ptr: TracePtr::new(address, Some(tag)) }))
            },
            [_, ts, "free", ptr] if dec(ts).is_some() => {
                let address = hex_addr(ptr).ok_or_else(unparseable)?;
                let tag = self.tags.tag_free(address)?;

                Ok(Some(Event::Free { ptr: TracePtr::new(address, Some(tag)) }))
            },
            [_, ts, hex, n, "realloc", old, size, new] if header_ok(ts, hex, n) => {
                let old = hex_addr(old).ok_or_else(unparseable)?;
                let size = dec(size).ok_or_else(unparseable)?;
                let new = hex_addr(new).ok_or_else(unparseable)?;
                if size == 0 {
                    return Err(ConvertError::ZeroSize { call: "realloc" });
                }
                let old_tag = self.tags.tag_free(old)?;
                let new_tag = self.tags.tag_alloc(new)?;

                Ok(Some(Event::Realloc {
                    old_ptr:    TracePtr::new(old, Some(old_tag)),
                    new_size:   size,
                    new_ptr:    TracePtr::new(new, Some(new_tag)),
                }))
            },
            [_, ts, hex, n, "mmap", ..] if header_ok(ts, hex, n) => {
                Ok(None)
            },
            _ => Err(unparseable()),
        }
    }
}

#[inline(always)]
fn header_ok(ts: &str, hex: &str, n: &str) -> bool {
    dec(ts).is_some() && hex_addr(hex).is_some() && dec(n).is_some()
}

#[inline(always)]
fn dec(s: &str) -> Option<ByteSteps> {
    if !s.bytes().all(|b| b.is_ascii_digit()) { return None; }
    s.parse().ok()
}

#[inline(always)]
fn hex_addr(s: &str) -> Option<ByteSteps> {
    parse_ptr(s).filter(|p| p.tag.is_none()).map(|p| p.address)
}
