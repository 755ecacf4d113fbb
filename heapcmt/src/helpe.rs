pub use std::{
    collections::{BTreeMap, Bound},
    io::{BufRead, BufReader, Read, Write},
    path::PathBuf,
    fmt,
};
pub use thiserror::Error;
pub use itertools::Itertools;
pub use clap::{Parser, ValueEnum};
pub use log::{debug, trace};

pub use crate::{Allocation, HeapTracker,
    pages::*,
    tracker::{Neighbour, FreeReport, MallocReport, Report},
    annotate::*,
};

/// The unit for measuring addresses and sizes. Traces come from
/// 64-bit machines, so `usize` is wide enough on the hosts we
/// care about.
pub type ByteSteps = usize;

/// 1-based position of an event in the trace. This is the only
/// notion of time the tracker knows of.
pub type LineNo = usize;

/// The debug-id that the tracer appends to every pointer, e.g. the
/// `6655` in `81d220b48<6655>`. Opaque to the tracker, but it must be
/// a decimal number that fits a `u32`: the same ids are issued by
/// [Converter](crate::convert::Converter) and stored as deltas by the
/// compact format. Anything else in the angle brackets makes the line
/// malformed.
pub type Tag = u32;

/// Granularity used for page accounting unless told otherwise.
pub const PAGE_SIZE: ByteSteps = 4096;

//---START ERRORS
#[derive(Error, Debug, PartialEq, Eq)]
/// Raised by the [HeapTracker] whenever an event contradicts
/// its view of the heap. None of these are recoverable: the
/// whole point is to surface them.
pub enum HeapError {
    #[error("no live allocation at {address:#x} (double free or desync)")]
    UnknownPointer { address: ByteSteps },
    #[error("allocation at {address:#x} is already live")]
    DuplicateAddress { address: ByteSteps },
    #[error("[{address:#x}, +{size}) overlaps live allocation [{other:#x}, +{other_size})")]
    OverlapViolation {
        address:    ByteSteps,
        size:       ByteSteps,
        other:      ByteSteps,
        other_size: ByteSteps,
    },
    #[error("page accounting for {address:#x} went below zero")]
    NegativePageCount { address: ByteSteps },
    #[error("zero-sized allocation at {address:#x}")]
    ZeroSize { address: ByteSteps },
    #[error("allocation at address 0")]
    NullAddress,
    #[error("[{address:#x}, +{size}) does not fit the address space")]
    AddressOverflow { address: ByteSteps, size: ByteSteps },
}

#[derive(Error, Debug, PartialEq, Eq)]
/// Appears while turning a trace line into an [Event].
pub enum ParseError {
    #[error("cannot parse line: \"{text}\"")]
    MalformedLine { text: String },
}

#[derive(Error, Debug)]
/// What the driver reports. Every variant that stems from
/// a line carries its 1-based number.
pub enum TraceError {
    #[error("line {line}: {source}")]
    Parse { line: LineNo, source: ParseError },
    #[error("line {line}: {source}")]
    Heap { line: LineNo, source: HeapError },
    /// The line could not be read at all, e.g. it is not UTF-8.
    #[error("line {line}: {source}")]
    Read { line: LineNo, source: std::io::Error },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TraceError {
    pub fn line(&self) -> Option<LineNo> {
        match self {
            TraceError::Parse { line, .. } |
            TraceError::Heap { line, .. } |
            TraceError::Read { line, .. }   => Some(*line),
            TraceError::Io(_)               => None,
        }
    }
}
//---END ERRORS

//---START EXTERNAL INTERFACES
// A trace, as produced by `trace2cmt -s`, looks like this:
//
//   malloc(8) = 81d220b48<6655>
//   realloc(81d220b48<6655>, 16) = 81d3b83a0<6656>
//   free(81d3b83a0<6656>)
//
// Below is everything needed to go from such a line to an
// [Event] and back.

/// A pointer as it appears in a trace: address plus the
/// optional debug-id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TracePtr {
    pub address:    ByteSteps,
    pub tag:        Option<Tag>,
}

impl TracePtr {
    pub fn new(address: ByteSteps, tag: Option<Tag>) -> Self {
        Self { address, tag }
    }
}

impl fmt::Display for TracePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.address)?;
        if let Some(t) = self.tag {
            write!(f, "<{}>", t)?;
        }

        Ok(())
    }
}

/// One allocator event, i.e. one trace line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Malloc  { size: ByteSteps, ptr: TracePtr },
    Free    { ptr: TracePtr },
    Realloc { old_ptr: TracePtr, new_size: ByteSteps, new_ptr: TracePtr },
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Malloc { size, ptr } => {
                write!(f, "malloc({}) = {}", size, ptr)
            },
            Event::Free { ptr } => {
                write!(f, "free({})", ptr)
            },
            Event::Realloc { old_ptr, new_size, new_ptr } => {
                write!(f, "realloc({}, {}) = {}", old_ptr, new_size, new_ptr)
            },
        }
    }
}

impl std::str::FromStr for Event {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_event(s)
    }
}

/// Turns one trace line into an [Event]. Surrounding whitespace
/// is ignored; anything that does not have one of the three
/// recognized shapes is rejected verbatim.
pub fn parse_event(line: &str) -> Result<Event, ParseError> {
    let text = line.trim();
    let malformed = || ParseError::MalformedLine { text: line.to_string() };

    let (name, rest) = text.split_once('(').ok_or_else(malformed)?;
    let (args, tail) = rest.split_once(')').ok_or_else(malformed)?;
    let args: Vec<&str> = args.split(',').map(str::trim).collect();
    let tail = tail.trim();
    // Whatever follows the closing parenthesis must be either
    // nothing (free) or "= <ptr>" (malloc, realloc).
    let result = match tail.strip_prefix('=') {
        Some(r) => Some(r.trim()),
        None if tail.is_empty() => None,
        None => { return Err(malformed()); }
    };

    match (name.trim(), args.as_slice(), result) {
        ("malloc", [size], Some(r)) => {
            Ok(Event::Malloc {
                size:   parse_size(size).ok_or_else(malformed)?,
                ptr:    parse_ptr(r).ok_or_else(malformed)?,
            })
        },
        ("free", [p], None) => {
            Ok(Event::Free {
                ptr:    parse_ptr(p).ok_or_else(malformed)?,
            })
        },
        ("realloc", [p, size], Some(r)) => {
            Ok(Event::Realloc {
                old_ptr:    parse_ptr(p).ok_or_else(malformed)?,
                new_size:   parse_size(size).ok_or_else(malformed)?,
                new_ptr:    parse_ptr(r).ok_or_else(malformed)?,
            })
        },
        _ => Err(malformed()),
    }
}

#[inline(always)]
fn parse_size(s: &str) -> Option<ByteSteps> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) { return None; }

    s.parse().ok()
}

/// Parses `81d220b48<6655>`, `0x81d220b48` and friends.
pub fn parse_ptr(s: &str) -> Option<TracePtr> {
    let (addr, tag) = match s.split_once('<') {
        Some((a, t)) => {
            let t = t.strip_suffix('>')?;
            if t.is_empty() || !t.bytes().all(|b| b.is_ascii_digit()) { return None; }
            (a, Some(t.parse().ok()?))
        },
        None => (s, None),
    };
    let addr = addr.strip_prefix("0x")
        .or_else(|| addr.strip_prefix("0X"))
        .unwrap_or(addr);
    if addr.is_empty() || !addr.bytes().all(|b| b.is_ascii_hexdigit()) { return None; }

    Some(TracePtr {
        address:    ByteSteps::from_str_radix(addr, 16).ok()?,
        tag,
    })
}
//---END EXTERNAL INTERFACES

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Debug, Default)]
pub enum Mode {
    /// Size and age of freed/reallocated blocks only
    Lifetimes,
    /// Lifetimes plus neighbours, gaps and page accounting (malloc lines too)
    #[default]
    Overhead,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tracer_output() {
        assert_eq!(
            parse_event("malloc(8) = 81d220b48<6655>").unwrap(),
            Event::Malloc { size: 8, ptr: TracePtr::new(0x81d220b48, Some(6655)) }
        );
        assert_eq!(
            parse_event("realloc(81d220b48<6655>, 16) = 81d3b83a0<6656>").unwrap(),
            Event::Realloc {
                old_ptr:    TracePtr::new(0x81d220b48, Some(6655)),
                new_size:   16,
                new_ptr:    TracePtr::new(0x81d3b83a0, Some(6656)),
            }
        );
        assert_eq!(
            parse_event("free(81d3b83a0<6656>)   ").unwrap(),
            Event::Free { ptr: TracePtr::new(0x81d3b83a0, Some(6656)) }
        );
    }

    #[test]
    fn accepts_prefixed_untagged_addresses() {
        assert_eq!(
            parse_event("malloc(17)=0x81d3bd6c0").unwrap(),
            Event::Malloc { size: 17, ptr: TracePtr::new(0x81d3bd6c0, None) }
        );
        assert_eq!(
            parse_event("free(0x100)").unwrap(),
            Event::Free { ptr: TracePtr::new(0x100, None) }
        );
    }

    #[test]
    fn rejects_everything_else() {
        for l in [
            "",
            "calloc(1, 8) = 100",
            "malloc(8)",
            "malloc(8) = ",
            "malloc(-8) = 100",
            "malloc(8) = 10g",
            "free(100) = 200",
            "free(100<abc>)",
            "free(100<12)",
            "realloc(100, 8)",
            "realloc(100) = 200",
            "mmap(4096) = 1000",
        ] {
            assert_eq!(
                parse_event(l),
                Err(ParseError::MalformedLine { text: l.to_string() }),
                "{l:?} should not parse"
            );
        }
    }

    #[test]
    fn tags_are_u32_numbers() {
        assert_eq!(parse_ptr("100<4294967295>"), Some(TracePtr::new(0x100, Some(Tag::MAX))));
        for l in ["free(100<4294967296>)", "free(100<x>)", "free(100<>)"] {
            assert!(parse_event(l).is_err(), "{l:?} should not parse");
        }
    }

    #[test]
    fn renders_canonical_form() {
        let l = "realloc(81d220b48<6655>, 16) = 81d3b83a0<6656>";
        assert_eq!(parse_event(l).unwrap().to_string(), l);
        let e: Event = "free( 0xABC )".parse().unwrap();
        assert_eq!(e.to_string(), "free(abc)");
    }
}
