//! Welcome to `heapcmt`!
//!
//! Replays an allocator trace and tells you, for every event, what
//! the heap looked like around it: how old a freed block was, who its
//! neighbours were, how many bytes sit idle between them and how
//! many pages a fresh allocation forces the OS to back.

mod allocation;
mod tracker;

pub mod pages;
pub mod annotate;
pub mod convert;
pub mod cmt;
pub mod helpe;

pub use crate::helpe::*;

/// Our fundamental unit of interest. An [`Allocation`] is one block
/// that is *live* at the point of the trace currently being replayed:
///
/// 1. [`size`](Allocation::size) bytes were handed out at
///     [`address`](Allocation::address).
/// 2. This happened at trace line [`born`](Allocation::born), either
///     through `malloc` or as the destination of a `realloc`.
///
/// Allocations are never mutated. A `realloc` retires the old record
/// and creates a brand new one, possibly at the same address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub address:    ByteSteps,
    pub size:       ByteSteps,
    pub born:       LineNo,
}

/// The heap as seen through the trace: every live [`Allocation`],
/// keyed and ordered by address.
///
/// Two invariants hold after every operation:
///
/// - addresses are unique;
/// - for consecutive live allocations `a`, `b`,
///   `a.address + a.size <= b.address`.
///
/// Any event that would break them is refused and the tracker is
/// left untouched.
#[derive(Debug, Clone)]
pub struct HeapTracker {
    live:       BTreeMap<ByteSteps, Allocation>,
    page_size:  ByteSteps,
    // Running and high-water byte counts, for the summary.
    live_bytes: ByteSteps,
    peak_bytes: ByteSteps,
}
