use crate::helpe::*;

/// The range of pages, inclusive on both ends, that a block
/// touches. Pages are numbered by `address / page_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageSpan {
    pub first:  ByteSteps,
    pub last:   ByteSteps,
}

impl PageSpan {
    /// Span of `[address, address + size)`. `size` must be non-zero.
    #[inline(always)]
    pub fn of(address: ByteSteps, size: ByteSteps, page_size: ByteSteps) -> Self {
        debug_assert!(size > 0 && page_size > 0, "Degenerate page span requested");
        Self {
            first:  address / page_size,
            last:   (address + size - 1) / page_size,
        }
    }

    /// Number of pages in the span.
    #[inline(always)]
    pub fn count(&self) -> ByteSteps {
        self.last - self.first + 1
    }
}

/// How many pages `block` forces the OS to back that were not already
/// backed because of its address-rank neighbours.
///
/// Starting from the block's own span:
///
/// - if the predecessor's last page is the block's first page, that
///   page is not new;
/// - if the block spans more than one page and its last page is the
///   successor's first page, that page is not new either.
///
/// A single-page block never loses its page to the successor alone.
/// Going below zero is a bug in the above and is reported as such.
pub fn new_pages(
    block:      &Allocation,
    prev:       Option<&Allocation>,
    next:       Option<&Allocation>,
    page_size:  ByteSteps,
) -> Result<ByteSteps, HeapError> {
    let span = block.pages(page_size);
    let mut more_pages = span.count();
    let negative = || HeapError::NegativePageCount { address: block.address };

    if let Some(p) = prev {
        let prev_page = p.pages(page_size).last;
        if prev_page == span.first {
            more_pages = more_pages.checked_sub(1).ok_or_else(negative)?;
        }
    }
    if let Some(n) = next {
        let next_page = n.address / page_size;
        if span.first != span.last && span.last == next_page {
            more_pages = more_pages.checked_sub(1).ok_or_else(negative)?;
        }
    }

    Ok(more_pages)
}
