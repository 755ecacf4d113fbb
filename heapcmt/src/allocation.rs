use crate::helpe::*;

impl Allocation {
    /// Validates the event's raw facts and builds the record.
    pub fn new(address: ByteSteps, size: ByteSteps, born: LineNo) -> Result<Self, HeapError> {
        if address == 0 {
            return Err(HeapError::NullAddress);
        }
        if size == 0 {
            return Err(HeapError::ZeroSize { address });
        }
        if address.checked_add(size).is_none() {
            return Err(HeapError::AddressOverflow { address, size });
        }

        Ok(Self {
            address,
            size,
            born,
        })
    }

    /// First byte past the block. Cannot overflow, see [Allocation::new].
    #[inline(always)]
    pub fn end(&self) -> ByteSteps {
        self.address + self.size
    }

    /// Number of trace lines the block has survived by `line`.
    #[inline(always)]
    pub fn age_at(&self, line: LineNo) -> LineNo {
        debug_assert!(line >= self.born, "Line {} precedes birth at line {}", line, self.born);
        line.saturating_sub(self.born)
    }

    /// Returns `true` if the two blocks share at least one byte.
    #[inline(always)]
    pub fn overlaps_with(&self, other: &Self) -> bool {
        self.address < other.end() &&
        other.address < self.end()
    }

    /// Bytes separating `self` from a block at a *higher* address.
    /// `None` means the two overlap, which the tracker never allows.
    #[inline(always)]
    pub fn gap_to(&self, higher: &Self) -> Option<ByteSteps> {
        higher.address.checked_sub(self.end())
    }

    #[inline(always)]
    pub fn pages(&self, page_size: ByteSteps) -> PageSpan {
        PageSpan::of(self.address, self.size, page_size)
    }
}
