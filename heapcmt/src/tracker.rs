use crate::helpe::*;

/// An address-rank neighbour of some block, along with the
/// number of idle bytes between the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Neighbour {
    pub address:    ByteSteps,
    pub gap:        ByteSteps,
}

/// Facts about a block at the moment it stopped being live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeReport {
    pub size:   ByteSteps,
    pub age:    LineNo,
    pub prev:   Option<Neighbour>,
    pub next:   Option<Neighbour>,
    pub pages:  PageSpan,
}

/// Facts about a block at the moment it became live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MallocReport {
    pub prev:       Option<Neighbour>,
    pub next:       Option<Neighbour>,
    pub pages:      PageSpan,
    /// Pages this block is the first to touch.
    pub new_pages:  ByteSteps,
}

/// What applying an [Event] yields. A `realloc` yields a
/// [Report::Free], describing the block it replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Report {
    Malloc(MallocReport),
    Free(FreeReport),
}

impl Default for HeapTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HeapTracker {
    /// An empty heap, with 4KiB pages.
    pub fn new() -> Self {
        Self::with_page_size(PAGE_SIZE)
    }

    pub fn with_page_size(page_size: ByteSteps) -> Self {
        assert!(page_size > 0, "Page size must be non-zero");
        Self {
            live:       BTreeMap::new(),
            page_size,
            live_bytes: 0,
            peak_bytes: 0,
        }
    }

    pub fn page_size(&self) -> ByteSteps {
        self.page_size
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn live_bytes(&self) -> ByteSteps {
        self.live_bytes
    }

    /// Highest [HeapTracker::live_bytes] ever observed.
    pub fn peak_live_bytes(&self) -> ByteSteps {
        self.peak_bytes
    }

    pub fn get(&self, address: ByteSteps) -> Option<&Allocation> {
        self.live.get(&address)
    }

    /// Live allocations in ascending address order.
    pub fn iter(&self) -> impl Iterator<Item = &Allocation> {
        self.live.values()
    }

    /// Feeds one event, read at trace line `line`, to the tracker.
    pub fn apply(&mut self, event: &Event, line: LineNo) -> Result<Report, HeapError> {
        match *event {
            Event::Malloc { size, ptr } => {
                self.apply_malloc(ptr.address, size, line).map(Report::Malloc)
            },
            Event::Free { ptr } => {
                self.apply_free(ptr.address, line).map(Report::Free)
            },
            Event::Realloc { old_ptr, new_size, new_ptr } => {
                self.apply_realloc(old_ptr.address, new_size, new_ptr.address, line).map(Report::Free)
            },
        }
    }

    /// Makes `[address, address + size)` live as of `line`.
    ///
    /// Fails, leaving the heap untouched, if the address is already
    /// live or the block would overlap one of its neighbours.
    pub fn apply_malloc(
        &mut self,
        address:    ByteSteps,
        size:       ByteSteps,
        line:       LineNo,
    ) -> Result<MallocReport, HeapError> {
        let baby = Allocation::new(address, size, line)?;
        if self.live.contains_key(&address) {
            return Err(HeapError::DuplicateAddress { address });
        }
        let (prev, next) = self.neighbours(address);
        let prev_gap = prev.map(|p| checked_gap(p, &baby)).transpose()?;
        let next_gap = next.map(|n| checked_gap(&baby, n)).transpose()?;
        let new_pages = new_pages(&baby, prev, next, self.page_size)?;
        let report = MallocReport {
            prev:       prev.zip(prev_gap).map(|(p, gap)| Neighbour { address: p.address, gap }),
            next:       next.zip(next_gap).map(|(n, gap)| Neighbour { address: n.address, gap }),
            pages:      baby.pages(self.page_size),
            new_pages,
        };

        debug!("line {}: +[{:#x}, +{}), {} new pages", line, address, size, new_pages);
        self.live.insert(address, baby);
        self.live_bytes += size;
        if self.live_bytes > self.peak_bytes {
            self.peak_bytes = self.live_bytes;
        }

        Ok(report)
    }

    /// Retires the block at `address`, reporting on it as it
    /// was right before.
    pub fn apply_free(&mut self, address: ByteSteps, line: LineNo) -> Result<FreeReport, HeapError> {
        let victim = *self.live
            .get(&address)
            .ok_or(HeapError::UnknownPointer { address })?;
        let (prev, next) = self.neighbours(address);
        let prev = prev.map(|p| {
            checked_gap(p, &victim).map(|gap| Neighbour { address: p.address, gap })
        }).transpose()?;
        let next = next.map(|n| {
            checked_gap(&victim, n).map(|gap| Neighbour { address: n.address, gap })
        }).transpose()?;
        let report = FreeReport {
            size:   victim.size,
            age:    victim.age_at(line),
            prev,
            next,
            pages:  victim.pages(self.page_size),
        };

        debug!("line {}: -[{:#x}, +{}), {} lines old", line, address, victim.size, report.age);
        self.live.remove(&address);
        self.live_bytes -= victim.size;

        Ok(report)
    }

    /// A free of `old_address` followed by a malloc of `new_size`
    /// bytes at `new_address`, both at `line`. The report is the
    /// free's.
    ///
    /// If the malloc half is refused, the freed block is put back.
    pub fn apply_realloc(
        &mut self,
        old_address:    ByteSteps,
        new_size:       ByteSteps,
        new_address:    ByteSteps,
        line:           LineNo,
    ) -> Result<FreeReport, HeapError> {
        let old = *self.live
            .get(&old_address)
            .ok_or(HeapError::UnknownPointer { address: old_address })?;
        let report = self.apply_free(old_address, line)?;
        if let Err(e) = self.apply_malloc(new_address, new_size, line) {
            self.live.insert(old_address, old);
            self.live_bytes += old.size;
            return Err(e);
        }

        Ok(report)
    }

    /// Walks the whole heap, checking that no two live blocks
    /// overlap. The tracker never lets this happen; this is for
    /// tests and paranoid callers.
    pub fn check_invariants(&self) -> Result<(), HeapError> {
        for (a, b) in self.live.values().tuple_windows() {
            checked_gap(a, b)?;
        }
        debug_assert_eq!(self.live.values().map(|a| a.size).sum::<ByteSteps>(), self.live_bytes);

        Ok(())
    }

    /// Returns the live blocks with the nearest strictly lower
    /// and strictly higher addresses, regardless of distance.
    #[inline(always)]
    fn neighbours(&self, address: ByteSteps) -> (Option<&Allocation>, Option<&Allocation>) {
        let prev = self.live
            .range(..address)
            .next_back()
            .map(|(_, a)| a);
        let next = self.live
            .range((Bound::Excluded(address), Bound::Unbounded))
            .next()
            .map(|(_, a)| a);
        trace!("{:#x}: prev {:x?}, next {:x?}", address, prev.map(|a| a.address), next.map(|a| a.address));

        (prev, next)
    }
}

/// Gap from `lower` to `higher`, or the overlap that prevents one.
#[inline(always)]
fn checked_gap(lower: &Allocation, higher: &Allocation) -> Result<ByteSteps, HeapError> {
    lower.gap_to(higher).ok_or(HeapError::OverlapViolation {
        address:    higher.address,
        size:       higher.size,
        other:      lower.address,
        other_size: lower.size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn age_and_size_of_a_freed_block() {
        let mut heap = HeapTracker::new();
        heap.apply_malloc(0x81d3bd6c0, 17, 1).unwrap();
        let r = heap.apply_free(0x81d3bd6c0, 2).unwrap();
        assert_eq!(r.size, 17);
        assert_eq!(r.age, 1);
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn lowest_block_has_no_predecessor() {
        let mut heap = HeapTracker::new();
        heap.apply_malloc(0x100, 8, 1).unwrap();
        heap.apply_malloc(0x200, 16, 2).unwrap();
        let r = heap.apply_free(0x100, 3).unwrap();
        assert_eq!(r.prev, None);
        assert_eq!(r.next, Some(Neighbour { address: 0x200, gap: 0xf8 }));
        assert_eq!(r.age, 2);
    }

    #[test]
    fn neighbours_are_by_rank_not_distance() {
        let mut heap = HeapTracker::new();
        heap.apply_malloc(0x1000, 0x10, 1).unwrap();
        heap.apply_malloc(0x9000_0000, 0x10, 2).unwrap();
        let r = heap.apply_malloc(0x5000, 0x20, 3).unwrap();
        assert_eq!(r.prev, Some(Neighbour { address: 0x1000, gap: 0x3ff0 }));
        assert_eq!(r.next, Some(Neighbour { address: 0x9000_0000, gap: 0x9000_0000 - 0x5020 }));
        assert_eq!(r.new_pages, 1);
    }

    #[test]
    fn touching_blocks_have_zero_gap() {
        let mut heap = HeapTracker::new();
        heap.apply_malloc(0x100, 0x10, 1).unwrap();
        heap.apply_malloc(0x120, 0x10, 2).unwrap();
        let r = heap.apply_malloc(0x110, 0x10, 3).unwrap();
        assert_eq!(r.prev.map(|n| n.gap), Some(0));
        assert_eq!(r.next.map(|n| n.gap), Some(0));
        assert_eq!(r.new_pages, 0);
    }

    #[test]
    fn page_boundary_off_by_one() {
        let mut heap = HeapTracker::new();
        // Ends at the last byte of page 1.
        heap.apply_malloc(0x1f00, 0x100, 1).unwrap();
        let r = heap.apply_malloc(0x2000, 0x40, 2).unwrap();
        assert_eq!(r.pages, PageSpan { first: 2, last: 2 });
        assert_eq!(r.new_pages, 1);

        // Ends at the first byte of page 3.
        heap.apply_malloc(0x2f00, 0x101, 3).unwrap();
        let r = heap.apply_malloc(0x3001, 0x40, 4).unwrap();
        assert_eq!(r.pages, PageSpan { first: 3, last: 3 });
        assert_eq!(r.new_pages, 0);
    }

    #[test]
    fn double_free_is_refused() {
        let mut heap = HeapTracker::new();
        heap.apply_malloc(0x100, 8, 1).unwrap();
        heap.apply_free(0x100, 2).unwrap();
        assert_eq!(heap.apply_free(0x100, 3), Err(HeapError::UnknownPointer { address: 0x100 }));
    }

    #[test]
    fn live_address_cannot_be_handed_out_again() {
        let mut heap = HeapTracker::new();
        heap.apply_malloc(0x100, 8, 1).unwrap();
        assert_eq!(heap.apply_malloc(0x100, 8, 2), Err(HeapError::DuplicateAddress { address: 0x100 }));
        assert_eq!(heap.get(0x100).map(|a| a.born), Some(1));
    }

    #[test]
    fn overlapping_malloc_is_refused_and_heap_unchanged() {
        let mut heap = HeapTracker::new();
        heap.apply_malloc(0x100, 0x20, 1).unwrap();
        heap.apply_malloc(0x200, 0x20, 2).unwrap();
        assert_eq!(
            heap.apply_malloc(0x110, 0x8, 3),
            Err(HeapError::OverlapViolation { address: 0x110, size: 0x8, other: 0x100, other_size: 0x20 })
        );
        assert_eq!(
            heap.apply_malloc(0x1f0, 0x20, 3),
            Err(HeapError::OverlapViolation { address: 0x200, size: 0x20, other: 0x1f0, other_size: 0x20 })
        );
        assert_eq!(heap.live_count(), 2);
        assert_eq!(heap.live_bytes(), 0x40);
        heap.check_invariants().unwrap();
    }

    #[test]
    fn realloc_reports_the_old_block() {
        let mut heap = HeapTracker::new();
        heap.apply_malloc(0x81d360600, 256, 1).unwrap();
        let r = heap.apply_realloc(0x81d360600, 512, 0x81d3b9800, 2).unwrap();
        assert_eq!((r.size, r.age), (256, 1));
        assert!(heap.get(0x81d360600).is_none());
        assert_eq!(heap.get(0x81d3b9800), Some(&Allocation { address: 0x81d3b9800, size: 512, born: 2 }));

        // In place.
        let r = heap.apply_realloc(0x81d3b9800, 1024, 0x81d3b9800, 5).unwrap();
        assert_eq!((r.size, r.age), (512, 3));
        assert_eq!(heap.get(0x81d3b9800).map(|a| (a.size, a.born)), Some((1024, 5)));
    }

    #[test]
    fn failed_realloc_restores_the_old_block() {
        let mut heap = HeapTracker::new();
        heap.apply_malloc(0x100, 0x10, 1).unwrap();
        heap.apply_malloc(0x200, 0x10, 2).unwrap();
        assert_eq!(
            heap.apply_realloc(0x100, 0x10, 0x200, 3),
            Err(HeapError::DuplicateAddress { address: 0x200 })
        );
        assert_eq!(heap.get(0x100).map(|a| a.born), Some(1));
        assert_eq!(heap.live_bytes(), 0x20);
        assert_eq!(
            heap.apply_realloc(0x300, 0x10, 0x400, 3),
            Err(HeapError::UnknownPointer { address: 0x300 })
        );
    }

    #[test]
    fn byte_accounting() {
        let mut heap = HeapTracker::new();
        heap.apply_malloc(0x100, 0x10, 1).unwrap();
        heap.apply_malloc(0x200, 0x30, 2).unwrap();
        heap.apply_free(0x100, 3).unwrap();
        heap.apply_realloc(0x200, 0x8, 0x300, 4).unwrap();
        assert_eq!(heap.live_bytes(), 0x8);
        assert_eq!(heap.peak_live_bytes(), 0x40);
        assert_eq!(heap.iter().map(|a| a.address).collect::<Vec<_>>(), vec![0x300]);
    }
}
