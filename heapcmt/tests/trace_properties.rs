// Randomized traces, checked against a naive model after every event.

use heapcmt::*;
use rand::{rngs::StdRng, Rng, SeedableRng};

const SLOT: ByteSteps = 0x180;
const SLOTS: ByteSteps = 512;

/// The dumbest possible heap: a list, scanned linearly.
#[derive(Default, Clone)]
struct Model {
    blocks: Vec<Allocation>,
}

impl Model {
    fn prev(&self, address: ByteSteps) -> Option<Allocation> {
        self.blocks.iter()
            .filter(|b| b.address < address)
            .max_by_key(|b| b.address)
            .copied()
    }

    fn next(&self, address: ByteSteps) -> Option<Allocation> {
        self.blocks.iter()
            .filter(|b| b.address > address)
            .min_by_key(|b| b.address)
            .copied()
    }

    fn take(&mut self, address: ByteSteps) -> Allocation {
        let idx = self.blocks.iter().position(|b| b.address == address).unwrap();
        self.blocks.swap_remove(idx)
    }
}

fn random_block(rng: &mut StdRng, model: &Model) -> Option<(ByteSteps, ByteSteps)> {
    // Blocks live in disjoint slots, so any free slot is a valid target.
    for _ in 0..16 {
        let slot = rng.gen_range(1..SLOTS);
        let address = slot * SLOT + rng.gen_range(0..0x40);
        if model.blocks.iter().all(|b| b.address / SLOT != slot) {
            return Some((address, rng.gen_range(1..=SLOT - 0x40)));
        }
    }
    None
}

fn check_neighbours(model: &Model, address: ByteSteps, size: ByteSteps, prev: Option<Neighbour>, next: Option<Neighbour>) {
    assert_eq!(
        prev,
        model.prev(address).map(|p| Neighbour { address: p.address, gap: address - p.address - p.size })
    );
    assert_eq!(
        next,
        model.next(address).map(|n| Neighbour { address: n.address, gap: n.address - address - size })
    );
}

fn replay(seed: u64, events: usize) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut heap = HeapTracker::new();
    let mut model = Model::default();

    for line in 1..=events {
        let roll = rng.gen_range(0..10);
        if model.blocks.is_empty() || roll < 5 {
            let Some((address, size)) = random_block(&mut rng, &model) else { continue };
            let r = heap.apply_malloc(address, size, line).unwrap();
            check_neighbours(&model, address, size, r.prev, r.next);
            assert!(r.new_pages <= r.pages.count());
            assert_eq!(r.pages, PageSpan::of(address, size, PAGE_SIZE));
            model.blocks.push(Allocation { address, size, born: line });
        } else if roll < 8 {
            let victim = model.blocks[rng.gen_range(0..model.blocks.len())];
            let r = heap.apply_free(victim.address, line).unwrap();
            model.take(victim.address);
            check_neighbours(&model, victim.address, victim.size, r.prev, r.next);
            assert_eq!(r.size, victim.size);
            assert_eq!(r.age, line - victim.born);
        } else {
            let victim = model.blocks[rng.gen_range(0..model.blocks.len())];
            let target = if rng.gen_bool(0.3) {
                Some((victim.address, rng.gen_range(1..=SLOT - 0x40)))
            } else {
                random_block(&mut rng, &model)
            };
            let Some((address, size)) = target else { continue };

            // Whatever realloc does to the heap, free + malloc must do too.
            let mut twin = heap.clone();
            let r = heap.apply_realloc(victim.address, size, address, line).unwrap();
            let f = twin.apply_free(victim.address, line).unwrap();
            twin.apply_malloc(address, size, line).unwrap();
            assert_eq!(r, f);
            assert!(heap.iter().eq(twin.iter()));

            model.take(victim.address);
            check_neighbours(&model, victim.address, victim.size, r.prev, r.next);
            assert_eq!(r.age, line - victim.born);
            model.blocks.push(Allocation { address, size, born: line });
        }

        heap.check_invariants().unwrap();
        assert_eq!(heap.live_count(), model.blocks.len());
        assert_eq!(heap.live_bytes(), model.blocks.iter().map(|b| b.size).sum::<ByteSteps>());
    }
}

#[test]
fn random_traces_agree_with_naive_model() {
    for seed in 0..8 {
        replay(seed, 2_000);
    }
}

#[test]
fn ages_count_lines_between_malloc_and_free() {
    let mut heap = HeapTracker::new();
    let mut line = 0;
    let mut births = vec![];
    for i in 1..=50 {
        line += 1;
        heap.apply_malloc(i * 0x1000, 8, line).unwrap();
        births.push((i * 0x1000, line));
    }
    for (address, born) in births.into_iter().rev() {
        line += 1;
        assert_eq!(heap.apply_free(address, line).unwrap().age, line - born);
    }
    assert_eq!(heap.live_count(), 0);
}
