#![cfg(all(test, feature = "loom"))]

use crate::buddy::{BuddyHeap, HeapLayout};
use crate::region::HeapRegion;
use crate::sync::{AtomicU32, Ordering, thread};
use crate::tag::{CellSlot, Fe, Gate};
use loom::sync::Arc;

fn produce(slot: &CellSlot, value: u64) {
    loop {
        if slot.try_lock(Gate::Empty).is_ok() {
            slot.set_value(value);
            slot.unlock(Fe::Full, 2);
            return;
        }
        thread::yield_now();
    }
}

fn consume(slot: &CellSlot) -> u64 {
    loop {
        if slot.try_lock(Gate::Full).is_ok() {
            let value = slot.value();
            slot.unlock(Fe::Empty, 2);
            return value;
        }
        thread::yield_now();
    }
}

#[test]
fn full_empty_handoff_is_exactly_once() {
    loom::model(|| {
        let slot = Arc::new(CellSlot::new(Fe::Empty));

        let producer = thread::spawn({
            let slot = slot.clone();
            move || {
                produce(&slot, 1);
                produce(&slot, 2);
            }
        });

        let first = consume(&slot);
        let second = consume(&slot);
        producer.join().unwrap();

        assert_eq!((first, second), (1, 2));
        assert_eq!(slot.tag().fe(), Fe::Empty);
    });
}

#[test]
fn two_consumers_never_share_one_fill() {
    loom::model(|| {
        let slot = Arc::new(CellSlot::new(Fe::Full));
        slot.try_lock(Gate::Full).unwrap();
        slot.set_value(7);
        slot.unlock(Fe::Full, 2);

        let taken = Arc::new(AtomicU32::new(0));
        let spawn_taker = |slot: Arc<CellSlot>, taken: Arc<AtomicU32>| {
            thread::spawn(move || {
                if slot.try_lock(Gate::Full).is_ok() {
                    assert_eq!(slot.value(), 7);
                    slot.unlock(Fe::Empty, 2);
                    taken.fetch_add(1, Ordering::SeqCst);
                }
            })
        };

        let a = spawn_taker(slot.clone(), taken.clone());
        let b = spawn_taker(slot.clone(), taken.clone());
        a.join().unwrap();
        b.join().unwrap();

        assert!(taken.load(Ordering::SeqCst) <= 1);
    });
}

#[test]
fn readers_exclude_exclusive_holder() {
    loom::model(|| {
        let slot = Arc::new(CellSlot::new(Fe::Full));
        let inside = Arc::new(AtomicU32::new(0));

        let reader = thread::spawn({
            let slot = slot.clone();
            let inside = inside.clone();
            move || {
                if slot.try_lock_shared(Gate::Full).is_ok() {
                    inside.fetch_add(1, Ordering::SeqCst);
                    inside.fetch_sub(1, Ordering::SeqCst);
                    slot.release_shared().unwrap();
                }
            }
        });

        if slot.try_lock(Gate::Any).is_ok() {
            assert_eq!(inside.load(Ordering::SeqCst), 0);
            slot.unlock(Fe::Full, 0);
        }
        reader.join().unwrap();

        let tag = slot.tag();
        assert_eq!(tag.readers(), 0);
        assert!(!tag.is_busy());
    });
}

#[test]
fn buddy_allocations_do_not_overlap() {
    loom::model(|| {
        let layout = HeapLayout::with_levels(1).unwrap();
        let owner = Arc::new(HeapRegion::new_zeroed(layout.total_size));
        let heap = Arc::new(unsafe { BuddyHeap::init(owner.region(), 0, layout).unwrap() });

        let t = thread::spawn({
            let heap = heap.clone();
            let owner = owner.clone();
            move || {
                let _keep = owner;
                heap.alloc(1).unwrap()
            }
        });
        let mine = heap.alloc(1).unwrap();
        let theirs = t.join().unwrap();

        assert_ne!(mine, theirs);
        heap.free(mine).unwrap();
        heap.free(theirs).unwrap();
        assert_eq!(heap.allocations(), 0);
    });
}
