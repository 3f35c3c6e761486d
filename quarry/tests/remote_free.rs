//! Two-thread ping-pong: blocks allocated on one thread, freed on another,
//! travel home through the remote queues.

use std::sync::mpsc;
use std::thread;

use quarry::{Address, Allocator};

const BLOCKS: usize = 1024;
const SIZE: usize = 48;

#[test]
fn two_thread_ping_pong() {
    let (handover_tx, handover_rx) = mpsc::channel::<Vec<usize>>();
    let (flushed_tx, flushed_rx) = mpsc::channel::<()>();

    let owner = thread::spawn(move || {
        let mut alloc = Allocator::new();
        let blocks: Vec<usize> = (0..BLOCKS)
            .map(|_| alloc.alloc(SIZE).unwrap().as_usize())
            .collect();
        handover_tx.send(blocks.clone()).unwrap();
        flushed_rx.recv().unwrap();

        // Allocation drains the inbound queue a batch at a time; keep
        // allocating until every remote free has come home.
        let mut spins = 0usize;
        while alloc.stats().remote_receives() < BLOCKS {
            let p = alloc.alloc(16).unwrap();
            alloc.dealloc(p);
            spins += 1;
            assert!(spins < 10_000_000, "remote frees never arrived");
            thread::yield_now();
        }

        // Every block is back in our own bins: reallocating the same count
        // of the same class reproduces the original addresses exactly.
        let mut again: Vec<usize> = (0..BLOCKS)
            .map(|_| alloc.alloc(SIZE).unwrap().as_usize())
            .collect();
        let mut expected = blocks;
        again.sort_unstable();
        expected.sort_unstable();
        assert_eq!(again, expected);

        for p in again {
            alloc.dealloc_sized(Address::from_usize(p), SIZE);
        }
        assert_eq!(alloc.stats().remote_frees(), 0);
    });

    let freer = thread::spawn(move || {
        let mut alloc = Allocator::new();
        let blocks = handover_rx.recv().unwrap();
        for p in blocks {
            alloc.dealloc(Address::from_usize(p));
        }
        // All frees were remote and batched locally.
        assert_eq!(alloc.stats().remote_frees(), BLOCKS);
        assert_eq!(alloc.stats().allocs(), 0);
        alloc.flush();
        assert!(alloc.stats().remote_posts() >= 1);
        flushed_tx.send(()).unwrap();
    });

    freer.join().unwrap();
    owner.join().unwrap();
}
