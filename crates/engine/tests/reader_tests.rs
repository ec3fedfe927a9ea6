//! Mapped reader properties
//!
//! These tests verify that:
//! 1. Reading every byte reproduces the region exactly
//! 2. Clones move independently of the original and of each other
//! 3. Dispose invalidates the original and every clone, including clones
//!    being read on other threads at that moment

use proptest::prelude::*;
use quarry_core::Error;
use quarry_engine::{IndexInput, MappedInput};
use quarry_storage::MappedRegion;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

fn input(bytes: Vec<u8>) -> MappedInput {
    MappedInput::open(MappedRegion::detached(bytes)).unwrap()
}

#[test]
fn test_seek_read_clone_scenario() {
    let mut reader = input((0u8..10).collect());
    reader.seek(5).unwrap();
    assert_eq!(reader.read_byte().unwrap(), 5);
    assert_eq!(reader.position().unwrap(), 6);

    let mut clone = reader.try_clone().unwrap();
    assert_eq!(clone.position().unwrap(), 6);

    reader.seek(0).unwrap();
    reader.read_byte().unwrap();
    assert_eq!(clone.position().unwrap(), 6);
    assert_eq!(clone.read_byte().unwrap(), 6);
    assert_eq!(reader.position().unwrap(), 1);
}

#[test]
fn test_sliced_region_reads_only_its_window() {
    let region = MappedRegion::detached((0u8..100).collect::<Vec<_>>());
    let mut reader = MappedInput::open(region.slice(40, 10).unwrap()).unwrap();
    assert_eq!(reader.len().unwrap(), 10);
    assert_eq!(reader.read_vec(10).unwrap(), (40u8..50).collect::<Vec<_>>());
    assert!(matches!(reader.read_byte(), Err(Error::EndOfInput { position: 10 })));
    assert!(matches!(
        reader.seek(11),
        Err(Error::InvalidOffset { offset: 11, length: 10 })
    ));
}

#[test]
fn test_dispose_races_with_clone_readers() {
    let bytes: Vec<u8> = (0..4096).map(|i| (i % 251) as u8).collect();
    let original = input(bytes.clone());
    let barrier = Arc::new(Barrier::new(5));
    let saw_disposed = Arc::new(AtomicBool::new(false));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let mut clone = original.try_clone().unwrap();
            let barrier = Arc::clone(&barrier);
            let expected = bytes.clone();
            let saw_disposed = Arc::clone(&saw_disposed);
            thread::spawn(move || {
                barrier.wait();
                let mut disposed = false;
                for round in 0..10_000u64 {
                    let position = (round * 37) % expected.len() as u64;
                    let outcome = clone
                        .seek(position as i64)
                        .and_then(|_| clone.read_byte());
                    match outcome {
                        Ok(byte) => {
                            // Nothing succeeds once a failure has been observed.
                            assert!(!disposed, "read succeeded after AlreadyDisposed");
                            assert_eq!(byte, expected[position as usize]);
                        }
                        Err(Error::AlreadyDisposed) => {
                            disposed = true;
                            saw_disposed.store(true, Ordering::Relaxed);
                        }
                        Err(other) => panic!("unexpected error: {}", other),
                    }
                }
                clone
            })
        })
        .collect();

    barrier.wait();
    original.dispose();

    for handle in handles {
        let mut clone = handle.join().unwrap();
        assert!(matches!(clone.read_byte(), Err(Error::AlreadyDisposed)));
        assert!(matches!(clone.seek(0), Err(Error::AlreadyDisposed)));
        assert!(matches!(clone.position(), Err(Error::AlreadyDisposed)));
        assert!(clone.try_clone().is_err());
    }
    assert!(original.is_disposed());
    assert!(matches!(original.len(), Err(Error::AlreadyDisposed)));
}

proptest! {
    #[test]
    fn prop_read_all_reproduces_bytes(
        bytes in proptest::collection::vec(any::<u8>(), 0..2048),
        chunks in proptest::collection::vec(1usize..64, 1..64),
    ) {
        let mut reader = input(bytes.clone());
        let mut out = Vec::with_capacity(bytes.len());
        let mut chunks = chunks.into_iter().cycle();
        while out.len() < bytes.len() {
            let remaining = bytes.len() - out.len();
            let n = chunks.next().unwrap_or(1).min(remaining);
            if n == 1 {
                out.push(reader.read_byte().unwrap());
            } else {
                out.extend(reader.read_vec(n).unwrap());
            }
        }
        prop_assert_eq!(&out, &bytes);
        prop_assert_eq!(reader.position().unwrap(), bytes.len() as u64);
        let at_end = matches!(reader.read_byte(), Err(Error::EndOfInput { .. }));
        prop_assert!(at_end);
    }

    #[test]
    fn prop_clone_positions_are_independent(
        bytes in proptest::collection::vec(any::<u8>(), 1..512),
        moves in proptest::collection::vec((any::<bool>(), any::<u16>()), 1..64),
    ) {
        let len = bytes.len() as u64;
        let mut original = input(bytes.clone());
        let mut clone = original.try_clone().unwrap();
        let (mut original_pos, mut clone_pos) = (0u64, 0u64);

        for (on_original, target) in moves {
            let target = target as u64 % len;
            let (reader, pos) = if on_original {
                (&mut original as &mut dyn IndexInput, &mut original_pos)
            } else {
                (&mut clone as &mut dyn IndexInput, &mut clone_pos)
            };
            reader.seek(target as i64).unwrap();
            prop_assert_eq!(reader.read_byte().unwrap(), bytes[target as usize]);
            *pos = target + 1;

            prop_assert_eq!(original.position().unwrap(), original_pos);
            prop_assert_eq!(clone.position().unwrap(), clone_pos);
        }
    }
}
