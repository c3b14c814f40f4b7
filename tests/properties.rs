//! Property tests for the count, ordering, and round-trip invariants that
//! must hold for any sequence of offers and polls, not just the specific
//! scenarios covered by the other integration tests.

use pbd::{Deque, DequeConfig};
use quickcheck_macros::quickcheck;
use tempfile::tempdir;

// Keep generated payloads well under a single segment so every test run
// exercises plain offer/poll without incidentally depending on rotation.
fn clamp_payload(mut payload: Vec<u8>) -> Vec<u8> {
    payload.truncate(4096);
    payload
}

#[quickcheck]
fn order_preservation(payloads: Vec<Vec<u8>>) -> bool {
    let payloads: Vec<Vec<u8>> = payloads.into_iter().map(clamp_payload).collect();
    let dir = tempdir().unwrap();
    let deque = Deque::open(DequeConfig::new(dir.path(), "q")).unwrap();

    for payload in &payloads {
        deque.offer(payload).unwrap();
    }

    for expected in &payloads {
        let handle = match deque.poll().unwrap() {
            Some(h) => h,
            None => return false,
        };
        let matches = handle.as_bytes() == expected.as_slice();
        handle.discard();
        if !matches {
            return false;
        }
    }
    deque.poll().unwrap().is_none()
}

#[quickcheck]
fn count_consistency(payloads: Vec<Vec<u8>>, poll_count: usize) -> bool {
    let payloads: Vec<Vec<u8>> = payloads.into_iter().map(clamp_payload).collect();
    let dir = tempdir().unwrap();
    let deque = Deque::open(DequeConfig::new(dir.path(), "q")).unwrap();

    for payload in &payloads {
        deque.offer(payload).unwrap();
    }
    if deque.num_objects() != payloads.len() as i64 {
        return false;
    }

    let to_poll = poll_count.min(payloads.len());
    for _ in 0..to_poll {
        let handle = deque.poll().unwrap().unwrap();
        handle.discard();
    }

    deque.num_objects() == (payloads.len() - to_poll) as i64
}

#[quickcheck]
fn round_trip_byte_identical(payload: Vec<u8>, allow_compression: bool) -> bool {
    let payload = clamp_payload(payload);
    let dir = tempdir().unwrap();
    let deque =
        Deque::open(DequeConfig::new(dir.path(), "q").with_compression(allow_compression)).unwrap();

    deque.offer(&payload).unwrap();
    let handle = deque.poll().unwrap().unwrap();
    let matches = handle.as_bytes() == payload.as_slice();
    handle.discard();
    matches
}
