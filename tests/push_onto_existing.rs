//! S6: `push` onto a deque that already has a backlog prepends the whole
//! batch ahead of what was already there, in the order given, without
//! touching the existing tail.

use pbd::{Deque, DequeConfig};
use tempfile::tempdir;

#[test]
fn push_onto_existing() {
    let dir = tempdir().unwrap();
    let deque = Deque::open(DequeConfig::new(dir.path(), "q")).unwrap();

    deque.offer(b"existing-1").unwrap();
    deque.offer(b"existing-2").unwrap();
    assert_eq!(deque.num_objects(), 2);

    deque.push(&[b"A", b"B", b"C"]).unwrap();
    assert_eq!(deque.num_objects(), 5);

    for expected in [b"A".as_slice(), b"B", b"C", b"existing-1", b"existing-2"] {
        let handle = deque.poll().unwrap().unwrap();
        assert_eq!(handle.as_bytes(), expected);
        handle.discard();
    }
    assert!(deque.poll().unwrap().is_none());

    // A second push after the first must land strictly in front of it.
    deque.offer(b"tail-record").unwrap();
    deque.push(&[b"X", b"Y"]).unwrap();
    for expected in [b"X".as_slice(), b"Y", b"tail-record"] {
        let handle = deque.poll().unwrap().unwrap();
        assert_eq!(handle.as_bytes(), expected);
        handle.discard();
    }
}
