//! S4: polling and discarding a prefix of a segment's records, then closing
//! and reopening, must not redeliver the already-discarded records -- only
//! the genuine remainder survives.

use pbd::{Deque, DequeConfig};
use tempfile::tempdir;

#[test]
fn discard_then_reopen() {
    let dir = tempdir().unwrap();

    {
        let deque = Deque::open(DequeConfig::new(dir.path(), "q")).unwrap();
        deque.offer(b"first").unwrap();
        deque.offer(b"second").unwrap();
        deque.offer(b"third").unwrap();

        let handle = deque.poll().unwrap().unwrap();
        assert_eq!(handle.as_bytes(), b"first");
        handle.discard();

        assert_eq!(deque.num_objects(), 2);
        deque.sync().unwrap();
        deque.close().unwrap();
    }

    let deque = Deque::open(DequeConfig::new(dir.path(), "q")).unwrap();
    assert_eq!(deque.num_objects(), 2);

    let second = deque.poll().unwrap().unwrap();
    assert_eq!(second.as_bytes(), b"second");
    second.discard();

    let third = deque.poll().unwrap().unwrap();
    assert_eq!(third.as_bytes(), b"third");
    third.discard();

    assert!(deque.poll().unwrap().is_none());
}
