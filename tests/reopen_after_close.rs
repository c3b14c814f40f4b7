//! S3: closing a deque with an unconsumed backlog and reopening it over the
//! same (nonce, directory) preserves `num_objects` and poll order exactly.

use pbd::{Deque, DequeConfig};
use tempfile::tempdir;

#[test]
fn reopen_after_close() {
    let dir = tempdir().unwrap();

    {
        let deque = Deque::open(DequeConfig::new(dir.path(), "q")).unwrap();
        deque.offer(b"alpha").unwrap();
        deque.offer(b"beta").unwrap();
        deque.sync().unwrap();
        deque.close().unwrap();
    }

    let deque = Deque::open(DequeConfig::new(dir.path(), "q")).unwrap();
    assert!(deque.initialized_from_existing_files());
    assert_eq!(deque.num_objects(), 2);

    let first = deque.poll().unwrap().unwrap();
    assert_eq!(first.as_bytes(), b"alpha");
    first.discard();

    let second = deque.poll().unwrap().unwrap();
    assert_eq!(second.as_bytes(), b"beta");
    second.discard();

    assert!(deque.poll().unwrap().is_none());
    assert_eq!(deque.num_objects(), 0);
}
