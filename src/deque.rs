//! The persistent binary deque itself: a directory of segment files
//! exposed as one durable double-ended queue of opaque records, behind a
//! single owning mutex.
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::buffer::BufferHandle;
use crate::compress;
use crate::header::{MAX_RECORD_BYTES, OBJECT_HEADER_BYTES, PUSH_BATCH_CAPACITY, SEGMENT_HEADER_BYTES};
use crate::segment::{parse_segment_file_name, Segment, SegmentBackend};
use crate::truncator::{Truncator, TruncatorAction};
use crate::{Error, Result, TruncateError};

/// Construction-time knobs for a [`Deque`].
#[derive(Clone, Debug)]
pub struct DequeConfig {
    pub directory: PathBuf,
    pub nonce: String,
    pub backend: SegmentBackend,
    pub allow_compression: bool,
    pub delete_empty_on_open: bool,
}

impl DequeConfig {
    pub fn new(directory: impl Into<PathBuf>, nonce: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            nonce: nonce.into(),
            backend: SegmentBackend::from_env(),
            allow_compression: false,
            delete_empty_on_open: false,
        }
    }

    pub fn with_backend(mut self, backend: SegmentBackend) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_compression(mut self, allow_compression: bool) -> Self {
        self.allow_compression = allow_compression;
        self
    }

    pub fn with_delete_empty_on_open(mut self, delete_empty_on_open: bool) -> Self {
        self.delete_empty_on_open = delete_empty_on_open;
        self
    }
}

struct Inner {
    segments: VecDeque<Segment>,
    closed: bool,
    next_segment_id: i64,
    min_segment_id: i64,
    config: DequeConfig,
}

struct Shared {
    inner: Mutex<Inner>,
    num_objects: AtomicI64,
    initialized_from_existing_files: bool,
}

/// A durable, crash-tolerant double-ended queue of opaque binary records,
/// backed by a directory of fixed-size segment files.
pub struct Deque {
    shared: Arc<Shared>,
}

impl Deque {
    /// Opens (or creates) the deque rooted at `config.directory`, scanning
    /// for any segment files a prior process left behind and reopening
    /// them in id order before appending a fresh, empty write segment.
    pub fn open(config: DequeConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.directory)?;

        let mut discovered: Vec<(i64, PathBuf)> = Vec::new();
        for entry in std::fs::read_dir(&config.directory)? {
            let entry = entry?;
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else { continue };
            let Some((nonce, id)) = parse_segment_file_name(name) else { continue };
            if nonce != config.nonce {
                continue;
            }
            let len = entry.metadata()?.len();
            if len == 4 {
                log::warn!("pbd: discarding abandoned segment header {}", path.display());
                std::fs::remove_file(&path)?;
                continue;
            }
            discovered.push((id, path));
        }
        discovered.sort_by_key(|(id, _)| *id);

        let mut segments = VecDeque::with_capacity(discovered.len() + 1);
        let mut num_objects: i64 = 0;
        let mut prev_id: Option<i64> = None;
        for (id, path) in &discovered {
            if let Some(prev) = prev_id {
                if *id != prev + 1 {
                    log::error!("pbd: gap in segment ids between {prev} and {id} in {}", config.directory.display());
                    return Err(Error::MissingSegments { from: prev + 1, to: id - 1 });
                }
            }
            prev_id = Some(*id);

            let mut segment = Segment::open_existing(path, *id, config.backend)?;
            if config.delete_empty_on_open && segment.num_entries() == 0 {
                segment.close_and_delete()?;
                continue;
            }
            num_objects += segment.num_entries() as i64;
            segments.push_back(segment);
        }

        let initialized_from_existing_files = !segments.is_empty();
        let min_segment_id = segments.front().map(|s| s.id()).unwrap_or(0);
        let next_segment_id = segments.back().map(|s| s.id() + 1).unwrap_or(0);

        let tail = Segment::create(&config.directory, &config.nonce, next_segment_id, config.backend)?;
        segments.push_back(tail);

        let inner = Inner {
            segments,
            closed: false,
            next_segment_id: next_segment_id + 1,
            min_segment_id,
            config,
        };

        Ok(Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(inner),
                num_objects: AtomicI64::new(num_objects),
                initialized_from_existing_files,
            }),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.shared.inner.lock().map_err(|_| Error::Corrupt("deque mutex poisoned".into()))
    }

    /// Whether segment files already existed in the target directory when
    /// this deque was opened.
    pub fn initialized_from_existing_files(&self) -> bool {
        self.shared.initialized_from_existing_files
    }

    /// Number of unconsumed records across all segments. Lock-free.
    pub fn num_objects(&self) -> i64 {
        self.shared.num_objects.load(Ordering::Acquire)
    }

    /// Sum of uncompressed bytes still unread across all segments.
    pub fn size_in_bytes(&self) -> Result<i64> {
        let inner = self.lock()?;
        Ok(inner.segments.iter().map(|s| s.uncompressed_bytes_to_read()).sum())
    }

    /// Whether any segment has an unread record.
    pub fn is_empty(&self) -> Result<bool> {
        let inner = self.lock()?;
        Ok(!inner.segments.iter().any(|s| s.has_more_entries()))
    }

    /// Appends `payload` to the tail of the deque, using the deque's
    /// configured default for whether to compress it, rotating to a new
    /// segment if the current one lacks room.
    pub fn offer(&self, payload: &[u8]) -> Result<()> {
        let allow_compression = self.lock()?.config.allow_compression;
        self.offer_compressible(payload, allow_compression)
    }

    /// Appends `payload` to the tail of the deque, overriding the deque's
    /// configured compression default for this one record.
    pub fn offer_compressible(&self, payload: &[u8], allow_compression: bool) -> Result<()> {
        if payload.len() > MAX_RECORD_BYTES {
            return Err(Error::RecordTooLarge { size: payload.len(), max: MAX_RECORD_BYTES });
        }
        let mut inner = self.lock()?;
        if inner.closed {
            return Err(Error::Closed);
        }
        loop {
            let tail = inner.segments.back_mut().expect("deque always has a tail segment");
            if tail.offer(payload, allow_compression)? {
                break;
            }
            rotate_tail(&mut inner)?;
        }
        self.shared.num_objects.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Appends a record built in place by `serialize`, which receives a
    /// scratch buffer of `max_len` bytes and returns how many it used.
    pub fn offer_with(&self, max_len: usize, serialize: impl FnOnce(&mut [u8]) -> usize) -> Result<usize> {
        if max_len > MAX_RECORD_BYTES {
            return Err(Error::RecordTooLarge { size: max_len, max: MAX_RECORD_BYTES });
        }
        let mut inner = self.lock()?;
        if inner.closed {
            return Err(Error::Closed);
        }
        let needed = OBJECT_HEADER_BYTES + max_len;
        loop {
            let tail = inner.segments.back().expect("deque always has a tail segment");
            if tail.free_bytes() >= needed {
                break;
            }
            rotate_tail(&mut inner)?;
        }
        let tail = inner.segments.back_mut().expect("deque always has a tail segment");
        let written = tail
            .offer_with(max_len, serialize)?
            .expect("tail was checked to have room for max_len");
        self.shared.num_objects.fetch_add(1, Ordering::AcqRel);
        Ok(written)
    }

    /// Atomically prepends `records` to the head of the deque: `push(&[A,
    /// B, C])` followed by polling yields `A, B, C, <whatever was already at
    /// the head>, ...`. Records are greedily partitioned into as few new
    /// segments as fit within one segment's capacity; no existing segment,
    /// including the current write tail, is touched.
    pub fn push(&self, records: &[&[u8]]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        for record in records {
            if record.len() > MAX_RECORD_BYTES {
                return Err(Error::RecordTooLarge { size: record.len(), max: MAX_RECORD_BYTES });
            }
        }

        let mut batches: Vec<Vec<&[u8]>> = Vec::new();
        let mut current: Vec<&[u8]> = Vec::new();
        let mut used = 0usize;
        for &record in records {
            let needed = OBJECT_HEADER_BYTES + record.len();
            if used + needed > PUSH_BATCH_CAPACITY && !current.is_empty() {
                batches.push(std::mem::take(&mut current));
                used = 0;
            }
            current.push(record);
            used += needed;
        }
        if !current.is_empty() {
            batches.push(current);
        }

        let mut inner = self.lock()?;
        if inner.closed {
            return Err(Error::Closed);
        }

        // Batches are created tail-batch-first and each prepended in turn,
        // so the batch holding the earliest records (created last) ends up
        // frontmost -- matching the order `records` was given in.
        let mut next_id = inner.min_segment_id - 1;
        let mut total_records: i64 = 0;
        for batch in batches.iter().rev() {
            let id = next_id;
            next_id -= 1;
            let mut segment =
                Segment::create(&inner.config.directory, &inner.config.nonce, id, inner.config.backend)?;
            for &record in batch {
                let wrote = segment.offer(record, false)?;
                if !wrote {
                    return Err(Error::Corrupt(format!(
                        "push batch for segment {id} exceeded its own capacity check"
                    )));
                }
                total_records += 1;
            }
            segment.sync()?;
            inner.segments.push_front(segment);
        }
        inner.min_segment_id = next_id + 1;
        drop(inner);

        self.shared.num_objects.fetch_add(total_records, Ordering::AcqRel);
        Ok(())
    }

    /// Returns the oldest unread record, or `None` if every segment is
    /// drained. The returned handle must be [`BufferHandle::discard`]ed by
    /// the caller once it is done with the bytes.
    pub fn poll(&self) -> Result<Option<BufferHandle>> {
        let mut inner = self.lock()?;
        if inner.closed {
            return Err(Error::Closed);
        }

        let idx = inner.segments.iter().position(|s| s.has_more_entries());
        let Some(idx) = idx else { return Ok(None) };

        let segment = &mut inner.segments[idx];
        let Some(raw) = segment.poll()? else { return Ok(None) };
        let outstanding = segment.outstanding_handle();
        let segment_id = segment.id();

        let shared = Arc::clone(&self.shared);
        let handle = raw.with_origin(segment_id, outstanding, move || {
            if let Err(err) = reclaim_if_drained(&shared, segment_id) {
                log::error!("pbd: failed to reclaim drained segment {segment_id}: {err}");
            }
            shared.num_objects.fetch_sub(1, Ordering::AcqRel);
        });

        Ok(Some(handle))
    }

    /// Forces buffered writes on every segment through to stable storage.
    pub fn sync(&self) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.closed {
            return Err(Error::Closed);
        }
        for segment in inner.segments.iter_mut() {
            segment.sync()?;
        }
        Ok(())
    }

    /// Flushes and closes every segment. Idempotent.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.closed {
            return Ok(());
        }
        for segment in inner.segments.iter_mut() {
            segment.close()?;
        }
        inner.closed = true;
        Ok(())
    }

    /// Closes every segment and deletes its backing file. Idempotent.
    pub fn close_and_delete(&self) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.closed {
            return Ok(());
        }
        for segment in inner.segments.iter_mut() {
            segment.close_and_delete()?;
        }
        inner.closed = true;
        Ok(())
    }

    /// Crash-recovery pass: scans every segment's records from the start,
    /// asking `truncator` what to do with each one. The first record a
    /// truncator rejects (fully or partially) truncates its segment there
    /// and discards every later segment.
    pub fn parse_and_truncate<T: Truncator>(
        &self,
        truncator: &mut T,
    ) -> std::result::Result<(), TruncateError<T::Error>> {
        let mut inner = self.lock().map_err(TruncateError::Deque)?;
        if inner.closed {
            return Err(TruncateError::Deque(Error::Closed));
        }

        let mut stop_after: Option<usize> = None;
        let mut objects_kept: i64 = 0;

        'segments: for idx in 0..inner.segments.len() {
            let total_entries = inner.segments[idx].num_entries();
            let mut offset = SEGMENT_HEADER_BYTES;
            let mut kept_entries: i32 = 0;
            let mut kept_bytes: i64 = 0;

            for _ in 0..total_entries {
                let segment = &mut inner.segments[idx];
                let (frame, body_start) =
                    segment.read_frame_header(offset).map_err(TruncateError::Deque)?;
                let stored_len = frame.stored_length as usize;
                let stored = segment.read_stored_bytes(body_start, stored_len).map_err(TruncateError::Deque)?;
                let decoded = if frame.is_compressed() {
                    compress::decompress(&stored).map_err(TruncateError::Deque)?
                } else {
                    stored
                };

                match truncator.parse(&decoded).map_err(TruncateError::Truncator)? {
                    TruncatorAction::Keep => {
                        kept_entries += 1;
                        kept_bytes += decoded.len() as i64;
                        offset = body_start + stored_len;
                    }
                    TruncatorAction::FullTruncate => {
                        log::warn!(
                            "pbd: full truncation at segment {} after {kept_entries} kept record(s)",
                            segment.id()
                        );
                        segment
                            .truncate_in_place(kept_entries, kept_bytes, offset)
                            .map_err(TruncateError::Deque)?;
                        objects_kept += kept_entries as i64;
                        stop_after = Some(idx);
                        break 'segments;
                    }
                    TruncatorAction::PartialTruncate(writer) => {
                        log::warn!(
                            "pbd: partial truncation at segment {} after {kept_entries} kept record(s)",
                            segment.id()
                        );
                        let mut scratch = vec![0u8; stored_len];
                        let written = writer(&mut scratch).min(stored_len);
                        scratch.truncate(written);
                        segment
                            .rewrite_record_in_place(offset, &scratch)
                            .map_err(TruncateError::Deque)?;
                        kept_entries += 1;
                        kept_bytes += written as i64;
                        segment
                            .truncate_in_place(kept_entries, kept_bytes, offset + OBJECT_HEADER_BYTES + written)
                            .map_err(TruncateError::Deque)?;
                        objects_kept += kept_entries as i64;
                        stop_after = Some(idx);
                        break 'segments;
                    }
                }
            }
            objects_kept += kept_entries as i64;
        }

        if let Some(keep_through) = stop_after {
            while inner.segments.len() > keep_through + 1 {
                let mut segment = inner.segments.pop_back().expect("checked len above");
                log::info!("pbd: truncation discarding trailing segment {}", segment.id());
                segment.close_and_delete().map_err(TruncateError::Deque)?;
            }
            // The segment truncation stopped at is left in place as a
            // finished, non-tail segment; a fresh empty tail follows it so
            // later offers never land inside the truncated segment.
            let truncated_id = inner.segments.back().expect("retained tail still present").id();
            let new_id = truncated_id + 1;
            log::info!("pbd: truncation starting fresh tail segment {new_id} after {truncated_id}");
            let new_tail =
                Segment::create(&inner.config.directory, &inner.config.nonce, new_id, inner.config.backend)
                    .map_err(TruncateError::Deque)?;
            inner.segments.push_back(new_tail);
            inner.next_segment_id = new_id + 1;
        }

        self.shared.num_objects.store(objects_kept, Ordering::Release);
        Ok(())
    }

    #[cfg(debug_assertions)]
    pub(crate) fn debug_assert_invariants(&self) {
        let inner = self.lock().expect("mutex poisoned");
        let expected: i64 = inner
            .segments
            .iter()
            .map(|s| (s.num_entries() - s.read_index()) as i64)
            .sum();
        debug_assert!(
            expected <= self.shared.num_objects.load(Ordering::Acquire),
            "num_objects must not undercount unread entries"
        );
        let ids: Vec<i64> = inner.segments.iter().map(|s| s.id()).collect();
        debug_assert!(ids.windows(2).all(|w| w[0] < w[1]), "segment ids must be strictly increasing");
    }
}

fn rotate_tail(inner: &mut Inner) -> Result<()> {
    let id = inner.next_segment_id;
    log::debug!("pbd: rotating tail to new segment {id}");
    let segment = Segment::create(&inner.config.directory, &inner.config.nonce, id, inner.config.backend)?;
    inner.segments.push_back(segment);
    inner.next_segment_id += 1;
    Ok(())
}

fn reclaim_if_drained(shared: &Shared, segment_id: i64) -> Result<()> {
    let mut inner = shared.inner.lock().map_err(|_| Error::Corrupt("deque mutex poisoned".into()))?;
    if inner.closed {
        return Ok(());
    }
    // Re-read the live tail id rather than trusting a snapshot taken at
    // poll time: the tail may have rotated away since then, and a segment
    // that was the tail back then is still eligible for reclaiming now.
    let tail_id = inner.segments.back().map(|s| s.id());
    if Some(segment_id) == tail_id {
        return Ok(());
    }
    let Some(pos) = inner.segments.iter().position(|s| s.id() == segment_id) else {
        return Ok(());
    };
    if !inner.segments[pos].is_empty() {
        return Ok(());
    }
    let mut segment = inner.segments.remove(pos).expect("position just found");
    segment.close_and_delete()?;
    if segment_id == inner.min_segment_id {
        inner.min_segment_id = inner.segments.front().map(|s| s.id()).unwrap_or(inner.next_segment_id);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::truncator::AcceptAll;
    use tempfile::tempdir;

    fn config(dir: &Path) -> DequeConfig {
        DequeConfig::new(dir, "q").with_backend(SegmentBackend::RegularIo)
    }

    #[test]
    fn fresh_directory_starts_empty() {
        let dir = tempdir().unwrap();
        let deque = Deque::open(config(dir.path())).unwrap();
        assert!(!deque.initialized_from_existing_files());
        assert_eq!(deque.num_objects(), 0);
        assert!(deque.is_empty().unwrap());
    }

    #[test]
    fn offer_then_poll_round_trips() {
        let dir = tempdir().unwrap();
        let deque = Deque::open(config(dir.path())).unwrap();
        deque.offer(b"hello").unwrap();
        assert_eq!(deque.num_objects(), 1);
        assert_eq!(deque.size_in_bytes().unwrap(), 5);

        let handle = deque.poll().unwrap().unwrap();
        assert_eq!(handle.as_bytes(), b"hello");
        handle.discard();
        assert_eq!(deque.num_objects(), 0);
        assert!(deque.poll().unwrap().is_none());
    }

    #[test]
    fn push_batch_is_read_before_earlier_offers() {
        let dir = tempdir().unwrap();
        let deque = Deque::open(config(dir.path())).unwrap();
        deque.offer(b"existing").unwrap();
        deque.push(&[b"A", b"B", b"C"]).unwrap();

        for expected in [b"A".as_slice(), b"B", b"C", b"existing"] {
            let handle = deque.poll().unwrap().unwrap();
            assert_eq!(handle.as_bytes(), expected);
            handle.discard();
        }
    }

    #[test]
    fn reopen_after_close_preserves_backlog() {
        let dir = tempdir().unwrap();
        {
            let deque = Deque::open(config(dir.path())).unwrap();
            deque.offer(b"abc").unwrap();
            deque.sync().unwrap();
            deque.close().unwrap();
        }
        let deque = Deque::open(config(dir.path())).unwrap();
        assert!(deque.initialized_from_existing_files());
        assert_eq!(deque.num_objects(), 1);
        let handle = deque.poll().unwrap().unwrap();
        assert_eq!(handle.as_bytes(), b"abc");
        handle.discard();
    }

    #[test]
    fn close_and_delete_removes_segment_files() {
        let dir = tempdir().unwrap();
        let deque = Deque::open(config(dir.path())).unwrap();
        deque.offer(b"abc").unwrap();
        deque.close_and_delete().unwrap();
        let remaining: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert!(remaining.is_empty());
    }

    #[test]
    fn gap_in_segment_ids_fails_construction() {
        let dir = tempdir().unwrap();
        let mut a = Segment::create(dir.path(), "q", 0, SegmentBackend::RegularIo).unwrap();
        a.offer(b"a", false).unwrap();
        a.sync().unwrap();
        a.close().unwrap();
        let mut b = Segment::create(dir.path(), "q", 2, SegmentBackend::RegularIo).unwrap();
        b.offer(b"b", false).unwrap();
        b.sync().unwrap();
        b.close().unwrap();

        let err = Deque::open(config(dir.path())).unwrap_err();
        match err {
            Error::MissingSegments { from, to } => {
                assert_eq!(from, 1);
                assert_eq!(to, 1);
            }
            other => panic!("expected MissingSegments, got {other:?}"),
        }
    }

    #[test]
    fn delete_empty_on_open_removes_header_only_segments() {
        let dir = tempdir().unwrap();
        {
            // Never offered into, so the lone tail segment stays at num_entries == 0.
            let deque = Deque::open(config(dir.path())).unwrap();
            deque.sync().unwrap();
            deque.close().unwrap();
        }
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);

        let deque = Deque::open(config(dir.path()).with_delete_empty_on_open(true)).unwrap();
        assert!(!deque.initialized_from_existing_files());
        assert_eq!(deque.num_objects(), 0);
        assert!(deque.is_empty().unwrap());
    }

    #[test]
    fn offer_rejects_record_larger_than_max() {
        let dir = tempdir().unwrap();
        let deque = Deque::open(config(dir.path())).unwrap();
        let oversized = vec![0u8; crate::header::MAX_RECORD_BYTES + 1];
        let err = deque.offer(&oversized).unwrap_err();
        assert!(matches!(err, Error::RecordTooLarge { .. }));

        let err = deque.push(&[oversized.as_slice()]).unwrap_err();
        assert!(matches!(err, Error::RecordTooLarge { .. }));
    }

    #[test]
    fn parse_and_truncate_accepts_everything_by_default() {
        let dir = tempdir().unwrap();
        {
            let deque = Deque::open(config(dir.path())).unwrap();
            deque.offer(b"one").unwrap();
            deque.offer(b"two").unwrap();
            deque.sync().unwrap();
            deque.close().unwrap();
        }
        let deque = Deque::open(config(dir.path())).unwrap();
        deque.parse_and_truncate(&mut AcceptAll).unwrap();
        assert_eq!(deque.num_objects(), 2);
    }
}
