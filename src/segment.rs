//! A single backing file for a contiguous run of records, with two
//! interchangeable storage backends.
use std::cell::UnsafeCell;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use memmap2::{Mmap, MmapMut, MmapOptions};

use crate::buffer::BufferHandle;
use crate::compress;
use crate::header::{
    RecordFrameHeader, SegmentHeader, CHUNK_SIZE, FLAG_COMPRESSED, OBJECT_HEADER_BYTES,
    SEGMENT_HEADER_BYTES,
};
use crate::{Error, Result};

/// Selects which I/O strategy a [`Segment`] uses to read and write its
/// backing file. Both must produce byte-identical files.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegmentBackend {
    RegularIo,
    MemoryMapped,
}

impl SegmentBackend {
    /// Reads the `PBD_USE_MMAP_SEGMENTS` environment variable, defaulting to
    /// [`SegmentBackend::RegularIo`] when unset or unrecognized.
    pub fn from_env() -> Self {
        match std::env::var("PBD_USE_MMAP_SEGMENTS") {
            Ok(value) if value == "1" || value.eq_ignore_ascii_case("true") => {
                SegmentBackend::MemoryMapped
            }
            _ => SegmentBackend::RegularIo,
        }
    }
}

/// Builds the on-disk file name for a segment, joining a (possibly
/// dotted) nonce with its id.
pub fn segment_file_name(nonce: &str, id: i64) -> String {
    format!("{nonce}.{id}.pbd")
}

/// Parses `<nonce>.<id>.pbd`, treating the last two dot-separated
/// components as `<id>` and `pbd` and rejoining everything before them as
/// the nonce.
pub fn parse_segment_file_name(name: &str) -> Option<(String, i64)> {
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() < 3 {
        return None;
    }
    if *parts.last().unwrap() != "pbd" {
        return None;
    }
    let id_part = parts[parts.len() - 2];
    let id: i64 = id_part.parse().ok()?;
    let nonce = parts[..parts.len() - 2].join(".");
    if nonce.is_empty() {
        return None;
    }
    Some((nonce, id))
}

/// A segment-backend-held mapping. Writes go through raw pointer access
/// gated entirely by the deque's outer lock -- there is never concurrent
/// access to the same segment, so this is the single-writer analogue of
/// `ControlFile`'s raw-pointer pattern over a mapped control block.
struct MmapCell(UnsafeCell<MmapMut>);

// SAFETY: all access to the contained `MmapMut` is serialized by the
// deque's single owning mutex; `BufferHandle`s only ever read already
// committed bytes behind an immutable slice.
unsafe impl Send for MmapCell {}
unsafe impl Sync for MmapCell {}

impl MmapCell {
    fn as_slice(&self) -> &[u8] {
        // SAFETY: shared read access; writers never alias outstanding reads
        // because records are append-only and truncation is gated on no
        // outstanding handles for the segment.
        unsafe { &*self.0.get() }
    }

    #[allow(clippy::mut_from_ref)]
    fn as_mut_slice(&self) -> &mut [u8] {
        // SAFETY: caller holds the deque's lock, guaranteeing exclusivity.
        unsafe { &mut *self.0.get() }
    }
}

enum Backend {
    RegularIo { file: File },
    MemoryMapped { file: File, map: Arc<MmapCell> },
}

/// One backing `.pbd` file: an append-only run of length-prefixed records
/// preceded by a small header.
pub struct Segment {
    id: i64,
    path: PathBuf,
    backend: Backend,
    num_entries: i32,
    read_index: i32,
    uncompressed_bytes_to_read: i64,
    write_pos: usize,
    read_pos: usize,
    header_dirty: bool,
    is_open: bool,
    outstanding: Arc<AtomicUsize>,
}

impl Segment {
    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn num_entries(&self) -> i32 {
        self.num_entries
    }

    pub fn read_index(&self) -> i32 {
        self.read_index
    }

    pub fn uncompressed_bytes_to_read(&self) -> i64 {
        self.uncompressed_bytes_to_read
    }

    pub fn is_open(&self) -> bool {
        self.is_open
    }

    pub fn is_being_polled(&self) -> bool {
        self.outstanding.load(Ordering::Acquire) > 0
    }

    pub fn has_more_entries(&self) -> bool {
        self.read_index < self.num_entries
    }

    pub fn is_empty(&self) -> bool {
        !self.has_more_entries() && !self.is_being_polled()
    }

    /// Free bytes remaining before this segment hits [`CHUNK_SIZE`]. The
    /// last 4 bytes of the chunk are never used, matching the reserved
    /// margin `MAX_RECORD_BYTES`/`PUSH_BATCH_CAPACITY` are sized against.
    pub fn free_bytes(&self) -> usize {
        (CHUNK_SIZE - 4).saturating_sub(self.write_pos)
    }

    /// Creates a brand new, empty segment open for write.
    pub fn create(
        dir: &Path,
        nonce: &str,
        id: i64,
        backend_kind: SegmentBackend,
    ) -> Result<Self> {
        let path = dir.join(segment_file_name(nonce, id));
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&path)?;

        let backend = match backend_kind {
            SegmentBackend::RegularIo => {
                let mut file = file;
                file.write_all(&SegmentHeader::default().encode())?;
                file.flush()?;
                Backend::RegularIo { file }
            }
            SegmentBackend::MemoryMapped => {
                file.set_len(CHUNK_SIZE as u64)?;
                let map = unsafe { MmapOptions::new().len(CHUNK_SIZE).map_mut(&file)? };
                let cell = Arc::new(MmapCell(UnsafeCell::new(map)));
                cell.as_mut_slice()[0..SEGMENT_HEADER_BYTES]
                    .copy_from_slice(&SegmentHeader::default().encode());
                Backend::MemoryMapped { file, map: cell }
            }
        };

        Ok(Self {
            id,
            path,
            backend,
            num_entries: 0,
            read_index: 0,
            uncompressed_bytes_to_read: 0,
            write_pos: SEGMENT_HEADER_BYTES,
            read_pos: SEGMENT_HEADER_BYTES,
            header_dirty: false,
            is_open: true,
            outstanding: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Opens an existing segment file for reading (and, incidentally,
    /// for the in-place rewrite that `parse_and_truncate` may perform).
    pub fn open_existing(path: &Path, id: i64, backend_kind: SegmentBackend) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len() as usize;
        if len < SEGMENT_HEADER_BYTES {
            return Err(Error::Corrupt(format!(
                "segment {} smaller than its header ({len} bytes)",
                path.display()
            )));
        }

        let (backend, header) = match backend_kind {
            SegmentBackend::RegularIo => {
                let mut file = file;
                let header = SegmentHeader::read_from(&mut file)?;
                (Backend::RegularIo { file }, header)
            }
            SegmentBackend::MemoryMapped => {
                let map = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
                let mut header_buf = [0u8; SEGMENT_HEADER_BYTES];
                header_buf.copy_from_slice(&map[0..SEGMENT_HEADER_BYTES]);
                let header = SegmentHeader::decode(&header_buf);
                let cell = Arc::new(MmapCell(UnsafeCell::new(map)));
                (Backend::MemoryMapped { file, map: cell }, header)
            }
        };

        Ok(Self {
            id,
            path: path.to_path_buf(),
            backend,
            num_entries: header.num_entries,
            read_index: 0,
            uncompressed_bytes_to_read: header.uncompressed_bytes as i64,
            write_pos: len,
            read_pos: SEGMENT_HEADER_BYTES,
            header_dirty: false,
            is_open: true,
            outstanding: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Shared handle used by `BufferHandle`s returned from [`Segment::poll`]
    /// to pin this segment open.
    pub(crate) fn outstanding_handle(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.outstanding)
    }

    fn regular_file_mut(&mut self) -> Option<&mut File> {
        match &mut self.backend {
            Backend::RegularIo { file } => Some(file),
            Backend::MemoryMapped { .. } => None,
        }
    }

    /// Appends one record, compressing it first if `compress` is requested.
    /// Returns `Ok(false)` if the segment lacks room (caller should rotate).
    pub fn offer(&mut self, payload: &[u8], compress: bool) -> Result<bool> {
        let (stored, flags) = if compress {
            (compress::compress(payload)?, FLAG_COMPRESSED)
        } else {
            (payload.to_vec(), 0)
        };
        self.write_frame(&stored, flags, payload.len())
    }

    /// Appends a record whose bytes are produced in place by `serialize`,
    /// which is given a scratch slice of `max_len` bytes and must return how
    /// many of them it used. Returns `Ok(None)` if the segment lacks room
    /// for `max_len` bytes (caller should rotate and retry).
    pub fn offer_with(
        &mut self,
        max_len: usize,
        serialize: impl FnOnce(&mut [u8]) -> usize,
    ) -> Result<Option<usize>> {
        let needed = OBJECT_HEADER_BYTES + max_len;
        if needed > self.free_bytes() {
            return Ok(None);
        }
        let mut scratch = vec![0u8; max_len];
        let written = serialize(&mut scratch).min(max_len);
        scratch.truncate(written);
        self.write_frame(&scratch, 0, written)?;
        Ok(Some(written))
    }

    fn write_frame(&mut self, stored: &[u8], flags: i32, uncompressed_len: usize) -> Result<bool> {
        let needed = OBJECT_HEADER_BYTES + stored.len();
        if needed > self.free_bytes() {
            return Ok(false);
        }
        let frame_header = RecordFrameHeader { stored_length: stored.len() as i32, flags };
        let offset = self.write_pos;

        match &mut self.backend {
            Backend::RegularIo { file } => {
                file.seek(SeekFrom::Start(offset as u64))?;
                file.write_all(&frame_header.encode())?;
                file.write_all(stored)?;
            }
            Backend::MemoryMapped { map, .. } => {
                let slice = map.as_mut_slice();
                slice[offset..offset + OBJECT_HEADER_BYTES].copy_from_slice(&frame_header.encode());
                slice[offset + OBJECT_HEADER_BYTES..offset + needed].copy_from_slice(stored);
            }
        }

        self.write_pos += needed;
        self.num_entries += 1;
        self.uncompressed_bytes_to_read += uncompressed_len as i64;
        self.header_dirty = true;
        Ok(true)
    }

    /// Reads the record at `read_index`, advancing the read cursor.
    /// Returns `None` once every written record has been polled.
    pub fn poll(&mut self) -> Result<Option<BufferHandle>> {
        if !self.has_more_entries() {
            return Ok(None);
        }

        let offset = self.read_pos;
        let (frame_header, stored_start) = self.read_frame_header(offset)?;
        let stored_len = frame_header.stored_length as usize;
        let frame_len = OBJECT_HEADER_BYTES + stored_len;

        let handle = if frame_header.is_compressed() {
            let stored = self.read_stored_bytes(stored_start, stored_len)?;
            let uncompressed = compress::decompress(&stored)?;
            self.uncompressed_bytes_to_read -= uncompressed.len() as i64;
            BufferHandle::owned(uncompressed)
        } else {
            let handle = self.mapped_or_owned_slice(stored_start, stored_len)?;
            self.uncompressed_bytes_to_read -= stored_len as i64;
            handle
        };

        self.read_pos += frame_len;
        self.read_index += 1;
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        Ok(Some(handle))
    }

    /// Reads the frame header at an arbitrary byte offset, independent of
    /// the segment's own read cursor. Used by recovery scanning.
    pub(crate) fn read_frame_header(&mut self, offset: usize) -> Result<(RecordFrameHeader, usize)> {
        let mut buf = [0u8; OBJECT_HEADER_BYTES];
        match &mut self.backend {
            Backend::RegularIo { file } => {
                file.seek(SeekFrom::Start(offset as u64))?;
                file.read_exact(&mut buf)?;
            }
            Backend::MemoryMapped { map, .. } => {
                buf.copy_from_slice(&map.as_slice()[offset..offset + OBJECT_HEADER_BYTES]);
            }
        }
        let header = RecordFrameHeader::decode(&buf)?;
        Ok((header, offset + OBJECT_HEADER_BYTES))
    }

    pub(crate) fn read_stored_bytes(&mut self, start: usize, len: usize) -> Result<Vec<u8>> {
        let mut out = vec![0u8; len];
        match &mut self.backend {
            Backend::RegularIo { file } => {
                file.seek(SeekFrom::Start(start as u64))?;
                file.read_exact(&mut out)?;
            }
            Backend::MemoryMapped { map, .. } => {
                out.copy_from_slice(&map.as_slice()[start..start + len]);
            }
        }
        Ok(out)
    }

    fn mapped_or_owned_slice(&mut self, start: usize, len: usize) -> Result<BufferHandle> {
        match &self.backend {
            Backend::RegularIo { .. } => Ok(BufferHandle::owned(self.read_stored_bytes(start, len)?)),
            Backend::MemoryMapped { file, .. } => {
                // A fresh read-only mapping shares pages with the writer's
                // mapping but avoids aliasing a `&mut` with the handle's
                // `&[u8]`.
                let map = unsafe { Mmap::map(file)? };
                Ok(BufferHandle::mapped(Arc::new(map), start, start + len))
            }
        }
    }

    pub fn sync(&mut self) -> Result<()> {
        if self.header_dirty {
            self.flush_header()?;
        }
        match &mut self.backend {
            Backend::RegularIo { file } => file.sync_all()?,
            Backend::MemoryMapped { map, file } => {
                map.as_mut_slice().flush()?;
                file.sync_all()?;
            }
        }
        Ok(())
    }

    fn flush_header(&mut self) -> Result<()> {
        let header = SegmentHeader {
            num_entries: self.num_entries,
            uncompressed_bytes: total_uncompressed_written(self)?,
        };
        match &mut self.backend {
            Backend::RegularIo { file } => header.write_to(file)?,
            Backend::MemoryMapped { map, .. } => {
                map.as_mut_slice()[0..SEGMENT_HEADER_BYTES].copy_from_slice(&header.encode());
            }
        }
        self.header_dirty = false;
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        if !self.is_open {
            return Ok(());
        }
        // Drop any already-polled prefix so a later `open_existing` doesn't
        // redeliver it: the on-disk (num_entries, bytes) pair only ever
        // describes the unconsumed tail. Skipped while a handle is still
        // outstanding, since compacting would shift bytes out from under it.
        if self.read_index > 0 && !self.is_being_polled() {
            self.compact()?;
        }
        if self.header_dirty {
            self.flush_header()?;
        }
        if let Backend::MemoryMapped { file, .. } = &mut self.backend {
            file.set_len(self.write_pos as u64)?;
            file.sync_all()?;
        }
        if let Some(file) = self.regular_file_mut() {
            file.flush()?;
        }
        self.is_open = false;
        Ok(())
    }

    /// Physically discards the prefix of already-polled records, shifting
    /// the unconsumed tail down to immediately follow the segment header
    /// and rewriting `num_entries`/`uncompressed_bytes` to describe only
    /// what remains. A no-op if nothing has been polled yet.
    fn compact(&mut self) -> Result<()> {
        if self.read_index == 0 {
            return Ok(());
        }
        let remaining_len = self.write_pos - self.read_pos;
        let mut buf = vec![0u8; remaining_len];
        match &mut self.backend {
            Backend::RegularIo { file } => {
                file.seek(SeekFrom::Start(self.read_pos as u64))?;
                file.read_exact(&mut buf)?;
                file.seek(SeekFrom::Start(SEGMENT_HEADER_BYTES as u64))?;
                file.write_all(&buf)?;
                file.set_len((SEGMENT_HEADER_BYTES + remaining_len) as u64)?;
            }
            Backend::MemoryMapped { map, .. } => {
                buf.copy_from_slice(&map.as_slice()[self.read_pos..self.write_pos]);
                map.as_mut_slice()[SEGMENT_HEADER_BYTES..SEGMENT_HEADER_BYTES + remaining_len]
                    .copy_from_slice(&buf);
            }
        }
        self.num_entries -= self.read_index;
        self.read_index = 0;
        self.write_pos = SEGMENT_HEADER_BYTES + remaining_len;
        self.read_pos = SEGMENT_HEADER_BYTES;
        self.header_dirty = true;
        Ok(())
    }

    pub fn close_and_delete(&mut self) -> Result<()> {
        self.is_open = false;
        std::fs::remove_file(&self.path).or_else(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Ok(())
            } else {
                Err(e)
            }
        })?;
        Ok(())
    }

    /// Rewrites the segment's header and truncates its file at
    /// `byte_offset`, used by `parse_and_truncate` to discard a suffix of
    /// the segment in place.
    pub fn truncate_in_place(
        &mut self,
        kept_entries: i32,
        kept_uncompressed_bytes: i64,
        byte_offset: usize,
    ) -> Result<()> {
        self.num_entries = kept_entries;
        self.uncompressed_bytes_to_read = kept_uncompressed_bytes;
        self.header_dirty = true;
        self.flush_header()?;
        self.write_pos = byte_offset;
        match &mut self.backend {
            Backend::RegularIo { file } => {
                file.set_len(byte_offset as u64)?;
                file.sync_all()?;
            }
            Backend::MemoryMapped { file, .. } => {
                file.set_len(byte_offset as u64)?;
                file.sync_all()?;
            }
        }
        Ok(())
    }

    /// Rewrites one record frame in place (used by `PartialTruncate`) at
    /// `byte_offset`, then truncates the file just past it.
    pub fn rewrite_record_in_place(
        &mut self,
        byte_offset: usize,
        replacement: &[u8],
    ) -> Result<()> {
        let frame_header = RecordFrameHeader { stored_length: replacement.len() as i32, flags: 0 };
        match &mut self.backend {
            Backend::RegularIo { file } => {
                file.seek(SeekFrom::Start(byte_offset as u64))?;
                file.write_all(&frame_header.encode())?;
                file.write_all(replacement)?;
            }
            Backend::MemoryMapped { map, .. } => {
                let slice = map.as_mut_slice();
                let body = byte_offset + OBJECT_HEADER_BYTES;
                slice[byte_offset..body].copy_from_slice(&frame_header.encode());
                slice[body..body + replacement.len()].copy_from_slice(replacement);
            }
        }
        Ok(())
    }
}

/// The header's `uncompressed_bytes` field describes only the unconsumed
/// tail: `compact` keeps it equal to `uncompressed_bytes_to_read` any time
/// it's flushed, so it's already exactly what belongs on disk.
fn total_uncompressed_written(segment: &Segment) -> Result<i32> {
    i32::try_from(segment.uncompressed_bytes_to_read)
        .map_err(|_| Error::Corrupt("uncompressed byte total exceeds i32 range".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parses_nonce_with_dots() {
        let (nonce, id) = parse_segment_file_name("export.staging.42.pbd").unwrap();
        assert_eq!(nonce, "export.staging");
        assert_eq!(id, 42);
    }

    #[test]
    fn parses_negative_id() {
        let (nonce, id) = parse_segment_file_name("q.-3.pbd").unwrap();
        assert_eq!(nonce, "q");
        assert_eq!(id, -3);
    }

    #[test]
    fn rejects_non_pbd_files() {
        assert!(parse_segment_file_name("q.42.tmp").is_none());
        assert!(parse_segment_file_name("noext").is_none());
    }

    fn offer_poll_round_trip(backend: SegmentBackend) {
        let dir = tempdir().unwrap();
        let mut segment = Segment::create(dir.path(), "q", 0, backend).unwrap();
        assert!(segment.offer(b"hello", false).unwrap());
        assert!(segment.offer(b"world", true).unwrap());
        segment.sync().unwrap();

        let first = segment.poll().unwrap().unwrap();
        assert_eq!(first.as_bytes(), b"hello");
        first.discard();
        let second = segment.poll().unwrap().unwrap();
        assert_eq!(second.as_bytes(), b"world");
        second.discard();
        assert!(segment.poll().unwrap().is_none());
    }

    #[test]
    fn regular_io_round_trips() {
        offer_poll_round_trip(SegmentBackend::RegularIo);
    }

    #[test]
    fn memory_mapped_round_trips() {
        offer_poll_round_trip(SegmentBackend::MemoryMapped);
    }

    #[test]
    fn reopen_preserves_header() {
        let dir = tempdir().unwrap();
        let path;
        {
            let mut segment =
                Segment::create(dir.path(), "q", 0, SegmentBackend::RegularIo).unwrap();
            segment.offer(b"abc", false).unwrap();
            segment.sync().unwrap();
            path = segment.path().to_path_buf();
        }
        let reopened =
            Segment::open_existing(&path, 0, SegmentBackend::RegularIo).unwrap();
        assert_eq!(reopened.num_entries(), 1);
        assert_eq!(reopened.uncompressed_bytes_to_read(), 3);
    }

    #[test]
    fn close_compacts_already_polled_prefix() {
        let dir = tempdir().unwrap();
        let path;
        {
            let mut segment =
                Segment::create(dir.path(), "q", 0, SegmentBackend::RegularIo).unwrap();
            segment.offer(b"first", false).unwrap();
            segment.offer(b"second", false).unwrap();
            let handle = segment.poll().unwrap().unwrap();
            assert_eq!(handle.as_bytes(), b"first");
            handle.discard();
            segment.close().unwrap();
            path = segment.path().to_path_buf();
        }

        let mut reopened =
            Segment::open_existing(&path, 0, SegmentBackend::RegularIo).unwrap();
        assert_eq!(reopened.num_entries(), 1);
        assert_eq!(reopened.uncompressed_bytes_to_read(), 6);
        let handle = reopened.poll().unwrap().unwrap();
        assert_eq!(handle.as_bytes(), b"second");
        handle.discard();
        assert!(reopened.poll().unwrap().is_none());
    }
}
