//! The handle returned by [`crate::Deque::poll`]: a reference-counted,
//! single-discard view over a record's bytes.
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use memmap2::Mmap;

enum Data {
    Owned(Vec<u8>),
    Mapped { map: Arc<Mmap>, start: usize, end: usize },
}

impl Data {
    fn as_bytes(&self) -> &[u8] {
        match self {
            Data::Owned(v) => v.as_slice(),
            Data::Mapped { map, start, end } => &map[*start..*end],
        }
    }
}

/// Ties a handle back to the segment it was read from, so that discarding
/// it can drop the segment's outstanding-reader count and, if the segment
/// is now fully drained and no longer the tail, let the deque reclaim it.
struct Origin {
    segment_id: i64,
    outstanding: Arc<AtomicUsize>,
    on_release: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

/// A single polled record. Must be explicitly released with [`discard`]
/// once the caller is done with the bytes; dropping without discarding
/// releases it anyway as a safety net.
pub struct BufferHandle {
    data: Data,
    origin: Option<Origin>,
    released: AtomicBool,
}

impl BufferHandle {
    pub(crate) fn owned(data: Vec<u8>) -> Self {
        Self { data: Data::Owned(data), origin: None, released: AtomicBool::new(false) }
    }

    pub(crate) fn mapped(map: Arc<Mmap>, start: usize, end: usize) -> Self {
        Self {
            data: Data::Mapped { map, start, end },
            origin: None,
            released: AtomicBool::new(false),
        }
    }

    /// Attaches the segment this record came from so that `discard` can
    /// release its outstanding-reader slot and run `on_release` (deque-level
    /// segment reclamation).
    pub(crate) fn with_origin(
        mut self,
        segment_id: i64,
        outstanding: Arc<AtomicUsize>,
        on_release: impl FnOnce() + Send + 'static,
    ) -> Self {
        self.origin = Some(Origin {
            segment_id,
            outstanding,
            on_release: Mutex::new(Some(Box::new(on_release))),
        });
        self
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.data.as_bytes()
    }

    pub fn len(&self) -> usize {
        self.data.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Releases this handle. Safe to call at most once; a second call is
    /// logged and otherwise ignored.
    pub fn discard(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            match &self.origin {
                Some(origin) => {
                    log::error!("double discard of buffer handle for segment {}", origin.segment_id)
                }
                None => log::error!("double discard of buffer handle"),
            }
            return;
        }
        if let Some(origin) = &self.origin {
            origin.outstanding.fetch_sub(1, Ordering::AcqRel);
            if let Some(cb) = origin.on_release.lock().unwrap().take() {
                cb();
            }
        }
    }
}

impl Drop for BufferHandle {
    fn drop(&mut self) {
        if !self.released.load(Ordering::Acquire) {
            self.discard();
        }
    }
}

impl fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferHandle").field("len", &self.len()).finish()
    }
}
