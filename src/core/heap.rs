//! Page Arena Heap
//!
//! Every frame owns one `FrameHeap`. Component data and user allocations live
//! in it and are addressed through bounds-checked [`HeapPtr`] handles that stay
//! valid across a structural copy, so cloning a frame for prediction is a page
//! by page copy with no pointer fixups.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  page 0 (Small)   [alloc][alloc][alloc]....... cursor ──►     │
//! │  page 1 (Free)    uncommitted until first use                │
//! │  page 2 (LargeHead, 2 pages) [───── one allocation ─────]    │
//! │  page 3 (LargeTail)                                          │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Small allocations bump a per-page cursor; a page is zeroed and returned to
//! the free pool when its last live allocation is freed. Allocations larger
//! than a page take a run of consecutive free pages. Running out of pages is a
//! configuration error: the heap never grows after construction.

use std::collections::{BTreeMap, BTreeSet};
use std::panic::Location;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::stream::{BitStream, Serializable, StreamError};

/// Allocation alignment in bytes.
pub const ALIGNMENT: usize = 8;

/// Smallest accepted page shift (1 KiB pages).
pub const MIN_PAGE_SHIFT: u32 = 10;

/// Largest accepted page shift (16 MiB pages).
pub const MAX_PAGE_SHIFT: u32 = 24;

/// Debug instrumentation level. Never affects simulated values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HeapTrackingMode {
    /// No bookkeeping.
    #[default]
    Disabled,
    /// Remember the tick of each live allocation and report unreachable ones.
    DetectLeaks,
    /// Like `DetectLeaks`, additionally recording each allocation's call site.
    TraceAllocations,
}

/// Heap geometry, fixed for the lifetime of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeapConfig {
    /// log2 of the page size in bytes.
    pub page_shift: u32,
    /// Regular page count.
    pub page_count: usize,
    /// Additional pages appended after the regular ones.
    pub extra_count: usize,
    /// Instrumentation level.
    pub tracking: HeapTrackingMode,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            page_shift: 15,
            page_count: 256,
            extra_count: 0,
            tracking: HeapTrackingMode::Disabled,
        }
    }
}

impl HeapConfig {
    /// Bytes per page.
    #[inline]
    pub fn page_size(&self) -> usize {
        1usize << self.page_shift
    }

    /// Total pages including extras.
    #[inline]
    pub fn total_pages(&self) -> usize {
        self.page_count + self.extra_count
    }

    /// Total capacity in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.page_size() * self.total_pages()
    }

    /// Reject geometries the heap cannot address.
    pub fn validate(&self) -> Result<(), HeapError> {
        if !(MIN_PAGE_SHIFT..=MAX_PAGE_SHIFT).contains(&self.page_shift) {
            return Err(HeapError::InvalidConfig(format!(
                "page shift {} outside {}..={}",
                self.page_shift, MIN_PAGE_SHIFT, MAX_PAGE_SHIFT
            )));
        }
        if self.page_count == 0 {
            return Err(HeapError::InvalidConfig("page count must be at least 1".into()));
        }
        if u32::try_from(self.total_pages()).is_err() {
            return Err(HeapError::InvalidConfig("too many pages".into()));
        }
        Ok(())
    }
}

/// Handle to a heap allocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HeapPtr {
    /// Page index.
    pub page: u32,
    /// Byte offset within the page.
    pub offset: u32,
    /// Requested length in bytes.
    pub len: u32,
}

impl Serializable for HeapPtr {
    fn serialize(&mut self, stream: &mut BitStream) -> Result<(), StreamError> {
        stream.serialize_u32(&mut self.page)?;
        stream.serialize_u32(&mut self.offset)?;
        stream.serialize_u32(&mut self.len)
    }
}

/// Heap errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeapError {
    /// No free space for the request. Fatal: raise the page count.
    #[error("Heap exhausted: requested {requested} bytes of {capacity} total")]
    OutOfMemory {
        /// Bytes requested.
        requested: usize,
        /// Heap capacity in bytes.
        capacity: usize,
    },
    /// Handle does not address a live allocation.
    #[error("Invalid heap pointer {0:?}")]
    InvalidPointer(HeapPtr),
    /// Copy between heaps with different page geometry.
    #[error("Heap geometry mismatch")]
    GeometryMismatch,
    /// Unusable configuration.
    #[error("Invalid heap config: {0}")]
    InvalidConfig(String),
}

// =============================================================================
// PAGES
// =============================================================================

const TAG_FREE: u8 = 0;
const TAG_SMALL: u8 = 1;
const TAG_LARGE_HEAD: u8 = 2;
const TAG_LARGE_TAIL: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PageState {
    Free,
    Small,
    LargeHead { pages: u32 },
    LargeTail,
}

impl PageState {
    fn tag(self) -> u8 {
        match self {
            PageState::Free => TAG_FREE,
            PageState::Small => TAG_SMALL,
            PageState::LargeHead { .. } => TAG_LARGE_HEAD,
            PageState::LargeTail => TAG_LARGE_TAIL,
        }
    }
}

#[derive(Debug, Clone)]
struct Page {
    state: PageState,
    // Empty until the page is first used.
    data: Vec<u8>,
    // Bytes in use (small) or allocation length (large head).
    cursor: u32,
    // Live small allocations, offset to length.
    slots: BTreeMap<u32, u32>,
}

impl Page {
    fn new() -> Self {
        Self {
            state: PageState::Free,
            data: Vec::new(),
            cursor: 0,
            slots: BTreeMap::new(),
        }
    }

    fn commit(&mut self, len: usize) {
        if self.data.len() != len {
            self.data.clear();
            self.data.resize(len, 0);
        }
    }

    fn release(&mut self) {
        self.data.fill(0);
        self.state = PageState::Free;
        self.cursor = 0;
        self.slots.clear();
    }

    fn holds(&self, offset: u32, len: u32) -> bool {
        self.slots.get(&offset) == Some(&len)
    }

    fn serialize(&mut self, stream: &mut BitStream, page_size: usize, remaining: usize) -> Result<(), StreamError> {
        let mut tag = self.state.tag();
        stream.serialize_u8(&mut tag)?;

        let mut span = match self.state {
            PageState::LargeHead { pages } => pages,
            _ => 0,
        };
        if tag == TAG_LARGE_HEAD {
            stream.serialize_u32(&mut span)?;
        }

        if stream.is_reading() {
            self.state = match tag {
                TAG_FREE => PageState::Free,
                TAG_SMALL => PageState::Small,
                TAG_LARGE_HEAD if span > 1 && span as usize <= remaining => PageState::LargeHead { pages: span },
                TAG_LARGE_TAIL => PageState::LargeTail,
                other => return Err(StreamError::Invalid(format!("heap page tag {other}"))),
            };
        }

        let reading = stream.is_reading();
        match self.state {
            PageState::Free | PageState::LargeTail => {
                if reading {
                    self.data.fill(0);
                    self.cursor = 0;
                    self.slots.clear();
                }
            }
            PageState::Small => {
                stream.serialize_u32(&mut self.cursor)?;
                let mut count = self.slots.len() as u32;
                stream.serialize_u32(&mut count)?;
                if reading {
                    if self.cursor as usize > page_size || count == 0 || count as usize > page_size / ALIGNMENT {
                        return Err(StreamError::Invalid("heap page header out of range".into()));
                    }
                    self.read_slots(stream, count)?;
                    self.data.clear();
                    self.data.resize(page_size, 0);
                } else {
                    for (&offset, &len) in &self.slots {
                        let (mut offset, mut len) = (offset, len);
                        stream.serialize_u32(&mut offset)?;
                        stream.serialize_u32(&mut len)?;
                    }
                }
                let used = self.cursor as usize;
                stream.serialize_raw(&mut self.data[..used])?;
            }
            PageState::LargeHead { pages } => {
                stream.serialize_u32(&mut self.cursor)?;
                let committed = page_size * pages as usize;
                if reading {
                    let cursor = self.cursor as usize;
                    if cursor <= committed - page_size || cursor > committed {
                        return Err(StreamError::Invalid("large allocation length out of range".into()));
                    }
                    self.slots.clear();
                    self.data.clear();
                    self.data.resize(committed, 0);
                }
                let used = self.cursor as usize;
                stream.serialize_raw(&mut self.data[..used])?;
            }
        }
        Ok(())
    }

    // Slots must be aligned, ascending, non-overlapping and under the cursor.
    fn read_slots(&mut self, stream: &mut BitStream, count: u32) -> Result<(), StreamError> {
        self.slots.clear();
        let mut next_free = 0u64;
        for _ in 0..count {
            let (mut offset, mut len) = (0u32, 0u32);
            stream.serialize_u32(&mut offset)?;
            stream.serialize_u32(&mut len)?;
            let start = offset as u64;
            let aligned = (len as u64 + ALIGNMENT as u64 - 1) & !(ALIGNMENT as u64 - 1);
            let ok = len > 0
                && start >= next_free
                && start % ALIGNMENT as u64 == 0
                && start + aligned <= self.cursor as u64;
            if !ok {
                return Err(StreamError::Invalid(format!("heap slot {offset}+{len} out of range")));
            }
            next_free = start + aligned;
            self.slots.insert(offset, len);
        }
        Ok(())
    }
}

/// Bookkeeping for one live allocation.
#[derive(Debug, Clone, Copy)]
pub struct AllocationRecord {
    /// Tick the allocation was made on.
    pub tick: i32,
    /// Call site, in `TraceAllocations` mode.
    pub site: Option<&'static Location<'static>>,
}

/// An allocation made during the current tick that nothing references.
#[derive(Debug, Clone, Copy)]
pub struct LeakReport {
    /// Leaked handle.
    pub ptr: HeapPtr,
    /// Tick of the allocation.
    pub tick: i32,
    /// Call site if traced.
    pub site: Option<&'static Location<'static>>,
}

// =============================================================================
// FRAME HEAP
// =============================================================================

/// Page-based arena owned by a single frame.
#[derive(Debug)]
pub struct FrameHeap {
    config: HeapConfig,
    page_size: usize,
    pages: Vec<Page>,
    allocations: BTreeMap<HeapPtr, AllocationRecord>,
    tick: i32,
}

impl FrameHeap {
    /// Create an empty heap. No page memory is committed yet.
    pub fn new(config: HeapConfig) -> Result<Self, HeapError> {
        config.validate()?;
        Ok(Self {
            config,
            page_size: config.page_size(),
            pages: (0..config.total_pages()).map(|_| Page::new()).collect(),
            allocations: BTreeMap::new(),
            tick: 0,
        })
    }

    /// Heap geometry.
    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// Total capacity in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.config.capacity()
    }

    /// Pages currently holding allocations.
    pub fn used_pages(&self) -> usize {
        self.pages.iter().filter(|p| p.state != PageState::Free).count()
    }

    /// Pages that have backing memory.
    pub fn committed_pages(&self) -> usize {
        self.pages.iter().filter(|p| !p.data.is_empty()).count()
    }

    /// Allocate `size` bytes, zero-filled.
    #[track_caller]
    pub fn allocate(&mut self, size: usize) -> Result<HeapPtr, HeapError> {
        let site = Location::caller();
        let size = size.max(1);
        let aligned = (size + ALIGNMENT - 1) & !(ALIGNMENT - 1);

        let ptr = if aligned <= self.page_size {
            self.allocate_small(size, aligned)?
        } else {
            self.allocate_large(size)?
        };

        self.track(ptr, site);
        Ok(ptr)
    }

    fn allocate_small(&mut self, size: usize, aligned: usize) -> Result<HeapPtr, HeapError> {
        let page_size = self.page_size;
        let index = self
            .pages
            .iter()
            .position(|p| p.state == PageState::Small && p.cursor as usize + aligned <= page_size)
            .or_else(|| self.pages.iter().position(|p| p.state == PageState::Free))
            .ok_or(HeapError::OutOfMemory {
                requested: size,
                capacity: self.capacity(),
            })?;

        let page = &mut self.pages[index];
        if page.state == PageState::Free {
            page.commit(page_size);
            page.state = PageState::Small;
        }
        let offset = page.cursor;
        page.cursor += aligned as u32;
        page.slots.insert(offset, size as u32);

        Ok(HeapPtr {
            page: index as u32,
            offset,
            len: size as u32,
        })
    }

    fn allocate_large(&mut self, size: usize) -> Result<HeapPtr, HeapError> {
        let span = size.div_ceil(self.page_size);
        let oom = HeapError::OutOfMemory {
            requested: size,
            capacity: self.capacity(),
        };
        if span > self.pages.len() {
            return Err(oom);
        }

        let head = (0..=self.pages.len() - span)
            .find(|&start| {
                self.pages[start..start + span]
                    .iter()
                    .all(|p| p.state == PageState::Free)
            })
            .ok_or(oom)?;

        let committed = span * self.page_size;
        let page = &mut self.pages[head];
        page.commit(committed);
        page.state = PageState::LargeHead { pages: span as u32 };
        page.cursor = size as u32;
        page.slots.clear();
        for tail in &mut self.pages[head + 1..head + span] {
            tail.state = PageState::LargeTail;
        }

        Ok(HeapPtr {
            page: head as u32,
            offset: 0,
            len: size as u32,
        })
    }

    fn track(&mut self, ptr: HeapPtr, site: &'static Location<'static>) {
        let site = match self.config.tracking {
            HeapTrackingMode::Disabled => return,
            HeapTrackingMode::DetectLeaks => None,
            HeapTrackingMode::TraceAllocations => Some(site),
        };
        self.allocations.insert(ptr, AllocationRecord { tick: self.tick, site });
    }

    fn check(&self, ptr: HeapPtr) -> Result<(), HeapError> {
        let page = self
            .pages
            .get(ptr.page as usize)
            .ok_or(HeapError::InvalidPointer(ptr))?;
        let end = ptr.offset as usize + ptr.len as usize;
        let ok = match page.state {
            PageState::Small => end <= page.cursor as usize && page.holds(ptr.offset, ptr.len),
            PageState::LargeHead { .. } => ptr.offset == 0 && ptr.len == page.cursor,
            PageState::Free | PageState::LargeTail => false,
        };
        if !ok {
            return Err(HeapError::InvalidPointer(ptr));
        }
        Ok(())
    }

    /// Free an allocation.
    pub fn free(&mut self, ptr: HeapPtr) -> Result<(), HeapError> {
        self.check(ptr)?;
        self.allocations.remove(&ptr);

        let index = ptr.page as usize;
        match self.pages[index].state {
            PageState::Small => {
                let page = &mut self.pages[index];
                let start = ptr.offset as usize;
                page.data[start..start + ptr.len as usize].fill(0);
                page.slots.remove(&ptr.offset);
                if page.slots.is_empty() {
                    page.release();
                }
            }
            PageState::LargeHead { pages } => {
                let end = (index + pages as usize).min(self.pages.len());
                for page in &mut self.pages[index..end] {
                    page.release();
                }
            }
            PageState::Free | PageState::LargeTail => return Err(HeapError::InvalidPointer(ptr)),
        }
        Ok(())
    }

    /// Read access to an allocation.
    pub fn bytes(&self, ptr: HeapPtr) -> Result<&[u8], HeapError> {
        self.check(ptr)?;
        let start = ptr.offset as usize;
        Ok(&self.pages[ptr.page as usize].data[start..start + ptr.len as usize])
    }

    /// Write access to an allocation.
    pub fn bytes_mut(&mut self, ptr: HeapPtr) -> Result<&mut [u8], HeapError> {
        self.check(ptr)?;
        let start = ptr.offset as usize;
        Ok(&mut self.pages[ptr.page as usize].data[start..start + ptr.len as usize])
    }

    /// Free everything.
    pub fn reset(&mut self) {
        for page in &mut self.pages {
            page.release();
        }
        self.allocations.clear();
    }

    /// Make this heap a byte-identical copy of `src`.
    pub fn copy_from(&mut self, src: &FrameHeap) -> Result<(), HeapError> {
        if self.page_size != src.page_size || self.pages.len() != src.pages.len() {
            return Err(HeapError::GeometryMismatch);
        }
        for (dst, from) in self.pages.iter_mut().zip(&src.pages) {
            dst.clone_from(from);
        }
        self.allocations.clone_from(&src.allocations);
        self.tick = src.tick;
        Ok(())
    }

    // =========================================================================
    // INSTRUMENTATION
    // =========================================================================

    /// Mark the start of a simulated tick for leak attribution.
    pub fn begin_tick(&mut self, tick: i32) {
        self.tick = tick;
    }

    /// Recorded call site of a live allocation.
    pub fn allocation_site(&self, ptr: HeapPtr) -> Option<&'static Location<'static>> {
        self.allocations.get(&ptr).and_then(|r| r.site)
    }

    /// Tracked live allocations.
    pub fn live_allocations(&self) -> usize {
        self.allocations.len()
    }

    /// Allocations made during the current tick that are not in `roots`.
    pub fn leaks(&self, roots: &BTreeSet<HeapPtr>) -> Vec<LeakReport> {
        self.allocations
            .iter()
            .filter(|(ptr, rec)| rec.tick == self.tick && !roots.contains(ptr))
            .map(|(ptr, rec)| LeakReport {
                ptr: *ptr,
                tick: rec.tick,
                site: rec.site,
            })
            .collect()
    }

    /// Log every leak of the current tick. Returns the number found.
    pub fn report_leaks(&self, roots: &BTreeSet<HeapPtr>) -> usize {
        if self.config.tracking == HeapTrackingMode::Disabled {
            return 0;
        }
        let leaks = self.leaks(roots);
        for leak in &leaks {
            match leak.site {
                Some(site) => warn!(
                    tick = leak.tick,
                    page = leak.ptr.page,
                    offset = leak.ptr.offset,
                    len = leak.ptr.len,
                    "Heap leak allocated at {}:{}",
                    site.file(),
                    site.line()
                ),
                None => warn!(
                    tick = leak.tick,
                    page = leak.ptr.page,
                    offset = leak.ptr.offset,
                    len = leak.ptr.len,
                    "Heap leak"
                ),
            }
        }
        leaks.len()
    }
}

impl Serializable for FrameHeap {
    fn serialize(&mut self, stream: &mut BitStream) -> Result<(), StreamError> {
        let mut count = self.pages.len();
        stream.serialize_len(&mut count)?;
        if stream.is_reading() {
            if count != self.pages.len() {
                return Err(StreamError::Invalid(format!(
                    "heap has {} pages, stream has {}",
                    self.pages.len(),
                    count
                )));
            }
            // Tracking records describe this process's history, not the state.
            self.allocations.clear();
        }
        let page_size = self.page_size;
        let total = self.pages.len();
        for (index, page) in self.pages.iter_mut().enumerate() {
            page.serialize(stream, page_size, total - index)?;
        }
        if stream.is_reading() {
            self.validate_spans()?;
        }
        Ok(())
    }
}

impl FrameHeap {
    // Every large head must be followed by exactly its tail pages, and every
    // tail must belong to a head.
    fn validate_spans(&self) -> Result<(), StreamError> {
        let mut index = 0;
        while index < self.pages.len() {
            match self.pages[index].state {
                PageState::LargeHead { pages } => {
                    let end = index + pages as usize;
                    let tails_ok = end <= self.pages.len()
                        && self.pages[index + 1..end]
                            .iter()
                            .all(|p| p.state == PageState::LargeTail);
                    if !tails_ok {
                        return Err(StreamError::Invalid(format!(
                            "large allocation at page {index} spans {pages} pages"
                        )));
                    }
                    index = end;
                }
                PageState::LargeTail => {
                    return Err(StreamError::Invalid(format!("orphan large tail page {index}")));
                }
                PageState::Free | PageState::Small => index += 1,
            }
        }
        Ok(())
    }
}
