use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::Context;
use parking_lot::Mutex;
use riptide_core::layout::{ChunkIndex, Layout};
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};

/// One mapped chunk region. How the bytes reach the filesystem is the
/// mapping's business; the store only drives `sync`.
pub trait ChunkMapping: Send {
    fn as_slice(&self) -> &[u8];
    fn as_mut_slice(&mut self) -> &mut [u8];
    fn sync(&mut self) -> anyhow::Result<()>;
}

/// Creates chunk mappings on demand. Injected into the store so embedders
/// can swap storage strategies.
pub trait ChunkSource: Send + Sync {
    fn create(
        &self,
        index: ChunkIndex,
        len: u32,
        writable: bool,
    ) -> anyhow::Result<Box<dyn ChunkMapping>>;
}

/// Errors the store cannot handle locally (mmap failures, disk full) are
/// reported here; the download reacts by stopping.
pub type StorageErrorSink = Box<dyn Fn(&anyhow::Error) + Send + Sync>;

#[derive(Debug, Clone, Copy, Default)]
pub struct GetFlags {
    pub write: bool,

    /// Fail instead of handing out a chunk that is queued for hashing.
    pub not_hashing: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SyncFlags {
    /// Sync dirty chunks even while handles are outstanding.
    pub all: bool,

    /// Sync chunks flushed within the damping window too. Shutdown and
    /// storage-error paths set this; periodic passes leave it off.
    pub force: bool,

    /// Skip mappings that are momentarily locked instead of waiting.
    pub sloppy: bool,

    /// Swallow sync errors instead of reporting them to the sink.
    pub ignore_error: bool,
}

/// A chunk that was flushed this recently is left alone by non-forced sync
/// passes, so the periodic tick doesn't thrash msync on hot chunks.
const SYNC_DAMP_WINDOW: Duration = Duration::from_secs(60);

type SharedMapping = Arc<Mutex<Box<dyn ChunkMapping>>>;

struct Node {
    mapping: SharedMapping,
    len: u32,
    refcount: u32,
    writable: bool,
    dirty: bool,
    hashing: bool,
    last_use: u64,
    last_sync: Option<Instant>,
}

struct Inner {
    nodes: HashMap<u32, Node>,
    mapped_bytes: u64,
    clock: u64,
}

struct Shared {
    layout: Layout,
    source: Box<dyn ChunkSource>,
    budget: u64,
    error_sink: StorageErrorSink,
    inner: Mutex<Inner>,
}

/// Maps chunk indices to refcounted memory regions under a byte budget.
///
/// When the budget is exceeded, unreferenced chunks are evicted, dirty ones
/// synced first. Release happens on [`ChunkHandle`] drop; that is the only
/// path back to unmap eligibility.
pub struct ChunkStore {
    shared: Arc<Shared>,
}

impl ChunkStore {
    pub fn new(
        layout: Layout,
        source: Box<dyn ChunkSource>,
        budget: u64,
        error_sink: StorageErrorSink,
    ) -> Self {
        ChunkStore {
            shared: Arc::new(Shared {
                layout,
                source,
                budget,
                error_sink,
                inner: Mutex::new(Inner {
                    nodes: HashMap::new(),
                    mapped_bytes: 0,
                    clock: 0,
                }),
            }),
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.shared.layout
    }

    pub fn mapped_bytes(&self) -> u64 {
        self.shared.inner.lock().mapped_bytes
    }

    pub fn get(&self, index: ChunkIndex, flags: GetFlags) -> Result<ChunkHandle> {
        let shared = &self.shared;
        let len = shared.layout.chunk_len(index);
        let mut inner = shared.inner.lock();
        inner.clock += 1;
        let clock = inner.clock;

        if let Some(node) = inner.nodes.get_mut(&index.get()) {
            if flags.not_hashing && node.hashing {
                return Err(Error::ChunkBusyHashing(index.get()));
            }
            if flags.write && !node.writable {
                if node.refcount > 0 {
                    return Err(Error::ChunkPinned(index.get()));
                }
                // Remap read-only regions writable on demand.
                let mapping = shared
                    .source
                    .create(index, len, true)
                    .inspect_err(|e| (shared.error_sink)(e))
                    .map_err(Error::Storage)?;
                node.mapping = Arc::new(Mutex::new(mapping));
                node.writable = true;
            }
            node.refcount += 1;
            node.last_use = clock;
            return Ok(ChunkHandle {
                shared: shared.clone(),
                mapping: node.mapping.clone(),
                index,
                len,
                writable: node.writable && flags.write,
                dirty: AtomicBool::new(false),
            });
        }

        if flags.write
            && shared.budget > 0
            && inner.mapped_bytes + len as u64 > shared.budget
            && !Self::evict(shared, &mut inner, len as u64)
        {
            // Every mapped chunk is pinned; admission control pushes the
            // writer back instead of blowing the budget.
            return Err(Error::ChunkBudgetExceeded);
        }

        let mapping = shared
            .source
            .create(index, len, flags.write)
            .inspect_err(|e| (shared.error_sink)(e))
            .map_err(Error::Storage)?;
        let mapping = Arc::new(Mutex::new(mapping));
        inner.nodes.insert(
            index.get(),
            Node {
                mapping: mapping.clone(),
                len,
                refcount: 1,
                writable: flags.write,
                dirty: false,
                hashing: false,
                last_use: clock,
                last_sync: None,
            },
        );
        inner.mapped_bytes += len as u64;
        trace!(chunk = index.get(), len, "mapped chunk");
        Ok(ChunkHandle {
            shared: shared.clone(),
            mapping,
            index,
            len,
            writable: flags.write,
            dirty: AtomicBool::new(false),
        })
    }

    /// Marks a chunk as queued for hashing so `not_hashing` getters stay
    /// away from it.
    pub fn set_hashing(&self, index: ChunkIndex, hashing: bool) {
        if let Some(node) = self.shared.inner.lock().nodes.get_mut(&index.get()) {
            node.hashing = hashing;
        }
    }

    /// Flushes dirty mappings per `flags`. Errors go to the sink unless
    /// `ignore_error`.
    pub fn sync_chunks(&self, flags: SyncFlags) {
        let shared = &self.shared;
        let mut inner = shared.inner.lock();
        for (index, node) in inner.nodes.iter_mut() {
            if !node.dirty {
                continue;
            }
            if node.refcount > 0 && !flags.all {
                continue;
            }
            if !flags.force
                && node
                    .last_sync
                    .is_some_and(|at| at.elapsed() < SYNC_DAMP_WINDOW)
            {
                continue;
            }
            let result = if flags.sloppy {
                match node.mapping.try_lock() {
                    Some(mut m) => m.sync(),
                    None => continue,
                }
            } else {
                node.mapping.lock().sync()
            };
            match result {
                Ok(()) => {
                    node.dirty = false;
                    node.last_sync = Some(Instant::now());
                }
                Err(e) => {
                    warn!(chunk = index, "sync failed: {e:#}");
                    if !flags.ignore_error {
                        (shared.error_sink)(&e);
                    }
                }
            }
        }
    }

    /// Evicts unreferenced chunks, LRU first and dirty ones synced, until
    /// `wanted` bytes fit the budget. Returns whether they do.
    fn evict(shared: &Shared, inner: &mut Inner, wanted: u64) -> bool {
        let mut victims: Vec<(u64, u32)> = inner
            .nodes
            .iter()
            .filter(|(_, n)| n.refcount == 0 && !n.hashing)
            .map(|(i, n)| (n.last_use, *i))
            .collect();
        victims.sort_unstable();

        for (_, index) in victims {
            if inner.mapped_bytes + wanted <= shared.budget {
                break;
            }
            let Some(node) = inner.nodes.get(&index) else {
                continue;
            };
            if node.dirty {
                if let Err(e) = node.mapping.lock().sync() {
                    (shared.error_sink)(&e);
                    continue;
                }
            }
            let node = inner.nodes.remove(&index).expect("checked above");
            inner.mapped_bytes -= node.len as u64;
            debug!(chunk = index, "evicted chunk mapping");
        }
        inner.mapped_bytes + wanted <= shared.budget
    }

    fn release(shared: &Arc<Shared>, index: ChunkIndex, dirty: bool) {
        let mut inner = shared.inner.lock();
        if let Some(node) = inner.nodes.get_mut(&index.get()) {
            node.dirty |= dirty;
            node.refcount = node.refcount.saturating_sub(1);
        }
        if shared.budget > 0 && inner.mapped_bytes > shared.budget {
            Self::evict(shared, &mut inner, 0);
        }
    }
}

/// Owning borrow of a mapped chunk. Dropping the handle releases the
/// refcount; writes mark the chunk dirty so eviction syncs it.
pub struct ChunkHandle {
    shared: Arc<Shared>,
    mapping: SharedMapping,
    index: ChunkIndex,
    len: u32,
    writable: bool,
    dirty: AtomicBool,
}

impl ChunkHandle {
    pub fn index(&self) -> ChunkIndex {
        self.index
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn write(&self, offset: u32, data: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(Error::Storage(anyhow::anyhow!(
                "write through a read-only chunk handle"
            )));
        }
        let mut m = self.mapping.lock();
        let start = offset as usize;
        let end = start + data.len();
        let slice = m.as_mut_slice();
        if end > slice.len() {
            return Err(Error::Storage(anyhow::anyhow!(
                "write past end of chunk {}: {}..{} > {}",
                self.index,
                start,
                end,
                slice.len()
            )));
        }
        slice[start..end].copy_from_slice(data);
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    pub fn read_into(&self, offset: u32, out: &mut [u8]) {
        let m = self.mapping.lock();
        let start = offset as usize;
        out.copy_from_slice(&m.as_slice()[start..start + out.len()]);
    }

    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let m = self.mapping.lock();
        f(m.as_slice())
    }

    /// Compares incoming bytes against the captured region; used to decide
    /// whether a trailing transfer agrees with the leader.
    pub fn matches(&self, offset: u32, data: &[u8]) -> bool {
        let m = self.mapping.lock();
        let start = offset as usize;
        m.as_slice()
            .get(start..start + data.len())
            .is_some_and(|s| s == data)
    }
}

impl Drop for ChunkHandle {
    fn drop(&mut self) {
        ChunkStore::release(&self.shared, self.index, self.dirty.load(Ordering::Acquire));
    }
}

impl std::fmt::Debug for ChunkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ChunkHandle({}, {} bytes)", self.index, self.len)
    }
}

// --- In-tree sources -----------------------------------------------------

/// Per-chunk slice of the spanned files: `(file id, offset in file, len)`.
#[derive(Debug, Clone)]
struct FileSegment {
    file: usize,
    offset: u64,
    len: usize,
}

/// File-backed source. Chunks wholly inside one file at a page-aligned
/// offset get a real memory map; chunks spanning files (or misaligned) use
/// a buffered read-modify-write mapping.
pub struct FileChunkSource {
    layout: Layout,
    files: Vec<(Arc<Mutex<std::fs::File>>, u64, u64)>,
}

const PAGE: u64 = 4096;

impl FileChunkSource {
    /// Opens or creates every file under `root`, pre-sized to its final
    /// length.
    pub fn open(
        root: &std::path::Path,
        layout: Layout,
        files: impl IntoIterator<Item = (PathBuf, u64)>,
    ) -> anyhow::Result<Self> {
        let mut out = Vec::new();
        let mut position = 0u64;
        for (path, size) in files {
            let full = root.join(&path);
            if let Some(parent) = full.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("error creating {parent:?}"))?;
            }
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&full)
                .with_context(|| format!("error opening {full:?}"))?;
            if file.metadata()?.len() < size {
                file.set_len(size)
                    .with_context(|| format!("error sizing {full:?}"))?;
            }
            out.push((Arc::new(Mutex::new(file)), position, size));
            position += size;
        }
        anyhow::ensure!(
            position == layout.total_bytes(),
            "files cover {position} bytes, layout says {}",
            layout.total_bytes()
        );
        Ok(FileChunkSource { layout, files: out })
    }

    fn segments(&self, index: ChunkIndex, len: u32) -> Vec<FileSegment> {
        let chunk_start = self.layout.chunk_offset(index);
        let chunk_end = chunk_start + len as u64;
        let mut segs = Vec::new();
        for (id, (_, position, size)) in self.files.iter().enumerate() {
            let start = chunk_start.max(*position);
            let end = chunk_end.min(position + size);
            if start < end {
                segs.push(FileSegment {
                    file: id,
                    offset: start - position,
                    len: (end - start) as usize,
                });
            }
        }
        segs
    }
}

impl ChunkSource for FileChunkSource {
    fn create(
        &self,
        index: ChunkIndex,
        len: u32,
        writable: bool,
    ) -> anyhow::Result<Box<dyn ChunkMapping>> {
        let segs = self.segments(index, len);
        anyhow::ensure!(
            segs.iter().map(|s| s.len).sum::<usize>() == len as usize,
            "chunk {index} does not cover its length"
        );

        if let [seg] = segs.as_slice()
            && seg.offset % PAGE == 0
        {
            let file = self.files[seg.file].0.lock();
            // Mapping stays valid after the guard drops; the fd is only
            // needed at mmap time.
            let mmap = unsafe {
                memmap2::MmapOptions::new()
                    .offset(seg.offset)
                    .len(seg.len)
                    .map_mut(&*file)
            }
            .context("mmap failed")?;
            let _ = writable;
            return Ok(Box::new(MmapChunk { mmap }));
        }

        // Spanning or misaligned chunk: buffered fallback.
        let mut buf = vec![0u8; len as usize];
        let mut at = 0usize;
        for seg in &segs {
            let mut f = self.files[seg.file].0.lock();
            f.seek(SeekFrom::Start(seg.offset))?;
            f.read_exact(&mut buf[at..at + seg.len])?;
            at += seg.len;
        }
        Ok(Box::new(BufferedChunk {
            buf,
            segs,
            files: self.files.iter().map(|(f, _, _)| f.clone()).collect(),
        }))
    }
}

struct MmapChunk {
    mmap: memmap2::MmapMut,
}

impl ChunkMapping for MmapChunk {
    fn as_slice(&self) -> &[u8] {
        &self.mmap
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.mmap
    }

    fn sync(&mut self) -> anyhow::Result<()> {
        self.mmap.flush().context("msync failed")
    }
}

struct BufferedChunk {
    buf: Vec<u8>,
    segs: Vec<FileSegment>,
    files: Vec<Arc<Mutex<std::fs::File>>>,
}

impl ChunkMapping for BufferedChunk {
    fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    fn sync(&mut self) -> anyhow::Result<()> {
        let mut at = 0usize;
        for seg in &self.segs {
            let mut f = self.files[seg.file].lock();
            f.seek(SeekFrom::Start(seg.offset))?;
            f.write_all(&self.buf[at..at + seg.len])?;
            f.sync_data()?;
            at += seg.len;
        }
        Ok(())
    }
}

/// Heap-backed source for tests and diskless runs. Contents survive
/// unmap/remap cycles through the shared backing map.
#[derive(Default)]
pub struct MemoryChunkSource {
    store: Arc<Mutex<HashMap<u32, Vec<u8>>>>,
}

impl MemoryChunkSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self, index: u32) -> Option<Vec<u8>> {
        self.store.lock().get(&index).cloned()
    }

    pub fn preload(&self, index: u32, data: Vec<u8>) {
        self.store.lock().insert(index, data);
    }

    pub fn shared(&self) -> Self {
        MemoryChunkSource {
            store: self.store.clone(),
        }
    }
}

impl ChunkSource for MemoryChunkSource {
    fn create(
        &self,
        index: ChunkIndex,
        len: u32,
        _writable: bool,
    ) -> anyhow::Result<Box<dyn ChunkMapping>> {
        let mut buf = self
            .store
            .lock()
            .get(&index.get())
            .cloned()
            .unwrap_or_default();
        buf.resize(len as usize, 0);
        Ok(Box::new(MemoryChunk {
            index: index.get(),
            buf,
            store: self.store.clone(),
        }))
    }
}

struct MemoryChunk {
    index: u32,
    buf: Vec<u8>,
    store: Arc<Mutex<HashMap<u32, Vec<u8>>>>,
}

impl ChunkMapping for MemoryChunk {
    fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    fn sync(&mut self) -> anyhow::Result<()> {
        self.store.lock().insert(self.index, self.buf.clone());
        Ok(())
    }
}
