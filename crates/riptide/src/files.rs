use std::path::PathBuf;

use riptide_core::layout::{ChunkIndex, Layout};
use riptide_core::metainfo::Metainfo;
use riptide_core::Bitfield;

use crate::selector::PriorityRanges;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    Off,
    #[default]
    Normal,
    High,
}

/// One logical file within the concatenated torrent byte stream.
#[derive(Debug)]
pub struct File {
    pub path: PathBuf,

    /// Byte range `[position, position + size)` in the torrent.
    pub position: u64,
    pub size: u64,

    /// Chunk range `[first, last)`; a boundary chunk can belong to two
    /// files.
    pub range: std::ops::Range<u32>,

    pub priority: Priority,
    pub prioritize_first: bool,
    pub prioritize_last: bool,

    /// How many chunks overlapping this file have been verified.
    pub completed_chunks: u32,
}

impl File {
    fn overlaps(&self, chunk: u32) -> bool {
        self.range.contains(&chunk)
    }
}

/// The ordered files of a torrent plus the canonical completed-chunk
/// bitfield. Files are contiguous and cover `[0, total_bytes)`.
#[derive(Debug)]
pub struct FileList {
    layout: Layout,
    files: Vec<File>,
    completed: Bitfield,
}

impl FileList {
    pub fn from_metainfo(meta: &Metainfo, layout: Layout) -> Self {
        let mut files = Vec::with_capacity(meta.files.len());
        let mut position = 0u64;
        for mf in &meta.files {
            let mut path = PathBuf::new();
            if mf.path.is_empty() {
                path.push(&meta.name);
            } else {
                for part in &mf.path {
                    path.push(part);
                }
            }
            files.push(File {
                path,
                position,
                size: mf.length,
                range: layout.chunks_spanning(position, mf.length),
                priority: Priority::Normal,
                prioritize_first: false,
                prioritize_last: false,
                completed_chunks: 0,
            });
            position += mf.length;
        }
        FileList {
            completed: Bitfield::with_size(layout.total_chunks() as usize),
            layout,
            files,
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn files(&self) -> &[File] {
        &self.files
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// The canonical completed-chunk bitfield, wire-ready.
    pub fn bitfield(&self) -> &Bitfield {
        &self.completed
    }

    pub fn is_done(&self) -> bool {
        self.completed.is_all_set()
    }

    pub fn set_priority(&mut self, file_index: usize, priority: Priority) {
        if let Some(f) = self.files.get_mut(file_index) {
            f.priority = priority;
        }
    }

    pub fn set_prioritize_first(&mut self, file_index: usize, value: bool) {
        if let Some(f) = self.files.get_mut(file_index) {
            f.prioritize_first = value;
        }
    }

    pub fn set_prioritize_last(&mut self, file_index: usize, value: bool) {
        if let Some(f) = self.files.get_mut(file_index) {
            f.prioritize_last = value;
        }
    }

    /// Marks a chunk verified, advancing the counter of every overlapped
    /// file. Idempotent: a chunk only ever counts once.
    pub fn mark_completed(&mut self, index: ChunkIndex) -> bool {
        if self.completed.get(index.get() as usize) {
            return false;
        }
        self.completed.set(index.get() as usize);
        for f in self.files.iter_mut() {
            if f.overlaps(index.get()) {
                f.completed_chunks += 1;
            }
        }
        true
    }

    /// Replaces the bitfield wholesale (initial hash check, resume) and
    /// recomputes per-file counters.
    pub fn set_completed(&mut self, completed: Bitfield) {
        debug_assert_eq!(completed.size_bits(), self.completed.size_bits());
        self.completed = completed;
        for f in self.files.iter_mut() {
            f.completed_chunks = f
                .range
                .clone()
                .filter(|i| self.completed.get(*i as usize))
                .count() as u32;
        }
    }

    /// Verified bytes across all files. Boundary chunks contribute to each
    /// file only the bytes that fall inside it.
    pub fn completed_bytes(&self) -> u64 {
        self.files
            .iter()
            .map(|f| {
                f.range
                    .clone()
                    .filter(|i| self.completed.get(*i as usize))
                    .map(|i| {
                        // Indices in a file range are valid by construction.
                        let chunk = self.layout.validate_chunk(i).unwrap();
                        self.layout.chunk_bytes_within(chunk, f.position, f.size)
                    })
                    .sum::<u64>()
            })
            .sum()
    }

    pub fn remaining_bytes(&self) -> u64 {
        self.layout.total_bytes() - self.completed_bytes()
    }

    /// Derives the {normal, high} range sets that seed the chunk selector.
    /// `prioritize_first`/`prioritize_last` promote a file's boundary
    /// chunks to high.
    pub fn priority_ranges(&self) -> (PriorityRanges, PriorityRanges) {
        let mut normal = PriorityRanges::new();
        let mut high = PriorityRanges::new();
        for f in &self.files {
            match f.priority {
                Priority::Off => continue,
                Priority::Normal => normal.insert(f.range.clone()),
                Priority::High => high.insert(f.range.clone()),
            }
            if f.range.is_empty() {
                continue;
            }
            if f.prioritize_first {
                high.insert(f.range.start..f.range.start + 1);
            }
            if f.prioritize_last {
                high.insert(f.range.end - 1..f.range.end);
            }
        }
        (normal, high)
    }
}
