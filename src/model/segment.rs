//! Segments of a loaded image.

use bitflags::bitflags;

bitflags! {
    /// Memory protection and paging attributes of a segment.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SegmentFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
        /// May be paged out (PE sections without `IMAGE_SCN_MEM_NOT_PAGED`).
        const PAGED = 1 << 3;
    }
}

/// Number of bytes a segment occupies in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhysicalSize {
    /// A fixed byte count.
    Fixed(u64),
    /// Grows with the data; used by segments this tool creates.
    Grow,
}

/// A contiguous range of the image's virtual address space.
///
/// Holds the file-backed bytes of the range so transformations can patch them in
/// place before the codec writes them back.
#[derive(Debug, Clone)]
pub struct Segment {
    /// Name of the segment (e.g. ".text", "__TEXT").
    pub name: String,
    /// The virtual address where this segment starts in memory.
    pub address: u64,
    /// Virtual size in bytes.
    pub size: u64,
    /// Offset of the first file-backed byte, relative to the image start.
    pub offset: u64,
    /// File-backed size.
    pub physical_size: PhysicalSize,
    pub flags: SegmentFlags,
    /// The file-backed bytes.
    pub data: Vec<u8>,
    /// Position of this segment's header entry in the container, if it came from one.
    pub header_index: Option<usize>,
}

impl Segment {
    pub fn new(
        name: impl Into<String>,
        address: u64,
        size: u64,
        offset: u64,
        data: Vec<u8>,
        flags: SegmentFlags,
    ) -> Self {
        Self {
            name: name.into(),
            address,
            size,
            offset,
            physical_size: PhysicalSize::Fixed(data.len() as u64),
            flags,
            data,
            header_index: None,
        }
    }

    pub fn end(&self) -> u64 {
        self.address.saturating_add(self.size)
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.address && address < self.end()
    }

    pub fn overlaps(&self, other: &Segment) -> bool {
        self.size > 0 && other.size > 0 && self.address < other.end() && other.address < self.end()
    }

    /// Bytes this segment occupies in the file.
    pub fn physical_len(&self) -> u64 {
        match self.physical_size {
            PhysicalSize::Fixed(n) => n,
            PhysicalSize::Grow => self.data.len() as u64,
        }
    }

    pub fn file_end(&self) -> u64 {
        self.offset + self.physical_len()
    }
}
