//! Fixed-size partitioning of `[0, total)`.
//!
//! Both the camera bulk read and the TCP sender walk an image in chunks of the
//! same shape: full-size chunks followed by one truncated remainder.

/// One span of a partitioned transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Chunk {
    pub offset: u32,
    pub len: u16,
    /// Set only on the span whose end reaches the total
    pub is_last: bool,
}

impl Chunk {
    #[inline]
    pub fn end(&self) -> u32 {
        self.offset + u32::from(self.len)
    }

    /// Byte range of this chunk within the whole transfer
    #[inline]
    pub fn range(&self) -> core::ops::Range<usize> {
        self.offset as usize..self.end() as usize
    }
}

/// Iterator over the chunks of `[0, total)`
#[derive(Debug, Clone)]
pub struct Chunks {
    total: u32,
    size: u16,
    offset: u32,
}

/// Partition `[0, total)` into chunks of `size` bytes
///
/// A `size` of zero yields nothing.
pub fn chunks(total: u32, size: u16) -> Chunks {
    Chunks {
        total,
        size,
        offset: 0,
    }
}

impl Iterator for Chunks {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        if self.size == 0 || self.offset >= self.total {
            return None;
        }
        let remaining = self.total - self.offset;
        let len = remaining.min(u32::from(self.size)) as u16;
        let chunk = Chunk {
            offset: self.offset,
            len,
            is_last: u32::from(len) == remaining,
        };
        self.offset += u32::from(len);
        Some(chunk)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = if self.size == 0 {
            0
        } else {
            (self.total - self.offset.min(self.total)).div_ceil(u32::from(self.size)) as usize
        };
        (n, Some(n))
    }
}

impl ExactSizeIterator for Chunks {}
