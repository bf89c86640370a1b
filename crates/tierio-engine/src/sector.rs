//! Mapping of byte ranges onto logical sectors

/// The part of one logical sector touched by a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectorRange {
    /// Logical sector number
    pub logical: u64,
    /// Byte offset within the sector
    pub offset_in_sector: usize,
    /// Number of bytes in this range
    pub length: usize,
    /// Byte offset of this range within the request buffer
    pub buf_offset: usize,
}

impl SectorRange {
    /// Whether the range covers its sector completely
    #[must_use]
    pub const fn is_full(&self, blocksize: u32) -> bool {
        self.offset_in_sector == 0 && self.length == blocksize as usize
    }
}

/// Splits requests on sector boundaries
///
/// ```text
/// request:   |----------- offset .. offset + length -----------|
/// sectors: |    n    |   n+1   |   n+2   |   n+3   |
///             ^^^^^^^ ^^^^^^^^^ ^^^^^^^^^ ^^^^
///             partial    full      full   partial
/// ```
#[derive(Debug, Clone, Copy)]
pub struct SectorMapper {
    blocksize: u64,
}

impl SectorMapper {
    #[must_use]
    pub fn new(blocksize: u32) -> Self {
        Self {
            blocksize: u64::from(blocksize.max(1)),
        }
    }

    /// Sectors touched by `length` bytes starting at byte `offset`
    #[must_use]
    pub fn sectors_spanned(&self, offset: u64, length: u64) -> u64 {
        if length == 0 {
            return 0;
        }
        let first = offset / self.blocksize;
        let last = (offset + length - 1) / self.blocksize;
        last - first + 1
    }

    /// Byte range to per-sector ranges, in ascending sector order
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn byte_range_to_sectors(&self, offset: u64, length: u64) -> Vec<SectorRange> {
        let mut ranges = Vec::with_capacity(self.sectors_spanned(offset, length) as usize);
        let end = offset + length;
        let mut current = offset;

        while current < end {
            let logical = current / self.blocksize;
            let sector_start = logical * self.blocksize;
            let offset_in_sector = current - sector_start;
            let length = (self.blocksize - offset_in_sector).min(end - current);

            ranges.push(SectorRange {
                logical,
                offset_in_sector: offset_in_sector as usize,
                length: length as usize,
                buf_offset: (current - offset) as usize,
            });
            current += length;
        }

        ranges
    }
}
