/// A power-of-two edge length, stored as its bit count together with the derived size and mask.
///
/// One `BitSize` describes how many units of one granularity fit along an axis of the next
/// (blocks per chunk, chunks per region, blocks per region).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct BitSize {
    pub bits: u32,
    pub size: i32,
    pub mask: i32,
}

impl BitSize {
    pub const fn new(bits: u32) -> Self {
        assert!(bits < 31, "bit size must leave room for the sign bit");
        let size = 1i32 << bits;
        Self {
            bits,
            size,
            mask: size - 1,
        }
    }

    /// Size whose edge spans `self` units of `inner`.
    pub const fn combine(self, inner: BitSize) -> Self {
        Self::new(self.bits + inner.bits)
    }

    /// Number of cells in a cube with this edge length.
    pub const fn volume(self) -> usize {
        1usize << (self.bits * 3)
    }

    #[inline]
    pub const fn container_coord(self, full: i32) -> i32 {
        full >> self.bits
    }

    #[inline]
    pub const fn local_coord(self, full: i32) -> i32 {
        full & self.mask
    }

    #[inline]
    pub const fn base_coord(self, full: i32) -> i32 {
        full & !self.mask
    }

    /// Inverse of [`container_coord`](Self::container_coord) for the first cell.
    #[inline]
    pub const fn container_base(self, container: i32) -> i32 {
        container << self.bits
    }
}
