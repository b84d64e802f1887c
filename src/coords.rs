use crate::bit_size::BitSize;
use cgmath::Vector3;
use std::fmt;

/// Blocks along one edge of a chunk.
pub const CHUNK_BLOCKS: BitSize = BitSize::new(4);
/// Chunks along one edge of a region.
pub const REGION_CHUNKS: BitSize = BitSize::new(4);
/// Blocks along one edge of a region.
pub const REGION_BLOCKS: BitSize = REGION_CHUNKS.combine(CHUNK_BLOCKS);
/// Chunk slots in one region file.
pub const REGION_VOLUME: usize = REGION_CHUNKS.volume(); // 4096

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct BlockPos {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ChunkPos {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct RegionPos {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

macro_rules! impl_vector_conversions {
    ($($pos:ident),*) => {
        $(
            impl $pos {
                pub const fn new(x: i32, y: i32, z: i32) -> Self {
                    Self { x, y, z }
                }

                pub fn to_vector(self) -> Vector3<i32> {
                    Vector3::new(self.x, self.y, self.z)
                }
            }

            impl From<Vector3<i32>> for $pos {
                fn from(v: Vector3<i32>) -> Self {
                    Self::new(v.x, v.y, v.z)
                }
            }

            impl From<$pos> for Vector3<i32> {
                fn from(pos: $pos) -> Self {
                    pos.to_vector()
                }
            }
        )*
    };
}

impl_vector_conversions!(BlockPos, ChunkPos, RegionPos);

/// Slot of a chunk inside its region file, packed as `x << 8 | y << 4 | z`.
///
/// Ascending indices visit chunks in the same x-major order as [`RegionPos::chunks`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalIndex(u16);

impl LocalIndex {
    pub fn from_local(x: i32, y: i32, z: i32) -> Self {
        let x = REGION_CHUNKS.local_coord(x);
        let y = REGION_CHUNKS.local_coord(y);
        let z = REGION_CHUNKS.local_coord(z);
        let bits = REGION_CHUNKS.bits;
        Self(((x << (bits * 2)) | (y << bits) | z) as u16)
    }

    pub fn from_index(index: usize) -> Option<Self> {
        (index < REGION_VOLUME).then_some(Self(index as u16))
    }

    #[inline]
    pub fn get(self) -> usize {
        self.0 as usize
    }

    /// Local chunk coordinates in `[0, 16)` this index was packed from.
    pub fn local_coords(self) -> [i32; 3] {
        let packed = self.0 as i32;
        let bits = REGION_CHUNKS.bits;
        [
            (packed >> (bits * 2)) & REGION_CHUNKS.mask,
            (packed >> bits) & REGION_CHUNKS.mask,
            packed & REGION_CHUNKS.mask,
        ]
    }
}

impl From<LocalIndex> for usize {
    fn from(index: LocalIndex) -> Self {
        index.get()
    }
}

impl fmt::Display for LocalIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [x, y, z] = self.local_coords();
        write!(f, "{} ({x},{y},{z})", self.0)
    }
}

pub fn compute_region_coordinate(chunk_x: i32, chunk_y: i32, chunk_z: i32) -> RegionPos {
    ChunkPos::new(chunk_x, chunk_y, chunk_z).region()
}

pub fn compute_local_index(chunk_x: i32, chunk_y: i32, chunk_z: i32) -> LocalIndex {
    LocalIndex::from_local(chunk_x, chunk_y, chunk_z)
}

impl BlockPos {
    pub fn chunk(self) -> ChunkPos {
        ChunkPos::new(
            CHUNK_BLOCKS.container_coord(self.x),
            CHUNK_BLOCKS.container_coord(self.y),
            CHUNK_BLOCKS.container_coord(self.z),
        )
    }

    pub fn region(self) -> RegionPos {
        RegionPos::new(
            REGION_BLOCKS.container_coord(self.x),
            REGION_BLOCKS.container_coord(self.y),
            REGION_BLOCKS.container_coord(self.z),
        )
    }

    /// Position within the owning chunk, each axis in `[0, 16)`.
    pub fn local_in_chunk(self) -> [i32; 3] {
        [
            CHUNK_BLOCKS.local_coord(self.x),
            CHUNK_BLOCKS.local_coord(self.y),
            CHUNK_BLOCKS.local_coord(self.z),
        ]
    }

    /// First block of the owning chunk.
    pub fn chunk_base(self) -> BlockPos {
        BlockPos::new(
            CHUNK_BLOCKS.base_coord(self.x),
            CHUNK_BLOCKS.base_coord(self.y),
            CHUNK_BLOCKS.base_coord(self.z),
        )
    }
}

impl ChunkPos {
    pub fn region(self) -> RegionPos {
        RegionPos::new(
            REGION_CHUNKS.container_coord(self.x),
            REGION_CHUNKS.container_coord(self.y),
            REGION_CHUNKS.container_coord(self.z),
        )
    }

    pub fn local_index(self) -> LocalIndex {
        LocalIndex::from_local(self.x, self.y, self.z)
    }

    pub fn base_block(self) -> BlockPos {
        BlockPos::new(
            CHUNK_BLOCKS.container_base(self.x),
            CHUNK_BLOCKS.container_base(self.y),
            CHUNK_BLOCKS.container_base(self.z),
        )
    }

    /// World position of a block given in chunk-local coordinates; out of range input wraps.
    pub fn block(self, x: i32, y: i32, z: i32) -> BlockPos {
        let base = self.base_block();
        BlockPos::new(
            base.x + CHUNK_BLOCKS.local_coord(x),
            base.y + CHUNK_BLOCKS.local_coord(y),
            base.z + CHUNK_BLOCKS.local_coord(z),
        )
    }

    pub fn contains_block(self, block: BlockPos) -> bool {
        block.chunk() == self
    }

    pub fn offset(self, dx: i32, dy: i32, dz: i32) -> ChunkPos {
        ChunkPos::new(self.x + dx, self.y + dy, self.z + dz)
    }
}

impl RegionPos {
    pub fn base_chunk(self) -> ChunkPos {
        ChunkPos::new(
            REGION_CHUNKS.container_base(self.x),
            REGION_CHUNKS.container_base(self.y),
            REGION_CHUNKS.container_base(self.z),
        )
    }

    pub fn base_block(self) -> BlockPos {
        BlockPos::new(
            REGION_BLOCKS.container_base(self.x),
            REGION_BLOCKS.container_base(self.y),
            REGION_BLOCKS.container_base(self.z),
        )
    }

    /// World position of the chunk stored in `index`.
    pub fn chunk_at(self, index: LocalIndex) -> ChunkPos {
        let [x, y, z] = index.local_coords();
        let base = self.base_chunk();
        ChunkPos::new(base.x + x, base.y + y, base.z + z)
    }

    pub fn contains_chunk(self, chunk: ChunkPos) -> bool {
        chunk.region() == self
    }

    pub fn contains_block(self, block: BlockPos) -> bool {
        block.region() == self
    }

    /// Every chunk position of this region in ascending [`LocalIndex`] order.
    pub fn chunks(self) -> impl Iterator<Item = ChunkPos> {
        (0..REGION_VOLUME).map(move |index| self.chunk_at(LocalIndex(index as u16)))
    }

    pub fn file_name(self, extension: &str) -> String {
        format!("r.{}.{}.{}.{extension}", self.x, self.y, self.z)
    }

    /// Parses names produced by [`file_name`](Self::file_name), e.g. `r.0.-1.3.srf`.
    pub fn from_file_name(name: &str, extension: &str) -> Option<Self> {
        let mut parts = name.split('.');
        if parts.next()? != "r" {
            return None;
        }
        let x = parts.next()?.parse().ok()?;
        let y = parts.next()?.parse().ok()?;
        let z = parts.next()?.parse().ok()?;
        if parts.next()? != extension || parts.next().is_some() {
            return None;
        }
        Some(Self::new(x, y, z))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composed_region_size_is_256_blocks() {
        assert_eq!(REGION_BLOCKS.size, 256);
        assert_eq!(REGION_VOLUME, 4096);
    }

    #[test]
    fn local_index_round_trips_every_slot() {
        for index in 0..REGION_VOLUME {
            let local = LocalIndex::from_index(index).expect("index in range");
            let [x, y, z] = local.local_coords();
            assert_eq!(LocalIndex::from_local(x, y, z), local);
            assert_eq!(local.get(), index);
        }
        assert!(LocalIndex::from_index(REGION_VOLUME).is_none());
    }

    #[test]
    fn negative_chunks_map_to_negative_regions() {
        let chunk = ChunkPos::new(-1, -16, -17);
        assert_eq!(chunk.region(), RegionPos::new(-1, -1, -2));
        assert_eq!(chunk.local_index().local_coords(), [15, 0, 15]);
        assert_eq!(
            compute_region_coordinate(-1, -16, -17),
            RegionPos::new(-1, -1, -2)
        );
        assert_eq!(compute_local_index(-1, -16, -17), chunk.local_index());
    }

    #[test]
    fn region_chunk_at_inverts_local_index() {
        for chunk in [
            ChunkPos::new(0, 0, 0),
            ChunkPos::new(31, -5, 700),
            ChunkPos::new(-33, 16, -1),
        ] {
            let region = chunk.region();
            assert!(region.contains_chunk(chunk));
            assert_eq!(region.chunk_at(chunk.local_index()), chunk);
        }
    }

    #[test]
    fn region_chunks_follow_local_index_order() {
        let region = RegionPos::new(2, -1, 0);
        let chunks: Vec<_> = region.chunks().collect();
        assert_eq!(chunks.len(), REGION_VOLUME);
        assert_eq!(chunks[0], region.base_chunk());
        assert_eq!(chunks[1], region.base_chunk().offset(0, 0, 1));
        assert_eq!(chunks[16], region.base_chunk().offset(0, 1, 0));
        assert_eq!(chunks[256], region.base_chunk().offset(1, 0, 0));
        for (index, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.local_index().get(), index);
        }
    }

    #[test]
    fn block_helpers_agree_with_chunk_and_region_bases() {
        let block = BlockPos::new(-1, 257, 31);
        assert_eq!(block.chunk(), ChunkPos::new(-1, 16, 1));
        assert_eq!(block.region(), RegionPos::new(-1, 1, 0));
        assert_eq!(block.local_in_chunk(), [15, 1, 15]);
        assert_eq!(block.chunk_base(), BlockPos::new(-16, 256, 16));
        assert_eq!(block.chunk().base_block(), block.chunk_base());
        assert_eq!(block.chunk().block(15, 1, 15), block);
        assert!(block.chunk().contains_block(block));
        assert!(block.region().contains_block(block));
        assert_eq!(RegionPos::new(-1, 1, 0).base_block(), BlockPos::new(-256, 256, 0));
    }

    #[test]
    fn file_names_round_trip() {
        let region = RegionPos::new(0, -1, 12);
        let name = region.file_name("srf");
        assert_eq!(name, "r.0.-1.12.srf");
        assert_eq!(RegionPos::from_file_name(&name, "srf"), Some(region));
        assert_eq!(RegionPos::from_file_name(&name, "mca"), None);
        assert_eq!(RegionPos::from_file_name("r.0.1.srf", "srf"), None);
        assert_eq!(RegionPos::from_file_name("r.0.1.2.srf.tmp", "srf"), None);
    }

    #[test]
    fn vector_conversions_preserve_axes() {
        let v = Vector3::new(3, -4, 5);
        let chunk = ChunkPos::from(v);
        assert_eq!(chunk, ChunkPos::new(3, -4, 5));
        assert_eq!(Vector3::from(chunk), v);
    }
}
