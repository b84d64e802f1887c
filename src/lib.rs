//! Chunk storage in block-allocated region files.
//!
//! A world is split into regions of 16×16×16 chunks. Each region is stored in one file holding
//! one variable-length blob per chunk, addressed by the chunk's [`LocalIndex`] inside the region.
//! [`RegionFileCache`] opens region files on demand and closes them again once idle.

pub mod bit_size;
pub mod blob_array;
pub mod cache;
pub mod config;
pub mod coords;
pub mod error;
pub mod region_file;

pub use bit_size::BitSize;
pub use blob_array::{BlobArray, ContainerState, OpenInProgress};
pub use cache::{IdleSweeper, RegionFileCache, RegionStore};
pub use config::{RegionFileConfig, RegionStoreConfig};
pub use coords::{
    compute_local_index, compute_region_coordinate, BlockPos, ChunkPos, LocalIndex, RegionPos,
    CHUNK_BLOCKS, REGION_BLOCKS, REGION_CHUNKS, REGION_VOLUME,
};
pub use error::StoreError;
pub use region_file::{
    BlockRun, EntryInfo, EntryReader, EntryRecord, EntryWriter, RegionFile, RegionFileStats,
};
