//! Fixed-size header at the start of every region file.
//!
//! The header region holds two copies of the allocation table. Checkpoint generation `g` is
//! written to copy `g % 2`, so a checkpoint torn by a crash leaves the previous copy intact.
//! Each copy is laid out as (little-endian):
//!
//! | bytes            | contents                                                  |
//! |------------------|-----------------------------------------------------------|
//! | 0..32            | preamble: magic, version, geometry, CRC, generation       |
//! | 32..32 + 16 * N  | one [`EntrySlot`] per local index                         |
//! | ..copy_len       | zero padding up to a whole block                          |
//!
//! Block 0 of the body starts at `header_len = 2 * copy_len`.

use super::alloc::BlockRun;
use crate::config::RegionFileConfig;
use bytemuck::{Pod, Zeroable};
use crc32fast::Hasher;

pub const HEADER_MAGIC: &[u8; 4] = b"RGNF";
pub const HEADER_VERSION: u32 = 2;
const PREAMBLE_LEN: usize = std::mem::size_of::<Preamble>();
const SLOT_LEN: usize = std::mem::size_of::<EntrySlot>();
const SLOT_PRESENT: u32 = 1;

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
struct Preamble {
    magic: [u8; 4],
    version: u32,
    block_bits: u32,
    entry_count: u32,
    /// CRC-32 of the preamble with this field zeroed, followed by the slot table.
    checksum: u32,
    reserved: u32,
    generation: u64,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
struct EntrySlot {
    start_block: u32,
    byte_len: u32,
    block_count: u32,
    flags: u32,
}

impl EntrySlot {
    fn swap_le(self) -> Self {
        Self {
            start_block: self.start_block.to_le(),
            byte_len: self.byte_len.to_le(),
            block_count: self.block_count.to_le(),
            flags: self.flags.to_le(),
        }
    }
}

/// Committed location of one entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct EntryRecord {
    pub run: BlockRun,
    pub byte_len: u32,
}

#[derive(Debug)]
pub struct DecodedHeader {
    /// Checkpoint generation of the copy the table was read from.
    pub generation: u64,
    pub entries: Vec<Option<EntryRecord>>,
    /// Indices whose slot was present but unusable.
    pub discarded: Vec<usize>,
    /// Why the other copy was not used, if it was rejected.
    pub rejected: Option<String>,
}

/// Length of one header copy, a whole number of blocks.
pub fn copy_len(config: &RegionFileConfig) -> u64 {
    let raw = (PREAMBLE_LEN + SLOT_LEN * config.entry_count()) as u64;
    let block = config.block_size();
    raw.div_ceil(block) * block
}

pub fn header_len(config: &RegionFileConfig) -> u64 {
    2 * copy_len(config)
}

/// File offset of the copy that holds `generation`.
pub fn copy_offset(config: &RegionFileConfig, generation: u64) -> u64 {
    (generation % 2) * copy_len(config)
}

/// Encodes one header copy, padded to [`copy_len`].
pub fn encode_header(
    config: &RegionFileConfig,
    generation: u64,
    entries: &[Option<EntryRecord>],
) -> Vec<u8> {
    let slots: Vec<EntrySlot> = entries
        .iter()
        .map(|entry| match entry {
            Some(record) => EntrySlot {
                start_block: record.run.start,
                byte_len: record.byte_len,
                block_count: record.run.count,
                flags: SLOT_PRESENT,
            }
            .swap_le(),
            None => EntrySlot::default(),
        })
        .collect();
    let table: &[u8] = bytemuck::cast_slice(&slots);

    let mut preamble = Preamble {
        magic: *HEADER_MAGIC,
        version: HEADER_VERSION.to_le(),
        block_bits: config.block_bits.to_le(),
        entry_count: (entries.len() as u32).to_le(),
        checksum: 0,
        reserved: 0,
        generation: generation.to_le(),
    };
    preamble.checksum = checksum(&preamble, table).to_le();

    let len = copy_len(config) as usize;
    let mut bytes = Vec::with_capacity(len);
    bytes.extend_from_slice(bytemuck::bytes_of(&preamble));
    bytes.extend_from_slice(table);
    bytes.resize(len, 0);
    bytes
}

/// Parses the header region read from a file of `file_len` bytes.
///
/// `bytes` may be shorter than [`header_len`] when the file is. The newest copy that passes
/// every check is used. `Err` carries the reasons both copies were rejected; the caller then
/// treats the file as empty. Individual slots that point outside the file or overlap are
/// discarded.
pub fn decode_header(
    config: &RegionFileConfig,
    bytes: &[u8],
    file_len: u64,
) -> Result<DecodedHeader, String> {
    let len = copy_len(config) as usize;
    let copy_at = |offset: usize| bytes.get(offset..).map(|rest| &rest[..rest.len().min(len)]);
    let first = decode_copy(config, copy_at(0).unwrap_or_default());
    let second = decode_copy(config, copy_at(len).unwrap_or_default());

    let (generation, table, rejected) = match (first, second) {
        (Ok(a), Ok(b)) => {
            let newest = if b.0 > a.0 { b } else { a };
            (newest.0, newest.1, None)
        }
        (Ok((generation, table)), Err(reason)) | (Err(reason), Ok((generation, table))) => {
            (generation, table, Some(reason))
        }
        (Err(first), Err(second)) => {
            return Err(format!("copy 0: {first}; copy 1: {second}"));
        }
    };

    let body_start = header_len(config);
    let block_size = config.block_size();
    let mut entries = vec![None; config.entry_count()];
    let mut discarded = Vec::new();
    let mut candidates = Vec::new();
    for (index, slot) in table.into_iter().enumerate() {
        if slot.flags & SLOT_PRESENT == 0 {
            continue;
        }
        let run = BlockRun::new(slot.start_block, slot.block_count);
        let capacity = run.count as u64 * block_size;
        let data_end = body_start + run.start as u64 * block_size + slot.byte_len as u64;
        if run.end() > u32::MAX as u64 || (slot.byte_len as u64) > capacity || data_end > file_len {
            discarded.push(index);
            continue;
        }
        candidates.push((
            index,
            EntryRecord {
                run,
                byte_len: slot.byte_len,
            },
        ));
    }

    candidates.sort_by_key(|(index, record)| (record.run.start, *index));
    let mut claimed_until = 0u64;
    for (index, record) in candidates {
        if !record.run.is_empty() {
            if (record.run.start as u64) < claimed_until {
                discarded.push(index);
                continue;
            }
            claimed_until = record.run.end();
        }
        entries[index] = Some(record);
    }
    discarded.sort_unstable();

    Ok(DecodedHeader {
        generation,
        entries,
        discarded,
        rejected,
    })
}

/// Checks one copy and returns its generation and native-endian slots.
fn decode_copy(
    config: &RegionFileConfig,
    bytes: &[u8],
) -> Result<(u64, Vec<EntrySlot>), String> {
    if bytes.len() < PREAMBLE_LEN {
        return Err(format!("header truncated at {} bytes", bytes.len()));
    }
    let preamble: Preamble = bytemuck::pod_read_unaligned(&bytes[..PREAMBLE_LEN]);
    if &preamble.magic != HEADER_MAGIC {
        return Err("header magic mismatch".to_string());
    }
    let version = u32::from_le(preamble.version);
    if version != HEADER_VERSION {
        return Err(format!("unsupported header version {version}"));
    }
    let block_bits = u32::from_le(preamble.block_bits);
    if block_bits != config.block_bits {
        return Err(format!(
            "block bits mismatch: file={block_bits} config={}",
            config.block_bits
        ));
    }
    let entry_count = u32::from_le(preamble.entry_count) as usize;
    if entry_count != config.entry_count() {
        return Err(format!(
            "entry count mismatch: file={entry_count} config={}",
            config.entry_count()
        ));
    }

    let table_end = PREAMBLE_LEN + SLOT_LEN * entry_count;
    if bytes.len() < table_end {
        return Err(format!(
            "slot table truncated: need {table_end} bytes, have {}",
            bytes.len()
        ));
    }
    let table = &bytes[PREAMBLE_LEN..table_end];
    let stored = u32::from_le(preamble.checksum);
    if checksum(&Preamble { checksum: 0, ..preamble }, table) != stored {
        return Err("header checksum mismatch".to_string());
    }

    let slots = table
        .chunks_exact(SLOT_LEN)
        .map(|chunk| bytemuck::pod_read_unaligned::<EntrySlot>(chunk).swap_le())
        .collect();
    Ok((u64::from_le(preamble.generation), slots))
}

fn checksum(preamble: &Preamble, table: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(bytemuck::bytes_of(preamble));
    hasher.update(table);
    hasher.finalize()
}
#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RegionFileConfig {
        RegionFileConfig::new(9, 8)
    }

    fn record(start: u32, count: u32, byte_len: u32) -> Option<EntryRecord> {
        Some(EntryRecord {
            run: BlockRun::new(start, count),
            byte_len,
        })
    }

    /// Whole header region holding `copy` at the slot of `generation`.
    fn header_region(config: &RegionFileConfig, generation: u64, copy: &[u8]) -> Vec<u8> {
        let mut bytes = vec![0u8; header_len(config) as usize];
        let offset = copy_offset(config, generation) as usize;
        bytes[offset..offset + copy.len()].copy_from_slice(copy);
        bytes
    }

    #[test]
    fn header_len_rounds_to_whole_blocks() {
        assert_eq!(PREAMBLE_LEN, 32);
        assert_eq!(SLOT_LEN, 16);
        assert_eq!(copy_len(&config()), 512);
        assert_eq!(header_len(&config()), 1024);
        assert_eq!(header_len(&RegionFileConfig::new(9, 4096)), 132_096);
        assert_eq!(header_len(&RegionFileConfig::new(12, 4096)), 139_264);
        assert_eq!(copy_offset(&config(), 4), 0);
        assert_eq!(copy_offset(&config(), 7), 512);
    }

    #[test]
    fn encoded_header_decodes_to_same_table() {
        let config = config();
        let mut entries = vec![None; 8];
        entries[0] = record(0, 2, 700);
        entries[3] = record(2, 0, 0);
        entries[7] = record(5, 1, 1);
        let copy = encode_header(&config, 3, &entries);
        assert_eq!(copy.len() as u64, copy_len(&config));
        assert_eq!(&copy[..4], HEADER_MAGIC);

        let bytes = header_region(&config, 3, &copy);
        let file_len = header_len(&config) + 6 * 512;
        let decoded = decode_header(&config, &bytes, file_len).expect("decode header");
        assert_eq!(decoded.generation, 3);
        assert_eq!(decoded.entries, entries);
        assert!(decoded.discarded.is_empty());
        assert!(decoded.rejected.is_some(), "the other copy is still blank");
    }

    #[test]
    fn newest_valid_copy_wins() {
        let config = config();
        let mut older = vec![None; 8];
        older[0] = record(0, 1, 10);
        let mut newer = older.clone();
        newer[1] = record(1, 1, 20);

        let mut bytes = header_region(&config, 4, &encode_header(&config, 4, &older));
        let offset = copy_offset(&config, 5) as usize;
        let copy = encode_header(&config, 5, &newer);
        bytes[offset..offset + copy.len()].copy_from_slice(&copy);
        let file_len = header_len(&config) + 2 * 512;

        let decoded = decode_header(&config, &bytes, file_len).expect("decode header");
        assert_eq!(decoded.generation, 5);
        assert_eq!(decoded.entries, newer);
        assert!(decoded.rejected.is_none());

        // A checkpoint torn halfway through the newer copy falls back to the older one.
        bytes[offset + 40] ^= 0xFF;
        let decoded = decode_header(&config, &bytes, file_len).expect("decode header");
        assert_eq!(decoded.generation, 4);
        assert_eq!(decoded.entries, older);
        assert!(decoded
            .rejected
            .as_deref()
            .is_some_and(|reason| reason.contains("checksum")));
    }

    #[test]
    fn rejects_foreign_or_mismatched_headers() {
        let config = config();
        let bytes = header_region(&config, 1, &encode_header(&config, 1, &vec![None; 8]));

        assert!(decode_header(&config, &bytes[..16], 16).is_err());
        assert!(decode_header(&config, &vec![0u8; 1024], 1024).is_err());
        assert!(decode_header(&RegionFileConfig::new(10, 8), &bytes, 1024).is_err());
        assert!(decode_header(&RegionFileConfig::new(9, 16), &bytes, 1024).is_err());

        let mut corrupted = bytes.clone();
        corrupted[512 + 40] ^= 0xFF;
        let error = decode_header(&config, &corrupted, 1024).expect_err("checksum must fail");
        assert!(error.contains("checksum"));

        let mut corrupted = bytes;
        corrupted[512 + 24] ^= 0x01;
        let error = decode_header(&config, &corrupted, 1024).expect_err("generation is covered");
        assert!(error.contains("checksum"));
    }

    #[test]
    fn discards_out_of_bounds_and_overlapping_slots() {
        let config = config();
        let mut entries = vec![None; 8];
        entries[0] = record(0, 2, 1024);
        entries[1] = record(1, 1, 10); // overlaps entry 0
        entries[2] = record(2, 1, 600); // longer than its run
        entries[4] = record(40, 1, 10); // beyond end of file
        entries[5] = record(3, 1, 512);
        let bytes = header_region(&config, 2, &encode_header(&config, 2, &entries));
        let file_len = header_len(&config) + 4 * 512;

        let decoded = decode_header(&config, &bytes, file_len).expect("decode header");
        assert_eq!(decoded.discarded, vec![1, 2, 4]);
        assert_eq!(decoded.entries[0], entries[0]);
        assert_eq!(decoded.entries[5], entries[5]);
        assert_eq!(decoded.entries.iter().flatten().count(), 2);
    }
}
