//! Fixed width encodings of the `.info` header and the `.kd` key directory.
//!
//! Every integer is a little endian u64. The functions here never touch
//! the filesystem.

use std::collections::HashMap;
use std::io::{self, Cursor};

use byteorder::{LittleEndian, ReadBytesExt};
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{
    config::constants::{
        INFO_HEADER_SIZE, KEY_DIRECTORY_SET_SIZE, PAGE_SIZE, RECORDS_PER_PAGE, SLOT_SIZE,
        START_RID,
    },
    error::{StorageError, StorageResult},
    storage::key_directory::KeyDirectory,
};

// Field pages inside one key directory set, in file order.
const KEY_FIELD: usize = 0;
const BASE_RID_FIELD: usize = 1;
const TAIL_RID_FIELD: usize = 2;
const BASE_BLOCK_FIELD: usize = 3;
const TAIL_BLOCK_FIELD: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableInfo {
    pub num_columns: u64,
    pub key_column: u64,
    pub num_records: u64,
    pub next_base_rid: u64,
    pub next_tail_rid: u64,
    pub next_base_block: u64,
    pub next_tail_block: u64,
}

impl TableInfo {
    pub fn new(num_columns: usize, key_column: usize) -> Self {
        TableInfo {
            num_columns: num_columns as u64,
            key_column: key_column as u64,
            num_records: 0,
            next_base_rid: START_RID,
            next_tail_rid: START_RID,
            next_base_block: 0,
            next_tail_block: 0,
        }
    }
}

pub fn encode_info(info: &TableInfo) -> Bytes {
    let mut buf = BytesMut::with_capacity(INFO_HEADER_SIZE);
    buf.put_u64_le(info.num_columns);
    buf.put_u64_le(info.key_column);
    buf.put_u64_le(info.num_records);
    buf.put_u64_le(info.next_base_rid);
    buf.put_u64_le(info.next_tail_rid);
    buf.put_u64_le(info.next_base_block);
    buf.put_u64_le(info.next_tail_block);
    buf.freeze()
}

pub fn decode_info(data: &[u8]) -> io::Result<TableInfo> {
    let mut cursor = Cursor::new(data);
    Ok(TableInfo {
        num_columns: cursor.read_u64::<LittleEndian>()?,
        key_column: cursor.read_u64::<LittleEndian>()?,
        num_records: cursor.read_u64::<LittleEndian>()?,
        next_base_rid: cursor.read_u64::<LittleEndian>()?,
        next_tail_rid: cursor.read_u64::<LittleEndian>()?,
        next_base_block: cursor.read_u64::<LittleEndian>()?,
        next_tail_block: cursor.read_u64::<LittleEndian>()?,
    })
}

/// Rewrites the whole directory as a sequence of key directory sets.
///
/// The key side (key, base rid, base block) and the tail side (tail rid,
/// tail block) are independent arrays that may differ in length; both are
/// zero padded to the end of the final set.
pub fn encode_key_directory(directory: &KeyDirectory) -> StorageResult<Bytes> {
    let mut key_side: Vec<(u64, u64, u64)> = directory
        .key_to_base_rid()
        .iter()
        .map(|(key, rid)| {
            directory
                .base_block(*rid)
                .map(|block| (*key, *rid, block))
                .ok_or_else(|| StorageError::corrupt(format!("base rid {rid} has no block")))
        })
        .collect::<StorageResult<_>>()?;
    key_side.sort_unstable();

    let mut tail_side: Vec<(u64, u64)> = directory
        .tail_rid_to_block()
        .iter()
        .map(|(rid, block)| (*rid, *block))
        .collect();
    tail_side.sort_unstable();

    let entries = key_side.len().max(tail_side.len());
    let sets = entries.div_ceil(RECORDS_PER_PAGE);

    let mut buf = BytesMut::with_capacity(sets * KEY_DIRECTORY_SET_SIZE);
    for set in 0..sets {
        let range = set * RECORDS_PER_PAGE..(set + 1) * RECORDS_PER_PAGE;

        for field in [KEY_FIELD, BASE_RID_FIELD, TAIL_RID_FIELD, BASE_BLOCK_FIELD, TAIL_BLOCK_FIELD] {
            for i in range.clone() {
                let value = match field {
                    KEY_FIELD => key_side.get(i).map(|entry| entry.0),
                    BASE_RID_FIELD => key_side.get(i).map(|entry| entry.1),
                    BASE_BLOCK_FIELD => key_side.get(i).map(|entry| entry.2),
                    TAIL_RID_FIELD => tail_side.get(i).map(|entry| entry.0),
                    _ => tail_side.get(i).map(|entry| entry.1),
                };
                buf.put_u64_le(value.unwrap_or(0));
            }
        }
    }

    debug_assert_eq!(buf.len(), sets * KEY_DIRECTORY_SET_SIZE);
    Ok(buf.freeze())
}

fn field_value(data: &[u8], index: usize, field: usize) -> u64 {
    let set = index / RECORDS_PER_PAGE;
    let slot = index % RECORDS_PER_PAGE;
    let offset = set * KEY_DIRECTORY_SET_SIZE + field * PAGE_SIZE + slot * SLOT_SIZE;
    (&data[offset..offset + SLOT_SIZE]).get_u64_le()
}

/// Rebuilds the in memory directory from the raw `.kd` bytes.
///
/// `num_keys` and `num_tails` come from the info header and tell the decoder
/// where the zero padding starts on each side.
pub fn decode_key_directory(
    data: &[u8],
    num_keys: usize,
    num_tails: usize,
) -> StorageResult<KeyDirectory> {
    if data.len() % KEY_DIRECTORY_SET_SIZE != 0 {
        return Err(StorageError::corrupt(format!(
            "directory length {} is not a multiple of the {} byte set size",
            data.len(),
            KEY_DIRECTORY_SET_SIZE
        )));
    }

    let capacity = (data.len() / KEY_DIRECTORY_SET_SIZE) * RECORDS_PER_PAGE;
    if num_keys > capacity || num_tails > capacity {
        return Err(StorageError::corrupt(format!(
            "directory holds {capacity} entries, header expects {num_keys} keys and {num_tails} tails"
        )));
    }

    let mut key_to_base_rid = HashMap::with_capacity(num_keys);
    let mut base_rid_to_block = HashMap::with_capacity(num_keys);
    for i in 0..num_keys {
        let key = field_value(data, i, KEY_FIELD);
        let rid = field_value(data, i, BASE_RID_FIELD);
        let block = field_value(data, i, BASE_BLOCK_FIELD);

        if key_to_base_rid.insert(key, rid).is_some() {
            return Err(StorageError::corrupt(format!("key {key} appears twice")));
        }
        if base_rid_to_block.insert(rid, block).is_some() {
            return Err(StorageError::corrupt(format!("base rid {rid} appears twice")));
        }
    }

    let mut tail_rid_to_block = HashMap::with_capacity(num_tails);
    for i in 0..num_tails {
        let rid = field_value(data, i, TAIL_RID_FIELD);
        let block = field_value(data, i, TAIL_BLOCK_FIELD);

        if tail_rid_to_block.insert(rid, block).is_some() {
            return Err(StorageError::corrupt(format!("tail rid {rid} appears twice")));
        }
    }

    Ok(KeyDirectory::from_maps(
        key_to_base_rid,
        base_rid_to_block,
        tail_rid_to_block,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_directory(keys: u64, tails: u64) -> KeyDirectory {
        let mut directory = KeyDirectory::new();
        for rid in 0..keys {
            // keys deliberately out of rid order
            directory.insert_base(1_000 - rid, rid, (rid / 512) * 8);
        }
        for rid in 0..tails {
            directory.insert_tail(rid, 3 + (rid / 512) * 8);
        }
        directory
    }

    #[test]
    fn info_header_layout() {
        let mut info = TableInfo::new(3, 0);
        info.num_records = 9;
        info.next_tail_rid = 4;

        let bytes = encode_info(&info);
        assert_eq!(bytes.len(), INFO_HEADER_SIZE);
        assert_eq!(&bytes[..8], &3u64.to_le_bytes());
        assert_eq!(&bytes[16..24], &9u64.to_le_bytes());
        assert_eq!(&bytes[32..40], &4u64.to_le_bytes());
        assert_eq!(decode_info(&bytes).unwrap(), info);
    }

    #[test]
    fn short_info_header_fails() {
        let bytes = encode_info(&TableInfo::new(1, 0));
        assert!(decode_info(&bytes[..40]).is_err());
    }

    #[test]
    fn directory_survives_rewrite_and_reload() {
        // More tails than keys, spanning several sets on the tail side
        let directory = sample_directory(700, 1_300);

        let bytes = encode_key_directory(&directory).unwrap();
        assert_eq!(bytes.len(), 3 * KEY_DIRECTORY_SET_SIZE);

        let decoded = decode_key_directory(&bytes, 700, 1_300).unwrap();
        assert_eq!(decoded, directory);

        // Reencoding the decoded directory is byte identical
        assert_eq!(encode_key_directory(&decoded).unwrap(), bytes);
    }

    #[test]
    fn empty_directory_is_empty_file() {
        let bytes = encode_key_directory(&KeyDirectory::new()).unwrap();
        assert!(bytes.is_empty());
        assert_eq!(decode_key_directory(&bytes, 0, 0).unwrap(), KeyDirectory::new());
    }

    #[test]
    fn entries_are_field_major_within_a_set() {
        let mut directory = KeyDirectory::new();
        directory.insert_base(5, 0, 0);
        directory.insert_tail(0, 6);
        directory.insert_tail(1, 6);

        let bytes = encode_key_directory(&directory).unwrap();
        assert_eq!(bytes.len(), KEY_DIRECTORY_SET_SIZE);
        assert_eq!(field_value(&bytes, 0, KEY_FIELD), 5);
        assert_eq!(field_value(&bytes, 1, TAIL_RID_FIELD), 1);
        assert_eq!(field_value(&bytes, 1, TAIL_BLOCK_FIELD), 6);
        // padding
        assert_eq!(field_value(&bytes, 1, KEY_FIELD), 0);
    }

    #[test]
    fn truncated_set_is_corrupt() {
        let bytes = encode_key_directory(&sample_directory(10, 10)).unwrap();
        let err = decode_key_directory(&bytes[..PAGE_SIZE * 3], 10, 10).unwrap_err();
        assert!(matches!(err, StorageError::CorruptDirectoryRecord(_)));
    }

    #[test]
    fn header_claiming_more_entries_is_corrupt() {
        let bytes = encode_key_directory(&sample_directory(10, 10)).unwrap();
        let err = decode_key_directory(&bytes, RECORDS_PER_PAGE + 1, 10).unwrap_err();
        assert!(matches!(err, StorageError::CorruptDirectoryRecord(_)));
    }
}
