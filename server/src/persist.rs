//! Binary persistence for the object store
//!
//! A dump file is a flat sequence of record frames with no header or
//! footer (see `shared::encode_frame` for the layout). Loading reads the
//! file in fixed-size chunks and slices frames at each 0x1E separator;
//! writing serializes the whole table into one buffer first so an I/O
//! failure can never leave a truncated frame behind.

use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use log::{info, warn};
use shared::{decode_frame, encode_frame, CofferError, CofferResult, FRAME_SEPARATOR, MAX_FRAME_SIZE};

use crate::store::ObjectStore;

const READ_CHUNK_SIZE: usize = 1024;

/// Serializes every record, in the table's bucket/chain order, to `path`.
/// Returns the number of records written.
pub fn save_store(store: &ObjectStore, path: &Path) -> CofferResult<usize> {
    let records = store.snapshot();

    let mut buffer = Vec::new();
    for record in &records {
        buffer.extend_from_slice(&encode_frame(record)?);
    }

    let mut writer = BufWriter::new(File::create(path)?);
    writer.write_all(&buffer)?;
    writer.flush()?;

    info!("saved {} records to {}", records.len(), path.display());
    Ok(records.len())
}

/// Loads record frames from `path` into `store`.
///
/// Frames are accumulated chunk by chunk and cut at each separator byte. A
/// key already present in the store is skipped with a warning: the
/// persistence boundary rejects duplicates even though the store's own
/// insert treats them as a success no-op. Corrupt or oversized frames and
/// trailing bytes with no separator abort the load. Returns the number of
/// records inserted.
pub fn load_store(store: &ObjectStore, path: &Path) -> CofferResult<usize> {
    let mut file = File::open(path)?;
    let mut pending: Vec<u8> = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];
    let mut loaded = 0usize;
    let mut skipped = 0usize;

    loop {
        let read = file.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        for &byte in &chunk[..read] {
            if byte == FRAME_SEPARATOR {
                let record = decode_frame(&pending)?;
                pending.clear();
                if store.insert(record)? {
                    loaded += 1;
                } else {
                    skipped += 1;
                }
            } else {
                pending.push(byte);
                if pending.len() >= MAX_FRAME_SIZE {
                    return Err(CofferError::FrameTooLarge);
                }
            }
        }
    }

    if !pending.is_empty() {
        return Err(CofferError::CorruptFrame("trailing bytes after last separator"));
    }
    if skipped > 0 {
        warn!("skipped {} duplicate keys while loading {}", skipped, path.display());
    }
    info!("loaded {} records from {}", loaded, path.display());
    Ok(loaded)
}

/// Writes every key as a newline-terminated line of plain text, the
/// human-readable export, distinct from the binary round-trip format.
pub fn dump_keys(store: &ObjectStore, path: &Path) -> CofferResult<usize> {
    let keys = store.keys();

    let mut writer = BufWriter::new(File::create(path)?);
    for key in &keys {
        writer.write_all(key.as_bytes())?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(keys.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::Record;

    fn store_with(records: &[Record]) -> ObjectStore {
        let store = ObjectStore::new(64).unwrap();
        for record in records {
            store.insert(record.clone()).unwrap();
        }
        store
    }

    #[test]
    fn test_save_then_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");

        let original = store_with(&[
            Record::new("k1", b"v1".to_vec(), "u1", 4),
            Record::new("k2", b"v2".to_vec(), "u2", 2),
            Record::new("k3", Vec::new(), "u1", 0),
        ]);
        assert_eq!(save_store(&original, &path).unwrap(), 3);

        let restored = ObjectStore::new(64).unwrap();
        assert_eq!(load_store(&restored, &path).unwrap(), 3);
        assert_eq!(restored.len(), 3);

        for key in ["k1", "k2", "k3"] {
            assert_eq!(restored.get(key), original.get(key), "mismatch for {key}");
        }
    }

    #[test]
    fn test_load_preserves_value_owner_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");

        let original = store_with(&[Record::new("k1", b"v1".to_vec(), "u1", 4)]);
        save_store(&original, &path).unwrap();

        let restored = ObjectStore::new(8).unwrap();
        load_store(&restored, &path).unwrap();

        let record = restored.get("k1").unwrap();
        assert_eq!(record.value, b"v1");
        assert_eq!(record.owner, "u1");
        assert_eq!(record.owner_permissions, 4);
    }

    #[test]
    fn test_load_skips_duplicate_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");

        let original = store_with(&[Record::new("k1", b"v1".to_vec(), "u1", 4)]);
        save_store(&original, &path).unwrap();

        // The target already holds the key with a different value; the file's
        // copy must be skipped, not merged and not treated as an error.
        let target = store_with(&[Record::new("k1", b"local".to_vec(), "u9", 1)]);
        assert_eq!(load_store(&target, &path).unwrap(), 0);
        assert_eq!(target.len(), 1);
        assert_eq!(target.get("k1").unwrap().value, b"local");
    }

    #[test]
    fn test_load_rejects_trailing_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");

        let original = store_with(&[Record::new("k1", b"v1".to_vec(), "u1", 4)]);
        save_store(&original, &path).unwrap();

        // Chop the final separator off the file.
        let mut bytes = std::fs::read(&path).unwrap();
        bytes.pop();
        std::fs::write(&path, &bytes).unwrap();

        let restored = ObjectStore::new(8).unwrap();
        assert!(matches!(
            load_store(&restored, &path),
            Err(CofferError::CorruptFrame(_))
        ));
    }

    #[test]
    fn test_load_rejects_unterminated_oversize_frame() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        // No separator anywhere: the accumulator must give up at the frame
        // bound instead of growing without limit.
        std::fs::write(&path, vec![0u8; MAX_FRAME_SIZE * 2]).unwrap();

        let restored = ObjectStore::new(8).unwrap();
        assert!(matches!(
            load_store(&restored, &path),
            Err(CofferError::FrameTooLarge)
        ));
    }

    #[test]
    fn test_load_rejects_corrupt_frame() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        // Header claims lengths that disagree with the frame size.
        let mut bytes = vec![5, 0, 5, 0, 5, 0, 1];
        bytes.extend_from_slice(b"xy");
        bytes.push(FRAME_SEPARATOR);
        std::fs::write(&path, &bytes).unwrap();

        let restored = ObjectStore::new(8).unwrap();
        assert!(matches!(
            load_store(&restored, &path),
            Err(CofferError::CorruptFrame(_))
        ));
    }

    #[test]
    fn test_load_missing_file_reports_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.db");

        let restored = ObjectStore::new(8).unwrap();
        assert!(matches!(load_store(&restored, &path), Err(CofferError::Io(_))));
    }

    #[test]
    fn test_dump_keys_writes_one_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.txt");

        let store = ObjectStore::with_hasher(1, |_| 0).unwrap();
        store.insert(Record::new("aa", b"1".to_vec(), "u", 0)).unwrap();
        store.insert(Record::new("bb", b"2".to_vec(), "u", 0)).unwrap();

        assert_eq!(dump_keys(&store, &path).unwrap(), 2);
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "bb\naa\n");
    }

    #[test]
    fn test_empty_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");

        let store = ObjectStore::new(8).unwrap();
        assert_eq!(save_store(&store, &path).unwrap(), 0);

        let restored = ObjectStore::new(8).unwrap();
        assert_eq!(load_store(&restored, &path).unwrap(), 0);
        assert!(restored.is_empty());
    }
}
