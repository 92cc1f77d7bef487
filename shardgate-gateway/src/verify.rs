//! Completeness and content checks for stored files.

use std::num::NonZeroUsize;

use shardgate_common::placement;
use shardgate_common::records::{ChunkRecord, ChunkStatus, FileId};

use crate::error::IntegrityError;
use crate::transfer::ChunkDigest;

/// A verified, index-ordered chunk list ready to be streamed.
#[derive(Debug, Clone)]
pub struct RetrievalPlan {
    pub file_id: FileId,
    pub chunks: Vec<ChunkRecord>,
}

impl RetrievalPlan {
    pub fn total_size(&self) -> u64 {
        self.chunks.iter().map(|c| c.chunk_size).sum()
    }
}

/// Check that a file's records describe a complete, fully stored chunk set whose
/// placement still matches the current backend list.
///
/// `records` may arrive in any order; the returned plan is sorted by chunk index.
pub fn verify_complete(
    file_id: &FileId,
    mut records: Vec<ChunkRecord>,
    backend_count: NonZeroUsize,
) -> Result<RetrievalPlan, IntegrityError> {
    let Some(first) = records.first() else {
        return Err(IntegrityError::UnknownFile(file_id.clone()));
    };
    let total = first.total_chunks;

    records.sort_by_key(|r| r.chunk_index);

    for record in &records {
        if record.total_chunks != total {
            return Err(IntegrityError::ChunkCountMismatch {
                chunk_index: record.chunk_index,
                recorded: record.total_chunks,
                expected: total,
            });
        }
        if record.chunk_index >= total {
            return Err(IntegrityError::UnexpectedChunk { chunk_index: record.chunk_index, total });
        }
    }

    let mut expected = 0u32;
    for record in &records {
        if record.chunk_index < expected {
            return Err(IntegrityError::DuplicateChunk { chunk_index: record.chunk_index });
        }
        if record.chunk_index > expected {
            return Err(IntegrityError::MissingChunk { chunk_index: expected });
        }
        expected += 1;
    }
    if expected != total {
        return Err(IntegrityError::MissingChunk { chunk_index: expected });
    }

    for record in &records {
        if record.status != ChunkStatus::Stored {
            return Err(IntegrityError::NotStored { chunk_index: record.chunk_index });
        }
        let computed = placement::route(file_id.as_str(), record.chunk_index, backend_count);
        if computed != record.backend_id {
            return Err(IntegrityError::PlacementMismatch {
                chunk_index: record.chunk_index,
                recorded: record.backend_id,
                computed,
            });
        }
    }

    Ok(RetrievalPlan { file_id: file_id.clone(), chunks: records })
}

/// Compare what was actually read for a chunk against its record.
pub fn check_digest(record: &ChunkRecord, digest: &ChunkDigest) -> Result<(), IntegrityError> {
    if digest.bytes != record.chunk_size {
        return Err(IntegrityError::SizeMismatch {
            chunk_index: record.chunk_index,
            expected: record.chunk_size,
            actual: digest.bytes,
        });
    }
    if !digest.hex.eq_ignore_ascii_case(&record.content_hash) {
        return Err(IntegrityError::HashMismatch {
            chunk_index: record.chunk_index,
            expected: record.content_hash.clone(),
            actual: digest.hex.clone(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const BACKENDS: usize = 3;

    fn backends() -> NonZeroUsize {
        NonZeroUsize::new(BACKENDS).unwrap()
    }

    fn stored(file_id: &FileId, index: u32, total: u32) -> ChunkRecord {
        let backend_id = placement::route(file_id.as_str(), index, backends());
        let mut record = ChunkRecord::pending(file_id.clone(), index, 10, backend_id, total);
        record.status = ChunkStatus::Stored;
        record.content_hash = "00ff".to_string();
        record
    }

    fn complete(file_id: &FileId, total: u32) -> Vec<ChunkRecord> {
        (0..total).map(|i| stored(file_id, i, total)).collect()
    }

    #[test]
    fn test_complete_set_is_sorted() {
        let id = FileId::generate();
        let mut records = complete(&id, 6);
        records.reverse();
        let plan = verify_complete(&id, records, backends()).unwrap();
        let indices: Vec<u32> = plan.chunks.iter().map(|c| c.chunk_index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(plan.total_size(), 60);
    }

    #[test]
    fn test_no_records_is_unknown_file() {
        let id = FileId::generate();
        let err = verify_complete(&id, Vec::new(), backends()).unwrap_err();
        assert!(matches!(err, IntegrityError::UnknownFile(ref f) if *f == id));
    }

    #[test]
    fn test_pending_chunk_rejected() {
        let id = FileId::generate();
        let mut records = complete(&id, 6);
        records[4].status = ChunkStatus::Pending;
        let err = verify_complete(&id, records, backends()).unwrap_err();
        assert!(matches!(err, IntegrityError::NotStored { chunk_index: 4 }));
    }

    #[test]
    fn test_gap_rejected() {
        let id = FileId::generate();
        let mut records = complete(&id, 6);
        records.remove(2);
        let err = verify_complete(&id, records, backends()).unwrap_err();
        assert!(matches!(err, IntegrityError::MissingChunk { chunk_index: 2 }));
    }

    #[test]
    fn test_missing_tail_rejected() {
        let id = FileId::generate();
        let mut records = complete(&id, 6);
        records.pop();
        let err = verify_complete(&id, records, backends()).unwrap_err();
        assert!(matches!(err, IntegrityError::MissingChunk { chunk_index: 5 }));
    }

    #[test]
    fn test_duplicate_rejected() {
        let id = FileId::generate();
        let mut records = complete(&id, 3);
        records.push(stored(&id, 1, 3));
        let err = verify_complete(&id, records, backends()).unwrap_err();
        assert!(matches!(err, IntegrityError::DuplicateChunk { chunk_index: 1 }));
    }

    #[test]
    fn test_out_of_range_rejected() {
        let id = FileId::generate();
        let mut records = complete(&id, 3);
        records.push(stored(&id, 7, 3));
        let err = verify_complete(&id, records, backends()).unwrap_err();
        assert!(matches!(err, IntegrityError::UnexpectedChunk { chunk_index: 7, total: 3 }));
    }

    #[test]
    fn test_disagreeing_totals_rejected() {
        let id = FileId::generate();
        let mut records = complete(&id, 3);
        records[2].total_chunks = 4;
        let err = verify_complete(&id, records, backends()).unwrap_err();
        assert!(matches!(err, IntegrityError::ChunkCountMismatch { chunk_index: 2, recorded: 4, expected: 3 }));
    }

    #[test]
    fn test_placement_mismatch_rejected() {
        let id = FileId::generate();
        let mut records = complete(&id, 3);
        records[1].backend_id = (records[1].backend_id + 1) % BACKENDS;
        let err = verify_complete(&id, records, backends()).unwrap_err();
        assert!(matches!(err, IntegrityError::PlacementMismatch { chunk_index: 1, .. }));
    }

    #[test]
    fn test_check_digest() {
        let id = FileId::generate();
        let record = stored(&id, 0, 1);

        check_digest(&record, &ChunkDigest { hex: "00FF".into(), bytes: 10 }).unwrap();

        let err = check_digest(&record, &ChunkDigest { hex: "00ff".into(), bytes: 9 }).unwrap_err();
        assert!(matches!(err, IntegrityError::SizeMismatch { expected: 10, actual: 9, .. }));

        let err = check_digest(&record, &ChunkDigest { hex: "abcd".into(), bytes: 10 }).unwrap_err();
        assert!(matches!(err, IntegrityError::HashMismatch { .. }));
    }
}
