//! Deterministic chunk placement.
//!
//! Placement is recomputed on every upload and download, never stored as a routing table.
//! Changing the number of backends moves existing chunks to different indices; readers
//! detect that through the `backend_id` recorded at write time.

use std::num::NonZeroUsize;

const DJB2_SEED: u32 = 5381;

/// Pick the backend index for one chunk of a file.
pub fn route(file_id: &str, chunk_index: u32, backend_count: NonZeroUsize) -> usize {
    let key = format!("{}_{}", file_id, chunk_index);
    djb2(&key) as usize % backend_count.get()
}

/// DJB2 over Unicode scalar values with 32-bit wrapping arithmetic.
fn djb2(s: &str) -> u32 {
    s.chars().fold(DJB2_SEED, |hash, c| {
        (hash << 5).wrapping_add(hash).wrapping_add(c as u32)
    })
}
