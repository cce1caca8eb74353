/// The dispatch engine: read and write pipelines.
pub mod read;
pub mod write;

use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_SOURCE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide id generator shared by all data sources, so cursor ids
/// stay unique whether or not the cursor map is global.
pub(crate) fn generate_source_id() -> u64 {
    NEXT_SOURCE_ID.fetch_add(1, Ordering::Relaxed)
}
