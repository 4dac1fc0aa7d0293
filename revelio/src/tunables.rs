//! Process-wide extraction tuning knobs.
//!
//! These bound the working memory of [`crate::extract`]: the shared pixel
//! arena, the provisional object table, and the deblending tree. They may be
//! adjusted between extractions; mutating them while an extraction is in
//! flight is the caller's responsibility to avoid (the values are read once
//! at extraction entry).

use std::sync::atomic::{AtomicUsize, Ordering};

/// Default capacity of the shared pixel arena.
pub const DEFAULT_PIXSTACK: usize = 300_000;

/// Default capacity of the provisional object table.
pub const DEFAULT_OBJECT_LIMIT: usize = 60_000;

/// Default cap on sub-objects considered while deblending one parent.
pub const DEFAULT_SUB_OBJECT_LIMIT: usize = 1024;

static EXTRACT_PIXSTACK: AtomicUsize = AtomicUsize::new(DEFAULT_PIXSTACK);
static EXTRACT_OBJECT_LIMIT: AtomicUsize = AtomicUsize::new(DEFAULT_OBJECT_LIMIT);
static SUB_OBJECT_LIMIT: AtomicUsize = AtomicUsize::new(DEFAULT_SUB_OBJECT_LIMIT);

/// Set the capacity of the pixel arena used during segmentation.
pub fn set_extract_pixstack(val: usize) {
    EXTRACT_PIXSTACK.store(val, Ordering::Relaxed);
}

pub fn extract_pixstack() -> usize {
    EXTRACT_PIXSTACK.load(Ordering::Relaxed)
}

/// Set the maximum number of provisional objects alive at once.
pub fn set_extract_object_limit(val: usize) {
    EXTRACT_OBJECT_LIMIT.store(val, Ordering::Relaxed);
}

pub fn extract_object_limit() -> usize {
    EXTRACT_OBJECT_LIMIT.load(Ordering::Relaxed)
}

/// Set the maximum number of sub-objects considered per deblended parent.
pub fn set_sub_object_limit(val: usize) {
    SUB_OBJECT_LIMIT.store(val, Ordering::Relaxed);
}

pub fn sub_object_limit() -> usize {
    SUB_OBJECT_LIMIT.load(Ordering::Relaxed)
}
