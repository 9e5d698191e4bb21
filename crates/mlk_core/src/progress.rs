use std::sync::Arc;

/// Byte-level progress of a single hashing, diffing or copy operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ByteProgress {
    /// Bytes processed so far.
    pub done: u64,
    /// Total bytes the operation will process (0 when unknown).
    pub total: u64,
}

impl ByteProgress {
    /// Fraction complete in `[0.0, 1.0]`; `1.0` for empty inputs.
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            (self.done as f64 / self.total as f64).min(1.0)
        }
    }
}

pub type ByteProgressCallback = Arc<dyn Fn(ByteProgress) + Send + Sync>;
