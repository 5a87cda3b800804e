//! Per-session revision tracking

/// Monotonic version counter. Only moves forward.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VersionCounter {
    value: u64,
}

impl VersionCounter {
    pub fn new(initial: u64) -> Self {
        Self { value: initial }
    }

    pub fn get(&self) -> u64 {
        self.value
    }

    /// Move up to `version`. Returns true if the counter changed.
    pub fn advance_to(&mut self, version: u64) -> bool {
        if version > self.value {
            self.value = version;
            true
        } else {
            false
        }
    }
}
