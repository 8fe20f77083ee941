//! Heap construction parameters.

use std::io;

/// Smallest page size a heap accepts.
pub const MIN_PAGE_SIZE: usize = 4096;

/// Bits reserved above the page offset for the space tag in the allocation
/// hash value.
pub const SPACE_TAG_BITS: u32 = 3;

/// Configuration for [`Heap::new`](crate::Heap::new).
///
/// ```
/// use gen_heap::HeapConfig;
///
/// let config = HeapConfig {
///     page_size: 4096,
///     large_object_threshold: 2048,
///     young_generation_pages: 2,
///     ..HeapConfig::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapConfig {
    /// Size of a regular page in bytes. Power of two, at least
    /// [`MIN_PAGE_SIZE`].
    pub page_size: usize,
    /// Requests larger than this go to large object space. Must be in
    /// `1..=page_size`.
    pub large_object_threshold: usize,
    /// Number of pages in the young generation.
    pub young_generation_pages: usize,
    /// Maximum number of pages each of old, code and descriptor space may
    /// grow to.
    pub paged_space_page_limit: usize,
    /// Byte budget of large object space.
    pub large_object_space_limit: usize,
    /// Fold every allocation and move into the allocation hash.
    pub enable_deterministic_hash: bool,
    /// Record a digest every this many allocations when hashing is enabled.
    pub digest_interval: u64,
    /// Ask the stack tracer for a sample every this many allocations when
    /// hashing is disabled. 0 turns sampling off.
    pub stack_sample_interval: u64,
    /// Turn allocation-site feedback into tenuring decisions.
    pub enable_pretenuring: bool,
    /// Stress mode: fail every `n`-th allocation with a retry outside an
    /// always-allocate scope.
    pub gc_interval: Option<usize>,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            page_size: 256 * 1024,
            large_object_threshold: 128 * 1024,
            young_generation_pages: 8,
            paged_space_page_limit: 256,
            large_object_space_limit: 256 * 1024 * 1024,
            enable_deterministic_hash: false,
            digest_interval: 10_000,
            stack_sample_interval: 0,
            enable_pretenuring: true,
            gc_interval: None,
        }
    }
}

impl HeapConfig {
    /// `log2(page_size)`.
    #[must_use]
    pub const fn page_size_bits(&self) -> u32 {
        self.page_size.trailing_zeros()
    }

    /// Checks the configuration for consistency.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` naming the first offending field.
    pub fn validate(&self) -> io::Result<()> {
        if !self.page_size.is_power_of_two() || self.page_size < MIN_PAGE_SIZE {
            return Err(invalid(format!(
                "page_size must be a power of two >= {MIN_PAGE_SIZE}, got {}",
                self.page_size
            )));
        }
        if self.page_size_bits() + SPACE_TAG_BITS > u32::BITS {
            return Err(invalid(format!(
                "page_size {} leaves no room for the space tag in a 32-bit hash value",
                self.page_size
            )));
        }
        if self.large_object_threshold == 0 || self.large_object_threshold > self.page_size {
            return Err(invalid(format!(
                "large_object_threshold must be in 1..={}, got {}",
                self.page_size, self.large_object_threshold
            )));
        }
        if self.young_generation_pages == 0 {
            return Err(invalid("young_generation_pages must be at least 1".into()));
        }
        if self.paged_space_page_limit == 0 {
            return Err(invalid("paged_space_page_limit must be at least 1".into()));
        }
        if self.digest_interval == 0 {
            return Err(invalid("digest_interval must be greater than 0".into()));
        }
        if self.gc_interval == Some(0) {
            return Err(invalid("gc_interval must be greater than 0".into()));
        }
        Ok(())
    }
}

fn invalid(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = HeapConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.page_size_bits(), 18);
    }

    #[test]
    fn page_size_must_be_a_power_of_two() {
        let config = HeapConfig {
            page_size: 5000,
            ..HeapConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(err.to_string().contains("page_size"));
    }

    #[test]
    fn threshold_may_not_exceed_a_page() {
        let config = HeapConfig {
            page_size: 4096,
            ..HeapConfig::default()
        };
        assert!(config.validate().is_err());

        let config = HeapConfig {
            page_size: 4096,
            large_object_threshold: 4096,
            ..HeapConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_intervals_are_rejected() {
        let digest = HeapConfig {
            digest_interval: 0,
            ..HeapConfig::default()
        };
        assert!(digest.validate().is_err());

        let stress = HeapConfig {
            gc_interval: Some(0),
            ..HeapConfig::default()
        };
        assert!(stress.validate().is_err());
    }
}
