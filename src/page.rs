//! Page-size helpers.
//!
//! Every shared-memory mapping is made in whole pages, so sizes move through
//! [`ceil_to_page_size`] before they reach `mmap`.

use std::sync::OnceLock;

/// The host page size, queried once and cached.
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(rustix::param::page_size)
}

/// Round `n` up to a multiple of the host page size.
///
/// Returns 0 for an input of 0; for any `n > 0` the result is a positive
/// page multiple no smaller than `n`.
pub fn ceil_to_page_size(n: usize) -> usize {
    if n == 0 {
        return 0;
    }
    let page = page_size();
    n.div_ceil(page) * page
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size_is_positive_power_of_two() {
        let page = page_size();
        assert!(page > 0);
        assert!(page.is_power_of_two());
    }

    #[test]
    fn test_ceil_zero() {
        assert_eq!(ceil_to_page_size(0), 0);
    }

    #[test]
    fn test_ceil_rounds_up() {
        let page = page_size();
        assert_eq!(ceil_to_page_size(1), page);
        assert_eq!(ceil_to_page_size(page - 1), page);
        assert_eq!(ceil_to_page_size(page), page);
        assert_eq!(ceil_to_page_size(page + 1), 2 * page);
    }

    #[test]
    fn test_ceil_is_idempotent() {
        for n in [1, 100, 4095, 4096, 4097, 1 << 20] {
            let rounded = ceil_to_page_size(n);
            assert_eq!(ceil_to_page_size(rounded), rounded);
            assert!(rounded >= n);
            assert_eq!(rounded % page_size(), 0);
        }
    }
}
