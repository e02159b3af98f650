//! Segment-name generation and validation.
//!
//! Generated names are exactly [`GENERATED_NAME_LEN`] bytes:
//!
//! ```text
//! /shmbus.Xq3Lp0vZ.000042
//! ^ ^      ^        ^
//! | prefix  random   per-process counter
//! ```
//!
//! The counter rules out duplicates within one process; the random infix
//! keeps independent processes from colliding. 23 bytes means the
//! NUL-terminated name plus a `u64` offset fill exactly one 32-byte
//! half-cache-line, which is what [`Locator`](crate::segment::Locator)
//! relies on.

use std::sync::atomic::{AtomicU32, Ordering};

use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::error::{Error, Result, MAX_NAME_LEN};

/// Total length of every generated name, in bytes.
pub const GENERATED_NAME_LEN: usize = 23;

const PREFIX: &str = "shmbus";
const INFIX_LEN: usize = 8;

static COUNTER: AtomicU32 = AtomicU32::new(0);

/// Produce a fresh, collision-resistant segment name.
///
/// Cannot fail. Uniqueness is probabilistic across processes; if a generated
/// name happens to exist on the host already, creating a segment with it
/// fails there with [`Error::NameInUse`], not here.
pub fn generate_name() -> String {
    // Relaxed is enough: no ordering with other memory is needed, only that
    // no two calls observe the same value.
    let serial = COUNTER.fetch_add(1, Ordering::Relaxed) % 1_000_000;
    let infix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(INFIX_LEN)
        .map(char::from)
        .collect();

    let name = format!("/{PREFIX}.{infix}.{serial:06}");
    debug_assert_eq!(name.len(), GENERATED_NAME_LEN);
    name
}

/// Check that `name` is acceptable to `shm_open`.
///
/// A valid name starts with `/`, has at least one byte after it, contains no
/// further `/` and no NUL, and is at most [`MAX_NAME_LEN`] bytes long.
pub fn validate_name(name: &str) -> Result<()> {
    if name.len() > MAX_NAME_LEN {
        return Err(Error::NameTooLong { len: name.len() });
    }
    let rest = name
        .strip_prefix('/')
        .ok_or_else(|| Error::InvalidName(name.to_owned()))?;
    if rest.is_empty() || rest.contains('/') || rest.contains('\0') {
        return Err(Error::InvalidName(name.to_owned()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_generated_names_are_distinct() {
        let names: HashSet<String> = (0..1000).map(|_| generate_name()).collect();
        assert_eq!(names.len(), 1000);
    }

    #[test]
    fn test_generated_name_shape() {
        for _ in 0..100 {
            let name = generate_name();
            assert_eq!(name.len(), GENERATED_NAME_LEN);
            assert!(name.starts_with('/'));
            assert!(name[1..]
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'_' || b == b'-'));
            validate_name(&name).unwrap();
        }
    }

    #[test]
    fn test_validate_rejects_malformed_names() {
        assert!(matches!(validate_name("no-slash"), Err(Error::InvalidName(_))));
        assert!(matches!(validate_name("/"), Err(Error::InvalidName(_))));
        assert!(matches!(validate_name("/a/b"), Err(Error::InvalidName(_))));
        assert!(matches!(validate_name("/a\0b"), Err(Error::InvalidName(_))));
        assert!(matches!(
            validate_name(&format!("/{}", "x".repeat(MAX_NAME_LEN))),
            Err(Error::NameTooLong { .. })
        ));
    }

    #[test]
    fn test_validate_accepts_limit_length() {
        let name = format!("/{}", "x".repeat(MAX_NAME_LEN - 1));
        validate_name(&name).unwrap();
    }
}
