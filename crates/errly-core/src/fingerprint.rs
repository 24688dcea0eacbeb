//! Error fingerprinting.
//!
//! The fingerprint is a SHA-256 hash over the service name, the message,
//! and the normalised stack trace, giving every logical error one stable
//! key across deploys and hosts.

use sha2::{Digest, Sha256};

use crate::normalise::normalise_stack;

/// Compute the fingerprint for an error occurrence.
///
/// Fields are joined with a NUL byte so that shifting characters between
/// fields cannot produce a colliding digest. Only the stack trace is
/// normalised; the message and service name hash verbatim.
#[must_use]
pub fn compute_fingerprint(service: &str, message: &str, stack_trace: Option<&str>) -> String {
    const DELIMITER: &[u8] = b"\x00";

    let mut hasher = Sha256::new();
    hasher.update(service.as_bytes());
    hasher.update(DELIMITER);
    hasher.update(message.as_bytes());
    hasher.update(DELIMITER);
    if let Some(stack) = stack_trace {
        hasher.update(normalise_stack(stack).as_bytes());
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_inputs_identical_fingerprints() {
        let a = compute_fingerprint("api", "TypeError: x", Some("at f (a.ts:10:1)"));
        let b = compute_fingerprint("api", "TypeError: x", Some("at f (a.ts:10:1)"));
        assert_eq!(a, b);
    }

    #[test]
    fn each_component_changes_the_fingerprint() {
        let base = compute_fingerprint("api", "TypeError: x", Some("at f (a.ts:10:1)"));
        assert_ne!(
            base,
            compute_fingerprint("worker", "TypeError: x", Some("at f (a.ts:10:1)"))
        );
        assert_ne!(
            base,
            compute_fingerprint("api", "TypeError: y", Some("at f (a.ts:10:1)"))
        );
        assert_ne!(
            base,
            compute_fingerprint("api", "TypeError: x", Some("at h (b.ts:10:1)"))
        );
        assert_ne!(base, compute_fingerprint("api", "TypeError: x", None));
    }

    #[test]
    fn stable_across_line_numbers_and_absolute_paths() {
        let a = compute_fingerprint(
            "api",
            "TypeError: x",
            Some("TypeError: x\n    at f (/srv/rel-1/a.ts:10:1)"),
        );
        let b = compute_fingerprint(
            "api",
            "TypeError: x",
            Some("TypeError: x\n    at f (/srv/rel-2/a.ts:99:3)"),
        );
        assert_eq!(a, b);
    }

    #[test]
    fn nul_delimiter_prevents_boundary_collisions() {
        let a = compute_fingerprint("ab", "c", None);
        let b = compute_fingerprint("a", "bc", None);
        assert_ne!(a, b);
    }

    #[test]
    fn fingerprint_is_sha256_hex() {
        let fp = compute_fingerprint("api", "boom", None);
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
