// crates/pw-store/src/ids.rs
// ============================================================================
// Module: Identifier Generation
// Description: Generates fresh opaque identifiers for rows the recorder
// creates on a caller's behalf (validation-error tokens, transform-error
// tokens, outcome/event/artifact/checkpoint ids).
// Purpose: Centralize the one place this crate produces randomness, so
// every generated identifier carries the same shape and collision odds.
// Dependencies: rand
// ============================================================================

use rand::Rng as _;

/// Generates a fresh 128-bit identifier, hex-encoded, prefixed by `kind`
/// (e.g. `"tok"`, `"evt"`) so ids remain visually distinguishable in logs.
#[must_use]
pub fn fresh(kind: &str) -> String {
    let bytes: [u8; 16] = rand::thread_rng().r#gen();
    let mut hex = String::with_capacity(kind.len() + 1 + bytes.len() * 2);
    hex.push_str(kind);
    hex.push('-');
    for byte in bytes {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "Test-only panic-based assertions are permitted.")]

    use super::*;

    #[test]
    fn fresh_ids_are_prefixed_and_distinct() {
        let a = fresh("tok");
        let b = fresh("tok");
        assert!(a.starts_with("tok-"));
        assert_ne!(a, b);
    }
}
