// crates/pw-orchestrator/src/ids.rs
// ============================================================================
// Module: Identifier Generation
// Description: Generates fresh group identifiers the token manager assigns
// itself (fork/expand/join groups), mirroring `pw-store`'s own id generator
// since `pw-store::ids` is private to that crate.
// Dependencies: rand
// Grounding: crates/pw-store/src/ids.rs
// ============================================================================

use rand::Rng as _;

/// Generates a fresh 128-bit identifier, hex-encoded, prefixed by `kind`.
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

    use super::fresh;

    #[test]
    fn fresh_ids_are_prefixed_and_distinct() {
        let a = fresh("fgrp");
        let b = fresh("fgrp");
        assert!(a.starts_with("fgrp-"));
        assert_ne!(a, b);
    }
}
