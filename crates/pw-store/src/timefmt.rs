// crates/pw-store/src/timefmt.rs
// ============================================================================
// Module: Timestamp Formatting
// Description: RFC 3339 encode/decode for the `OffsetDateTime` columns every
// Landscape table carries.
// Purpose: One shared conversion so every table's timestamp column round-
// trips identically; `SQLite` itself is untyped and would otherwise let each
// call site pick its own text format.
// Dependencies: time
// ============================================================================

use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::error::StoreError;

/// Encodes a timestamp as RFC 3339 text for storage in a `TEXT` column.
pub fn encode(value: OffsetDateTime) -> String {
    value.format(&Rfc3339).unwrap_or_else(|_| value.unix_timestamp().to_string())
}

/// Decodes an RFC 3339 `TEXT` column back into a timestamp.
///
/// # Errors
///
/// Returns [`StoreError::Decode`] if `text` is not valid RFC 3339.
pub fn decode(text: &str) -> Result<OffsetDateTime, StoreError> {
    OffsetDateTime::parse(text, &Rfc3339).map_err(|err| StoreError::Decode(format!("bad timestamp '{text}': {err}")))
}

/// Encodes an optional timestamp, as [`encode`] would for `Some`.
#[must_use]
pub fn encode_opt(value: Option<OffsetDateTime>) -> Option<String> {
    value.map(encode)
}

/// Decodes an optional `TEXT` column back into an optional timestamp.
///
/// # Errors
///
/// See [`decode`].
pub fn decode_opt(text: Option<String>) -> Result<Option<OffsetDateTime>, StoreError> {
    text.map(|text| decode(&text)).transpose()
}
