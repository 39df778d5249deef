//! Small shared helpers.

use std::fmt::Write;

/// Lowercase hex rendering of a byte slice.
#[must_use]
pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}
