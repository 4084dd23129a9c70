//! Plate text canonicalization.

/// Placeholder plate text when recognition recovers nothing.
pub const UNREAD: &str = "UNREAD";

/// Canonical matching form: upper-case ASCII letters and digits only.
///
/// Idempotent, so re-normalizing stored plates is harmless.
pub fn canonicalize(plate: &str) -> String {
    plate
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}
