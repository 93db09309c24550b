//! Small helpers shared across the engine.

/// The substring of `version` up to and including the first `.`, used for
/// platform-prefix compatibility checks.
///
/// Returns `None` if there's no `.` at all -- callers must treat that as
/// an error, not an empty prefix.
pub fn dotted_prefix(version: &str) -> Option<&str> {
    let dot = version.find('.')?;
    Some(&version[..=dot])
}

/// Read a NUL-terminated (or NUL-padded) ASCII/UTF-8 string out of a
/// fixed-width byte field, stopping at the first NUL.
pub fn nul_terminated_str(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}
