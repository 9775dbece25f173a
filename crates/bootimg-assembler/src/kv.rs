//! Value lookup in the loose `key: value` text dumped by `unpack_bootimg`
//! and `avbtool info_image`.
//!
//! This is a substring scan, not a parser: only the first occurrence of
//! `key` counts, even when it sits inside an earlier value, and a key with
//! no newline after it yields nothing.

pub const BOOT_CMDLINE_KEY: &str = "command line args: ";
pub const VENDOR_CMDLINE_KEY: &str = "vendor command line args: ";
pub const OS_VERSION_KEY: &str = "Prop: com.android.build.boot.os_version -> ";

/// Return the text between the first `key` and the next `\n`, or an empty
/// string when the key is missing or unterminated.
pub fn extract_value(dump: &str, key: &str) -> String {
    let Some(start) = dump.find(key).map(|i| i + key.len()) else {
        return String::new();
    };
    match dump[start..].find('\n') {
        Some(len) => dump[start..start + len].to_string(),
        None => String::new(),
    }
}
