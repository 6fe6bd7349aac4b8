//! Character offset to UTF-8 byte offset conversion.
//!
//! Editors address text in UTF-16 code units while the daemon expects byte
//! offsets into the UTF-8 encoded file. Offsets past the end clamp to the
//! full byte length; an offset that falls inside a surrogate pair rounds
//! down to the start of that character.

use crate::models::CharRange;

/// Byte length of the prefix of `content` spanning `index` UTF-16 units.
pub fn utf16_to_byte_offset(content: &str, index: usize) -> usize {
    let mut units = 0;
    let mut bytes = 0;
    for ch in content.chars() {
        let next = units + ch.len_utf16();
        if next > index {
            break;
        }
        units = next;
        bytes += ch.len_utf8();
    }
    bytes
}

/// Convert a character range into a `(start, end)` byte range.
pub fn byte_range(content: &str, range: &CharRange) -> (u32, u32) {
    let start = utf16_to_byte_offset(content, range.start);
    let end = utf16_to_byte_offset(content, range.end).max(start);
    (start as u32, end as u32)
}

/// Length of `content` in UTF-16 code units.
pub fn utf16_len(content: &str) -> usize {
    content.chars().map(char::len_utf16).sum()
}
