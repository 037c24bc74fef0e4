use std::fmt::Write;

use sha2::{Digest, Sha256};

/// Derived file names longer than this are shortened and suffixed with a hash of the key.
const MAX_FILE_NAME: usize = 200;

/// Replaces all special URI characters with a single `+`.
///
/// Runs of `+` (including ones already present in the input) collapse into one. The transform
/// is monotone for prefixes: when `key` starts with `prefix`, `safe_file_name(key)` starts with
/// `safe_file_name(prefix)`. This is what lets prefix invalidation match records on disk.
pub fn safe_file_name(key: &str) -> String {
    let mut name = String::with_capacity(key.len());
    for c in key.chars() {
        let c = match c {
            '.' | ':' | '/' | ',' | '%' | '?' | '&' | '=' | '\\' => '+',
            c => c,
        };
        if c == '+' && name.ends_with('+') {
            continue;
        }
        name.push(c);
    }
    name
}

/// The file name a key is persisted under in the disk tier.
///
/// Names that would exceed the filesystem's limits keep their first [`MAX_FILE_NAME`]
/// bytes, followed by `-` and the hex encoded sha-256 of the full key.
pub fn file_name_for_key(key: &str) -> String {
    let name = safe_file_name(key);
    if name.len() <= MAX_FILE_NAME {
        return name;
    }

    let mut end = MAX_FILE_NAME;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    let mut shortened = String::with_capacity(end + 1 + 64);
    shortened.push_str(&name[..end]);
    shortened.push('-');
    for b in Sha256::digest(key.as_bytes()) {
        // writing into a `String` cannot fail
        let _ = write!(shortened, "{b:02x}");
    }
    shortened
}

/// The file name prefix that every record of a key starting with `prefix` has.
///
/// For very long prefixes this is the shortened part of the name only, which makes prefix
/// matching on disk err on the side of removing too much.
pub fn file_name_prefix(prefix: &str) -> String {
    let mut name = safe_file_name(prefix);
    if name.len() > MAX_FILE_NAME {
        let mut end = MAX_FILE_NAME;
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        name.truncate(end);
    }
    name
}
