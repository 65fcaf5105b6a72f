//! Various utility functions

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Units used by [`pretty_size`]
const SIZE_UNITS: [&str; 9] = ["B", "kB", "MB", "GB", "TB", "PB", "EB", "ZB", "YB"];

/// Calculate the hash of the given item
pub fn calculate_hash<T: Hash + ?Sized>(t: &T) -> u64 {
    let mut s = DefaultHasher::new();
    t.hash(&mut s);
    s.finish()
}

/// Returns the formatted hash of the given item as 16 hexadecimal digits
pub fn hexdigest<T: Hash + ?Sized>(t: &T) -> String {
    let h = calculate_hash(t);
    format!("{h:016x}")
}

/// Format a byte count with decimal units and at most two fractional digits
///
/// ```
/// # use snaptrace::utils::pretty_size;
/// assert_eq!(pretty_size(512), "512 B");
/// assert_eq!(pretty_size(0x3000), "12.29 kB");
/// assert_eq!(pretty_size(5_000_000), "5 MB");
/// ```
#[allow(clippy::cast_precision_loss)]
pub fn pretty_size(bytes: u64) -> String {
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1000.0 && unit < SIZE_UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }

    // Round to two digits and drop trailing zeros
    let rounded = (value * 100.0).round() / 100.0;
    format!("{rounded} {}", SIZE_UNITS[unit])
}
