//! Natural ordering of read names.
//!
//! Read names are compared the way name-sorted alignment files are ordered:
//! runs of digits compare by numeric value (leading zeros ignored), every
//! other byte compares by value. UTF-8 byte order equals code point order, so
//! comparing bytes is enough.

use std::cmp::Ordering;

#[inline]
fn digit_at(s: &[u8], i: usize) -> bool {
    s.get(i).is_some_and(u8::is_ascii_digit)
}

/// Compare two read names in natural order.
///
/// Two names that only differ in zero padding of a number (`read02` and
/// `read2`) compare equal.
pub fn compare(a: &str, b: &str) -> Ordering {
    let a = a.as_bytes();
    let b = b.as_bytes();
    let (mut i, mut j) = (0, 0);

    while i < a.len() && j < b.len() {
        if a[i].is_ascii_digit() && b[j].is_ascii_digit() {
            while i < a.len() && a[i] == b'0' {
                i += 1;
            }
            while j < b.len() && b[j] == b'0' {
                j += 1;
            }
            while digit_at(a, i) && digit_at(b, j) && a[i] == b[j] {
                i += 1;
                j += 1;
            }

            match (digit_at(a, i), digit_at(b, j)) {
                (true, true) => {
                    // Same prefix, first differing digit found. The longer
                    // run is the larger number; equal lengths fall back to
                    // that first digit.
                    let mut k = 0;
                    while digit_at(a, i + k) && digit_at(b, j + k) {
                        k += 1;
                    }
                    if digit_at(a, i + k) {
                        return Ordering::Greater;
                    }
                    if digit_at(b, j + k) {
                        return Ordering::Less;
                    }
                    return a[i].cmp(&b[j]);
                }
                (true, false) => return Ordering::Greater,
                (false, true) => return Ordering::Less,
                (false, false) => {}
            }
        } else {
            if a[i] != b[j] {
                return a[i].cmp(&b[j]);
            }
            i += 1;
            j += 1;
        }
    }

    // Whichever name still has unread bytes is the longer one.
    (a.len() - i).cmp(&(b.len() - j))
}
