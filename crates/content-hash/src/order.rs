//! Entry ordering inside a git tree object.
//!
//! Git sorts tree entries by raw name bytes, except that a directory name
//! compares as if it carried a trailing `/`. So `a.txt` sorts before the
//! directory `a`, while the file `a` sorts before `a.txt`.

use std::cmp::Ordering;

const fn terminator(is_dir: bool) -> u8 {
    if is_dir { b'/' } else { 0 }
}

/// Compares two tree entry names the way git orders them in a tree object.
pub fn tree_name_cmp(a: &[u8], a_is_dir: bool, b: &[u8], b_is_dir: bool) -> Ordering {
    let common = a.len().min(b.len());
    match a[..common].cmp(&b[..common]) {
        Ordering::Equal => {}
        other => return other,
    }

    let next_a = a.get(common).copied().unwrap_or(terminator(a_is_dir));
    let next_b = b.get(common).copied().unwrap_or(terminator(b_is_dir));
    next_a.cmp(&next_b)
}
