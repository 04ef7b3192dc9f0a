//! Document ids.
//!
//! Times are zero padded to 16 digits so lexicographic order of ids is
//! chronological order, which range scans rely on.

use std::sync::atomic::{AtomicU64, Ordering};

pub fn pad16(t: i64) -> String {
    format!("{:016}", t)
}

/// Time prefixed id, for scans over a time range.
pub fn tkuri(key: &str, time: i64) -> String {
    format!("t/{}/k/{}", pad16(time), key)
}

/// Key prefixed id, for scans over the history of a key.
pub fn kturi(key: &str, time: i64) -> String {
    format!("k/{}/t/{}", key, pad16(time))
}

/// Generates monotonic processed ids of the form `<pad16(time)>-<counter>`.
#[derive(Debug, Default)]
pub struct SeqId {
    counter: AtomicU64,
}

impl SeqId {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self, time: i64) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        format!("{}-{:08}", pad16(time), n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids() {
        assert_eq!(pad16(42), "0000000000000042");
        assert_eq!(tkuri("a/b", 7), "t/0000000000000007/k/a/b");
        assert_eq!(kturi("a/b", 7), "k/a/b/t/0000000000000007");
        assert!(tkuri("z", 9) < tkuri("a", 10));
    }

    #[test]
    fn test_seqid_is_monotonic() {
        let seq = SeqId::new();
        let a = seq.next(1000);
        let b = seq.next(1000);
        assert_eq!(a, "0000000000001000-00000000");
        assert!(a < b);
        assert!(b < seq.next(1001));
    }
}
