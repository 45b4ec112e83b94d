//! Id allocation: monotone counter plus a short random suffix, so ids sort
//! by creation order but are not guessable.

use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};

pub struct IdGen {
    counter: AtomicU64,
}

impl IdGen {
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(1),
        }
    }

    pub fn next(&self, prefix: &str) -> String {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        let suffix: u32 = rand::thread_rng().gen_range(0x1000..0xFFFF);
        format!("{prefix}-{seq}-{suffix:x}")
    }
}

impl Default for IdGen {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_monotone_and_unique() {
        let gen = IdGen::new();
        let a = gen.next("ORD");
        let b = gen.next("ORD");
        assert!(a.starts_with("ORD-1-"));
        assert!(b.starts_with("ORD-2-"));
        assert_ne!(a, b);
    }
}
