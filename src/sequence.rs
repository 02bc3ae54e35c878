use std::sync::atomic::{AtomicU32, Ordering};

/// Thread-safe sequence number generator for request frames.
///
/// Numbers wrap around at `u32::MAX`; the dispatcher skips any number that
/// is still pending.
#[derive(Debug)]
pub struct SequenceGenerator {
    counter: AtomicU32,
}

impl SequenceGenerator {
    /// Create a new generator starting from 1
    pub fn new() -> Self {
        SequenceGenerator {
            counter: AtomicU32::new(1),
        }
    }

    /// Create a new generator starting from a specific value
    pub fn starting_at(start: u32) -> Self {
        SequenceGenerator {
            counter: AtomicU32::new(start),
        }
    }

    /// Get the next sequence number
    pub fn next(&self) -> u32 {
        self.counter.fetch_add(1, Ordering::Relaxed)
    }

    /// Get the current value without incrementing
    pub fn current(&self) -> u32 {
        self.counter.load(Ordering::Relaxed)
    }
}

impl Default for SequenceGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_sequence_generation() {
        let gen = SequenceGenerator::new();
        assert_eq!(gen.next(), 1);
        assert_eq!(gen.next(), 2);
        assert_eq!(gen.current(), 3);
    }

    #[test]
    fn test_sequence_wraps() {
        let gen = SequenceGenerator::starting_at(u32::MAX);
        assert_eq!(gen.next(), u32::MAX);
        assert_eq!(gen.next(), 0);
        assert_eq!(gen.next(), 1);
    }

    #[test]
    fn test_sequence_thread_safe() {
        let gen = Arc::new(SequenceGenerator::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gen = Arc::clone(&gen);
                thread::spawn(move || (0..250).map(|_| gen.next()).collect::<Vec<_>>())
            })
            .collect();

        let mut all: Vec<u32> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 2000);
        assert_eq!(all.first(), Some(&1));
        assert_eq!(all.last(), Some(&2000));
    }
}
