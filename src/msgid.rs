use std::sync::atomic::{AtomicI32, Ordering};

use crate::RequestId;

/// Per-connection message ID counter.
///
/// IDs are strictly increasing until the counter reaches `i32::MAX`, after which it
/// wraps around to 1. Zero is reserved for unsolicited notifications and is never
/// returned, nor is a negative value.
#[derive(Debug, Default)]
pub(crate) struct MessageIdAllocator {
    last: AtomicI32,
}

impl MessageIdAllocator {
    pub(crate) fn new() -> Self {
        Self::with_last(0)
    }

    fn with_last(last: RequestId) -> Self {
        MessageIdAllocator {
            last: AtomicI32::new(last),
        }
    }

    pub(crate) fn next(&self) -> RequestId {
        let mut current = self.last.load(Ordering::Relaxed);
        loop {
            let next = if current <= 0 || current == RequestId::MAX {
                1
            } else {
                current + 1
            };
            match self.last.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn starts_at_one_and_increases() {
        let alloc = MessageIdAllocator::new();
        assert_eq!(alloc.next(), 1);
        assert_eq!(alloc.next(), 2);
        assert_eq!(alloc.next(), 3);
    }

    #[test]
    fn wraps_to_one_after_max() {
        let alloc = MessageIdAllocator::with_last(RequestId::MAX - 1);
        assert_eq!(alloc.next(), RequestId::MAX);
        assert_eq!(alloc.next(), 1);
        assert_eq!(alloc.next(), 2);
    }

    #[test]
    fn concurrent_callers_never_collide() {
        let alloc = Arc::new(MessageIdAllocator::with_last(RequestId::MAX - 500));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let alloc = alloc.clone();
                thread::spawn(move || (0..250).map(|_| alloc.next()).collect::<Vec<_>>())
            })
            .collect();
        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().expect("thread") {
                assert!(id > 0);
                assert!(seen.insert(id), "duplicate id {}", id);
            }
        }
        assert_eq!(seen.len(), 1000);
    }
}
