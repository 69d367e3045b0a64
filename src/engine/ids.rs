//! Correlation id allocation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::config::IdStrategy;
use crate::protocol::RequestId;

/// Hands out correlation ids.
///
/// The sequential strategy serializes all callers on one counter. The
/// partitioned strategy spreads callers over independent ranges, each with
/// its own lock; ids wrap within their range, so an id is only reused after
/// the range has been exhausted.
#[derive(Debug)]
pub(crate) enum IdAllocator {
    Sequential(Mutex<RequestId>),
    Partitioned {
        ranges: Vec<Mutex<RequestId>>,
        range_size: RequestId,
        cursor: AtomicUsize,
    },
}

impl IdAllocator {
    pub(crate) fn new(strategy: IdStrategy) -> Self {
        match strategy {
            IdStrategy::Sequential => IdAllocator::Sequential(Mutex::new(0)),
            IdStrategy::Partitioned { ranges, range_size } => IdAllocator::Partitioned {
                ranges: (0..ranges.max(1))
                    .map(|i| Mutex::new(i.saturating_mul(range_size)))
                    .collect(),
                range_size: range_size.max(1),
                cursor: AtomicUsize::new(0),
            },
        }
    }

    pub(crate) fn next(&self) -> RequestId {
        match self {
            IdAllocator::Sequential(counter) => {
                let mut counter = counter.lock().unwrap_or_else(|e| e.into_inner());
                *counter = counter.wrapping_add(1);
                *counter
            }
            IdAllocator::Partitioned {
                ranges,
                range_size,
                cursor,
            } => {
                let index = cursor.fetch_add(1, Ordering::Relaxed) % ranges.len();
                let start = (index as RequestId).saturating_mul(*range_size);
                let mut next = ranges[index].lock().unwrap_or_else(|e| e.into_inner());
                let id = *next;
                *next = if id - start + 1 >= *range_size {
                    start
                } else {
                    id + 1
                };
                id
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_sequential_ids() {
        let ids = IdAllocator::new(IdStrategy::Sequential);
        assert_eq!(ids.next(), 1);
        assert_eq!(ids.next(), 2);
        assert_eq!(ids.next(), 3);
    }

    #[test]
    fn test_sequential_wraps() {
        let ids = IdAllocator::Sequential(Mutex::new(RequestId::MAX - 1));
        assert_eq!(ids.next(), RequestId::MAX);
        assert_eq!(ids.next(), 0);
    }

    #[test]
    fn test_partitioned_ranges_rotate() {
        let ids = IdAllocator::new(IdStrategy::Partitioned {
            ranges: 3,
            range_size: 10,
        });
        let first: Vec<_> = (0..6).map(|_| ids.next()).collect();
        assert_eq!(first, vec![0, 10, 20, 1, 11, 21]);
    }

    #[test]
    fn test_partitioned_wraps_within_range() {
        let ids = IdAllocator::new(IdStrategy::Partitioned {
            ranges: 2,
            range_size: 3,
        });
        let all: Vec<_> = (0..8).map(|_| ids.next()).collect();
        assert_eq!(all, vec![0, 3, 1, 4, 2, 5, 0, 3]);
    }

    #[test]
    fn test_concurrent_ids_are_unique() {
        let ids = Arc::new(IdAllocator::new(IdStrategy::partitioned()));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ids = Arc::clone(&ids);
                std::thread::spawn(move || (0..1_000).map(|_| ids.next()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "duplicate id {id}");
            }
        }
        assert_eq!(seen.len(), 8_000);
    }
}
