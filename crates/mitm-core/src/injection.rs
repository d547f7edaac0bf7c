use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::protocol::Direction;

/// A raw packet waiting to be spliced into one direction of the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectionEntry {
    pub direction: Direction,
    pub bytes: Vec<u8>,
}

impl InjectionEntry {
    pub fn new(direction: Direction, bytes: Vec<u8>) -> Self {
        Self { direction, bytes }
    }
}

/// One FIFO per direction, shared by the console and both pumps of a relay.
///
/// Pumps pop at most one entry per received buffer so injected packets stay
/// interleaved with genuine traffic instead of bursting.
#[derive(Debug, Default)]
pub struct InjectionQueue {
    upstream: Mutex<VecDeque<Vec<u8>>>,
    downstream: Mutex<VecDeque<Vec<u8>>>,
}

impl InjectionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lane(&self, direction: Direction) -> &Mutex<VecDeque<Vec<u8>>> {
        match direction {
            Direction::Upstream => &self.upstream,
            Direction::Downstream => &self.downstream,
        }
    }

    pub fn enqueue(&self, direction: Direction, bytes: Vec<u8>) {
        self.lane(direction).lock().push_back(bytes);
    }

    pub fn enqueue_entry(&self, entry: InjectionEntry) {
        self.enqueue(entry.direction, entry.bytes);
    }

    pub fn try_dequeue(&self, direction: Direction) -> Option<Vec<u8>> {
        self.lane(direction).lock().pop_front()
    }

    pub fn len(&self, direction: Direction) -> usize {
        self.lane(direction).lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len(Direction::Upstream) == 0 && self.len(Direction::Downstream) == 0
    }

    /// Drops everything queued in `direction`; returns how many were dropped.
    pub fn clear(&self, direction: Direction) -> usize {
        let mut lane = self.lane(direction).lock();
        let dropped = lane.len();
        lane.clear();
        dropped
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn fifo_per_direction() {
        let queue = InjectionQueue::new();
        queue.enqueue(Direction::Upstream, vec![1]);
        queue.enqueue(Direction::Downstream, vec![9]);
        queue.enqueue(Direction::Upstream, vec![2]);

        assert_eq!(queue.try_dequeue(Direction::Upstream), Some(vec![1]));
        assert_eq!(queue.try_dequeue(Direction::Upstream), Some(vec![2]));
        assert_eq!(queue.try_dequeue(Direction::Upstream), None);
        assert_eq!(queue.try_dequeue(Direction::Downstream), Some(vec![9]));
        assert!(queue.is_empty());
    }

    #[test]
    fn concurrent_producers_lose_nothing() {
        let queue = Arc::new(InjectionQueue::new());
        let handles: Vec<_> = (0..4u8)
            .map(|t| {
                let queue = queue.clone();
                thread::spawn(move || {
                    for i in 0..100u8 {
                        queue.enqueue(Direction::Downstream, vec![t, i]);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(queue.len(Direction::Downstream), 400);
        // Each producer's own entries keep their relative order.
        let mut last = [None::<u8>; 4];
        while let Some(entry) = queue.try_dequeue(Direction::Downstream) {
            let (t, i) = (entry[0] as usize, entry[1]);
            assert!(last[t].is_none_or(|prev| prev < i));
            last[t] = Some(i);
        }
    }

    #[test]
    fn clear_reports_dropped_count() {
        let queue = InjectionQueue::new();
        queue.enqueue_entry(InjectionEntry::new(Direction::Upstream, vec![1]));
        queue.enqueue_entry(InjectionEntry::new(Direction::Upstream, vec![2]));
        assert_eq!(queue.clear(Direction::Upstream), 2);
        assert_eq!(queue.len(Direction::Upstream), 0);
    }
}
