use super::backend::Point;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// What happens to the oldest pending point when the buffer is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Discard it.
    DropOldest,
    /// Move it to the fallback log.
    #[default]
    Spill,
}

/// Bounded FIFO of points awaiting a successful write.
#[derive(Debug)]
pub struct PersistenceBuffer {
    queue: VecDeque<Point>,
    capacity: usize,
    policy: OverflowPolicy,
}

impl PersistenceBuffer {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            queue: VecDeque::new(),
            capacity: capacity.max(1),
            policy,
        }
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Appends a point. When full, the oldest point is evicted and returned.
    pub fn push(&mut self, point: Point) -> Option<Point> {
        let evicted = if self.queue.len() >= self.capacity {
            self.queue.pop_front()
        } else {
            None
        };
        self.queue.push_back(point);
        evicted
    }

    /// Takes up to `max` points from the front.
    pub fn take_batch(&mut self, max: usize) -> Vec<Point> {
        let n = max.min(self.queue.len());
        self.queue.drain(..n).collect()
    }

    /// Puts points back at the front, preserving their order. Points that no
    /// longer fit are returned, oldest first.
    pub fn requeue_front(&mut self, points: Vec<Point>) -> Vec<Point> {
        let room = self.capacity.saturating_sub(self.queue.len());
        let overflow = points.len().saturating_sub(room);
        let mut points = points;
        let fits = points.split_off(overflow);
        for point in fits.into_iter().rev() {
            self.queue.push_front(point);
        }
        points
    }

    pub fn drain_all(&mut self) -> Vec<Point> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
