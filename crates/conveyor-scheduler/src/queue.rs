//! Pending work ordered by priority, FIFO within a priority tier.

use conveyor_core::QueueEntryId;
use conveyor_core::queue::{Priority, QueueEntry};
use std::collections::VecDeque;

#[derive(Debug, Default)]
pub struct PendingQueue {
    tiers: [VecDeque<QueueEntry>; 3],
}

fn tier(priority: Priority) -> usize {
    match priority {
        Priority::High => 0,
        Priority::Medium => 1,
        Priority::Low => 2,
    }
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry behind everything of equal priority.
    pub fn push(&mut self, entry: QueueEntry) {
        self.tiers[tier(entry.priority)].push_back(entry);
    }

    /// Remove the highest priority, earliest inserted entry.
    pub fn pop(&mut self) -> Option<QueueEntry> {
        self.tiers.iter_mut().find_map(|t| t.pop_front())
    }

    pub fn remove(&mut self, id: &QueueEntryId) -> Option<QueueEntry> {
        for t in self.tiers.iter_mut() {
            if let Some(pos) = t.iter().position(|e| e.id == *id) {
                return t.remove(pos);
            }
        }
        None
    }

    pub fn get(&self, id: &QueueEntryId) -> Option<&QueueEntry> {
        self.iter().find(|e| e.id == *id)
    }

    /// Entries in dispatch order.
    pub fn iter(&self) -> impl Iterator<Item = &QueueEntry> {
        self.tiers.iter().flat_map(|t| t.iter())
    }

    pub fn len(&self) -> usize {
        self.tiers.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.iter().all(VecDeque::is_empty)
    }

    pub fn count(&self, priority: Priority) -> usize {
        self.tiers[tier(priority)].len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::queue::NewJob;

    fn entry(name: &str, priority: Priority) -> QueueEntry {
        QueueEntry::admit(NewJob::new(name).with_priority(priority)).unwrap()
    }

    #[test]
    fn test_pop_order_is_priority_then_fifo() {
        let mut queue = PendingQueue::new();
        queue.push(entry("low-1", Priority::Low));
        queue.push(entry("medium-1", Priority::Medium));
        queue.push(entry("high-1", Priority::High));
        queue.push(entry("medium-2", Priority::Medium));
        queue.push(entry("high-2", Priority::High));

        let order: Vec<String> = std::iter::from_fn(|| queue.pop())
            .map(|e| e.job_id)
            .collect();
        assert_eq!(
            order,
            vec!["high-1", "high-2", "medium-1", "medium-2", "low-1"]
        );
    }

    #[test]
    fn test_remove_by_id() {
        let mut queue = PendingQueue::new();
        let keep = entry("keep", Priority::Low);
        let drop = entry("drop", Priority::Low);
        let drop_id = drop.id;
        queue.push(keep);
        queue.push(drop);

        assert_eq!(queue.remove(&drop_id).unwrap().job_id, "drop");
        assert!(queue.remove(&drop_id).is_none());
        assert!(queue.get(&drop_id).is_none());
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.count(Priority::Low), 1);
    }

    #[test]
    fn test_iter_matches_dispatch_order() {
        let mut queue = PendingQueue::new();
        queue.push(entry("b", Priority::Low));
        queue.push(entry("a", Priority::High));
        let names: Vec<&str> = queue.iter().map(|e| e.job_id.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(!queue.is_empty());
    }
}
