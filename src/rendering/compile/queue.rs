use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

/// Blocking multi-producer/multi-consumer queue that hands each item to
/// exactly one taker. Serves both as the compile-context pool and as the
/// loader-worker task queue. There are no timeouts; [`ResourceQueue::shutdown`]
/// poisons the queue so blocked takers wake up and callers fail fast.
pub struct ResourceQueue<T> {
    state: Mutex<QueueState<T>>,
    available: Condvar,
}

struct QueueState<T> {
    items: VecDeque<T>,
    shutdown: bool,
}

impl<T> ResourceQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                shutdown: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Pushes an item and wakes one waiter. Items added after shutdown are
    /// dropped (the pool is winding down and must stay empty); returns whether
    /// the item was accepted.
    pub fn add(&self, item: T) -> bool {
        let mut state = self.state.lock().expect("resource queue lock");
        if state.shutdown {
            return false;
        }
        state.items.push_back(item);
        self.available.notify_one();
        true
    }

    /// Blocks until an item is available and returns it, or returns `None`
    /// once the queue has been shut down.
    pub fn take_when_available(&self) -> Option<T> {
        let mut state = self.state.lock().expect("resource queue lock");
        loop {
            if state.shutdown {
                return None;
            }
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            state = self.available.wait(state).expect("resource queue lock");
        }
    }

    pub fn try_take(&self) -> Option<T> {
        let mut state = self.state.lock().expect("resource queue lock");
        if state.shutdown { None } else { state.items.pop_front() }
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("resource queue lock").items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.lock().expect("resource queue lock").shutdown
    }

    /// Drains the queue permanently: queued items are dropped, every blocked
    /// taker wakes up with `None`, and all future takes fail fast.
    pub fn shutdown(&self) {
        let mut state = self.state.lock().expect("resource queue lock");
        state.shutdown = true;
        state.items.clear();
        self.available.notify_all();
    }
}

impl<T> Default for ResourceQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;

    use itertools::Itertools;

    use super::ResourceQueue;

    #[test]
    fn delivers_in_fifo_order() {
        let queue = ResourceQueue::new();
        queue.add(1);
        queue.add(2);
        queue.add(3);

        assert_eq!(queue.take_when_available(), Some(1));
        assert_eq!(queue.take_when_available(), Some(2));
        assert_eq!(queue.take_when_available(), Some(3));
    }

    #[test]
    fn concurrent_takers_never_see_the_same_item() {
        let queue = Arc::new(ResourceQueue::new());
        for item in 0..1000 {
            queue.add(item);
        }
        // stop marker, bounced between takers so each of them terminates
        queue.add(i32::MAX);

        let workers = (0..4)
            .map(|index| {
                let queue = queue.clone();
                std::thread::Builder::new()
                    .name(format!("taker {}", index))
                    .spawn(move || {
                        let mut seen = Vec::new();
                        while let Some(item) = queue.take_when_available() {
                            if item == i32::MAX {
                                // pass the stop marker on to the next taker
                                queue.add(item);
                                break;
                            }
                            seen.push(item);
                        }
                        seen
                    })
                    .expect("Failed to spawn taker")
            })
            .collect_vec();

        let taken = workers
            .into_iter()
            .flat_map(|worker| worker.join().expect("Taker to terminate normally"))
            .collect_vec();

        assert_eq!(taken.len(), 1000);
        assert_eq!(taken.iter().copied().collect::<HashSet<_>>().len(), 1000);
    }

    #[test]
    fn shutdown_unblocks_waiting_takers() {
        let queue: Arc<ResourceQueue<i32>> = Arc::new(ResourceQueue::new());

        let blocked = {
            let queue = queue.clone();
            std::thread::Builder::new()
                .name("blocked taker".into())
                .spawn(move || queue.take_when_available())
                .expect("Failed to spawn taker")
        };

        std::thread::sleep(Duration::from_millis(50));
        queue.shutdown();

        assert_eq!(blocked.join().expect("Taker to terminate normally"), None);
    }

    #[test]
    fn adds_after_shutdown_are_dropped() {
        let queue = ResourceQueue::new();
        assert!(queue.add(1));
        queue.shutdown();
        assert!(!queue.add(2));

        assert!(queue.is_empty());
        assert_eq!(queue.take_when_available(), None);
    }
}
