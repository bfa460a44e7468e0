//! A multi-producer multi-consumer queue with close semantics.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

/// MPMC queue, bounded or unbounded, shared by cloning.
///
/// Poppers wait for values; bounded pushers wait for a free slot. After
/// [`close`](WaitQueue::close) returns no push succeeds, every waiter is
/// woken, and poppers drain whatever remains before receiving `None`.
pub struct WaitQueue<T> {
    shared: Arc<Shared<T>>,
}

struct Shared<T> {
    items: Mutex<Inner<T>>,
    /// One permit per queued value. Closing this wakes all poppers.
    ready: Semaphore,
    /// One permit per free slot, bounded queues only.
    slots: Option<Semaphore>,
}

struct Inner<T> {
    queue: VecDeque<T>,
    closed: bool,
}

impl<T> Clone for WaitQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Default for WaitQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WaitQueue<T> {
    /// Create an unbounded queue.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Create a queue holding at most `capacity` values.
    pub fn bounded(capacity: usize) -> Self {
        Self::build(Some(Semaphore::new(capacity)))
    }

    fn build(slots: Option<Semaphore>) -> Self {
        Self {
            shared: Arc::new(Shared {
                items: Mutex::new(Inner {
                    queue: VecDeque::new(),
                    closed: false,
                }),
                ready: Semaphore::new(0),
                slots,
            }),
        }
    }

    /// Append a value, waiting for a free slot on a bounded queue.
    ///
    /// Returns the value back if the queue has been closed.
    pub async fn push(&self, value: T) -> Result<(), T> {
        if let Some(slots) = &self.shared.slots {
            match slots.acquire().await {
                Ok(permit) => permit.forget(),
                Err(_) => return Err(value),
            }
        }

        {
            let mut inner = self.shared.items.lock().unwrap();
            if inner.closed {
                return Err(value);
            }
            inner.queue.push_back(value);
        }
        self.shared.ready.add_permits(1);
        Ok(())
    }

    /// Append a value without waiting.
    ///
    /// Returns the value back if the queue is closed or full.
    pub fn try_push(&self, value: T) -> Result<(), T> {
        if let Some(slots) = &self.shared.slots {
            match slots.try_acquire() {
                Ok(permit) => permit.forget(),
                Err(_) => return Err(value),
            }
        }

        {
            let mut inner = self.shared.items.lock().unwrap();
            if inner.closed {
                return Err(value);
            }
            inner.queue.push_back(value);
        }
        self.shared.ready.add_permits(1);
        Ok(())
    }

    /// Remove the front value, waiting until one is pushed.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub async fn wait_and_pop(&self) -> Option<T> {
        match self.shared.ready.acquire().await {
            Ok(permit) => {
                permit.forget();
                self.pop_locked()
            }
            // Closed: hand out leftovers until they run dry.
            Err(_) => self.pop_locked(),
        }
    }

    /// Remove the front value without waiting.
    pub fn try_pop(&self) -> Option<T> {
        match self.shared.ready.try_acquire() {
            Ok(permit) => {
                permit.forget();
                self.pop_locked()
            }
            Err(_) if self.shared.ready.is_closed() => self.pop_locked(),
            Err(_) => None,
        }
    }

    fn pop_locked(&self) -> Option<T> {
        let value = self.shared.items.lock().unwrap().queue.pop_front();
        if value.is_some() {
            if let Some(slots) = &self.shared.slots {
                slots.add_permits(1);
            }
        }
        value
    }

    /// Close the queue: wake all waiters and reject subsequent pushes.
    ///
    /// The closed flag flips under the items lock, so a push racing with
    /// `close` either completed beforehand (its value stays poppable) or
    /// observes the flag and gets its value back.
    pub fn close(&self) {
        self.shared.items.lock().unwrap().closed = true;
        self.shared.ready.close();
        if let Some(slots) = &self.shared.slots {
            slots.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.items.lock().unwrap().closed
    }

    pub fn len(&self) -> usize {
        self.shared.items.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn push_pop_preserves_order() {
        let queue = WaitQueue::new();
        for i in 0..5 {
            queue.push(i).await.unwrap();
        }
        assert_eq!(queue.len(), 5);
        for i in 0..5 {
            assert_eq!(queue.wait_and_pop().await, Some(i));
        }
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn pop_waits_for_push() {
        let queue = WaitQueue::new();
        let popper = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.wait_and_pop().await })
        };
        queue.push(42u32).await.unwrap();
        assert_eq!(popper.await.unwrap(), Some(42));
    }

    #[tokio::test]
    async fn bounded_push_waits_for_slot() {
        let queue = WaitQueue::bounded(1);
        queue.push(1u8).await.unwrap();

        let pusher = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.push(2u8).await })
        };
        // The second push cannot complete while the queue is full.
        tokio::task::yield_now().await;
        assert_eq!(queue.len(), 1);

        assert_eq!(queue.wait_and_pop().await, Some(1));
        pusher.await.unwrap().unwrap();
        assert_eq!(queue.wait_and_pop().await, Some(2));

        queue.try_push(3u8).unwrap();
        assert_eq!(queue.try_push(4u8), Err(4));
    }

    #[tokio::test]
    async fn close_wakes_waiting_popper() {
        let queue = WaitQueue::<u8>::new();
        let popper = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.wait_and_pop().await })
        };
        tokio::task::yield_now().await;
        queue.close();
        assert_eq!(
            timeout(Duration::from_secs(1), popper).await.unwrap().unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn close_rejects_push_and_drains_leftovers() {
        let queue = WaitQueue::new();
        queue.push(1u8).await.unwrap();
        queue.push(2u8).await.unwrap();
        queue.close();

        assert!(queue.is_closed());
        assert_eq!(queue.push(3u8).await, Err(3));
        assert_eq!(queue.try_push(4u8), Err(4));
        assert_eq!(queue.wait_and_pop().await, Some(1));
        assert_eq!(queue.try_pop(), Some(2));
        assert_eq!(queue.wait_and_pop().await, None);
        assert_eq!(queue.try_pop(), None);
    }
}
