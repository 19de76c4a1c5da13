//! Bounded FIFO request queue with per-entry wait deadlines.
//!
//! Submissions past capacity are refused immediately. Entries that outstay
//! their `max_wait` are failed with a timeout, either by the periodic sweep
//! (which keeps running while the worker is busy with an upstream call) or
//! by the head-of-line check in [`RequestQueue::pop`]; an overdue request is
//! never dispatched. Order is strictly first-in, first-out.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use secrecy::SecretString;
use tokio::sync::Notify;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::{BoxError, PoolError};

/// A caller's request function, re-invokable once per attempted key.
pub(crate) type Job<R> = Box<dyn Fn(SecretString) -> BoxFuture<'static, Result<R, BoxError>> + Send + Sync>;

pub(crate) struct QueuedRequest<R> {
    pub queued_at: Instant,
    pub max_wait: Duration,
    pub job: Job<R>,
    pub reply: oneshot::Sender<Result<R, PoolError>>,
}

struct QueueInner<R> {
    items: VecDeque<QueuedRequest<R>>,
    closed: bool,
}

pub(crate) struct RequestQueue<R> {
    inner: Mutex<QueueInner<R>>,
    notify: Notify,
    max_size: usize,
}

impl<R> RequestQueue<R> {
    pub fn new(max_size: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                items: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
            max_size,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner<R>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a request, refusing immediately when at capacity or closed.
    pub fn push(&self, request: QueuedRequest<R>) -> Result<(), PoolError> {
        {
            let mut inner = self.lock();

            if inner.closed {
                return Err(PoolError::Shutdown);
            }

            if inner.items.len() >= self.max_size {
                log::debug!("request queue is full ({}/{})", inner.items.len(), self.max_size);

                return Err(PoolError::QueueFull {
                    queue_size: inner.items.len(),
                    max_queue_size: self.max_size,
                    retry_after: retry_after_hint(inner.items.len()),
                });
            }

            inner.items.push_back(request);
        }

        self.notify.notify_one();
        Ok(())
    }

    /// Wait for the next dispatchable request. Returns `None` once the
    /// queue is closed and drained.
    pub async fn pop(&self) -> Option<QueuedRequest<R>> {
        loop {
            let notified = self.notify.notified();

            {
                let mut inner = self.lock();
                expire_overdue(&mut inner);

                if let Some(request) = inner.items.pop_front() {
                    return Some(request);
                }

                if inner.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Fail every overdue entry. Called on a ~100ms tick while the queue is
    /// non-empty.
    pub fn sweep(&self) {
        let mut inner = self.lock();

        if !inner.items.is_empty() {
            expire_overdue(&mut inner);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    /// Refuse further submissions and fail everything pending.
    pub fn close(&self) {
        let drained = {
            let mut inner = self.lock();
            inner.closed = true;
            std::mem::take(&mut inner.items)
        };

        if !drained.is_empty() {
            log::debug!("failing {} pending requests on shutdown", drained.len());
        }

        for request in drained {
            let _ = request.reply.send(Err(PoolError::Shutdown));
        }

        self.notify.notify_waiters();
    }
}

fn expire_overdue<R>(inner: &mut QueueInner<R>) {
    let now = Instant::now();
    let mut index = 0;

    while index < inner.items.len() {
        let overdue = {
            let item = &inner.items[index];
            now.saturating_duration_since(item.queued_at) >= item.max_wait
        };

        if !overdue {
            index += 1;
            continue;
        }

        if let Some(request) = inner.items.remove(index) {
            let waited = now.saturating_duration_since(request.queued_at);
            let queue_size = inner.items.len();

            log::debug!("request timed out after {waited:?} in queue ({queue_size} still pending)");

            let _ = request.reply.send(Err(PoolError::QueueTimeout {
                waited,
                retry_after: retry_after_hint(queue_size),
                queue_size,
            }));
        }
    }
}

/// Back-off hint scaled to the backlog: one second per queued request, at
/// least one second.
fn retry_after_hint(queue_size: usize) -> Duration {
    Duration::from_secs((queue_size as u64).max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request<R>(max_wait: Duration) -> (QueuedRequest<R>, oneshot::Receiver<Result<R, PoolError>>)
    where
        R: Send + 'static,
    {
        let (reply, rx) = oneshot::channel();

        let request = QueuedRequest {
            queued_at: Instant::now(),
            max_wait,
            job: Box::new(|_| unimplemented!("never dispatched in queue tests")),
            reply,
        };

        (request, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn pop_returns_in_submission_order() {
        let queue: RequestQueue<u32> = RequestQueue::new(10);

        let (first, _rx1) = request(Duration::from_secs(30));
        let (second, _rx2) = request(Duration::from_secs(30));
        let first_at = first.queued_at;

        queue.push(first).unwrap();
        tokio::time::advance(Duration::from_millis(10)).await;
        queue.push(second).unwrap();

        let popped = queue.pop().await.unwrap();
        assert_eq!(popped.queued_at, first_at);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn push_past_capacity_is_refused() {
        let queue: RequestQueue<u32> = RequestQueue::new(2);

        let (a, _rx_a) = request(Duration::from_secs(30));
        let (b, _rx_b) = request(Duration::from_secs(30));
        let (c, _rx_c) = request(Duration::from_secs(30));

        queue.push(a).unwrap();
        queue.push(b).unwrap();

        let err = queue.push(c).unwrap_err();
        match err {
            PoolError::QueueFull {
                queue_size,
                max_queue_size,
                retry_after,
            } => {
                assert_eq!(queue_size, 2);
                assert_eq!(max_queue_size, 2);
                assert_eq!(retry_after, Duration::from_secs(2));
            }
            other => unreachable!("expected QueueFull, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn overdue_entries_fail_with_timeout() {
        let queue: RequestQueue<u32> = RequestQueue::new(10);

        let (stale, mut rx) = request(Duration::from_millis(200));
        queue.push(stale).unwrap();

        tokio::time::advance(Duration::from_millis(250)).await;
        queue.sweep();

        match rx.try_recv().unwrap() {
            Err(PoolError::QueueTimeout { waited, queue_size, .. }) => {
                assert!(waited >= Duration::from_millis(200));
                assert_eq!(queue_size, 0);
            }
            other => unreachable!("expected QueueTimeout, got {other:?}"),
        }

        assert_eq!(queue.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn overdue_head_is_never_dispatched() {
        let queue: RequestQueue<u32> = RequestQueue::new(10);

        let (stale, mut stale_rx) = request(Duration::from_millis(100));
        queue.push(stale).unwrap();

        tokio::time::advance(Duration::from_millis(150)).await;

        let (fresh, _fresh_rx) = request(Duration::from_secs(30));
        let fresh_at = fresh.queued_at;
        queue.push(fresh).unwrap();

        // The stale head is failed inside pop; the fresh one is handed out.
        let popped = queue.pop().await.unwrap();
        assert_eq!(popped.queued_at, fresh_at);
        assert!(matches!(
            stale_rx.try_recv().unwrap(),
            Err(PoolError::QueueTimeout { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn close_fails_pending_and_refuses_new() {
        let queue: RequestQueue<u32> = RequestQueue::new(10);

        let (pending, mut rx) = request(Duration::from_secs(30));
        queue.push(pending).unwrap();

        queue.close();

        assert!(matches!(rx.try_recv().unwrap(), Err(PoolError::Shutdown)));
        assert!(queue.pop().await.is_none());

        let (late, _late_rx) = request(Duration::from_secs(30));
        assert!(matches!(queue.push(late), Err(PoolError::Shutdown)));
    }

    #[tokio::test(start_paused = true)]
    async fn pop_wakes_on_push() {
        let queue = std::sync::Arc::new(RequestQueue::<u32>::new(10));
        let popper = std::sync::Arc::clone(&queue);

        let handle = tokio::spawn(async move { popper.pop().await.is_some() });
        tokio::task::yield_now().await;

        let (item, _rx) = request(Duration::from_secs(30));
        queue.push(item).unwrap();

        assert!(handle.await.unwrap());
    }
}
