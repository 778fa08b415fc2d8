//! Strictly FIFO async mutual exclusion.
//!
//! The lock only remembers the tail of the waiter queue: a receiver that
//! completes when the most recent acquirer releases. `acquire` swaps in a new
//! tail synchronously, so the queue position is fixed at call time rather
//! than at first poll.
//!
//! A waiter abandoned before it got the lock sends its own predecessor's
//! receiver down the chain, so its successor keeps waiting on that instead.

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

// What a released or abandoned slot tells the next waiter. A dropped sender
// means the lock is free.
#[derive(Debug)]
enum Handoff {
    WaitFor(oneshot::Receiver<Handoff>),
}

#[derive(Debug, Default)]
pub struct Lock {
    tail: Mutex<Option<oneshot::Receiver<Handoff>>>,
}

impl Lock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Joins the queue. The returned future resolves once every earlier
    /// acquirer has released.
    pub fn acquire(&self) -> Acquire {
        let (release, released) = oneshot::channel();
        let previous = {
            let mut tail = self.tail.lock().unwrap_or_else(|e| e.into_inner());
            tail.replace(released)
        };
        Acquire { previous, release: Some(release) }
    }
}

/// Future returned by [`Lock::acquire`].
#[derive(Debug)]
#[must_use = "the lock is not acquired until the future is awaited"]
pub struct Acquire {
    previous: Option<oneshot::Receiver<Handoff>>,
    release: Option<oneshot::Sender<Handoff>>,
}

impl Future for Acquire {
    type Output = LockGuard;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<LockGuard> {
        while let Some(previous) = self.previous.as_mut() {
            match Pin::new(previous).poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Ok(Handoff::WaitFor(earlier))) => self.previous = Some(earlier),
                Poll::Ready(Err(_)) => self.previous = None,
            }
        }
        Poll::Ready(LockGuard { release: self.release.take() })
    }
}

impl Drop for Acquire {
    fn drop(&mut self) {
        // abandoned while still queued
        if let (Some(previous), Some(release)) = (self.previous.take(), self.release.take()) {
            let _ = release.send(Handoff::WaitFor(previous));
        }
    }
}

/// Proof of holding the lock. Released on [`LockGuard::release`] or drop.
#[derive(Debug)]
pub struct LockGuard {
    release: Option<oneshot::Sender<Handoff>>,
}

impl LockGuard {
    pub fn release(mut self) {
        self.release.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::sleep;

    fn push(out: &Mutex<Vec<u32>>, v: u32) {
        out.lock().unwrap().push(v);
    }

    #[tokio::test]
    async fn acquire_release_acquire() {
        let lock = Lock::new();
        let first = lock.acquire().await;
        first.release();
        let second = lock.acquire().await;
        drop(second);
        let _third = lock.acquire().await;
    }

    #[tokio::test(start_paused = true)]
    async fn interleaved_critical_sections_run_in_order() {
        let lock = Arc::new(Lock::new());
        let out = Arc::new(Mutex::new(Vec::new()));

        let t1 = {
            let (lock, out) = (lock.clone(), out.clone());
            async move {
                let guard = lock.acquire().await;
                push(&out, 1);
                sleep(Duration::from_millis(1000)).await;
                push(&out, 2);
                guard.release();
                sleep(Duration::from_millis(1000)).await;
                let guard = lock.acquire().await;
                push(&out, 5);
                guard.release();
            }
        };
        let t2 = {
            let (lock, out) = (lock.clone(), out.clone());
            async move {
                sleep(Duration::from_millis(500)).await;
                let guard = lock.acquire().await;
                push(&out, 3);
                sleep(Duration::from_millis(500)).await;
                push(&out, 4);
                guard.release();
            }
        };

        tokio::join!(t1, t2);
        assert_eq!(*out.lock().unwrap(), vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn queued_waiters_are_served_in_call_order() {
        let lock = Arc::new(Lock::new());
        let out = Arc::new(Mutex::new(Vec::new()));

        let t1 = {
            let (lock, out) = (lock.clone(), out.clone());
            async move {
                let guard = lock.acquire().await;
                push(&out, 1);
                sleep(Duration::from_millis(5000)).await;
                push(&out, 2);
                guard.release();
            }
        };
        let t2 = {
            let (lock, out) = (lock.clone(), out.clone());
            async move {
                sleep(Duration::from_millis(500)).await;
                let guard = lock.acquire().await;
                push(&out, 3);
                sleep(Duration::from_millis(500)).await;
                push(&out, 4);
                guard.release();
            }
        };
        let t3 = {
            let (lock, out) = (lock.clone(), out.clone());
            async move {
                sleep(Duration::from_millis(1500)).await;
                let guard = lock.acquire().await;
                push(&out, 5);
                push(&out, 6);
                guard.release();
            }
        };

        tokio::join!(t1, t2, t3);
        assert_eq!(*out.lock().unwrap(), vec![1, 2, 3, 4, 5, 6]);
    }

    #[tokio::test(start_paused = true)]
    async fn queue_position_is_taken_when_acquire_is_called() {
        let lock = Lock::new();
        let out = Mutex::new(Vec::new());

        let holder = lock.acquire().await;
        // created in order b, c but polled in order c, b
        let b = lock.acquire();
        let c = lock.acquire();
        let tc = async {
            let g = c.await;
            push(&out, 3);
            g.release();
        };
        let tb = async {
            let g = b.await;
            push(&out, 2);
            sleep(Duration::from_millis(100)).await;
            g.release();
        };
        let release_holder = async {
            sleep(Duration::from_millis(10)).await;
            push(&out, 1);
            holder.release();
        };
        tokio::join!(tc, tb, release_holder);
        assert_eq!(*out.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_waiter_keeps_the_queue_intact() {
        let lock = Lock::new();
        let holder = lock.acquire().await;

        let abandoned = lock.acquire();
        let next = lock.acquire();
        drop(abandoned);

        // still held: the successor of the abandoned waiter must not get in
        let early = tokio::time::timeout(Duration::from_millis(50), next).await;
        assert!(early.is_err());

        holder.release();
        let _guard = tokio::time::timeout(Duration::from_millis(50), lock.acquire())
            .await
            .expect("lock should be free once the holder released");
    }

    #[test]
    fn abandoning_works_without_a_runtime() {
        let lock = Lock::new();
        let mut cx = Context::from_waker(std::task::Waker::noop());

        let mut first = Box::pin(lock.acquire());
        let Poll::Ready(holder) = first.as_mut().poll(&mut cx) else { panic!("free lock must be granted") };
        let abandoned = lock.acquire();
        let mut next = Box::pin(lock.acquire());
        drop(abandoned);

        assert!(next.as_mut().poll(&mut cx).is_pending());
        holder.release();
        assert!(next.as_mut().poll(&mut cx).is_ready());
    }
}
