//! Inactivity detection
//!
//! A periodic checker over a single has-activity flag: any I/O progress
//! calls [`ActivityTimer::update`]; a tick that finds the flag clear fires
//! the timeout callback once. The timer keeps no strong reference to the
//! flow it supervises; the callback must tolerate the flow being gone.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Idle period for a fully open connection
pub const CONNECTION_IDLE: Duration = Duration::from_secs(300);

/// Idle period once one direction has finished
pub const HALF_CLOSED_IDLE: Duration = Duration::from_secs(1);

pub struct ActivityTimer {
    inner: Arc<TimerInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

struct TimerInner {
    active: AtomicBool,
    cancelled: AtomicBool,
    on_timeout: Box<dyn Fn() + Send + Sync>,
}

impl ActivityTimer {
    /// Start checking with the given period
    pub fn new<F>(timeout: Duration, on_timeout: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let inner = Arc::new(TimerInner {
            active: AtomicBool::new(true),
            cancelled: AtomicBool::new(false),
            on_timeout: Box::new(on_timeout),
        });
        let timer = ActivityTimer {
            inner,
            task: Mutex::new(None),
        };
        timer.restart(timeout);
        timer
    }

    /// Record I/O progress
    pub fn update(&self) {
        self.inner.active.store(true, Ordering::Release);
    }

    /// Switch the supervision period. A zero period fires immediately.
    pub fn set_timeout(&self, timeout: Duration) {
        if timeout.is_zero() {
            self.stop_task();
            if !self.inner.cancelled.swap(true, Ordering::AcqRel) {
                (self.inner.on_timeout)();
            }
            return;
        }
        self.restart(timeout);
    }

    /// Stop supervising; the callback will not fire afterwards
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        self.stop_task();
    }

    fn stop_task(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }

    fn restart(&self, period: Duration) {
        self.stop_task();
        self.inner.active.store(true, Ordering::Release);
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                if inner.cancelled.load(Ordering::Acquire) {
                    return;
                }
                if inner.active.swap(false, Ordering::AcqRel) {
                    continue;
                }
                if !inner.cancelled.swap(true, Ordering::AcqRel) {
                    (inner.on_timeout)();
                }
                return;
            }
        });
        *self.task.lock() = Some(handle);
    }
}

impl Drop for ActivityTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}
