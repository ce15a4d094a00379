//! Single-thread deferred task executor.
//!
//! One dedicated thread executes submitted closures one batch at a time.
//! Used to move socket bookkeeping off a thread that must not re-enter a
//! lock held elsewhere: the coordinator's accept loop defers registration of
//! freshly accepted sockets here instead of taking the socket-set mutex that
//! the listen loop may be holding mid-iteration.
//!
//! The executor is only ever used for short, order-insensitive bookkeeping —
//! nothing whose completion is required for correctness beyond the explicit
//! join at shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

type Task = Box<dyn FnOnce() + Send + 'static>;

struct Shared {
    tasks: Mutex<Vec<Task>>,
    wakeup: Condvar,
    quit: AtomicBool,
}

pub struct DeferredTaskExecutor {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl DeferredTaskExecutor {
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            tasks: Mutex::new(Vec::new()),
            wakeup: Condvar::new(),
            quit: AtomicBool::new(false),
        });

        let worker_shared = shared.clone();
        let thread = std::thread::Builder::new()
            .name("collboot-deferred".to_string())
            .spawn(move || worker_loop(worker_shared))
            .expect("Failed to spawn deferred executor thread");

        Self {
            shared,
            thread: Some(thread),
        }
    }

    /// Queue a task for execution and wake the worker.
    ///
    /// Returns false if the executor is already shutting down (the task is
    /// dropped, matching shutdown semantics).
    pub fn submit(&self, task: impl FnOnce() + Send + 'static) -> bool {
        if self.shared.quit.load(Ordering::Acquire) {
            return false;
        }
        self.shared.tasks.lock().unwrap().push(Box::new(task));
        self.shared.wakeup.notify_one();
        true
    }

    /// Synchronous barrier: returns true once the worker thread has
    /// demonstrably executed a task, guaranteeing the executor is running
    /// before callers rely on it. Returns false if the worker does not come
    /// up within `timeout`, or if the executor is already shutting down.
    pub fn wait_until_ready(&self, timeout: Duration) -> bool {
        let ready = Arc::new(AtomicBool::new(false));
        let flag = ready.clone();
        if !self.submit(move || flag.store(true, Ordering::Release)) {
            return false;
        }
        let deadline = Instant::now() + timeout;
        while !ready.load(Ordering::Acquire) {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::yield_now();
        }
        true
    }

    /// Stop the worker and join it. Tasks still queued after the final drain
    /// are dropped, not executed, and logged as an error.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        self.shared.quit.store(true, Ordering::Release);
        self.shared.wakeup.notify_one();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        let leftover = {
            let mut tasks = self.shared.tasks.lock().unwrap();
            std::mem::take(&mut *tasks)
        };
        if !leftover.is_empty() {
            eprintln!(
                "Error: deferred executor dropped {} queued task(s) at shutdown",
                leftover.len()
            );
        }
    }
}

impl Default for DeferredTaskExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DeferredTaskExecutor {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.stop_and_join();
        }
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let batch = {
            let mut tasks = shared.tasks.lock().unwrap();
            while tasks.is_empty() && !shared.quit.load(Ordering::Acquire) {
                tasks = shared.wakeup.wait(tasks).unwrap();
            }
            std::mem::take(&mut *tasks)
        };

        // Drain and execute everything we were woken for, then re-check quit.
        for task in batch {
            task();
        }

        if shared.quit.load(Ordering::Acquire) {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_executes_submitted_tasks() {
        let executor = DeferredTaskExecutor::new();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let counter = counter.clone();
            executor.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        assert!(executor.wait_until_ready(Duration::from_secs(5)));
        // wait_until_ready only proves the worker is running; give the last
        // batch a moment to drain before asserting.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while counter.load(Ordering::SeqCst) < 10 && std::time::Instant::now() < deadline {
            std::thread::yield_now();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_wait_until_ready_blocks_until_started() {
        let executor = DeferredTaskExecutor::new();
        // A true result means a submitted task ran to completion.
        assert!(executor.wait_until_ready(Duration::from_secs(5)));
        executor.shutdown();
    }

    #[test]
    fn test_wait_until_ready_bounded_after_quit() {
        let executor = DeferredTaskExecutor::new();
        executor.shared.quit.store(true, Ordering::Release);
        // The readiness task is rejected, so this must report failure
        // instead of spinning forever.
        assert!(!executor.wait_until_ready(Duration::from_millis(50)));
    }

    #[test]
    fn test_single_thread_execution_order() {
        let executor = DeferredTaskExecutor::new();
        assert!(executor.wait_until_ready(Duration::from_secs(5)));

        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..20 {
            let order = order.clone();
            executor.submit(move || {
                order.lock().unwrap().push(i);
            });
        }

        // Shutdown may drop tasks still queued, so wait for the drain first.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while order.lock().unwrap().len() < 20 && std::time::Instant::now() < deadline {
            std::thread::yield_now();
        }
        executor.shutdown();

        // One worker thread drains the list in submission order.
        let expected: Vec<i32> = (0..20).collect();
        assert_eq!(*order.lock().unwrap(), expected);
    }

    #[test]
    fn test_submit_after_shutdown_is_rejected() {
        let executor = DeferredTaskExecutor::new();
        executor.shared.quit.store(true, Ordering::Release);
        assert!(!executor.submit(|| panic!("must not run")));
    }
}
