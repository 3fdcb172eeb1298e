use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Trailing-edge debouncer.
///
/// Every call to [`schedule`](Self::schedule) cancels whatever was still
/// pending and starts the delay over, so out of a burst of calls only the
/// last task ever runs, once the burst has been quiet for the whole delay.
/// Dropping the debouncer cancels the pending task.
///
/// Tasks run on the current Tokio runtime. Outside of a runtime there is
/// nothing to wait on, and tasks run immediately instead.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::time::Duration;
/// use strata_asyncutils::Debouncer;
///
/// # #[tokio::main(flavor = "current_thread", start_paused = true)]
/// # async fn main() {
/// let runs = Arc::new(AtomicUsize::new(0));
/// let mut debouncer = Debouncer::new(Duration::from_millis(200));
/// for _ in 0..3 {
///     let runs = Arc::clone(&runs);
///     debouncer.schedule(move || {
///         runs.fetch_add(1, Ordering::SeqCst);
///     });
/// }
/// tokio::time::sleep(Duration::from_millis(250)).await;
/// assert_eq!(runs.load(Ordering::SeqCst), 1);
/// # }
/// ```
#[derive(Debug)]
pub struct Debouncer {
    delay: Duration,
    pending: Option<JoinHandle<()>>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self { delay, pending: None }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Run `task` once the delay has elapsed without another call to
    /// `schedule`, cancelling the previously scheduled task.
    ///
    /// Returns `false` if there was no runtime to defer to, in which case
    /// `task` has already run by the time this returns.
    pub fn schedule<F>(&mut self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.cancel();
        let Ok(runtime) = Handle::try_current() else {
            tracing::trace!("No async runtime available; running debounced task immediately");
            task();
            return false;
        };
        let delay = self.delay;
        self.pending = Some(runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            task();
        }));
        true
    }

    /// Cancel the pending task, if there is one. Returns whether a task was
    /// still waiting to run.
    pub fn cancel(&mut self) -> bool {
        match self.pending.take() {
            Some(handle) if !handle.is_finished() => {
                handle.abort();
                true
            },
            _ => false,
        }
    }

    /// Whether a scheduled task is still waiting to run.
    pub fn is_pending(&self) -> bool {
        self.pending.as_ref().is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> Box<dyn FnOnce() + Send>) {
        let runs = Arc::new(AtomicUsize::new(0));
        let handle = Arc::clone(&runs);
        let make = move || {
            let runs = Arc::clone(&handle);
            Box::new(move || {
                runs.fetch_add(1, Ordering::SeqCst);
            }) as Box<dyn FnOnce() + Send>
        };
        (runs, make)
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_the_last_task_of_a_burst_runs() {
        let (runs, task) = counter();
        let mut debouncer = Debouncer::new(Duration::from_millis(200));
        for _ in 0..5 {
            assert!(debouncer.schedule(task()));
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert!(debouncer.is_pending());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!debouncer.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_spaced_out_tasks_all_run() {
        let (runs, task) = counter();
        let mut debouncer = Debouncer::new(Duration::from_millis(200));
        for _ in 0..3 {
            debouncer.schedule(task());
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_and_drop_prevent_the_task() {
        let (runs, task) = counter();
        let mut debouncer = Debouncer::new(Duration::from_millis(200));
        debouncer.schedule(task());
        assert!(debouncer.cancel());
        assert!(!debouncer.cancel());

        debouncer.schedule(task());
        drop(debouncer);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_runs_immediately_without_runtime() {
        let (runs, task) = counter();
        let mut debouncer = Debouncer::new(Duration::from_millis(200));
        assert!(!debouncer.schedule(task()));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!debouncer.is_pending());
    }
}
