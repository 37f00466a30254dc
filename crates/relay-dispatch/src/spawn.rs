use flume::{Receiver, unbounded};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::ThreadId;

pub type SpawnFunc = Box<dyn FnOnce() + Send>;
pub type ScheduleFunc = Box<dyn Fn(SpawnFunc) + Send + Sync + 'static>;

fn no_scheduler_configured(_: SpawnFunc) {
    panic!("no scheduler has been configured");
}

lazy_static::lazy_static! {
    static ref ON_MAIN_THREAD: Mutex<ScheduleFunc> = Mutex::new(Box::new(no_scheduler_configured));
    static ref MAIN_THREAD: Mutex<Option<ThreadId>> = Mutex::new(None);
}

static SCHEDULER_CONFIGURED: AtomicBool = AtomicBool::new(false);

pub fn is_scheduler_configured() -> bool {
    SCHEDULER_CONFIGURED.load(Ordering::Relaxed)
}

/// Bind the host's timer-enqueue primitive.
///
/// Why this and not "just tokio"? The chat host has its own single-threaded
/// event loop; the only thing it lets other threads do is push a zero-delay
/// one-shot callback onto its timer queue. This crate has no knowledge of
/// how that plumbing works, it just provides the abstraction for scheduling
/// the work. The embedding host sets it up here.
pub fn set_scheduler(main: ScheduleFunc) {
    *ON_MAIN_THREAD.lock().unwrap() = main;
    SCHEDULER_CONFIGURED.store(true, Ordering::Relaxed);
}

/// Submit a trampoline to run on the host event-loop thread.
/// Can be called from any thread.
pub fn enqueue_on_main(f: SpawnFunc) {
    let func = ON_MAIN_THREAD.lock().unwrap();
    func(f);
}

/// Record the calling thread as the host event-loop ("main") thread.
pub fn mark_main_thread() {
    *MAIN_THREAD.lock().unwrap() = Some(std::thread::current().id());
}

/// Whether the calling thread is the recorded main thread.
/// Returns false when no main thread has been marked yet.
pub fn is_main_thread() -> bool {
    MAIN_THREAD
        .lock()
        .unwrap()
        .is_some_and(|id| id == std::thread::current().id())
}

/// A minimal host loop: installs itself as the scheduler, marks the calling
/// thread as main, and drains enqueued trampolines on demand. Used by tests
/// and by embedders that have no real event loop of their own.
pub struct SimpleExecutor {
    rx: Receiver<SpawnFunc>,
}

impl Default for SimpleExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl SimpleExecutor {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        set_scheduler(Box::new(move |f: SpawnFunc| {
            tx.send(f).ok();
        }));
        mark_main_thread();
        Self { rx }
    }

    /// Block until one trampoline arrives, then run it.
    pub fn tick(&self) -> anyhow::Result<()> {
        match self.rx.recv() {
            Ok(func) => func(),
            Err(err) => anyhow::bail!("while waiting for work: {:?}", err),
        }
        Ok(())
    }

    /// Run one trampoline if one is queued. Returns whether any work ran.
    pub fn try_tick(&self) -> bool {
        match self.rx.try_recv() {
            Ok(func) => {
                func();
                true
            }
            Err(_) => false,
        }
    }

    /// Drain everything currently queued, including work enqueued by the
    /// trampolines themselves. Returns how many trampolines ran.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        while self.try_tick() {
            ran += 1;
        }
        ran
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::AtomicUsize;

    // Serialize tests that touch global scheduler state
    static TEST_LOCK: StdMutex<()> = StdMutex::new(());

    #[test]
    fn set_scheduler_marks_configured() {
        let _lock = TEST_LOCK.lock().unwrap();
        set_scheduler(Box::new(|_| {}));
        assert!(is_scheduler_configured());
    }

    #[test]
    fn simple_executor_configures_scheduler_and_main_thread() {
        let _lock = TEST_LOCK.lock().unwrap();
        let _exec = SimpleExecutor::new();
        assert!(is_scheduler_configured());
        assert!(is_main_thread());
    }

    #[test]
    fn enqueue_on_main_runs_via_tick() {
        let _lock = TEST_LOCK.lock().unwrap();
        let exec = SimpleExecutor::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_inner = Arc::clone(&ran);
        enqueue_on_main(Box::new(move || {
            ran_inner.fetch_add(1, Ordering::SeqCst);
        }));
        exec.tick().unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn enqueue_from_worker_thread_is_observed_on_main() {
        let _lock = TEST_LOCK.lock().unwrap();
        let exec = SimpleExecutor::new();
        let ran = Arc::new(AtomicUsize::new(0));

        let ran_inner = Arc::clone(&ran);
        let worker = std::thread::spawn(move || {
            enqueue_on_main(Box::new(move || {
                ran_inner.fetch_add(1, Ordering::SeqCst);
            }));
        });
        worker.join().unwrap();

        exec.run_until_idle();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn run_until_idle_drains_nested_enqueues() {
        let _lock = TEST_LOCK.lock().unwrap();
        let exec = SimpleExecutor::new();
        let ran = Arc::new(AtomicUsize::new(0));

        let outer = Arc::clone(&ran);
        enqueue_on_main(Box::new(move || {
            let inner = Arc::clone(&outer);
            outer.fetch_add(1, Ordering::SeqCst);
            enqueue_on_main(Box::new(move || {
                inner.fetch_add(1, Ordering::SeqCst);
            }));
        }));

        let count = exec.run_until_idle();
        assert_eq!(count, 2);
        assert_eq!(ran.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn try_tick_reports_idle() {
        let _lock = TEST_LOCK.lock().unwrap();
        let exec = SimpleExecutor::new();
        assert!(!exec.try_tick());
    }

    #[test]
    fn worker_thread_is_not_main() {
        let _lock = TEST_LOCK.lock().unwrap();
        let _exec = SimpleExecutor::new();
        let handle = std::thread::spawn(is_main_thread);
        assert!(!handle.join().unwrap());
        assert!(is_main_thread());
    }

    #[test]
    fn enqueue_order_is_preserved() {
        let _lock = TEST_LOCK.lock().unwrap();
        let exec = SimpleExecutor::new();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        for i in 0..5 {
            let seen = Arc::clone(&seen);
            enqueue_on_main(Box::new(move || {
                seen.lock().unwrap().push(i);
            }));
        }
        exec.run_until_idle();
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }
}
