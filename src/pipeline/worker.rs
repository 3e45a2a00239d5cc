use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Stage-specific body of a pausable worker loop
pub trait WorkerTask: Send + 'static {
    /// Run one iteration. Called repeatedly while the worker is not paused;
    /// blocking waits inside must give up once `control.is_interrupted()`.
    fn execute_task(&mut self, control: &WorkerControl);

    /// Called before the first iteration after the worker is un-paused
    fn on_resume(&mut self) {}
}

/// Pause/end flags shared between a worker thread and its owner
pub struct WorkerControl {
    name: String,
    paused: AtomicBool,
    ended: AtomicBool,
    resumes: AtomicU64,

    /// The worker thread is blocked in `wait_while_paused`
    parked: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
    waker: Box<dyn Fn() + Send + Sync>,
}

impl WorkerControl {
    /// # Arguments
    /// * `name` - Thread name, used in logs
    /// * `paused` - Initial pause state
    /// * `waker` - Wakes whatever external condition the task blocks on
    pub fn new(name: &str, paused: bool, waker: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            name: name.to_string(),
            paused: AtomicBool::new(paused),
            ended: AtomicBool::new(false),
            resumes: AtomicU64::new(0),
            parked: AtomicBool::new(false),
            lock: Mutex::new(()),
            cond: Condvar::new(),
            waker: Box::new(waker),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_paused(&self, paused: bool) {
        let was_paused = self.paused.swap(paused, Ordering::SeqCst);
        if was_paused && !paused {
            self.resumes.fetch_add(1, Ordering::SeqCst);
        }
        self.notify();
    }

    /// Ask the worker to exit its loop
    pub fn end(&self) {
        self.ended.store(true, Ordering::SeqCst);
        self.notify();
    }

    fn notify(&self) {
        {
            let _guard = self.lock.lock();
            self.cond.notify_all();
        }
        (self.waker)();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    /// True when the current iteration should be abandoned
    pub fn is_interrupted(&self) -> bool {
        self.is_paused() || self.is_ended()
    }

    /// Number of paused -> running transitions so far
    pub fn resume_count(&self) -> u64 {
        self.resumes.load(Ordering::SeqCst)
    }

    /// Block while paused. Returns false once the worker has been ended.
    pub fn wait_while_paused(&self) -> bool {
        let mut guard = self.lock.lock();
        if self.is_paused() && !self.is_ended() {
            self.parked.store(true, Ordering::SeqCst);
            self.cond.notify_all();
            while self.is_paused() && !self.is_ended() {
                self.cond.wait(&mut guard);
            }
            self.parked.store(false, Ordering::SeqCst);
        }
        !self.is_ended()
    }

    /// Wait until the paused worker has left its current iteration
    ///
    /// Returns false if the worker is not paused or did not park within
    /// `timeout`. An ended worker counts as parked.
    pub fn wait_parked(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.lock.lock();
        loop {
            if self.parked.load(Ordering::SeqCst) || self.is_ended() {
                return true;
            }
            if !self.is_paused() {
                return false;
            }
            if self.cond.wait_until(&mut guard, deadline).timed_out() {
                return self.parked.load(Ordering::SeqCst);
            }
        }
    }

    /// Sleep for `duration` unless paused or ended first.
    ///
    /// Returns true if the full duration elapsed.
    pub fn sleep(&self, duration: Duration) -> bool {
        if duration.is_zero() {
            return !self.is_interrupted();
        }
        let deadline = Instant::now() + duration;
        let mut guard = self.lock.lock();
        loop {
            if self.is_interrupted() {
                return false;
            }
            if self.cond.wait_until(&mut guard, deadline).timed_out() {
                return !self.is_interrupted();
            }
        }
    }

    /// Block until the worker is paused or ended
    pub fn wait_for_interrupt(&self) {
        let mut guard = self.lock.lock();
        while !self.is_interrupted() {
            self.cond.wait(&mut guard);
        }
    }
}

/// Long-lived thread running a `WorkerTask` until ended
pub struct Worker {
    control: Arc<WorkerControl>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn spawn<T: WorkerTask>(task: T, control: WorkerControl) -> std::io::Result<Self> {
        let control = Arc::new(control);
        let thread_control = control.clone();
        let handle = thread::Builder::new()
            .name(control.name().to_string())
            .spawn(move || run(task, thread_control))?;

        Ok(Self {
            control,
            handle: Some(handle),
        })
    }

    pub fn control(&self) -> &Arc<WorkerControl> {
        &self.control
    }

    pub fn set_paused(&self, paused: bool) {
        self.control.set_paused(paused);
    }

    pub fn is_paused(&self) -> bool {
        self.control.is_paused()
    }

    /// Pause and wait (bounded) until the thread is idle, so nothing from
    /// its current iteration happens after this returns
    pub fn pause_and_park(&self, timeout: Duration) {
        self.control.set_paused(true);
        if !self.control.wait_parked(timeout) {
            tracing::warn!("Worker {} did not park within {:?}", self.control.name(), timeout);
        }
    }

    /// End the loop and join the thread
    pub fn end(&mut self) {
        self.control.end();
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            tracing::error!("Worker {} panicked", self.control.name());
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.end();
    }
}

fn run<T: WorkerTask>(mut task: T, control: Arc<WorkerControl>) {
    tracing::debug!("Worker {} started", control.name());
    let mut resumes = control.resume_count();

    while control.wait_while_paused() {
        let current = control.resume_count();
        if current != resumes {
            resumes = current;
            task.on_resume();
        }
        task.execute_task(&control);
    }

    tracing::debug!("Worker {} exited", control.name());
}
