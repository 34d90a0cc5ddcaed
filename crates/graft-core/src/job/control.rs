use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// 暂停等待结束的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    Resumed,
    Aborted,
}

/// 任务控制信号
///
/// 暂停、中止请求可以由任何线程设置，执行任务的工作线程只在块边界读取。
/// 超时与中止共用同一个标志，只是额外记录了原因。
#[derive(Debug)]
pub struct JobControl {
    pause: AtomicBool,
    abort: AtomicBool,
    timed_out: AtomicBool,
    timeout: Option<Duration>,
    deadline: Mutex<Option<Instant>>,
    gate: Mutex<()>,
    wake: Condvar,
}

impl Default for JobControl {
    fn default() -> Self {
        Self::new(None)
    }
}

impl JobControl {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            pause: AtomicBool::new(false),
            abort: AtomicBool::new(false),
            timed_out: AtomicBool::new(false),
            timeout,
            deadline: Mutex::new(None),
            gate: Mutex::new(()),
            wake: Condvar::new(),
        }
    }

    /// 任务开始执行时调用，超时从此刻计算；超出时钟范围的超时等同于不限时
    pub fn start_clock(&self) {
        if let Some(timeout) = self.timeout {
            *self.deadline.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now().checked_add(timeout);
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn request_pause(&self) {
        self.pause.store(true, Ordering::SeqCst);
        self.notify();
    }

    pub fn request_resume(&self) {
        self.pause.store(false, Ordering::SeqCst);
        self.notify();
    }

    pub fn request_abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
        self.notify();
    }

    pub fn is_pause_requested(&self) -> bool {
        self.pause.load(Ordering::SeqCst)
    }

    pub fn is_abort_requested(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out.load(Ordering::SeqCst)
    }

    /// 检查中止请求，超过截止时间时视为中止
    pub fn observe_abort(&self) -> bool {
        if !self.is_abort_requested() && self.deadline().is_some_and(|d| Instant::now() >= d) {
            self.timed_out.store(true, Ordering::SeqCst);
            self.abort.store(true, Ordering::SeqCst);
        }
        self.is_abort_requested()
    }

    /// 阻塞当前线程直到恢复、中止或超时
    pub fn wait_while_paused(&self) -> Wake {
        let mut guard = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if self.observe_abort() {
                return Wake::Aborted;
            }
            if !self.is_pause_requested() {
                return Wake::Resumed;
            }

            guard = match self.deadline() {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    self.wake
                        .wait_timeout(guard, remaining)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => self.wake.wait(guard).unwrap_or_else(PoisonError::into_inner),
            };
        }
    }

    fn deadline(&self) -> Option<Instant> {
        *self.deadline.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self) {
        let _guard = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        self.wake.notify_all();
    }
}
