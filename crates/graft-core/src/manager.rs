use std::any::Any;
use std::collections::VecDeque;
use std::io;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Utc;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::config::{ConfigError, ImportConfig, ManagerConfig};
use crate::gateway::GatewayFactory;
use crate::job::{
    CsvImport, ImportJob, ImportKind, Input, JobContext, JobControl, JobSnapshot, JobStatus, JsonLinesImport, StatusSink,
};
use crate::progress::ProgressReporter;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("配置非法: {0}")]
    InvalidConfiguration(#[from] ConfigError),
    #[error("任务不存在: {0}")]
    UnknownJob(String),
    #[error("任务尚未结束: {0}")]
    JobActive(String),
    #[error("任务管理器已关闭")]
    ShutDown,
    #[error("启动工作线程失败: {0}")]
    Spawn(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceFormat {
    Csv,
    JsonLines,
}

/// 提交导入任务的请求
#[derive(Debug, Clone)]
pub struct ImportRequest {
    pub owner: String,
    pub format: SourceFormat,
    pub input: Input,
    pub config: ImportConfig,
}

impl ImportRequest {
    pub fn csv(
        owner: impl Into<String>,
        input: Input,
        config: ImportConfig,
    ) -> Self {
        Self {
            owner: owner.into(),
            format: SourceFormat::Csv,
            input,
            config,
        }
    }

    pub fn json_lines(
        owner: impl Into<String>,
        input: Input,
        config: ImportConfig,
    ) -> Self {
        Self {
            owner: owner.into(),
            format: SourceFormat::JsonLines,
            input,
            config,
        }
    }
}

/// 任务列表过滤条件，字段为空表示不过滤
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub statuses: Vec<JobStatus>,
    pub owner: Option<String>,
    pub kind: Option<String>,
}

impl JobFilter {
    pub fn status(status: JobStatus) -> Self {
        Self {
            statuses: vec![status],
            ..Default::default()
        }
    }

    fn matches(
        &self,
        snapshot: &JobSnapshot,
    ) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&snapshot.status))
            && self.owner.as_ref().is_none_or(|o| *o == snapshot.owner)
            && self.kind.as_ref().is_none_or(|k| k.eq_ignore_ascii_case(&snapshot.kind))
    }
}

struct JobEntry {
    snapshot: JobSnapshot,
    control: Arc<JobControl>,
}

impl JobEntry {
    /// 对外的快照：尚未被任务观察到的请求体现为 *_REQUESTED
    fn view(&self) -> JobSnapshot {
        let mut snapshot = self.snapshot.clone();
        if !snapshot.status.is_terminal() {
            if self.control.is_abort_requested() {
                snapshot.status = JobStatus::AbortRequested;
            } else if self.control.is_pause_requested()
                && matches!(snapshot.status, JobStatus::Queued | JobStatus::Running)
            {
                snapshot.status = JobStatus::PauseRequested;
            }
        }
        snapshot
    }
}

/// 任务注册表，所有状态变更都经由这里
#[derive(Default)]
struct Registry {
    jobs: Mutex<IndexMap<String, JobEntry>>,
    changed: Condvar,
}

impl Registry {
    fn lock(&self) -> MutexGuard<'_, IndexMap<String, JobEntry>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 注册表中最后一次发布的快照（不含尚未观察到的请求）
    fn latest(
        &self,
        id: &str,
    ) -> Option<JobSnapshot> {
        self.lock().get(id).map(|entry| entry.snapshot.clone())
    }
}

impl StatusSink for Registry {
    fn publish(
        &self,
        snapshot: &JobSnapshot,
    ) {
        let mut jobs = self.lock();
        let Some(entry) = jobs.get_mut(&snapshot.id) else {
            tracing::debug!("[{}] 任务已从注册表移除，忽略状态更新", snapshot.id);
            return;
        };

        let current = entry.snapshot.status;
        if current != snapshot.status && !current.can_transition_to(snapshot.status) {
            tracing::warn!(
                "[{}] 忽略非法的状态变更 {} -> {}",
                snapshot.id,
                current.label(),
                snapshot.status.label()
            );
            return;
        }
        if current.is_terminal() {
            return;
        }

        entry.snapshot = snapshot.clone();
        self.changed.notify_all();
    }
}

#[derive(Default)]
struct Queue {
    jobs: VecDeque<ImportJob>,
    closed: bool,
}

struct Shared {
    registry: Arc<Registry>,
    queue: Mutex<Queue>,
    available: Condvar,
}

impl Shared {
    fn queue(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// 导入任务管理器
///
/// 固定数量的工作线程从队列中取任务执行，超出上限的任务保持 QUEUED。
pub struct JobManager {
    config: ManagerConfig,
    factory: Arc<dyn GatewayFactory>,
    reporter: ProgressReporter,
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl JobManager {
    pub fn new(
        config: ManagerConfig,
        factory: Arc<dyn GatewayFactory>,
        reporter: ProgressReporter,
    ) -> Result<Self, ManagerError> {
        config.validate()?;

        let shared = Arc::new(Shared {
            registry: Arc::new(Registry::default()),
            queue: Mutex::new(Queue::default()),
            available: Condvar::new(),
        });

        let manager = Self {
            config,
            factory,
            reporter,
            shared,
            workers: Mutex::new(Vec::new()),
        };

        for i in 0..manager.config.max_running {
            let shared = manager.shared.clone();
            let handle = thread::Builder::new()
                .name(format!("graft-worker-{}", i))
                .spawn(move || work(shared))?;
            manager.lock_workers().push(handle);
        }
        tracing::info!("任务管理器已启动，工作线程 {} 个", manager.config.max_running);
        Ok(manager)
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn reporter(&self) -> &ProgressReporter {
        &self.reporter
    }

    /// 校验配置并登记任务，返回任务 ID；配置非法时不会创建任务
    pub fn submit(
        &self,
        request: ImportRequest,
    ) -> Result<String, ManagerError> {
        let settings = request.config.validate()?;
        self.purge_expired();

        let kind: Arc<dyn ImportKind> = match request.format {
            SourceFormat::Csv => Arc::new(CsvImport::new(request.input)),
            SourceFormat::JsonLines => Arc::new(JsonLinesImport::new(request.input)),
        };

        let id = Uuid::new_v4().to_string();
        let snapshot = JobSnapshot::new(&id, kind.name(), request.owner, &settings.target_type);
        let control = Arc::new(JobControl::new(self.config.job_timeout));
        let ctx = JobContext {
            factory: self.factory.clone(),
            control: control.clone(),
            reporter: self.reporter.clone(),
            sink: self.shared.registry.clone(),
        };

        let mut queue = self.shared.queue();
        if queue.closed {
            return Err(ManagerError::ShutDown);
        }
        self.shared.registry.lock().insert(
            id.clone(),
            JobEntry {
                snapshot: snapshot.clone(),
                control,
            },
        );
        queue.jobs.push_back(ImportJob::new(snapshot, settings, kind, ctx));
        drop(queue);
        self.shared.available.notify_one();

        tracing::info!("[{}] 已提交 {} 导入任务", id, request.format.label());
        Ok(id)
    }

    pub fn get(
        &self,
        id: &str,
    ) -> Option<JobSnapshot> {
        self.shared.registry.lock().get(id).map(JobEntry::view)
    }

    /// 按提交顺序列出符合条件的任务
    pub fn list(
        &self,
        filter: &JobFilter,
    ) -> Vec<JobSnapshot> {
        self.shared
            .registry
            .lock()
            .values()
            .map(JobEntry::view)
            .filter(|s| filter.matches(s))
            .collect()
    }

    pub fn request_pause(
        &self,
        id: &str,
    ) -> Result<(), ManagerError> {
        self.control(id)?.request_pause();
        tracing::info!("[{}] 收到暂停请求", id);
        Ok(())
    }

    pub fn request_resume(
        &self,
        id: &str,
    ) -> Result<(), ManagerError> {
        self.control(id)?.request_resume();
        tracing::info!("[{}] 收到恢复请求", id);
        Ok(())
    }

    /// 排队中的任务立即进入 ABORTED，运行中的任务在下一个块边界中止
    pub fn request_abort(
        &self,
        id: &str,
    ) -> Result<(), ManagerError> {
        let queued = {
            let mut queue = self.shared.queue();
            queue
                .jobs
                .iter()
                .position(|job| job.id() == id)
                .and_then(|pos| queue.jobs.remove(pos))
        };
        if let Some(job) = queued {
            job.cancel();
            return Ok(());
        }

        self.control(id)?.request_abort();
        tracing::info!("[{}] 收到中止请求", id);
        Ok(())
    }

    /// 等待任务进入终态，超时后返回当前快照；任务不存在时返回 `None`
    pub fn wait(
        &self,
        id: &str,
        timeout: Duration,
    ) -> Option<JobSnapshot> {
        // 超出时钟范围的等待时长视为一直等待
        let deadline = Instant::now().checked_add(timeout);
        let registry = &self.shared.registry;
        let mut jobs = registry.lock();
        loop {
            let snapshot = jobs.get(id)?.view();
            if snapshot.status.is_terminal() {
                return Some(snapshot);
            }
            jobs = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Some(snapshot);
                    }
                    registry
                        .changed
                        .wait_timeout(jobs, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => registry.changed.wait(jobs).unwrap_or_else(PoisonError::into_inner),
            };
        }
    }

    /// 移除已结束的任务
    pub fn evict(
        &self,
        id: &str,
    ) -> Result<JobSnapshot, ManagerError> {
        let mut jobs = self.shared.registry.lock();
        let entry = jobs.get(id).ok_or_else(|| ManagerError::UnknownJob(id.to_string()))?;
        if !entry.snapshot.status.is_terminal() {
            return Err(ManagerError::JobActive(id.to_string()));
        }
        let entry = jobs
            .shift_remove(id)
            .ok_or_else(|| ManagerError::UnknownJob(id.to_string()))?;
        tracing::debug!("[{}] 任务已移除", id);
        Ok(entry.snapshot)
    }

    /// 移除超过保留期的已结束任务，返回移除数量
    pub fn purge_expired(&self) -> usize {
        let Some(retention) = self.config.retention else {
            return 0;
        };

        let now = Utc::now();
        let mut jobs = self.shared.registry.lock();
        let before = jobs.len();
        jobs.retain(|_, entry| {
            let expired = entry.snapshot.status.is_terminal()
                && entry
                    .snapshot
                    .finished_at
                    .and_then(|at| (now - at).to_std().ok())
                    .is_some_and(|age| age >= retention);
            !expired
        });
        let purged = before - jobs.len();
        if purged > 0 {
            tracing::debug!("已清理 {} 个过期任务", purged);
        }
        purged
    }

    /// 停止接收任务，中止排队与运行中的任务并等待工作线程退出
    pub fn shutdown(&self) {
        let drained: Vec<ImportJob> = {
            let mut queue = self.shared.queue();
            queue.closed = true;
            queue.jobs.drain(..).collect()
        };
        self.shared.available.notify_all();

        for job in drained {
            job.cancel();
        }
        for entry in self.shared.registry.lock().values() {
            if !entry.snapshot.status.is_terminal() {
                entry.control.request_abort();
            }
        }

        let handles: Vec<_> = self.lock_workers().drain(..).collect();
        if handles.is_empty() {
            return;
        }
        for handle in handles {
            if handle.thread().id() == thread::current().id() {
                continue;
            }
            if handle.join().is_err() {
                tracing::error!("工作线程异常退出");
            }
        }
        tracing::info!("任务管理器已关闭");
    }

    fn control(
        &self,
        id: &str,
    ) -> Result<Arc<JobControl>, ManagerError> {
        self.shared
            .registry
            .lock()
            .get(id)
            .map(|entry| entry.control.clone())
            .ok_or_else(|| ManagerError::UnknownJob(id.to_string()))
    }

    fn lock_workers(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for JobManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl SourceFormat {
    pub fn label(&self) -> &'static str {
        match self {
            SourceFormat::Csv => "CSV",
            SourceFormat::JsonLines => "JSON Lines",
        }
    }
}

fn work(shared: Arc<Shared>) {
    loop {
        let job = {
            let mut queue = shared.queue();
            loop {
                if let Some(job) = queue.jobs.pop_front() {
                    break job;
                }
                if queue.closed {
                    return;
                }
                queue = shared.available.wait(queue).unwrap_or_else(PoisonError::into_inner);
            }
        };

        let id = job.id().to_string();
        tracing::debug!("[{}] 由 {} 执行", id, thread::current().name().unwrap_or("worker"));
        let recovery = job.recovery();
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| job.run())) {
            let reason = format!("任务执行时发生 panic: {}", panic_message(payload.as_ref()));
            match shared.registry.latest(&id) {
                Some(last) if !last.status.is_terminal() => {
                    recovery.fail(last, &reason);
                }
                _ => tracing::error!("[{}] {}", id, reason),
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "未知原因".into()
    }
}
