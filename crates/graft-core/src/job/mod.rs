use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{ConfigError, ImportSettings};
use crate::gateway::{GatewayFactory, PersistenceError, PersistenceGateway};
use crate::mapper::Mapper;
use crate::progress::{EventKind, ProgressEvent, ProgressReporter};
use crate::source::{RecordSource, SourceError};
use crate::{Entity, SourceRow};

pub use control::{JobControl, Wake};
pub use kinds::{CsvImport, Input, JsonLinesImport};

mod control;
mod kinds;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Running,
    PauseRequested,
    Paused,
    AbortRequested,
    Aborted,
    Finished,
    Failed,
}

impl JobStatus {
    pub fn label(&self) -> &'static str {
        match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Running => "RUNNING",
            JobStatus::PauseRequested => "PAUSE_REQUESTED",
            JobStatus::Paused => "PAUSED",
            JobStatus::AbortRequested => "ABORT_REQUESTED",
            JobStatus::Aborted => "ABORTED",
            JobStatus::Finished => "FINISHED",
            JobStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Aborted | JobStatus::Finished | JobStatus::Failed)
    }

    /// 状态只能沿生命周期前进，终态不再变化
    pub fn can_transition_to(
        &self,
        next: JobStatus,
    ) -> bool {
        use JobStatus::*;

        match self {
            Queued => matches!(next, Running | AbortRequested | Aborted | Failed),
            Running => matches!(next, PauseRequested | Paused | AbortRequested | Aborted | Finished | Failed),
            PauseRequested => matches!(next, Running | Paused | AbortRequested | Aborted | Finished | Failed),
            Paused => matches!(next, Running | AbortRequested | Aborted | Failed),
            AbortRequested => matches!(next, Aborted | Finished | Failed),
            Aborted | Finished | Failed => false,
        }
    }
}

/// 任务运行状态的副本
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub id: String,
    pub kind: String,
    pub owner: String,
    pub target_type: String,
    pub status: JobStatus,
    pub rows_read: u64,
    pub rows_committed: u64,
    /// 映射失败被跳过的行
    pub rows_skipped: u64,
    /// 数据源中格式错误的行
    pub malformed_rows: u64,
    /// 被容忍的字段转换失败（字段置空，行仍写入）
    pub field_errors: u64,
    pub chunks_committed: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_chunk_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl JobSnapshot {
    pub fn new(
        id: impl Into<String>,
        kind: impl Into<String>,
        owner: impl Into<String>,
        target_type: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            owner: owner.into(),
            target_type: target_type.into(),
            status: JobStatus::Queued,
            rows_read: 0,
            rows_committed: 0,
            rows_skipped: 0,
            malformed_rows: 0,
            field_errors: 0,
            chunks_committed: 0,
            created_at: Utc::now(),
            started_at: None,
            last_chunk_at: None,
            finished_at: None,
            last_error: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("配置非法: {0}")]
    InvalidConfiguration(#[from] ConfigError),
    #[error("输入格式错误: {0}")]
    MalformedInput(String),
    #[error("第 {chunk} 块提交失败: {source}")]
    Persistence { chunk: u64, source: PersistenceError },
    #[error("系统错误: {0}")]
    Systemic(String),
    #[error("读取数据源失败: {0}")]
    Source(String),
}

impl JobError {
    fn persistence(
        chunk: u64,
        err: PersistenceError,
    ) -> Self {
        if err.is_systemic() {
            JobError::Systemic(format!("第 {} 块: {}", chunk, err))
        } else {
            JobError::Persistence { chunk, source: err }
        }
    }
}

impl From<SourceError> for JobError {
    fn from(err: SourceError) -> Self {
        match err {
            SourceError::MalformedInput(reason) => JobError::MalformedInput(reason),
            other => JobError::Source(other.to_string()),
        }
    }
}

/// 接收任务状态变化（由任务管理器实现）
pub trait StatusSink: Send + Sync {
    fn publish(
        &self,
        snapshot: &JobSnapshot,
    );
}

impl<F> StatusSink for F
where
    F: Fn(&JobSnapshot) + Send + Sync,
{
    fn publish(
        &self,
        snapshot: &JobSnapshot,
    ) {
        self(snapshot)
    }
}

/// 一种导入任务的能力集合
///
/// 分块循环本身与任务类型无关，类型只负责校验输入、产生原始行以及生命周期回调。
pub trait ImportKind: Send + Sync {
    fn name(&self) -> &str;

    /// 预检，失败时任务直接进入 FAILED，不会打开数据源
    fn validate(
        &self,
        settings: &ImportSettings,
    ) -> Result<(), JobError>;

    /// 每次调用都返回一个新的数据源
    fn produce_rows(
        &self,
        settings: &ImportSettings,
    ) -> Result<Box<dyn RecordSource>, JobError>;

    fn on_chunk_committed(
        &self,
        _snapshot: &JobSnapshot,
    ) {
    }

    /// 任务进入终态时调用且只调用一次
    fn on_terminal(
        &self,
        _snapshot: &JobSnapshot,
    ) {
    }
}

/// 任务执行所需的协作者
#[derive(Clone)]
pub struct JobContext {
    pub factory: Arc<dyn GatewayFactory>,
    pub control: Arc<JobControl>,
    pub reporter: ProgressReporter,
    pub sink: Arc<dyn StatusSink>,
}

enum Completion {
    Finished,
    Aborted,
}

/// 一次导入运行：数据源 -> 映射 -> 存储的分块循环
pub struct ImportJob {
    snapshot: JobSnapshot,
    settings: ImportSettings,
    kind: Arc<dyn ImportKind>,
    ctx: JobContext,
    started: Instant,
    marks: Arc<TerminalMarks>,
}

/// 终态回调与终态事件各自只能发生一次
#[derive(Debug, Default)]
struct TerminalMarks {
    hook: AtomicBool,
    event: AtomicBool,
}

impl TerminalMarks {
    fn take_hook(&self) -> bool {
        !self.hook.swap(true, Ordering::SeqCst)
    }

    fn take_event(&self) -> bool {
        !self.event.swap(true, Ordering::SeqCst)
    }
}

impl ImportJob {
    pub fn new(
        snapshot: JobSnapshot,
        settings: ImportSettings,
        kind: Arc<dyn ImportKind>,
        ctx: JobContext,
    ) -> Self {
        Self {
            snapshot,
            settings,
            kind,
            ctx,
            started: Instant::now(),
            marks: Arc::default(),
        }
    }

    /// 在 `run` 之前取得，任务线程 panic 时用它收尾
    pub fn recovery(&self) -> PanicRecovery {
        PanicRecovery {
            kind: self.kind.clone(),
            ctx: self.ctx.clone(),
            started: Instant::now(),
            marks: self.marks.clone(),
        }
    }

    pub fn id(&self) -> &str {
        &self.snapshot.id
    }

    /// 在当前线程执行任务直到终态，返回最终快照
    pub fn run(mut self) -> JobSnapshot {
        self.started = Instant::now();
        self.ctx.control.start_clock();

        if self.ctx.control.observe_abort() {
            tracing::info!("[{}] 任务在开始前已被中止", self.snapshot.id);
            return self.terminate(JobStatus::Aborted, None);
        }

        let (mut gateway, mapper) = match self.preflight() {
            Ok(prepared) => prepared,
            Err(err) => {
                tracing::error!("[{}] 预检失败: {}", self.snapshot.id, err);
                return self.terminate(JobStatus::Failed, Some(err));
            }
        };

        self.snapshot.status = JobStatus::Running;
        self.snapshot.started_at = Some(Utc::now());
        self.publish();
        self.emit(EventKind::Started, Duration::ZERO, None);
        tracing::info!(
            "[{}] {} 导入开始，目标类型 {}，每块 {} 行",
            self.snapshot.id,
            self.kind.name(),
            self.settings.target_type,
            self.settings.commit_interval
        );

        match self.run_chunks(gateway.as_mut(), &mapper) {
            Ok(Completion::Finished) => self.terminate(JobStatus::Finished, None),
            Ok(Completion::Aborted) => self.terminate(JobStatus::Aborted, None),
            Err(err) => {
                tracing::error!("[{}] 任务失败: {}", self.snapshot.id, err);
                self.terminate(JobStatus::Failed, Some(err))
            }
        }
    }

    fn preflight(&mut self) -> Result<(Box<dyn PersistenceGateway>, Mapper), JobError> {
        let mut gateway = self
            .ctx
            .factory
            .open()
            .map_err(|err| JobError::Systemic(format!("打开存储失败: {}", err)))?;

        self.kind.validate(&self.settings)?;

        let schema = gateway
            .describe_type(&self.settings.target_type)
            .map_err(|err| JobError::Systemic(format!("读取目标类型失败: {}", err)))?
            .ok_or_else(|| JobError::Systemic(format!("目标类型不存在: {}", self.settings.target_type)))?;

        let mapper = Mapper::new(&self.settings, &schema)?;
        Ok((gateway, mapper))
    }

    fn run_chunks(
        &mut self,
        gateway: &mut dyn PersistenceGateway,
        mapper: &Mapper,
    ) -> Result<Completion, JobError> {
        let mut source = self.kind.produce_rows(&self.settings)?;
        let interval = self.settings.commit_interval;
        let mut pending: Vec<Entity> = Vec::with_capacity(interval);
        let mut lookahead = None;

        loop {
            if self.ctx.control.observe_abort() {
                return Ok(Completion::Aborted);
            }
            if self.ctx.control.is_pause_requested() && self.pause() == Wake::Aborted {
                return Ok(Completion::Aborted);
            }

            pending.clear();
            let exhausted = self.fill(source.as_mut(), mapper, &mut pending, &mut lookahead, interval)?;

            if !pending.is_empty() {
                self.commit_chunk(gateway, &pending)?;
            }
            if exhausted {
                return Ok(Completion::Finished);
            }
        }
    }

    /// 读取并映射行直到凑满一块，返回数据源是否已读完
    ///
    /// 凑满后预读一行：数据源已读完时本块就是最后一块，提交后任务直接 FINISHED，
    /// 不会再被中止请求改成 ABORTED。
    fn fill(
        &mut self,
        source: &mut dyn RecordSource,
        mapper: &Mapper,
        pending: &mut Vec<Entity>,
        lookahead: &mut Option<Result<SourceRow, SourceError>>,
        interval: usize,
    ) -> Result<bool, JobError> {
        while pending.len() < interval {
            let row = match lookahead.take().or_else(|| source.next()) {
                None => {
                    self.snapshot.malformed_rows = source.malformed();
                    return Ok(true);
                }
                Some(row) => row?,
            };
            self.snapshot.rows_read += 1;

            match mapper.map(&row) {
                Ok(mapped) => {
                    for field in &mapped.field_errors {
                        tracing::warn!(
                            "[{}] 第 {} 行字段 {} 转换失败，已置空: {}",
                            self.snapshot.id,
                            row.position,
                            field.property,
                            field.reason
                        );
                    }
                    self.snapshot.field_errors += mapped.field_errors.len() as u64;
                    pending.push(mapped.entity);
                }
                Err(err) => {
                    tracing::warn!("[{}] 跳过行: {}", self.snapshot.id, err);
                    self.snapshot.rows_skipped += 1;
                }
            }
        }
        *lookahead = source.next();
        self.snapshot.malformed_rows = source.malformed();
        Ok(lookahead.is_none())
    }

    fn commit_chunk(
        &mut self,
        gateway: &mut dyn PersistenceGateway,
        entities: &[Entity],
    ) -> Result<(), JobError> {
        let began = Instant::now();
        let number = self.snapshot.chunks_committed + 1;

        let mut chunk = gateway
            .begin_chunk()
            .map_err(|err| JobError::persistence(number, err))?;
        for entity in entities {
            if let Err(err) = gateway.create(&mut chunk, entity) {
                tracing::warn!("[{}] 第 {} 块写入失败，回滚: {}", self.snapshot.id, number, err);
                gateway.rollback(chunk);
                return Err(JobError::persistence(number, err));
            }
        }
        gateway
            .commit(chunk)
            .map_err(|err| JobError::persistence(number, err))?;

        self.snapshot.rows_committed += entities.len() as u64;
        self.snapshot.chunks_committed = number;
        self.snapshot.last_chunk_at = Some(Utc::now());
        self.publish();

        let elapsed = began.elapsed();
        tracing::debug!(
            "[{}] 第 {} 块已提交 {} 行，耗时 {:?}，累计 {} 行",
            self.snapshot.id,
            number,
            entities.len(),
            elapsed,
            self.snapshot.rows_committed
        );
        self.emit(EventKind::ChunkCommitted, elapsed, None);
        self.kind.on_chunk_committed(&self.snapshot);
        Ok(())
    }

    fn pause(&mut self) -> Wake {
        self.snapshot.status = JobStatus::Paused;
        self.publish();
        self.emit(EventKind::Paused, Duration::ZERO, None);
        tracing::info!("[{}] 任务已暂停，已提交 {} 行", self.snapshot.id, self.snapshot.rows_committed);

        let wake = self.ctx.control.wait_while_paused();
        if wake == Wake::Resumed {
            self.snapshot.status = JobStatus::Running;
            self.publish();
            self.emit(EventKind::Resumed, Duration::ZERO, None);
            tracing::info!("[{}] 任务已恢复", self.snapshot.id);
        }
        wake
    }

    fn terminate(
        mut self,
        status: JobStatus,
        error: Option<JobError>,
    ) -> JobSnapshot {
        let message = match (&error, status) {
            (Some(err), _) => err.to_string(),
            (None, JobStatus::Aborted) if self.ctx.control.timed_out() => format!(
                "超过最长运行时间 {:?}，任务已中止，已提交 {} 行",
                self.ctx.control.timeout().unwrap_or_default(),
                self.snapshot.rows_committed
            ),
            (None, JobStatus::Aborted) => format!("任务已中止，已提交 {} 行", self.snapshot.rows_committed),
            (None, _) => format!(
                "导入完成: 读取 {} 行，提交 {} 行（{} 块），跳过 {} 行，格式错误 {} 行",
                self.snapshot.rows_read,
                self.snapshot.rows_committed,
                self.snapshot.chunks_committed,
                self.snapshot.rows_skipped,
                self.snapshot.malformed_rows
            ),
        };

        self.snapshot.status = status;
        self.snapshot.finished_at = Some(Utc::now());
        self.snapshot.last_error = error.map(|err| err.to_string());
        tracing::info!("[{}] {}: {}", self.snapshot.id, status.label(), message);

        if self.marks.take_hook() {
            self.kind.on_terminal(&self.snapshot);
        }

        let kind = match status {
            JobStatus::Finished => EventKind::Finished,
            JobStatus::Aborted => EventKind::Aborted,
            _ => EventKind::Failed,
        };
        if self.marks.take_event() {
            self.emit(kind, Duration::ZERO, Some(message));
        }
        self.publish();
        self.snapshot
    }

    /// 排队中的任务被中止：不占用工作线程，也不调用任务类型的回调
    pub fn cancel(mut self) -> JobSnapshot {
        self.snapshot.status = JobStatus::Aborted;
        self.snapshot.finished_at = Some(Utc::now());
        tracing::info!("[{}] 任务在排队时被中止", self.snapshot.id);

        self.emit(EventKind::Aborted, Duration::ZERO, Some("任务在排队时被中止".into()));
        self.publish();
        self.snapshot
    }

    fn publish(&self) {
        self.ctx.sink.publish(&self.snapshot);
    }

    fn emit(
        &self,
        kind: EventKind,
        chunk_elapsed: Duration,
        message: Option<String>,
    ) {
        self.ctx.reporter.emit(progress_event(
            &self.snapshot,
            kind,
            chunk_elapsed,
            self.started.elapsed(),
            message,
        ));
    }
}

/// 任务线程 panic 后的收尾句柄
///
/// `run` 会消费任务本身，因此工作线程需要提前持有任务类型、上下文与终态标记。
pub struct PanicRecovery {
    kind: Arc<dyn ImportKind>,
    ctx: JobContext,
    started: Instant,
    marks: Arc<TerminalMarks>,
}

impl PanicRecovery {
    /// 以 FAILED 结束任务：尚未执行的终态回调与终态事件在这里补上
    ///
    /// `last` 是任务最后一次发布的快照。
    pub fn fail(
        self,
        mut last: JobSnapshot,
        reason: &str,
    ) -> JobSnapshot {
        last.status = JobStatus::Failed;
        last.finished_at = Some(Utc::now());
        last.last_error = Some(reason.to_string());
        tracing::error!("[{}] {}", last.id, reason);

        if self.marks.take_hook() {
            let kind = &self.kind;
            if catch_unwind(AssertUnwindSafe(|| kind.on_terminal(&last))).is_err() {
                tracing::error!("[{}] 终态回调发生 panic，已忽略", last.id);
            }
        }
        if self.marks.take_event() {
            self.ctx.reporter.emit(progress_event(
                &last,
                EventKind::Failed,
                Duration::ZERO,
                self.started.elapsed(),
                Some(reason.to_string()),
            ));
        }
        self.ctx.sink.publish(&last);
        last
    }
}

fn progress_event(
    snapshot: &JobSnapshot,
    kind: EventKind,
    chunk_elapsed: Duration,
    total_elapsed: Duration,
    message: Option<String>,
) -> ProgressEvent {
    ProgressEvent {
        job_id: snapshot.id.clone(),
        kind,
        status: snapshot.status,
        rows_read: snapshot.rows_read,
        rows_committed: snapshot.rows_committed,
        chunks_committed: snapshot.chunks_committed,
        chunk_elapsed_millis: chunk_elapsed.as_millis() as u64,
        total_elapsed_millis: total_elapsed.as_millis() as u64,
        message,
    }
}
