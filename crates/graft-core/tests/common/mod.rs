#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use graft_core::{
    ChunkHandle, Entity, GatewayFactory, JobManager, JobSnapshot, MemoryGateway, PersistenceError,
    PersistenceGateway, ProgressEvent, ProgressReporter, PropertyKind, PropertySchema, TypeSchema,
};

/// 注入故障与延迟的存储包装
#[derive(Clone, Debug, Default)]
pub struct Faults {
    pub commit_delay: Duration,
    pub fail_create_on_chunk: Option<u64>,
    pub fail_commit_on_chunk: Option<u64>,
    /// 在该块的第一行写入时 panic
    pub panic_on_chunk: Option<u64>,
}

pub struct FaultyGateway {
    inner: MemoryGateway,
    faults: Faults,
    chunk: u64,
    active: Arc<AtomicUsize>,
}

impl PersistenceGateway for FaultyGateway {
    fn describe_type(
        &mut self,
        name: &str,
    ) -> Result<Option<TypeSchema>, PersistenceError> {
        self.inner.describe_type(name)
    }

    fn begin_chunk(&mut self) -> Result<ChunkHandle, PersistenceError> {
        self.chunk += 1;
        self.inner.begin_chunk()
    }

    fn create(
        &mut self,
        chunk: &mut ChunkHandle,
        entity: &Entity,
    ) -> Result<graft_core::EntityRef, PersistenceError> {
        if self.faults.fail_create_on_chunk == Some(self.chunk) && chunk.len() == 3 {
            return Err(PersistenceError::Constraint("injected create failure".into()));
        }
        if self.faults.panic_on_chunk == Some(self.chunk) && chunk.is_empty() {
            panic!("injected storage panic");
        }
        self.inner.create(chunk, entity)
    }

    fn commit(
        &mut self,
        chunk: ChunkHandle,
    ) -> Result<(), PersistenceError> {
        thread::sleep(self.faults.commit_delay);
        if self.faults.fail_commit_on_chunk == Some(self.chunk) {
            self.inner.rollback(chunk);
            return Err(PersistenceError::Backend("injected commit failure".into()));
        }
        self.inner.commit(chunk)
    }

    fn rollback(
        &mut self,
        chunk: ChunkHandle,
    ) {
        self.inner.rollback(chunk)
    }
}

impl Drop for FaultyGateway {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// 记录同时打开的连接数
pub struct FaultyFactory {
    pub gateway: MemoryGateway,
    pub faults: Faults,
    pub active: Arc<AtomicUsize>,
    pub peak: Arc<AtomicUsize>,
}

impl FaultyFactory {
    pub fn new(
        gateway: MemoryGateway,
        faults: Faults,
    ) -> Self {
        Self {
            gateway,
            faults,
            active: Arc::default(),
            peak: Arc::default(),
        }
    }
}

impl GatewayFactory for FaultyFactory {
    fn open(&self) -> Result<Box<dyn PersistenceGateway>, PersistenceError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        Ok(Box::new(FaultyGateway {
            inner: self.gateway.clone(),
            faults: self.faults.clone(),
            chunk: 0,
            active: self.active.clone(),
        }))
    }
}

pub fn person_schema(age_required: bool) -> TypeSchema {
    let mut age = PropertySchema::new("age", PropertyKind::Integer);
    if age_required {
        age = age.required();
    }
    TypeSchema::new(
        "Person",
        vec![PropertySchema::new("name", PropertyKind::String).required(), age],
    )
}

pub fn people_gateway() -> MemoryGateway {
    MemoryGateway::new().with_schema(person_schema(false))
}

/// `name;age` 格式的数据，第 i 行为 `p{i};{i}`（i 从 1 开始）
pub fn people_csv(rows: usize) -> String {
    let mut data = String::from("name;age\n");
    for i in 1..=rows {
        data.push_str(&format!("p{};{}\n", i, i));
    }
    data
}

pub fn collect_events(reporter: &ProgressReporter) -> Arc<Mutex<Vec<ProgressEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    reporter.subscribe(move |event: &ProgressEvent| sink.lock().unwrap().push(event.clone()));
    events
}

pub fn events_for(
    events: &Arc<Mutex<Vec<ProgressEvent>>>,
    id: &str,
) -> Vec<ProgressEvent> {
    events.lock().unwrap().iter().filter(|e| e.job_id == id).cloned().collect()
}

/// 轮询直到快照满足条件
pub fn wait_until(
    manager: &JobManager,
    id: &str,
    timeout: Duration,
    predicate: impl Fn(&JobSnapshot) -> bool,
) -> JobSnapshot {
    let deadline = Instant::now() + timeout;
    loop {
        let snapshot = manager.get(id).expect("job should exist");
        if predicate(&snapshot) {
            return snapshot;
        }
        assert!(Instant::now() < deadline, "timed out waiting, last snapshot: {:?}", snapshot);
        thread::sleep(Duration::from_millis(2));
    }
}

pub fn names(gateway: &MemoryGateway) -> Vec<String> {
    gateway
        .committed()
        .iter()
        .map(|e| e.get("name").map(|v| v.to_string()).unwrap_or_default())
        .collect()
}
