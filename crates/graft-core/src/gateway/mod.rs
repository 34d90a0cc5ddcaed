use thiserror::Error;

use crate::{Entity, EntityRef, TypeSchema};

pub use memory::MemoryGateway;
pub use sqlite::{SQLiteOptions, SqliteGateway, SqliteGatewayFactory};

mod memory;
mod sqlite;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PersistenceError {
    #[error("目标类型不存在: {0}")]
    UnknownType(String),
    #[error("无法连接存储: {0}")]
    Connection(String),
    #[error("违反约束: {0}")]
    Constraint(String),
    #[error("{0}")]
    Backend(String),
}

impl PersistenceError {
    /// 系统性错误与块的内容无关，任务无法继续
    pub fn is_systemic(&self) -> bool {
        matches!(self, PersistenceError::UnknownType(_) | PersistenceError::Connection(_))
    }
}

/// 一个块的事务句柄
///
/// 句柄不可复制，`commit` / `rollback` 会消费它，因此只能属于单个块。
#[derive(Debug)]
pub struct ChunkHandle {
    id: u64,
    created: usize,
    staged: Vec<Entity>,
}

impl ChunkHandle {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            created: 0,
            staged: Vec::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// 本块中已写入（尚未提交）的实体数
    pub fn len(&self) -> usize {
        self.created
    }

    pub fn is_empty(&self) -> bool {
        self.created == 0
    }

    /// 记录一次直接写入存储的创建
    pub fn mark_created(&mut self) {
        self.created += 1;
    }

    /// 暂存实体，提交时统一写入
    pub fn stage(&mut self, entity: Entity) {
        self.staged.push(entity);
        self.created += 1;
    }

    pub fn into_staged(self) -> Vec<Entity> {
        self.staged
    }
}

/// 存储层接口
///
/// 每个块是一个事务：`begin_chunk` 开始，`create` 写入，`commit` 或 `rollback` 结束。
/// `commit` 失败时本块的任何数据都不会生效。
pub trait PersistenceGateway: Send {
    fn describe_type(
        &mut self,
        name: &str,
    ) -> Result<Option<TypeSchema>, PersistenceError>;

    fn begin_chunk(&mut self) -> Result<ChunkHandle, PersistenceError>;

    fn create(
        &mut self,
        chunk: &mut ChunkHandle,
        entity: &Entity,
    ) -> Result<EntityRef, PersistenceError>;

    fn commit(
        &mut self,
        chunk: ChunkHandle,
    ) -> Result<(), PersistenceError>;

    fn rollback(
        &mut self,
        chunk: ChunkHandle,
    );
}

/// 为每个任务打开独立的存储连接（在任务所在的工作线程上调用）
pub trait GatewayFactory: Send + Sync {
    fn open(&self) -> Result<Box<dyn PersistenceGateway>, PersistenceError>;
}

impl<F> GatewayFactory for F
where
    F: Fn() -> Result<Box<dyn PersistenceGateway>, PersistenceError> + Send + Sync,
{
    fn open(&self) -> Result<Box<dyn PersistenceGateway>, PersistenceError> {
        self()
    }
}
