use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use indexmap::IndexMap;

use crate::{Entity, EntityRef, TypeSchema};

use super::{ChunkHandle, GatewayFactory, PersistenceError, PersistenceGateway};

#[derive(Debug, Default)]
struct Store {
    schemas: IndexMap<String, TypeSchema>,
    committed: Vec<Entity>,
    chunk_sizes: Vec<usize>,
    next_id: u64,
    next_chunk: u64,
}

/// 内存存储
///
/// 克隆共享同一份数据，因此可以同时作为工厂交给任务管理器并在外部观察提交结果。
#[derive(Debug, Clone, Default)]
pub struct MemoryGateway {
    store: Arc<Mutex<Store>>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_schema(
        self,
        schema: TypeSchema,
    ) -> Self {
        self.register(schema);
        self
    }

    pub fn register(
        &self,
        schema: TypeSchema,
    ) {
        self.lock().schemas.insert(schema.name.clone(), schema);
    }

    /// 删除类型定义（已提交的数据保留），之后的写入会失败
    pub fn drop_type(
        &self,
        name: &str,
    ) {
        self.lock().schemas.shift_remove(name);
    }

    pub fn committed(&self) -> Vec<Entity> {
        self.lock().committed.clone()
    }

    pub fn committed_count(&self) -> usize {
        self.lock().committed.len()
    }

    /// 每个已提交块的实体数，按提交顺序
    pub fn chunk_sizes(&self) -> Vec<usize> {
        self.lock().chunk_sizes.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PersistenceGateway for MemoryGateway {
    fn describe_type(
        &mut self,
        name: &str,
    ) -> Result<Option<TypeSchema>, PersistenceError> {
        Ok(self.lock().schemas.get(name).cloned())
    }

    fn begin_chunk(&mut self) -> Result<ChunkHandle, PersistenceError> {
        let mut store = self.lock();
        store.next_chunk += 1;
        Ok(ChunkHandle::new(store.next_chunk))
    }

    fn create(
        &mut self,
        chunk: &mut ChunkHandle,
        entity: &Entity,
    ) -> Result<EntityRef, PersistenceError> {
        let id = {
            let mut store = self.lock();
            let schema = store
                .schemas
                .get(&entity.type_name)
                .ok_or_else(|| PersistenceError::UnknownType(entity.type_name.clone()))?;

            for prop in schema.properties.iter().filter(|p| p.required) {
                if entity.get(&prop.name).is_none_or(|v| v.is_null()) {
                    return Err(PersistenceError::Constraint(format!(
                        "{}.{} 不能为空",
                        entity.type_name, prop.name
                    )));
                }
            }

            store.next_id += 1;
            store.next_id
        };

        chunk.stage(entity.clone());
        Ok(EntityRef {
            type_name: entity.type_name.clone(),
            id: id.to_string(),
        })
    }

    fn commit(
        &mut self,
        chunk: ChunkHandle,
    ) -> Result<(), PersistenceError> {
        let mut store = self.lock();
        let staged = chunk.into_staged();

        if let Some(missing) = staged.iter().find(|e| !store.schemas.contains_key(&e.type_name)) {
            return Err(PersistenceError::UnknownType(missing.type_name.clone()));
        }

        store.chunk_sizes.push(staged.len());
        store.committed.extend(staged);
        Ok(())
    }

    fn rollback(
        &mut self,
        chunk: ChunkHandle,
    ) {
        tracing::debug!("内存存储回滚块 {}，丢弃 {} 个实体", chunk.id(), chunk.len());
    }
}

impl GatewayFactory for MemoryGateway {
    fn open(&self) -> Result<Box<dyn PersistenceGateway>, PersistenceError> {
        Ok(Box::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PropertyKind, PropertySchema, Value};

    fn gateway() -> MemoryGateway {
        MemoryGateway::new().with_schema(TypeSchema::new(
            "Person",
            vec![PropertySchema::new("name", PropertyKind::String).required()],
        ))
    }

    fn person(name: &str) -> Entity {
        let mut entity = Entity::new("Person");
        entity.fields.insert("name".into(), Value::String(name.into()));
        entity
    }

    #[test]
    fn commit_makes_chunk_visible() {
        let mut gateway = gateway();
        let mut chunk = gateway.begin_chunk().unwrap();
        gateway.create(&mut chunk, &person("a")).unwrap();
        gateway.create(&mut chunk, &person("b")).unwrap();
        assert_eq!(gateway.committed_count(), 0);

        gateway.commit(chunk).unwrap();
        assert_eq!(gateway.committed_count(), 2);
        assert_eq!(gateway.chunk_sizes(), [2]);
    }

    #[test]
    fn rollback_discards_chunk() {
        let mut gateway = gateway();
        let mut chunk = gateway.begin_chunk().unwrap();
        gateway.create(&mut chunk, &person("a")).unwrap();
        gateway.rollback(chunk);
        assert_eq!(gateway.committed_count(), 0);
        assert!(gateway.chunk_sizes().is_empty());
    }

    #[test]
    fn unknown_type_and_required_fields() {
        let mut gateway = gateway();
        let mut chunk = gateway.begin_chunk().unwrap();

        let err = gateway.create(&mut chunk, &Entity::new("Robot")).unwrap_err();
        assert!(err.is_systemic());

        let err = gateway.create(&mut chunk, &Entity::new("Person")).unwrap_err();
        assert!(matches!(err, PersistenceError::Constraint(_)));
    }

    #[test]
    fn dropping_type_fails_pending_commit() {
        let mut gateway = gateway();
        let observer = gateway.clone();

        let mut chunk = gateway.begin_chunk().unwrap();
        gateway.create(&mut chunk, &person("a")).unwrap();
        observer.drop_type("Person");

        assert_eq!(gateway.commit(chunk), Err(PersistenceError::UnknownType("Person".into())));
        assert_eq!(observer.committed_count(), 0);
    }
}
