use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use rusqlite::{Connection, ErrorCode, OpenFlags, params_from_iter, types::Value as SqlValue};
use serde::{Deserialize, Serialize};

use crate::{Entity, EntityRef, PropertyKind, PropertySchema, TypeSchema, Value};

use super::{ChunkHandle, GatewayFactory, PersistenceError, PersistenceGateway};

/// SQLite 连接参数；导入需要写入，数据库总是以读写方式打开，不存在时创建
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SQLiteOptions {
    pub filepath: String,
}

impl SQLiteOptions {
    pub fn new(filepath: impl Into<String>) -> Self {
        Self {
            filepath: filepath.into(),
        }
    }

    pub fn endpoint(&self) -> String {
        let path = self.filepath.trim();
        if path.is_empty() {
            return "sqlite://<未配置文件>".into();
        }

        let name = Path::new(path)
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(path);

        format!("sqlite://{}", name)
    }
}

/// SQLite 存储：目标类型对应同名表，每个块一个事务
pub struct SqliteGateway {
    conn: Connection,
    endpoint: String,
    schemas: HashMap<String, TypeSchema>,
    next_chunk: u64,
}

impl SqliteGateway {
    pub fn open(options: &SQLiteOptions) -> Result<Self, PersistenceError> {
        let conn = open_conn(options)?;
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(|err| PersistenceError::Connection(format!("设置等待超时失败: {}", err)))?;

        let endpoint = options.endpoint();
        tracing::debug!("已打开 {}", endpoint);
        Ok(Self {
            conn,
            endpoint,
            schemas: HashMap::new(),
            next_chunk: 0,
        })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    fn insert_sql(entity: &Entity) -> String {
        let columns = entity
            .fields
            .keys()
            .map(|name| format!("\"{}\"", escape_quote(name)))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = (1..=entity.fields.len())
            .map(|i| format!("?{}", i))
            .collect::<Vec<_>>()
            .join(", ");

        if entity.fields.is_empty() {
            format!("INSERT INTO \"{}\" DEFAULT VALUES", escape_quote(&entity.type_name))
        } else {
            format!(
                "INSERT INTO \"{}\" ({}) VALUES ({})",
                escape_quote(&entity.type_name),
                columns,
                placeholders
            )
        }
    }

    fn finish(
        &self,
        chunk: &ChunkHandle,
        sql: &str,
    ) -> Result<(), PersistenceError> {
        self.conn.execute_batch(sql).map_err(|err| {
            tracing::warn!("{} 块 {} 执行 {} 失败: {}", self.endpoint, chunk.id(), sql, err);
            map_error(err)
        })
    }
}

impl PersistenceGateway for SqliteGateway {
    fn describe_type(
        &mut self,
        name: &str,
    ) -> Result<Option<TypeSchema>, PersistenceError> {
        if let Some(schema) = self.schemas.get(name) {
            return Ok(Some(schema.clone()));
        }

        let sql = format!("PRAGMA table_info(\"{}\")", escape_quote(name));
        let mut stmt = self
            .conn
            .prepare(&sql)
            .map_err(|err| PersistenceError::Backend(format!("查询列信息失败: {}", err)))?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i32>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, i32>(5)?,
                ))
            })
            .map_err(|err| PersistenceError::Backend(format!("查询列信息失败: {}", err)))?;

        let mut properties = vec![];
        for row in rows {
            let (column, declared, notnull, default_value, pk) =
                row.map_err(|err| PersistenceError::Backend(format!("读取列信息失败: {}", err)))?;

            let mut property = PropertySchema::new(column, PropertyKind::from_declared(&declared));
            if notnull != 0 && default_value.is_none() && pk == 0 {
                property = property.required();
            }
            properties.push(property);
        }

        if properties.is_empty() {
            return Ok(None);
        }

        let schema = TypeSchema::new(name, properties);
        self.schemas.insert(name.to_string(), schema.clone());
        Ok(Some(schema))
    }

    fn begin_chunk(&mut self) -> Result<ChunkHandle, PersistenceError> {
        self.next_chunk += 1;
        let chunk = ChunkHandle::new(self.next_chunk);
        self.finish(&chunk, "BEGIN")?;
        Ok(chunk)
    }

    fn create(
        &mut self,
        chunk: &mut ChunkHandle,
        entity: &Entity,
    ) -> Result<EntityRef, PersistenceError> {
        let sql = Self::insert_sql(entity);
        let params = entity.fields.values().map(to_sql).collect::<Vec<_>>();

        let mut stmt = self.conn.prepare_cached(&sql).map_err(map_error)?;
        stmt.execute(params_from_iter(params.iter())).map_err(map_error)?;

        chunk.mark_created();
        Ok(EntityRef {
            type_name: entity.type_name.clone(),
            id: self.conn.last_insert_rowid().to_string(),
        })
    }

    fn commit(
        &mut self,
        chunk: ChunkHandle,
    ) -> Result<(), PersistenceError> {
        if let Err(err) = self.finish(&chunk, "COMMIT") {
            if !self.conn.is_autocommit() {
                let _ = self.finish(&chunk, "ROLLBACK");
            }
            return Err(err);
        }
        tracing::debug!("{} 块 {} 已提交 {} 行", self.endpoint, chunk.id(), chunk.len());
        Ok(())
    }

    fn rollback(
        &mut self,
        chunk: ChunkHandle,
    ) {
        if self.conn.is_autocommit() {
            return;
        }
        if self.finish(&chunk, "ROLLBACK").is_ok() {
            tracing::debug!("{} 块 {} 已回滚 {} 行", self.endpoint, chunk.id(), chunk.len());
        }
    }
}

/// 按 SQLite 连接参数为每个任务打开独立连接
#[derive(Clone, Debug)]
pub struct SqliteGatewayFactory {
    options: SQLiteOptions,
}

impl SqliteGatewayFactory {
    pub fn new(options: SQLiteOptions) -> Self {
        Self { options }
    }
}

impl GatewayFactory for SqliteGatewayFactory {
    fn open(&self) -> Result<Box<dyn PersistenceGateway>, PersistenceError> {
        Ok(Box::new(SqliteGateway::open(&self.options)?))
    }
}

fn open_conn(config: &SQLiteOptions) -> Result<Connection, PersistenceError> {
    let path_str = config.filepath.trim();
    if path_str.is_empty() {
        return Err(PersistenceError::Connection("未配置 filepath".into()));
    }

    let path = Path::new(path_str);

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|err| PersistenceError::Connection(format!("创建目录失败: {}", err)))?;
        }
    }

    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
    Connection::open_with_flags(path, flags)
        .map_err(|err| PersistenceError::Connection(format!("打开 SQLite 失败: {}", err)))
}

fn map_error(err: rusqlite::Error) -> PersistenceError {
    let message = err.to_string();
    if message.contains("no such table") {
        return PersistenceError::UnknownType(message);
    }
    match err.sqlite_error_code() {
        Some(ErrorCode::ConstraintViolation) => PersistenceError::Constraint(message),
        _ => PersistenceError::Backend(message),
    }
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::Integer(i) => SqlValue::Integer(*i),
        Value::Float(n) => SqlValue::Real(*n),
        Value::Boolean(b) => SqlValue::Integer(i64::from(*b)),
        Value::Date(_) | Value::DateTime(_) => SqlValue::Text(value.to_string()),
    }
}

fn escape_quote(s: &str) -> String {
    s.replace('"', "\"\"")
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn setup() -> (TempDir, SqliteGateway) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("graft.db");
        let gateway = SqliteGateway::open(&SQLiteOptions::new(path.to_string_lossy())).unwrap();
        gateway
            .connection()
            .execute_batch(
                "CREATE TABLE person (
                    id INTEGER PRIMARY KEY,
                    name TEXT NOT NULL,
                    age INTEGER,
                    born DATE,
                    active BOOLEAN NOT NULL DEFAULT 1,
                    code TEXT UNIQUE
                )",
            )
            .unwrap();
        (dir, gateway)
    }

    fn person(
        name: &str,
        code: &str,
    ) -> Entity {
        let mut entity = Entity::new("person");
        entity.fields.insert("name".into(), Value::String(name.into()));
        entity.fields.insert("age".into(), Value::Integer(30));
        entity.fields.insert("code".into(), Value::String(code.into()));
        entity
    }

    fn count(gateway: &SqliteGateway) -> i64 {
        gateway
            .connection()
            .query_row("SELECT COUNT(*) FROM person", [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn describes_table_columns() {
        let (_dir, mut gateway) = setup();
        let schema = gateway.describe_type("person").unwrap().unwrap();

        let kinds: Vec<_> = schema.properties.iter().map(|p| (p.name.as_str(), p.kind, p.required)).collect();
        assert_eq!(
            kinds,
            [
                ("id", PropertyKind::Integer, false),
                ("name", PropertyKind::String, true),
                ("age", PropertyKind::Integer, false),
                ("born", PropertyKind::Date, false),
                ("active", PropertyKind::Boolean, false),
                ("code", PropertyKind::String, false),
            ]
        );
        assert!(gateway.describe_type("missing").unwrap().is_none());
    }

    #[test]
    fn chunk_commits_atomically() {
        let (_dir, mut gateway) = setup();

        let mut chunk = gateway.begin_chunk().unwrap();
        gateway.create(&mut chunk, &person("ada", "a")).unwrap();
        let reference = gateway.create(&mut chunk, &person("bob", "b")).unwrap();
        assert_eq!(reference.id, "2");
        gateway.commit(chunk).unwrap();
        assert_eq!(count(&gateway), 2);

        let mut chunk = gateway.begin_chunk().unwrap();
        gateway.create(&mut chunk, &person("cy", "c")).unwrap();
        gateway.rollback(chunk);
        assert_eq!(count(&gateway), 2);
        assert!(gateway.connection().is_autocommit());
    }

    #[test]
    fn constraint_violation_is_reported() {
        let (_dir, mut gateway) = setup();

        let mut chunk = gateway.begin_chunk().unwrap();
        gateway.create(&mut chunk, &person("ada", "dup")).unwrap();
        let err = gateway.create(&mut chunk, &person("bob", "dup")).unwrap_err();
        assert!(matches!(err, PersistenceError::Constraint(_)));
        assert!(!err.is_systemic());
        gateway.rollback(chunk);
        assert_eq!(count(&gateway), 0);
    }

    #[test]
    fn dropped_table_is_systemic() {
        let (_dir, mut gateway) = setup();
        gateway.describe_type("person").unwrap();
        gateway.connection().execute_batch("DROP TABLE person").unwrap();

        let mut chunk = gateway.begin_chunk().unwrap();
        let err = gateway.create(&mut chunk, &person("ada", "a")).unwrap_err();
        assert!(matches!(err, PersistenceError::UnknownType(_)));
        gateway.rollback(chunk);
    }

    #[test]
    fn dates_and_booleans_are_stored_as_text_and_integers() {
        let (_dir, mut gateway) = setup();
        let mut entity = person("ada", "a");
        entity.fields.insert(
            "born".into(),
            Value::Date(chrono::NaiveDate::from_ymd_opt(1815, 12, 10).unwrap()),
        );
        entity.fields.insert("active".into(), Value::Boolean(false));

        let mut chunk = gateway.begin_chunk().unwrap();
        gateway.create(&mut chunk, &entity).unwrap();
        gateway.commit(chunk).unwrap();

        let (born, active): (String, i64) = gateway
            .connection()
            .query_row("SELECT born, active FROM person", [], |row| Ok((row.get(0)?, row.get(1)?)))
            .unwrap();
        assert_eq!(born, "1815-12-10");
        assert_eq!(active, 0);
    }

    #[test]
    fn options_ignore_unknown_keys() {
        let options: SQLiteOptions = serde_json::from_str(r#"{"filepath": "a/graft.db", "readonly": true}"#).unwrap();
        assert_eq!(options.filepath, "a/graft.db");
        assert_eq!(options.endpoint(), "sqlite://graft.db");
    }

    #[test]
    fn missing_filepath_is_a_connection_error() {
        let err = SqliteGateway::open(&SQLiteOptions::default()).err().unwrap();
        assert!(err.is_systemic());
        assert_eq!(SQLiteOptions::new("/tmp/x/graft.db").endpoint(), "sqlite://graft.db");
    }
}
