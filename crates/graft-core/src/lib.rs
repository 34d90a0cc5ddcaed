use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

// 核心模块导出
pub mod config;
pub mod gateway;
pub mod job;
pub mod manager;
pub mod mapper;
pub mod paths;
pub mod progress;
pub mod source;

// 重新导出常用类型
pub use config::{ConfigError, ImportConfig, ImportSettings, ManagerConfig};
pub use gateway::{
    ChunkHandle, GatewayFactory, MemoryGateway, PersistenceError, PersistenceGateway, SQLiteOptions, SqliteGateway,
    SqliteGatewayFactory,
};
pub use job::{
    CsvImport, ImportJob, ImportKind, Input, JobContext, JobControl, JobError, JobSnapshot, JobStatus, JsonLinesImport,
    PanicRecovery, StatusSink,
};
pub use manager::{ImportRequest, JobFilter, JobManager, ManagerError, SourceFormat};
pub use mapper::{Mapper, MappingError, Transform, TransformError};
pub use paths::{root_dir, task_dir, tasks_dir};
pub use progress::{EventKind, ProgressEvent, ProgressListener, ProgressReporter};
pub use source::{CsvSource, JsonLinesSource, RecordSource, RowRange, SourceError};

// ============================================================================
// Model Types
// ============================================================================

/// 数据源中的一行原始数据
///
/// `position` 为数据行序号（从 1 开始，不含表头）
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceRow {
    pub position: u64,
    pub values: IndexMap<String, String>,
}

impl SourceRow {
    pub fn get(
        &self,
        column: &str,
    ) -> Option<&str> {
        self.values.get(column).map(|v| v.as_str())
    }
}

/// 目标属性的语义类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropertyKind {
    String,
    Integer,
    Float,
    Boolean,
    Date,
    DateTime,
}

impl PropertyKind {
    pub fn label(&self) -> &'static str {
        match self {
            PropertyKind::String => "STRING",
            PropertyKind::Integer => "INTEGER",
            PropertyKind::Float => "FLOAT",
            PropertyKind::Boolean => "BOOLEAN",
            PropertyKind::Date => "DATE",
            PropertyKind::DateTime => "DATETIME",
        }
    }

    /// 根据 SQL 声明类型推断属性类型（规则与 SQLite 的类型亲和性一致）
    pub fn from_declared(decl: &str) -> Self {
        let decl = decl.trim().to_uppercase();
        if decl.contains("BOOL") {
            PropertyKind::Boolean
        } else if decl.contains("DATETIME") || decl.contains("TIMESTAMP") {
            PropertyKind::DateTime
        } else if decl.contains("DATE") {
            PropertyKind::Date
        } else if decl.contains("INT") {
            PropertyKind::Integer
        } else if decl.contains("REAL") || decl.contains("FLOA") || decl.contains("DOUB") || decl.contains("NUMERIC")
        {
            PropertyKind::Float
        } else {
            PropertyKind::String
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertySchema {
    pub name: String,
    pub kind: PropertyKind,
    pub required: bool,
}

impl PropertySchema {
    pub fn new(
        name: impl Into<String>,
        kind: PropertyKind,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// 目标类型定义
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeSchema {
    pub name: String,
    pub properties: Vec<PropertySchema>,
}

impl TypeSchema {
    pub fn new(
        name: impl Into<String>,
        properties: Vec<PropertySchema>,
    ) -> Self {
        Self {
            name: name.into(),
            properties,
        }
    }

    pub fn property(
        &self,
        name: &str,
    ) -> Option<&PropertySchema> {
        self.properties.iter().find(|p| p.name == name)
    }
}

/// 属性值
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl fmt::Display for Value {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::String(s) => f.write_str(s),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Float(n) => write!(f, "{}", n),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Value::DateTime(dt) => write!(f, "{}", dt.format("%Y-%m-%dT%H:%M:%S")),
        }
    }
}

/// 待写入的目标实体
#[derive(Clone, Debug, PartialEq)]
pub struct Entity {
    pub type_name: String,
    pub fields: IndexMap<String, Value>,
}

impl Entity {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            fields: IndexMap::new(),
        }
    }

    pub fn get(
        &self,
        name: &str,
    ) -> Option<&Value> {
        self.fields.get(name)
    }
}

/// 写入成功后由存储层返回的实体引用
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntityRef {
    pub type_name: String,
    pub id: String,
}
