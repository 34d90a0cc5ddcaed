use chrono::{DateTime, NaiveDate, NaiveDateTime};
use thiserror::Error;

use crate::config::{ConfigError, ImportSettings};
use crate::{Entity, PropertyKind, SourceRow, TypeSchema, Value};

pub use transform::{Transform, TransformError};

mod transform;

/// 行级映射错误，不会导致任务失败，只计数并跳过该行
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MappingError {
    #[error("第 {position} 行缺少必填属性 {property}")]
    MissingRequired { position: u64, property: String },
    #[error("第 {position} 行必填属性 {property} 无法转换: {reason}")]
    Coercion {
        position: u64,
        property: String,
        reason: String,
    },
    #[error("第 {position} 行必填属性 {property} 转换表达式执行失败: {source}")]
    Transform {
        position: u64,
        property: String,
        source: TransformError,
    },
    #[error("第 {position} 行所有 {count} 个字段均转换失败")]
    AllFieldsFailed { position: u64, count: usize },
}

/// 非必填字段转换失败的记录，该字段被置为空值
#[derive(Debug, Clone, PartialEq)]
pub struct FieldError {
    pub property: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MappedRow {
    pub entity: Entity,
    pub field_errors: Vec<FieldError>,
}

#[derive(Debug, Clone)]
struct FieldPlan {
    column: String,
    property: String,
    kind: PropertyKind,
    required: bool,
    transform: Transform,
}

/// 将原始行映射为目标实体
///
/// 映射是纯函数，行与行之间没有依赖。
#[derive(Debug, Clone)]
pub struct Mapper {
    target_type: String,
    fields: Vec<FieldPlan>,
    /// 同名映射时，行中不存在的列不写入实体
    identity: bool,
}

impl Mapper {
    /// 根据导入参数与目标类型定义构建映射计划
    ///
    /// 未配置列映射时，按同名规则将目标类型的每个属性映射到同名列。
    pub fn new(
        settings: &ImportSettings,
        schema: &TypeSchema,
    ) -> Result<Self, ConfigError> {
        let pairs: Vec<(String, String)> = if settings.column_mappings.is_empty() {
            schema
                .properties
                .iter()
                .map(|p| (p.name.clone(), p.name.clone()))
                .collect()
        } else {
            settings
                .column_mappings
                .iter()
                .map(|(c, p)| (c.clone(), p.clone()))
                .collect()
        };

        let mut fields = Vec::with_capacity(pairs.len());
        for (column, property) in pairs {
            let prop = schema.property(&property).ok_or_else(|| {
                ConfigError::invalid(
                    "columnMappings",
                    format!("目标类型 {} 没有属性 {}", schema.name, property),
                )
            })?;
            let transform = settings.transforms.get(&column).cloned().unwrap_or_default();
            fields.push(FieldPlan {
                column,
                property,
                kind: prop.kind,
                required: prop.required,
                transform,
            });
        }

        for prop in schema.properties.iter().filter(|p| p.required) {
            if !fields.iter().any(|f| f.property == prop.name) {
                return Err(ConfigError::invalid(
                    "columnMappings",
                    format!("必填属性 {} 没有对应的源列", prop.name),
                ));
            }
        }

        for column in settings.transforms.keys() {
            if !fields.iter().any(|f| &f.column == column) {
                tracing::warn!("转换表达式引用的列 {} 未参与映射，已忽略", column);
            }
        }

        Ok(Self {
            target_type: schema.name.clone(),
            fields,
            identity: settings.column_mappings.is_empty(),
        })
    }

    pub fn map(
        &self,
        row: &SourceRow,
    ) -> Result<MappedRow, MappingError> {
        let mut entity = Entity::new(self.target_type.clone());
        let mut field_errors = Vec::new();
        let mut attempted = 0;

        for plan in &self.fields {
            let raw = row.get(&plan.column);
            if raw.is_none() && self.identity && !plan.required {
                continue;
            }
            attempted += 1;

            let value = match plan.transform.apply(raw) {
                Ok(v) => coerce(v.as_deref(), plan.kind).map_err(|reason| (reason, None)),
                Err(e) => Err((e.to_string(), Some(e))),
            };

            match value {
                Ok(Value::Null) if plan.required => {
                    return Err(MappingError::MissingRequired {
                        position: row.position,
                        property: plan.property.clone(),
                    });
                }
                Ok(value) => {
                    entity.fields.insert(plan.property.clone(), value);
                }
                Err((_, Some(source))) if plan.required => {
                    return Err(MappingError::Transform {
                        position: row.position,
                        property: plan.property.clone(),
                        source,
                    });
                }
                Err((reason, None)) if plan.required => {
                    return Err(MappingError::Coercion {
                        position: row.position,
                        property: plan.property.clone(),
                        reason,
                    });
                }
                Err((reason, _)) => {
                    entity.fields.insert(plan.property.clone(), Value::Null);
                    field_errors.push(FieldError {
                        property: plan.property.clone(),
                        reason,
                    });
                }
            }
        }

        if attempted > 0 && field_errors.len() == attempted {
            return Err(MappingError::AllFieldsFailed {
                position: row.position,
                count: attempted,
            });
        }

        Ok(MappedRow { entity, field_errors })
    }
}

const DATE_FORMATS: [&str; 3] = ["%Y-%m-%d", "%d.%m.%Y", "%m/%d/%Y"];
const DATETIME_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"];

/// 将字符串转换为目标类型的值，空字符串视为空值
pub fn coerce(
    raw: Option<&str>,
    kind: PropertyKind,
) -> Result<Value, String> {
    let text = match raw.map(str::trim) {
        None | Some("") => return Ok(Value::Null),
        Some(t) => t,
    };

    match kind {
        PropertyKind::String => Ok(Value::String(raw.unwrap_or_default().to_string())),
        PropertyKind::Integer => text
            .parse::<i64>()
            .map(Value::Integer)
            .map_err(|_| format!("{:?} 不是整数", text)),
        PropertyKind::Float => match text.parse::<f64>() {
            Ok(n) if n.is_finite() => Ok(Value::Float(n)),
            _ => Err(format!("{:?} 不是数字", text)),
        },
        PropertyKind::Boolean => match text.to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" => Ok(Value::Boolean(true)),
            "false" | "0" | "no" | "n" => Ok(Value::Boolean(false)),
            _ => Err(format!("{:?} 不是布尔值", text)),
        },
        PropertyKind::Date => DATE_FORMATS
            .iter()
            .find_map(|f| NaiveDate::parse_from_str(text, f).ok())
            .map(Value::Date)
            .ok_or_else(|| format!("{:?} 不是日期", text)),
        PropertyKind::DateTime => DateTime::parse_from_rfc3339(text)
            .map(|dt| dt.naive_utc())
            .ok()
            .or_else(|| {
                DATETIME_FORMATS
                    .iter()
                    .find_map(|f| NaiveDateTime::parse_from_str(text, f).ok())
            })
            .map(Value::DateTime)
            .ok_or_else(|| format!("{:?} 不是日期时间", text)),
    }
}
