use std::collections::HashSet;
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::mapper::Transform;
use crate::source::RowRange;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("配置字段缺失: {0}")]
    Missing(String),
    #[error("配置字段非法: {field}: {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    pub fn invalid(
        field: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        ConfigError::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

fn default_delimiter() -> String {
    ";".into()
}

fn default_quote_char() -> Option<String> {
    Some("\"".into())
}

fn default_commit_interval() -> i64 {
    1000
}

/// 导入任务配置（提交时由调用方给出）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportConfig {
    #[serde(default)]
    pub target_type: Option<String>,
    #[serde(default = "default_delimiter")]
    pub delimiter: String,
    /// `None` 或空字符串表示不使用引号
    #[serde(default = "default_quote_char")]
    pub quote_char: Option<String>,
    #[serde(default)]
    pub range: Option<String>,
    /// 源列名 -> 目标属性名
    #[serde(default)]
    pub column_mappings: IndexMap<String, String>,
    /// 源列名 -> 转换表达式
    #[serde(default)]
    pub transforms: IndexMap<String, String>,
    #[serde(default = "default_commit_interval")]
    pub commit_interval: i64,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            target_type: None,
            delimiter: default_delimiter(),
            quote_char: default_quote_char(),
            range: None,
            column_mappings: IndexMap::new(),
            transforms: IndexMap::new(),
            commit_interval: default_commit_interval(),
        }
    }
}

impl ImportConfig {
    pub fn new(target_type: impl Into<String>) -> Self {
        Self {
            target_type: Some(target_type.into()),
            ..Default::default()
        }
    }

    /// 校验配置并生成不可变的运行参数
    pub fn validate(&self) -> Result<ImportSettings, ConfigError> {
        let target_type = match self.target_type.as_deref().map(str::trim) {
            Some(t) if !t.is_empty() => t.to_string(),
            _ => return Err(ConfigError::Missing("targetType".into())),
        };

        let delimiter = single_ascii("delimiter", &self.delimiter)?;

        let quote_char = match self.quote_char.as_deref() {
            None | Some("") => None,
            Some(q) => Some(single_ascii("quoteChar", q)?),
        };
        if quote_char == Some(delimiter) {
            return Err(ConfigError::invalid("quoteChar", "不能与 delimiter 相同"));
        }

        if self.commit_interval <= 0 {
            return Err(ConfigError::invalid(
                "commitInterval",
                format!("必须为正整数，收到: {}", self.commit_interval),
            ));
        }
        let commit_interval = usize::try_from(self.commit_interval)
            .map_err(|_| ConfigError::invalid("commitInterval", "超出范围"))?;

        let range = match self.range.as_deref() {
            Some(spec) => RowRange::parse(spec).map_err(|e| ConfigError::invalid("range", e))?,
            None => RowRange::all(),
        };

        let mut targets = HashSet::new();
        for (column, property) in &self.column_mappings {
            if column.trim().is_empty() || property.trim().is_empty() {
                return Err(ConfigError::invalid("columnMappings", "列名和属性名不能为空"));
            }
            if !targets.insert(property.as_str()) {
                return Err(ConfigError::invalid(
                    "columnMappings",
                    format!("属性 {} 被多个列映射", property),
                ));
            }
        }

        let mut transforms = IndexMap::with_capacity(self.transforms.len());
        for (column, expr) in &self.transforms {
            if column.trim().is_empty() {
                return Err(ConfigError::invalid("transforms", "列名不能为空"));
            }
            let transform =
                Transform::parse(expr).map_err(|e| ConfigError::invalid("transforms", format!("{}: {}", column, e)))?;
            transforms.insert(column.clone(), transform);
        }

        Ok(ImportSettings {
            target_type,
            delimiter,
            quote_char,
            range,
            column_mappings: self.column_mappings.clone(),
            transforms,
            commit_interval,
        })
    }
}

fn single_ascii(
    field: &str,
    value: &str,
) -> Result<u8, ConfigError> {
    let mut chars = value.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) if c.is_ascii() => Ok(c as u8),
        (None, _) => Err(ConfigError::Missing(field.into())),
        _ => Err(ConfigError::invalid(field, format!("必须是单个 ASCII 字符，收到: {:?}", value))),
    }
}

/// 校验后的导入参数，任务运行期间不可变
#[derive(Debug, Clone)]
pub struct ImportSettings {
    pub target_type: String,
    pub delimiter: u8,
    pub quote_char: Option<u8>,
    pub range: RowRange,
    pub column_mappings: IndexMap<String, String>,
    pub transforms: IndexMap<String, Transform>,
    pub commit_interval: usize,
}

/// 任务管理器配置
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// 同时运行的任务上限（即工作线程数）
    pub max_running: usize,
    /// 单个任务的最长运行时间，在块边界检查
    pub job_timeout: Option<Duration>,
    /// 终态任务在注册表中的保留时长
    pub retention: Option<Duration>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_running: 2,
            job_timeout: None,
            retention: None,
        }
    }
}

impl ManagerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_running == 0 {
            return Err(ConfigError::invalid("max_running", "至少为 1"));
        }
        if self.job_timeout.is_some_and(|t| t.is_zero()) {
            return Err(ConfigError::invalid("job_timeout", "不能为 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_fields_absent() {
        let config: ImportConfig = serde_json::from_str(r#"{"targetType": "Person"}"#).unwrap();
        let settings = config.validate().unwrap();

        assert_eq!(settings.target_type, "Person");
        assert_eq!(settings.delimiter, b';');
        assert_eq!(settings.quote_char, Some(b'"'));
        assert_eq!(settings.commit_interval, 1000);
        assert!(settings.range.is_all());
        assert!(settings.column_mappings.is_empty());
    }

    #[test]
    fn camel_case_fields_are_read() {
        let config: ImportConfig = serde_json::from_str(
            r#"{
                "targetType": "Person",
                "delimiter": ",",
                "quoteChar": null,
                "range": "2-4",
                "columnMappings": {"Name": "name"},
                "transforms": {"Name": "trim | upper"},
                "commitInterval": 50
            }"#,
        )
        .unwrap();
        let settings = config.validate().unwrap();

        assert_eq!(settings.delimiter, b',');
        assert_eq!(settings.quote_char, None);
        assert_eq!(settings.commit_interval, 50);
        assert!(settings.range.contains(3));
        assert!(!settings.range.contains(5));
        assert_eq!(settings.column_mappings.get("Name").map(String::as_str), Some("name"));
        assert!(settings.transforms.contains_key("Name"));
    }

    #[test]
    fn zero_or_negative_commit_interval_is_rejected() {
        for interval in [0, -5] {
            let config = ImportConfig {
                commit_interval: interval,
                ..ImportConfig::new("Person")
            };
            let err = config.validate().unwrap_err();
            assert!(matches!(err, ConfigError::Invalid { ref field, .. } if field == "commitInterval"));
        }
    }

    #[test]
    fn missing_target_type_is_rejected() {
        let err = ImportConfig::default().validate().unwrap_err();
        assert!(matches!(err, ConfigError::Missing(ref f) if f == "targetType"));

        let blank = ImportConfig::new("  ");
        assert!(blank.validate().is_err());
    }

    #[test]
    fn delimiter_must_be_single_ascii_char() {
        for bad in ["", ";;", "§"] {
            let config = ImportConfig {
                delimiter: bad.into(),
                ..ImportConfig::new("Person")
            };
            assert!(config.validate().is_err(), "delimiter {:?} should be rejected", bad);
        }
    }

    #[test]
    fn empty_quote_char_disables_quoting() {
        let config = ImportConfig {
            quote_char: Some(String::new()),
            ..ImportConfig::new("Person")
        };
        assert_eq!(config.validate().unwrap().quote_char, None);
    }

    #[test]
    fn quote_char_equal_to_delimiter_is_rejected() {
        let config = ImportConfig {
            delimiter: "'".into(),
            quote_char: Some("'".into()),
            ..ImportConfig::new("Person")
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn bad_range_and_transform_are_rejected() {
        let config = ImportConfig {
            range: Some("5-2".into()),
            ..ImportConfig::new("Person")
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { ref field, .. }) if field == "range"));

        let mut transforms = IndexMap::new();
        transforms.insert("Name".to_string(), "explode()".to_string());
        let config = ImportConfig {
            transforms,
            ..ImportConfig::new("Person")
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { ref field, .. }) if field == "transforms"));
    }

    #[test]
    fn duplicate_mapping_targets_are_rejected() {
        let mut mappings = IndexMap::new();
        mappings.insert("First".to_string(), "name".to_string());
        mappings.insert("Last".to_string(), "name".to_string());
        let config = ImportConfig {
            column_mappings: mappings,
            ..ImportConfig::new("Person")
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn manager_config_requires_a_worker() {
        assert!(ManagerConfig::default().validate().is_ok());
        let config = ManagerConfig {
            max_running: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
