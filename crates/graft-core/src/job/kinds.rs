use std::fs::File;
use std::io::{BufRead, BufReader, Cursor};
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{ConfigError, ImportSettings};
use crate::source::{CsvSource, JsonLinesSource, RecordSource};

use super::{ImportKind, JobError, JobSnapshot};

/// 导入数据的来源
#[derive(Debug, Clone)]
pub enum Input {
    Path(PathBuf),
    Bytes(Arc<[u8]>),
}

impl Input {
    pub fn path(path: impl Into<PathBuf>) -> Self {
        Input::Path(path.into())
    }

    pub fn bytes(data: impl Into<Vec<u8>>) -> Self {
        let data: Vec<u8> = data.into();
        Input::Bytes(Arc::from(data))
    }

    pub fn describe(&self) -> String {
        match self {
            Input::Path(path) => path.display().to_string(),
            Input::Bytes(data) => format!("<内存数据 {} 字节>", data.len()),
        }
    }

    fn check(&self) -> Result<(), JobError> {
        if let Input::Path(path) = self {
            if !path.is_file() {
                return Err(ConfigError::invalid("file", format!("{} 不存在或不是文件", path.display())).into());
            }
        }
        Ok(())
    }

    fn open(&self) -> Result<Box<dyn BufRead>, JobError> {
        match self {
            Input::Path(path) => {
                let file = File::open(path).map_err(|err| JobError::Source(format!("打开 {} 失败: {}", path.display(), err)))?;
                Ok(Box::new(BufReader::new(file)))
            }
            Input::Bytes(data) => Ok(Box::new(Cursor::new(data.clone()))),
        }
    }
}

/// 分隔文本（CSV）导入
#[derive(Debug, Clone)]
pub struct CsvImport {
    input: Input,
}

impl CsvImport {
    pub fn new(input: Input) -> Self {
        Self { input }
    }
}

impl ImportKind for CsvImport {
    fn name(&self) -> &str {
        "CSV"
    }

    fn validate(
        &self,
        _settings: &ImportSettings,
    ) -> Result<(), JobError> {
        self.input.check()
    }

    fn produce_rows(
        &self,
        settings: &ImportSettings,
    ) -> Result<Box<dyn RecordSource>, JobError> {
        let source = CsvSource::open(
            self.input.open()?,
            settings.delimiter,
            settings.quote_char,
            settings.range.clone(),
        )?;
        tracing::debug!("CSV 表头: {:?}", source.headers());
        Ok(Box::new(source))
    }

    fn on_terminal(
        &self,
        snapshot: &JobSnapshot,
    ) {
        tracing::info!(
            "[{}] CSV 导入 {} 结束: 读取 {} 行，格式错误 {} 行",
            snapshot.id,
            self.input.describe(),
            snapshot.rows_read,
            snapshot.malformed_rows
        );
    }
}

/// JSON Lines 导入，分隔符与引号设置不适用
#[derive(Debug, Clone)]
pub struct JsonLinesImport {
    input: Input,
}

impl JsonLinesImport {
    pub fn new(input: Input) -> Self {
        Self { input }
    }
}

impl ImportKind for JsonLinesImport {
    fn name(&self) -> &str {
        "JSON"
    }

    fn validate(
        &self,
        _settings: &ImportSettings,
    ) -> Result<(), JobError> {
        self.input.check()
    }

    fn produce_rows(
        &self,
        settings: &ImportSettings,
    ) -> Result<Box<dyn RecordSource>, JobError> {
        Ok(Box::new(JsonLinesSource::open(self.input.open()?, settings.range.clone())))
    }

    fn on_terminal(
        &self,
        snapshot: &JobSnapshot,
    ) {
        tracing::info!(
            "[{}] JSON Lines 导入 {} 结束: 读取 {} 行，格式错误 {} 行",
            snapshot.id,
            self.input.describe(),
            snapshot.rows_read,
            snapshot.malformed_rows
        );
    }
}
