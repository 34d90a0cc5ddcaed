use std::io;

use thiserror::Error;

use crate::SourceRow;

pub use delimited::CsvSource;
pub use json_lines::JsonLinesSource;
pub use range::RowRange;

mod delimited;
mod json_lines;
mod range;

#[derive(Debug, Error)]
pub enum SourceError {
    /// 表头无法解析，整个任务失败
    #[error("输入格式错误: {0}")]
    MalformedInput(String),
    #[error("读取输入失败: {0}")]
    Io(#[from] io::Error),
    #[error("CSV 读取失败: {0}")]
    Csv(#[from] csv::Error),
}

/// 惰性的原始行序列
///
/// 序列只能读取一次，重新读取需要新建实例。格式错误的行会被跳过并计数，
/// 不会以 `Err` 的形式出现；`Err` 只表示无法继续读取（如 I/O 失败）。
pub trait RecordSource: Iterator<Item = Result<SourceRow, SourceError>> {
    /// 已跳过的格式错误行数
    fn malformed(&self) -> u64;
}
