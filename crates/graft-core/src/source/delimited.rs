use std::collections::HashSet;
use std::io::Read;

use csv::{ByteRecord, ErrorKind, Reader, ReaderBuilder};
use indexmap::IndexMap;

use crate::SourceRow;

use super::{RecordSource, RowRange, SourceError};

/// 基于 `csv` 的分隔文本数据源
pub struct CsvSource<R: Read> {
    reader: Reader<R>,
    headers: Vec<String>,
    range: RowRange,
    record: ByteRecord,
    position: u64,
    malformed: u64,
    done: bool,
}

impl<R: Read> CsvSource<R> {
    /// 打开数据源并读取表头
    ///
    /// 表头无法解析（非 UTF-8、空列名、重复列名）时返回 `MalformedInput`；
    /// 完全为空的输入视为 0 行数据。
    pub fn open(
        input: R,
        delimiter: u8,
        quote_char: Option<u8>,
        range: RowRange,
    ) -> Result<Self, SourceError> {
        let mut builder = ReaderBuilder::new();
        builder.delimiter(delimiter).has_headers(true).flexible(true);
        match quote_char {
            Some(quote) => builder.quote(quote),
            None => builder.quoting(false),
        };
        let mut reader = builder.from_reader(input);

        let raw = match reader.byte_headers() {
            Ok(raw) => raw.clone(),
            Err(err) => {
                return Err(match err.kind() {
                    ErrorKind::Io(_) => SourceError::Csv(err),
                    _ => SourceError::MalformedInput(format!("无法解析表头: {}", err)),
                });
            }
        };

        let mut headers = Vec::with_capacity(raw.len());
        let mut seen = HashSet::new();
        for (idx, field) in raw.iter().enumerate() {
            let name = std::str::from_utf8(field)
                .map_err(|_| SourceError::MalformedInput(format!("表头第 {} 列不是有效的 UTF-8", idx + 1)))?;
            let name = name.trim_start_matches('\u{feff}').trim().to_string();
            if name.is_empty() {
                return Err(SourceError::MalformedInput(format!("表头第 {} 列为空", idx + 1)));
            }
            if !seen.insert(name.clone()) {
                return Err(SourceError::MalformedInput(format!("表头列名重复: {}", name)));
            }
            headers.push(name);
        }

        let done = headers.is_empty();
        if done {
            tracing::debug!("输入为空，没有表头和数据行");
        }

        Ok(Self {
            reader,
            headers,
            range,
            record: ByteRecord::new(),
            position: 0,
            malformed: 0,
            done,
        })
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    fn decode(&self) -> Option<IndexMap<String, String>> {
        let mut values = IndexMap::with_capacity(self.headers.len());
        for (name, field) in self.headers.iter().zip(self.record.iter()) {
            let value = std::str::from_utf8(field).ok()?;
            values.insert(name.clone(), value.to_string());
        }
        Some(values)
    }
}

impl<R: Read> Iterator for CsvSource<R> {
    type Item = Result<SourceRow, SourceError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            if self.range.upper_bound().is_some_and(|max| self.position >= max) {
                self.done = true;
                return None;
            }

            match self.reader.read_byte_record(&mut self.record) {
                Ok(true) => {}
                Ok(false) => {
                    self.done = true;
                    return None;
                }
                Err(err) => {
                    if matches!(err.kind(), ErrorKind::Io(_)) {
                        self.done = true;
                        return Some(Err(SourceError::Csv(err)));
                    }
                    self.position += 1;
                    if self.range.contains(self.position) {
                        tracing::warn!("第 {} 行无法解析，已跳过: {}", self.position, err);
                        self.malformed += 1;
                    }
                    continue;
                }
            }

            self.position += 1;
            if !self.range.contains(self.position) {
                continue;
            }

            if self.record.len() != self.headers.len() {
                tracing::warn!(
                    "第 {} 行列数不匹配（期望 {}，实际 {}），已跳过",
                    self.position,
                    self.headers.len(),
                    self.record.len()
                );
                self.malformed += 1;
                continue;
            }

            match self.decode() {
                Some(values) => {
                    return Some(Ok(SourceRow {
                        position: self.position,
                        values,
                    }));
                }
                None => {
                    tracing::warn!("第 {} 行不是有效的 UTF-8，已跳过", self.position);
                    self.malformed += 1;
                }
            }
        }
    }
}

impl<R: Read> RecordSource for CsvSource<R> {
    fn malformed(&self) -> u64 {
        self.malformed
    }
}
