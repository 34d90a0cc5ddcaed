use std::io::BufRead;

use indexmap::IndexMap;
use serde_json::Value;

use crate::SourceRow;

use super::{RecordSource, RowRange, SourceError};

/// JSON Lines 数据源：每个非空行是一个 JSON 对象
pub struct JsonLinesSource<R: BufRead> {
    reader: R,
    range: RowRange,
    line: Vec<u8>,
    position: u64,
    malformed: u64,
    done: bool,
}

impl<R: BufRead> JsonLinesSource<R> {
    pub fn open(
        reader: R,
        range: RowRange,
    ) -> Self {
        Self {
            reader,
            range,
            line: Vec::new(),
            position: 0,
            malformed: 0,
            done: false,
        }
    }

    fn parse_line(line: &[u8]) -> Option<IndexMap<String, String>> {
        let text = std::str::from_utf8(line).ok()?;
        let Value::Object(object) = serde_json::from_str::<Value>(text).ok()? else {
            return None;
        };

        let mut values = IndexMap::with_capacity(object.len());
        for (key, value) in object {
            let text = match value {
                Value::Null => String::new(),
                Value::String(s) => s,
                Value::Bool(b) => b.to_string(),
                Value::Number(n) => n.to_string(),
                nested => nested.to_string(),
            };
            values.insert(key, text);
        }
        Some(values)
    }
}

impl<R: BufRead> Iterator for JsonLinesSource<R> {
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

            self.line.clear();
            match self.reader.read_until(b'\n', &mut self.line) {
                Ok(0) => {
                    self.done = true;
                    return None;
                }
                Ok(_) => {}
                Err(err) => {
                    self.done = true;
                    return Some(Err(SourceError::Io(err)));
                }
            }

            if self.line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            self.position += 1;
            if !self.range.contains(self.position) {
                continue;
            }

            match Self::parse_line(&self.line) {
                Some(values) => {
                    return Some(Ok(SourceRow {
                        position: self.position,
                        values,
                    }));
                }
                None => {
                    tracing::warn!("第 {} 行不是有效的 JSON 对象，已跳过", self.position);
                    self.malformed += 1;
                }
            }
        }
    }
}

impl<R: BufRead> RecordSource for JsonLinesSource<R> {
    fn malformed(&self) -> u64 {
        self.malformed
    }
}
