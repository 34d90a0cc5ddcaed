use chrono::{NaiveDate, NaiveDateTime};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransformError {
    #[error("表达式语法错误（位置 {pos}）: {reason}")]
    Syntax { pos: usize, reason: String },
    #[error("未知函数: {0}")]
    UnknownFunction(String),
    #[error("函数 {name} 参数错误: {reason}")]
    Arguments { name: String, reason: String },
    #[error("无法按格式 {format} 解析: {value}")]
    Format { format: String, value: String },
}

/// 转换表达式
///
/// 语法为以 `|` 连接的函数管道，例如 `trim | replace(",", ".") | default("0")`。
/// 表达式没有副作用，输入 `None` 表示空值。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transform {
    steps: Vec<Step>,
}

#[derive(Debug, Clone, PartialEq)]
enum Step {
    Trim,
    Lower,
    Upper,
    Number,
    Prefix(String),
    Suffix(String),
    Replace(String, String),
    Substr(usize, Option<usize>),
    Split(String, usize),
    Default(String),
    NullIf(String),
    Date(String),
    DateTime(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Arg {
    Str(String),
    Int(i64),
}

impl Transform {
    pub fn identity() -> Self {
        Self::default()
    }

    pub fn parse(expr: &str) -> Result<Self, TransformError> {
        let mut parser = Parser::new(expr);
        let mut steps = Vec::new();

        parser.skip_ws();
        if parser.at_end() {
            return Ok(Self::identity());
        }

        loop {
            steps.push(parser.step()?);
            parser.skip_ws();
            if parser.at_end() {
                break;
            }
            parser.expect('|')?;
        }

        Ok(Self { steps })
    }

    pub fn is_identity(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn apply(
        &self,
        input: Option<&str>,
    ) -> Result<Option<String>, TransformError> {
        let mut value = input.map(str::to_string);
        for step in &self.steps {
            value = step.apply(value)?;
        }
        Ok(value)
    }
}

impl Step {
    fn build(
        name: &str,
        args: Vec<Arg>,
    ) -> Result<Self, TransformError> {
        let arity = |n: usize| -> Result<(), TransformError> {
            if args.len() == n {
                Ok(())
            } else {
                Err(TransformError::Arguments {
                    name: name.into(),
                    reason: format!("需要 {} 个参数，收到 {}", n, args.len()),
                })
            }
        };

        let step = match name {
            "trim" => arity(0).map(|_| Step::Trim)?,
            "lower" => arity(0).map(|_| Step::Lower)?,
            "upper" => arity(0).map(|_| Step::Upper)?,
            "number" => arity(0).map(|_| Step::Number)?,
            "prefix" => {
                arity(1)?;
                Step::Prefix(str_arg(&args[0]))
            }
            "suffix" => {
                arity(1)?;
                Step::Suffix(str_arg(&args[0]))
            }
            "replace" => {
                arity(2)?;
                let from = str_arg(&args[0]);
                if from.is_empty() {
                    return Err(TransformError::Arguments {
                        name: name.into(),
                        reason: "被替换的字符串不能为空".into(),
                    });
                }
                Step::Replace(from, str_arg(&args[1]))
            }
            "substr" => match args.len() {
                1 => Step::Substr(index_arg(name, &args[0])?, None),
                2 => Step::Substr(index_arg(name, &args[0])?, Some(index_arg(name, &args[1])?)),
                n => {
                    return Err(TransformError::Arguments {
                        name: name.into(),
                        reason: format!("需要 1 或 2 个参数，收到 {}", n),
                    });
                }
            },
            "split" => {
                arity(2)?;
                let sep = str_arg(&args[0]);
                if sep.is_empty() {
                    return Err(TransformError::Arguments {
                        name: name.into(),
                        reason: "分隔符不能为空".into(),
                    });
                }
                Step::Split(sep, index_arg(name, &args[1])?)
            }
            "default" => {
                arity(1)?;
                Step::Default(str_arg(&args[0]))
            }
            "null_if" => {
                arity(1)?;
                Step::NullIf(str_arg(&args[0]))
            }
            "date" => {
                arity(1)?;
                Step::Date(str_arg(&args[0]))
            }
            "datetime" => {
                arity(1)?;
                Step::DateTime(str_arg(&args[0]))
            }
            other => return Err(TransformError::UnknownFunction(other.into())),
        };
        Ok(step)
    }

    fn apply(
        &self,
        value: Option<String>,
    ) -> Result<Option<String>, TransformError> {
        match self {
            Step::Default(fallback) => {
                return Ok(match value {
                    Some(v) if !v.is_empty() => Some(v),
                    _ => Some(fallback.clone()),
                });
            }
            Step::NullIf(marker) => return Ok(value.filter(|v| v != marker)),
            _ => {}
        }

        let Some(v) = value else {
            return Ok(None);
        };

        let out = match self {
            Step::Trim => v.trim().to_string(),
            Step::Lower => v.to_lowercase(),
            Step::Upper => v.to_uppercase(),
            Step::Number => v
                .chars()
                .filter(|c| !c.is_whitespace() && *c != ',' && *c != '_')
                .collect(),
            Step::Prefix(p) => format!("{}{}", p, v),
            Step::Suffix(s) => format!("{}{}", v, s),
            Step::Replace(from, to) => v.replace(from.as_str(), to),
            Step::Substr(start, len) => {
                let chars = v.chars().skip(*start);
                match len {
                    Some(n) => chars.take(*n).collect(),
                    None => chars.collect(),
                }
            }
            Step::Split(sep, index) => match v.split(sep.as_str()).nth(*index) {
                Some(part) => part.to_string(),
                None => return Ok(None),
            },
            Step::Date(format) => {
                if v.trim().is_empty() {
                    return Ok(None);
                }
                NaiveDate::parse_from_str(v.trim(), format)
                    .map_err(|_| TransformError::Format {
                        format: format.clone(),
                        value: v.clone(),
                    })?
                    .format("%Y-%m-%d")
                    .to_string()
            }
            Step::DateTime(format) => {
                if v.trim().is_empty() {
                    return Ok(None);
                }
                NaiveDateTime::parse_from_str(v.trim(), format)
                    .map_err(|_| TransformError::Format {
                        format: format.clone(),
                        value: v.clone(),
                    })?
                    .format("%Y-%m-%dT%H:%M:%S")
                    .to_string()
            }
            Step::Default(_) | Step::NullIf(_) => v,
        };
        Ok(Some(out))
    }
}

fn str_arg(arg: &Arg) -> String {
    match arg {
        Arg::Str(s) => s.clone(),
        Arg::Int(i) => i.to_string(),
    }
}

fn index_arg(
    name: &str,
    arg: &Arg,
) -> Result<usize, TransformError> {
    match arg {
        Arg::Int(i) if *i >= 0 => Ok(*i as usize),
        _ => Err(TransformError::Arguments {
            name: name.into(),
            reason: format!("需要非负整数，收到 {:?}", arg),
        }),
    }
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
}

impl Parser {
    fn new(src: &str) -> Self {
        Self {
            chars: src.chars().collect(),
            pos: 0,
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.chars.len()
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn error(
        &self,
        reason: impl Into<String>,
    ) -> TransformError {
        TransformError::Syntax {
            pos: self.pos,
            reason: reason.into(),
        }
    }

    fn expect(
        &mut self,
        expected: char,
    ) -> Result<(), TransformError> {
        self.skip_ws();
        match self.peek() {
            Some(c) if c == expected => {
                self.pos += 1;
                Ok(())
            }
            Some(c) => Err(self.error(format!("期望 '{}'，遇到 '{}'", expected, c))),
            None => Err(self.error(format!("期望 '{}'，表达式已结束", expected))),
        }
    }

    fn step(&mut self) -> Result<Step, TransformError> {
        self.skip_ws();
        let name = self.ident()?;
        self.skip_ws();

        let mut args = Vec::new();
        if self.peek() == Some('(') {
            self.pos += 1;
            self.skip_ws();
            if self.peek() == Some(')') {
                self.pos += 1;
            } else {
                loop {
                    args.push(self.arg()?);
                    self.skip_ws();
                    match self.peek() {
                        Some(',') => self.pos += 1,
                        Some(')') => {
                            self.pos += 1;
                            break;
                        }
                        _ => return Err(self.error("参数列表未闭合")),
                    }
                }
            }
        }

        Step::build(&name, args)
    }

    fn ident(&mut self) -> Result<String, TransformError> {
        let start = self.pos;
        while self.peek().is_some_and(|c| c.is_ascii_alphanumeric() || c == '_') {
            self.pos += 1;
        }
        if start == self.pos || self.chars[start].is_ascii_digit() {
            return Err(self.error("期望函数名"));
        }
        Ok(self.chars[start..self.pos].iter().collect())
    }

    fn arg(&mut self) -> Result<Arg, TransformError> {
        self.skip_ws();
        match self.peek() {
            Some(quote @ ('"' | '\'')) => {
                self.pos += 1;
                let mut out = String::new();
                loop {
                    match self.peek() {
                        None => return Err(self.error("字符串未闭合")),
                        Some('\\') => {
                            self.pos += 1;
                            match self.peek() {
                                Some(c) => out.push(c),
                                None => return Err(self.error("字符串未闭合")),
                            }
                        }
                        Some(c) if c == quote => {
                            self.pos += 1;
                            return Ok(Arg::Str(out));
                        }
                        Some(c) => out.push(c),
                    }
                    self.pos += 1;
                }
            }
            Some(c) if c.is_ascii_digit() || c == '-' => {
                let start = self.pos;
                self.pos += 1;
                while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                    self.pos += 1;
                }
                let text: String = self.chars[start..self.pos].iter().collect();
                text.parse::<i64>()
                    .map(Arg::Int)
                    .map_err(|_| self.error(format!("无效的整数: {}", text)))
            }
            _ => Err(self.error("期望字符串或整数参数")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(
        expr: &str,
        input: Option<&str>,
    ) -> Option<String> {
        Transform::parse(expr).unwrap().apply(input).unwrap()
    }

    #[test]
    fn empty_expression_is_identity() {
        let t = Transform::parse("   ").unwrap();
        assert!(t.is_identity());
        assert_eq!(t.apply(Some(" x ")).unwrap().as_deref(), Some(" x "));
    }

    #[test]
    fn pipeline_runs_left_to_right() {
        assert_eq!(run("trim | upper | prefix('ID-')", Some("  ab ")).as_deref(), Some("ID-AB"));
        assert_eq!(run("replace(\",\", \".\")", Some("1,5")).as_deref(), Some("1.5"));
        assert_eq!(run("substr(1, 3)", Some("héllo")).as_deref(), Some("éll"));
        assert_eq!(run("split('/', 2)", Some("a/b/c")).as_deref(), Some("c"));
        assert_eq!(run("split('/', 5)", Some("a/b/c")), None);
        assert_eq!(run("number", Some("1 234,567")).as_deref(), Some("1234567"));
        assert_eq!(run("suffix(\"\\\"\")", Some("q")).as_deref(), Some("q\""));
    }

    #[test]
    fn null_handling() {
        assert_eq!(run("trim | upper", None), None);
        assert_eq!(run("default('n/a')", None).as_deref(), Some("n/a"));
        assert_eq!(run("default('n/a')", Some("")).as_deref(), Some("n/a"));
        assert_eq!(run("null_if('-')", Some("-")), None);
        assert_eq!(run("null_if('-') | default('0')", Some("-")).as_deref(), Some("0"));
    }

    #[test]
    fn dates_are_normalized() {
        assert_eq!(run("date('%d.%m.%Y')", Some("09.03.2024")).as_deref(), Some("2024-03-09"));
        assert_eq!(
            run("datetime('%d/%m/%Y %H:%M')", Some("09/03/2024 14:05")).as_deref(),
            Some("2024-03-09T14:05:00")
        );
        assert_eq!(run("date('%d.%m.%Y')", Some("  ")), None);

        let err = Transform::parse("date('%d.%m.%Y')").unwrap().apply(Some("2024-03-09"));
        assert!(matches!(err, Err(TransformError::Format { .. })));
    }

    #[test]
    fn parse_errors() {
        assert!(matches!(Transform::parse("explode"), Err(TransformError::UnknownFunction(_))));
        assert!(matches!(Transform::parse("trim(1)"), Err(TransformError::Arguments { .. })));
        assert!(matches!(Transform::parse("substr('a')"), Err(TransformError::Arguments { .. })));
        assert!(matches!(Transform::parse("replace('', 'x')"), Err(TransformError::Arguments { .. })));
        assert!(matches!(Transform::parse("prefix('x"), Err(TransformError::Syntax { .. })));
        assert!(matches!(Transform::parse("trim |"), Err(TransformError::Syntax { .. })));
        assert!(matches!(Transform::parse("trim upper"), Err(TransformError::Syntax { .. })));
        assert!(matches!(Transform::parse("prefix('a' 'b')"), Err(TransformError::Syntax { .. })));
    }
}
