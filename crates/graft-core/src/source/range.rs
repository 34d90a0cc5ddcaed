/// 行范围过滤器
///
/// 支持 `"10-500"`、`"5,9,20-30"`、`"100-"`（到结尾）、`"-50"`（从第 1 行开始），
/// 行号从 1 开始计数；空字符串表示全部行。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowRange {
    spans: Vec<(u64, Option<u64>)>,
}

impl RowRange {
    pub fn all() -> Self {
        Self { spans: vec![] }
    }

    pub fn parse(spec: &str) -> Result<Self, String> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Ok(Self::all());
        }

        let mut spans = Vec::new();
        for item in spec.split(',') {
            let item = item.trim();
            if item.is_empty() {
                return Err(format!("范围表达式包含空项: {:?}", spec));
            }

            let span = match item.split_once('-') {
                None => {
                    let n = parse_position(item)?;
                    (n, Some(n))
                }
                Some((start, end)) => {
                    let start = start.trim();
                    let end = end.trim();
                    let start = if start.is_empty() { 1 } else { parse_position(start)? };
                    let end = if end.is_empty() { None } else { Some(parse_position(end)?) };
                    if start == 1 && end.is_none() && item.trim() == "-" {
                        return Err(format!("无效的范围项: {:?}", item));
                    }
                    if let Some(end) = end {
                        if start > end {
                            return Err(format!("范围起点大于终点: {:?}", item));
                        }
                    }
                    (start, end)
                }
            };
            spans.push(span);
        }

        Ok(Self { spans })
    }

    pub fn is_all(&self) -> bool {
        self.spans.is_empty()
    }

    pub fn contains(
        &self,
        position: u64,
    ) -> bool {
        if self.spans.is_empty() {
            return true;
        }
        self.spans
            .iter()
            .any(|(start, end)| position >= *start && end.is_none_or(|end| position <= end))
    }

    /// 最大行号；存在开放区间或不过滤时返回 None
    pub fn upper_bound(&self) -> Option<u64> {
        if self.spans.is_empty() {
            return None;
        }
        let mut max = 0;
        for (_, end) in &self.spans {
            max = max.max((*end)?);
        }
        Some(max)
    }
}

fn parse_position(s: &str) -> Result<u64, String> {
    match s.parse::<u64>() {
        Ok(0) => Err("行号从 1 开始".into()),
        Ok(n) => Ok(n),
        Err(_) => Err(format!("无效的行号: {:?}", s)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_spec_selects_everything() {
        let range = RowRange::parse("  ").unwrap();
        assert!(range.is_all());
        assert!(range.contains(1));
        assert!(range.contains(1_000_000));
        assert_eq!(range.upper_bound(), None);
    }

    #[test]
    fn single_span() {
        let range = RowRange::parse("10-500").unwrap();
        assert!(!range.contains(9));
        assert!(range.contains(10));
        assert!(range.contains(500));
        assert!(!range.contains(501));
        assert_eq!(range.upper_bound(), Some(500));
    }

    #[test]
    fn mixed_items() {
        let range = RowRange::parse("5, 9,20-30").unwrap();
        let picked: Vec<u64> = (1..=40).filter(|p| range.contains(*p)).collect();
        let mut expected = vec![5, 9];
        expected.extend(20..=30);
        assert_eq!(picked, expected);
        assert_eq!(range.upper_bound(), Some(30));
    }

    #[test]
    fn open_ended_spans() {
        let tail = RowRange::parse("100-").unwrap();
        assert!(!tail.contains(99));
        assert!(tail.contains(1_000));
        assert_eq!(tail.upper_bound(), None);

        let head = RowRange::parse("-3").unwrap();
        assert!(head.contains(1));
        assert!(head.contains(3));
        assert!(!head.contains(4));
    }

    #[test]
    fn invalid_specs() {
        for spec in ["0", "5-2", "a-b", "1,,2", "-", "3-x", "1.5"] {
            assert!(RowRange::parse(spec).is_err(), "{:?} should be rejected", spec);
        }
    }
}
