//! Influx line protocol: `measurement,tag=v field=v timestamp`.

use std::collections::BTreeMap;

use super::ConvertError;

#[derive(Debug, Clone, PartialEq)]
pub enum LineValue {
    Float(f64),
    Int(i64),
    UInt(u64),
    Bool(bool),
    Str(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    pub fields: Vec<(String, LineValue)>,
    /// Nanoseconds since the epoch.
    pub timestamp: Option<i64>,
}

struct Cursor {
    chars: Vec<char>,
    pos: usize,
    line: usize,
}

impl Cursor {
    fn new(src: &str, line: usize) -> Self {
        Self {
            chars: src.chars().collect(),
            pos: 0,
            line,
        }
    }

    fn error(&self, reason: impl Into<String>) -> ConvertError {
        ConvertError::LineProtocol {
            line: self.line,
            reason: reason.into(),
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn at_end(&self) -> bool {
        self.pos >= self.chars.len()
    }

    /// Reads up to (not including) the first unescaped stop char.
    fn token(&mut self, stops: &[char]) -> String {
        let mut out = String::new();
        while let Some(c) = self.peek() {
            if c == '\\' {
                match self.chars.get(self.pos + 1) {
                    Some(next) if stops.contains(next) || *next == '\\' || *next == '=' => {
                        out.push(*next);
                        self.pos += 2;
                        continue;
                    }
                    _ => {}
                }
            } else if stops.contains(&c) {
                break;
            }
            out.push(c);
            self.pos += 1;
        }
        out
    }

    fn quoted(&mut self) -> Result<String, ConvertError> {
        self.pos += 1;
        let mut out = String::new();
        loop {
            match self.peek() {
                None => return Err(self.error("unterminated string field")),
                Some('\\') if matches!(self.chars.get(self.pos + 1), Some('"') | Some('\\')) => {
                    out.push(self.chars[self.pos + 1]);
                    self.pos += 2;
                }
                Some('"') => {
                    self.pos += 1;
                    return Ok(out);
                }
                Some(c) => {
                    out.push(c);
                    self.pos += 1;
                }
            }
        }
    }

    fn expect(&mut self, c: char) -> Result<(), ConvertError> {
        if self.peek() == Some(c) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(format!("expected `{c}` at column {}", self.pos + 1)))
        }
    }

    fn skip_spaces(&mut self) {
        while self.peek() == Some(' ') {
            self.pos += 1;
        }
    }
}

fn parse_value(raw: &str, cursor: &Cursor) -> Result<LineValue, ConvertError> {
    let bad = || cursor.error(format!("invalid field value `{raw}`"));
    match raw {
        "t" | "T" | "true" | "True" | "TRUE" => return Ok(LineValue::Bool(true)),
        "f" | "F" | "false" | "False" | "FALSE" => return Ok(LineValue::Bool(false)),
        _ => {}
    }
    if let Some(num) = raw.strip_suffix('i') {
        return num.parse().map(LineValue::Int).map_err(|_| bad());
    }
    if let Some(num) = raw.strip_suffix('u') {
        return num.parse().map(LineValue::UInt).map_err(|_| bad());
    }
    raw.parse::<f64>()
        .ok()
        .filter(|f| f.is_finite())
        .map(LineValue::Float)
        .ok_or_else(bad)
}

fn parse_line(src: &str, line: usize) -> Result<Point, ConvertError> {
    let mut cursor = Cursor::new(src, line);

    let measurement = cursor.token(&[',', ' ']);
    if measurement.is_empty() {
        return Err(cursor.error("missing measurement"));
    }

    let mut tags = BTreeMap::new();
    while cursor.peek() == Some(',') {
        cursor.pos += 1;
        let key = cursor.token(&['=', ',', ' ']);
        cursor.expect('=')?;
        let value = cursor.token(&[',', ' ']);
        if key.is_empty() || value.is_empty() {
            return Err(cursor.error("empty tag key or value"));
        }
        tags.insert(key, value);
    }

    cursor.skip_spaces();
    let mut fields = Vec::new();
    loop {
        let key = cursor.token(&['=', ',', ' ']);
        if key.is_empty() {
            return Err(cursor.error("missing field key"));
        }
        cursor.expect('=')?;
        let value = if cursor.peek() == Some('"') {
            LineValue::Str(cursor.quoted()?)
        } else {
            let raw = cursor.token(&[',', ' ']);
            parse_value(&raw, &cursor)?
        };
        fields.push((key, value));
        if cursor.peek() == Some(',') {
            cursor.pos += 1;
        } else {
            break;
        }
    }

    cursor.skip_spaces();
    let timestamp = if cursor.at_end() {
        None
    } else {
        let raw: String = cursor.chars[cursor.pos..].iter().collect();
        let raw = raw.trim();
        Some(
            raw.parse::<i64>()
                .map_err(|_| cursor.error(format!("invalid timestamp `{raw}`")))?,
        )
    };

    Ok(Point {
        measurement,
        tags,
        fields,
        timestamp,
    })
}

/// Parses every non-empty, non-comment line. Line numbers in errors are
/// 1-based.
pub fn parse(body: &str) -> Result<Vec<Point>, ConvertError> {
    body.lines()
        .enumerate()
        .map(|(idx, line)| (idx + 1, line.trim_end_matches('\r')))
        .filter(|(_, line)| {
            let trimmed = line.trim_start();
            !trimmed.is_empty() && !trimmed.starts_with('#')
        })
        .map(|(no, line)| parse_line(line.trim_start(), no))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_full_line() {
        let points = parse("cpu,host=a,region=eu usage=1.5,count=3i,up=t,name=\"x y\" 1700000000000000000").unwrap();
        assert_eq!(points.len(), 1);
        let p = &points[0];
        assert_eq!(p.measurement, "cpu");
        assert_eq!(p.tags["host"], "a");
        assert_eq!(p.tags["region"], "eu");
        assert_eq!(
            p.fields,
            vec![
                ("usage".to_string(), LineValue::Float(1.5)),
                ("count".to_string(), LineValue::Int(3)),
                ("up".to_string(), LineValue::Bool(true)),
                ("name".to_string(), LineValue::Str("x y".to_string())),
            ]
        );
        assert_eq!(p.timestamp, Some(1_700_000_000_000_000_000));
    }

    #[test]
    fn handles_escapes_and_missing_timestamp() {
        let points = parse(r#"disk\ io,path=/var\,log free=10u,msg="say \"hi\"""#).unwrap();
        let p = &points[0];
        assert_eq!(p.measurement, "disk io");
        assert_eq!(p.tags["path"], "/var,log");
        assert_eq!(p.fields[0].1, LineValue::UInt(10));
        assert_eq!(p.fields[1].1, LineValue::Str("say \"hi\"".to_string()));
        assert_eq!(p.timestamp, None);
    }

    #[test]
    fn skips_blank_and_comment_lines() {
        let points = parse("# header\n\ncpu v=1\r\nmem v=2\n").unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[1].measurement, "mem");
    }

    #[test]
    fn reports_the_failing_line() {
        let err = parse("cpu v=1\ncpu v=abc").unwrap_err();
        assert!(matches!(err, ConvertError::LineProtocol { line: 2, .. }));
        assert!(parse("cpu").is_err());
        assert!(parse("cpu v=\"open").is_err());
        assert!(parse("cpu v=1 notatime").is_err());
    }
}
