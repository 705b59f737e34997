use serde_json::Value;

use super::ConvertError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Step {
    Key(String),
    Index(usize),
}

/// A small JSON path: `$`, `.key`, `[0]` and `['key']` steps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonPath {
    raw: String,
    steps: Vec<Step>,
}

impl JsonPath {
    pub fn parse(raw: &str) -> Result<Self, ConvertError> {
        let err = |reason: &str| ConvertError::Path {
            path: raw.to_string(),
            reason: reason.to_string(),
        };
        let rest = raw.strip_prefix('$').ok_or_else(|| err("must start with `$`"))?;
        let chars: Vec<char> = rest.chars().collect();
        let mut steps = Vec::new();
        let mut i = 0;
        while i < chars.len() {
            match chars[i] {
                '.' => {
                    let start = i + 1;
                    let mut end = start;
                    while end < chars.len() && chars[end] != '.' && chars[end] != '[' {
                        end += 1;
                    }
                    if end == start {
                        return Err(err("empty key"));
                    }
                    steps.push(Step::Key(chars[start..end].iter().collect()));
                    i = end;
                }
                '[' => {
                    let close = chars[i..]
                        .iter()
                        .position(|c| *c == ']')
                        .map(|p| p + i)
                        .ok_or_else(|| err("unclosed `[`"))?;
                    let inner: String = chars[i + 1..close].iter().collect();
                    let inner = inner.trim();
                    let quoted = inner
                        .strip_prefix('\'')
                        .and_then(|s| s.strip_suffix('\''))
                        .or_else(|| inner.strip_prefix('"').and_then(|s| s.strip_suffix('"')));
                    match quoted {
                        Some(key) => steps.push(Step::Key(key.to_string())),
                        None => {
                            let idx = inner
                                .parse::<usize>()
                                .map_err(|_| err("index must be a non-negative integer"))?;
                            steps.push(Step::Index(idx));
                        }
                    }
                    i = close + 1;
                }
                _ => return Err(err("expected `.` or `[`")),
            }
        }
        Ok(Self {
            raw: raw.to_string(),
            steps,
        })
    }

    pub fn lookup<'v>(&self, doc: &'v Value) -> Option<&'v Value> {
        self.steps.iter().try_fold(doc, |current, step| match step {
            Step::Key(key) => current.get(key.as_str()),
            Step::Index(idx) => current.get(*idx),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn walks_keys_and_indexes() {
        let doc = json!({"a": {"b": [10, {"c d": "x"}]}});
        let path = JsonPath::parse("$.a.b[0]").unwrap();
        assert_eq!(path.lookup(&doc), Some(&json!(10)));
        let path = JsonPath::parse("$.a.b[1]['c d']").unwrap();
        assert_eq!(path.lookup(&doc), Some(&json!("x")));
        assert_eq!(JsonPath::parse("$").unwrap().lookup(&doc), Some(&doc));
    }

    #[test]
    fn missing_steps_yield_none() {
        let doc = json!({"a": 1});
        assert!(JsonPath::parse("$.b").unwrap().lookup(&doc).is_none());
        assert!(JsonPath::parse("$.a[3]").unwrap().lookup(&doc).is_none());
    }

    #[test]
    fn rejects_malformed_paths() {
        assert!(JsonPath::parse("a.b").is_err());
        assert!(JsonPath::parse("$..a").is_err());
        assert!(JsonPath::parse("$.a[").is_err());
        assert!(JsonPath::parse("$.a[-1]").is_err());
    }
}
