use std::collections::HashMap;

use super::{PatternError, Segment, segments};

/// Parameters bound while matching, in pattern order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params(pub Vec<(String, String)>);

impl Params {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug)]
struct Terminal<T> {
    pattern: String,
    names: Vec<String>,
    value: T,
}

#[derive(Debug)]
struct Node<T> {
    literals: HashMap<String, Node<T>>,
    param: Option<Box<Node<T>>>,
    catch_all: Option<Terminal<T>>,
    terminal: Option<Terminal<T>>,
}

impl<T> Default for Node<T> {
    fn default() -> Self {
        Self {
            literals: HashMap::new(),
            param: None,
            catch_all: None,
            terminal: None,
        }
    }
}

/// Segment tree resolving concrete channels to the most specific pattern.
///
/// At each level a literal child wins over a `:param` child, which wins
/// over a `*catchall`. When the preferred branch has no match further down,
/// the next alternative at the same level is tried.
#[derive(Debug)]
pub struct PatternTree<T> {
    root: Node<T>,
    len: usize,
}

impl<T> Default for PatternTree<T> {
    fn default() -> Self {
        Self {
            root: Node::default(),
            len: 0,
        }
    }
}

impl<T> PatternTree<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn insert(&mut self, pattern: &str, value: T) -> Result<(), PatternError> {
        let segs = segments(pattern)?;
        let mut names = Vec::new();
        let mut node = &mut self.root;
        let mut catch_all = false;
        for seg in segs {
            match seg {
                Segment::Literal(lit) => {
                    node = node.literals.entry(lit.to_string()).or_default();
                }
                Segment::Param(name) => {
                    names.push(name.to_string());
                    node = &mut **node.param.get_or_insert_with(Box::default);
                }
                Segment::CatchAll(name) => {
                    names.push(name.to_string());
                    catch_all = true;
                }
            }
        }

        let slot = if catch_all {
            &mut node.catch_all
        } else {
            &mut node.terminal
        };
        if let Some(existing) = slot {
            return Err(PatternError::Conflict {
                pattern: pattern.to_string(),
                existing: existing.pattern.clone(),
            });
        }
        *slot = Some(Terminal {
            pattern: pattern.to_string(),
            names,
            value,
        });
        self.len += 1;
        Ok(())
    }

    /// Resolves `channel`, returning the matched value, its pattern and the
    /// bound parameters.
    pub fn get(&self, channel: &str) -> Option<(&T, &str, Params)> {
        let segs: Vec<&str> = channel.split('/').collect();
        let mut values = Vec::new();
        let terminal = lookup(&self.root, &segs, &mut values)?;
        let params = terminal.names.iter().cloned().zip(values).collect();
        Some((&terminal.value, terminal.pattern.as_str(), Params(params)))
    }

    pub fn patterns(&self) -> Vec<&str> {
        let mut out = Vec::new();
        collect(&self.root, &mut out);
        out
    }
}

fn lookup<'t, T>(
    node: &'t Node<T>,
    segs: &[&str],
    values: &mut Vec<String>,
) -> Option<&'t Terminal<T>> {
    let Some((head, rest)) = segs.split_first() else {
        return node.terminal.as_ref();
    };

    if let Some(child) = node.literals.get(*head) {
        if let Some(found) = lookup(child, rest, values) {
            return Some(found);
        }
    }

    if let Some(child) = node.param.as_deref() {
        if !head.is_empty() {
            values.push(head.to_string());
            if let Some(found) = lookup(child, rest, values) {
                return Some(found);
            }
            values.pop();
        }
    }

    if let Some(terminal) = node.catch_all.as_ref() {
        let remainder = segs.join("/");
        if !remainder.is_empty() {
            values.push(remainder);
            return Some(terminal);
        }
    }
    None
}

fn collect<'t, T>(node: &'t Node<T>, out: &mut Vec<&'t str>) {
    if let Some(t) = &node.terminal {
        out.push(&t.pattern);
    }
    if let Some(t) = &node.catch_all {
        out.push(&t.pattern);
    }
    for child in node.literals.values() {
        collect(child, out);
    }
    if let Some(child) = &node.param {
        collect(child, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree(patterns: &[&str]) -> PatternTree<String> {
        let mut t = PatternTree::new();
        for p in patterns {
            t.insert(p, p.to_string()).unwrap();
        }
        t
    }

    #[test]
    fn literal_beats_parameter() {
        let t = tree(&["a/:x", "a/b"]);
        let (rule, _, params) = t.get("a/b").unwrap();
        assert_eq!(rule, "a/b");
        assert!(params.is_empty());

        let (rule, pattern, params) = t.get("a/c").unwrap();
        assert_eq!(rule, "a/:x");
        assert_eq!(pattern, "a/:x");
        assert_eq!(params.get("x"), Some("c"));
    }

    #[test]
    fn parameter_beats_catch_all() {
        let t = tree(&["stream/:ns/*rest", "stream/:ns/cpu", "stream/*all"]);
        assert_eq!(t.get("stream/telegraf/cpu").unwrap().0, "stream/:ns/cpu");

        let (rule, _, params) = t.get("stream/telegraf/mem/host=a").unwrap();
        assert_eq!(rule, "stream/:ns/*rest");
        assert_eq!(
            params,
            Params(vec![
                ("ns".to_string(), "telegraf".to_string()),
                ("rest".to_string(), "mem/host=a".to_string()),
            ])
        );

        let (rule, _, params) = t.get("stream/only").unwrap();
        assert_eq!(rule, "stream/*all");
        assert_eq!(params.get("all"), Some("only"));
    }

    #[test]
    fn falls_back_when_preferred_branch_dead_ends() {
        let t = tree(&["a/b/c", "a/:x/d"]);
        let (rule, _, params) = t.get("a/b/d").unwrap();
        assert_eq!(rule, "a/:x/d");
        assert_eq!(params.get("x"), Some("b"));
    }

    #[test]
    fn catch_all_needs_at_least_one_segment() {
        let t = tree(&["stream/*rest"]);
        assert!(t.get("stream").is_none());
        assert!(t.get("stream/a").is_some());
    }

    #[test]
    fn unmatched_channel_returns_none() {
        let t = tree(&["stream/json/auto"]);
        assert!(t.get("stream/json").is_none());
        assert!(t.get("stream/json/auto/more").is_none());
        assert!(t.get("plugin/json/auto").is_none());
    }

    #[test]
    fn duplicate_shapes_conflict() {
        let mut t = tree(&["stream/:a"]);
        let err = t.insert("stream/:b", "other".to_string()).unwrap_err();
        assert_eq!(
            err,
            PatternError::Conflict {
                pattern: "stream/:b".to_string(),
                existing: "stream/:a".to_string(),
            }
        );
        assert_eq!(t.len(), 1);
        assert_eq!(t.patterns(), vec!["stream/:a"]);
    }
}
