//! Channel patterns: literal segments, `:name` parameters and a trailing
//! `*name` catch-all.

mod tree;

use thiserror::Error;

pub use tree::{Params, PatternTree};

pub const MAX_PATTERN_LENGTH: usize = 160;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PatternError {
    #[error("pattern is empty")]
    Empty,
    #[error("pattern `{0}` must not start with `/`")]
    LeadingSlash(String),
    #[error("pattern `{0}` is longer than {MAX_PATTERN_LENGTH} characters")]
    TooLong(String),
    #[error("pattern `{pattern}` contains invalid character `{ch}`")]
    InvalidChar { pattern: String, ch: char },
    #[error("pattern `{0}` contains an empty segment")]
    EmptySegment(String),
    #[error("pattern `{pattern}` has a parameter without a name in segment `{segment}`")]
    UnnamedParam { pattern: String, segment: String },
    #[error("pattern `{pattern}` uses `:` or `*` inside segment `{segment}`")]
    MisplacedWildcard { pattern: String, segment: String },
    #[error("catch-all must be the last segment of pattern `{0}`")]
    CatchAllNotLast(String),
    #[error("pattern `{pattern}` binds parameter `{name}` twice")]
    DuplicateParam { pattern: String, name: String },
    #[error("pattern `{pattern}` conflicts with existing pattern `{existing}`")]
    Conflict { pattern: String, existing: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Segment<'a> {
    Literal(&'a str),
    Param(&'a str),
    CatchAll(&'a str),
}

pub(crate) fn segments(pattern: &str) -> Result<Vec<Segment<'_>>, PatternError> {
    validate_chars(pattern)?;
    let raw: Vec<&str> = pattern.split('/').collect();
    let last = raw.len() - 1;
    let mut out = Vec::with_capacity(raw.len());
    let mut names: Vec<&str> = Vec::new();
    for (idx, seg) in raw.iter().enumerate() {
        if seg.is_empty() {
            return Err(PatternError::EmptySegment(pattern.to_string()));
        }
        let segment = if let Some(name) = seg.strip_prefix(':') {
            Segment::Param(name)
        } else if let Some(name) = seg.strip_prefix('*') {
            if idx != last {
                return Err(PatternError::CatchAllNotLast(pattern.to_string()));
            }
            Segment::CatchAll(name)
        } else {
            Segment::Literal(seg)
        };
        match segment {
            Segment::Param(name) | Segment::CatchAll(name) => {
                if name.is_empty() {
                    return Err(PatternError::UnnamedParam {
                        pattern: pattern.to_string(),
                        segment: seg.to_string(),
                    });
                }
                if name.contains([':', '*']) {
                    return Err(PatternError::MisplacedWildcard {
                        pattern: pattern.to_string(),
                        segment: seg.to_string(),
                    });
                }
                if names.contains(&name) {
                    return Err(PatternError::DuplicateParam {
                        pattern: pattern.to_string(),
                        name: name.to_string(),
                    });
                }
                names.push(name);
            }
            Segment::Literal(lit) => {
                if lit.contains([':', '*']) {
                    return Err(PatternError::MisplacedWildcard {
                        pattern: pattern.to_string(),
                        segment: seg.to_string(),
                    });
                }
            }
        }
        out.push(segment);
    }
    Ok(out)
}

fn validate_chars(pattern: &str) -> Result<(), PatternError> {
    if pattern.is_empty() {
        return Err(PatternError::Empty);
    }
    if pattern.starts_with('/') {
        return Err(PatternError::LeadingSlash(pattern.to_string()));
    }
    if pattern.len() > MAX_PATTERN_LENGTH {
        return Err(PatternError::TooLong(pattern.to_string()));
    }
    if let Some(ch) = pattern.chars().find(|c| {
        !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '/' | '=' | '.' | ':' | '*'))
    }) {
        return Err(PatternError::InvalidChar {
            pattern: pattern.to_string(),
            ch,
        });
    }
    Ok(())
}

pub fn validate_pattern(pattern: &str) -> Result<(), PatternError> {
    segments(pattern).map(|_| ())
}

/// Normalized form used to detect structurally identical patterns:
/// `stream/:id/*rest` and `stream/:x/*y` both hash to
/// `stream/:parameter/*catchall`.
pub fn pattern_hash(pattern: &str) -> Result<String, PatternError> {
    let normalized: Vec<&str> = segments(pattern)?
        .into_iter()
        .map(|seg| match seg {
            Segment::Literal(lit) => lit,
            Segment::Param(_) => ":parameter",
            Segment::CatchAll(_) => "*catchall",
        })
        .collect();
    Ok(normalized.join("/"))
}
