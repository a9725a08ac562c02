//! Field resolution: named source fields into named destination fields.
//!
//! A source expression is either a plain field name or a field name
//! followed by a JSON path into that field's text:
//!
//! ```text
//! answer                 whole field
//! answer.choices[0].text nested value of the JSON stored in `answer`
//! $.answer['a.b']        optional `$.` prefix, quoted keys
//! $                      root, names no field
//! ```
//!
//! Only a malformed expression is an error. A missing leading field yields
//! `None`; a path that does not resolve yields empty text. The path applied
//! to a field's own content follows the same grammar, where `$` is the
//! content itself (see [`extract_json_path`]).

use exptflow_core::{Content, FieldConf, FieldMap, ValidationError};
use serde_json::Value;
use std::fmt;
use std::iter::Peekable;
use std::str::{Chars, FromStr};

// ============================================================================
// PATH
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// A parsed source expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    /// Name of the source field.
    pub field: String,
    /// Path applied to the field's JSON text. Empty means the field itself.
    pub segments: Vec<PathSegment>,
}

impl FieldPath {
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.field)?;
        for segment in &self.segments {
            match segment {
                PathSegment::Key(key) if key.contains(['.', '[', ']']) => write!(f, "['{}']", key)?,
                PathSegment::Key(key) => write!(f, ".{}", key)?,
                PathSegment::Index(idx) => write!(f, "[{}]", idx)?,
            }
        }
        Ok(())
    }
}

impl FromStr for FieldPath {
    type Err = ValidationError;

    fn from_str(expr: &str) -> Result<Self, Self::Err> {
        let malformed = |reason: String| ValidationError::InvalidFieldPath {
            path: expr.to_string(),
            reason,
        };

        if expr.is_empty() {
            return Err(malformed("empty path".to_string()));
        }
        if expr == "$" {
            return Ok(Self {
                field: String::new(),
                segments: Vec::new(),
            });
        }
        let body = expr.strip_prefix("$.").unwrap_or(expr);

        let mut chars = body.chars().peekable();
        let field = read_key(&mut chars);
        if field.is_empty() {
            return Err(malformed("empty field name".to_string()));
        }
        let segments = read_segments(&mut chars).map_err(malformed)?;

        Ok(Self { field, segments })
    }
}

/// Parse a path applied to one field's content: `$` or empty for the
/// content itself, then any number of `.key`, `[n]` or `['key']` steps.
pub fn parse_json_path(path: &str) -> Result<Vec<PathSegment>, ValidationError> {
    let rest = path.strip_prefix('$').unwrap_or(path);
    let mut chars = rest.chars().peekable();
    read_segments(&mut chars).map_err(|reason| ValidationError::InvalidFieldPath {
        path: path.to_string(),
        reason,
    })
}

fn read_segments(chars: &mut Peekable<Chars<'_>>) -> Result<Vec<PathSegment>, String> {
    let mut segments = Vec::new();
    while let Some(c) = chars.next() {
        match c {
            '.' => {
                let key = read_key(chars);
                if key.is_empty() {
                    return Err("empty segment".to_string());
                }
                segments.push(PathSegment::Key(key));
            }
            '[' => segments.push(read_bracket(chars)?),
            other => return Err(format!("unexpected character {other:?}")),
        }
    }
    Ok(segments)
}

fn read_key(chars: &mut Peekable<Chars<'_>>) -> String {
    let mut key = String::new();
    while let Some(&c) = chars.peek() {
        if matches!(c, '.' | '[' | ']') {
            break;
        }
        key.push(c);
        chars.next();
    }
    key
}

fn read_bracket(chars: &mut Peekable<Chars<'_>>) -> Result<PathSegment, String> {
    match chars.peek().copied() {
        Some(quote @ ('\'' | '"')) => {
            chars.next();
            let mut key = String::new();
            loop {
                match chars.next() {
                    Some(c) if c == quote => break,
                    Some(c) => key.push(c),
                    None => return Err("unclosed quoted key".to_string()),
                }
            }
            if chars.next() != Some(']') {
                return Err("expected ']' after quoted key".to_string());
            }
            Ok(PathSegment::Key(key))
        }
        _ => {
            let mut raw = String::new();
            loop {
                match chars.next() {
                    Some(']') => break,
                    Some(c) => raw.push(c),
                    None => return Err("unclosed bracket".to_string()),
                }
            }
            raw.parse::<usize>()
                .map(PathSegment::Index)
                .map_err(|_| format!("invalid index {raw:?}"))
        }
    }
}

// ============================================================================
// RESOLUTION
// ============================================================================

/// Resolve one source expression against `fields`.
pub fn resolve_field(fields: &FieldMap, expr: &str) -> Result<Option<Content>, ValidationError> {
    let path: FieldPath = expr.parse()?;
    let Some(content) = fields.get(&path.field) else {
        return Ok(None);
    };
    if path.is_root() {
        return Ok(Some(content.clone()));
    }
    Ok(extract_path(content, &path.segments))
}

/// Apply a textual JSON path to one field's content. The root path
/// returns the content unchanged.
pub fn extract_json_path(content: &Content, path: &str) -> Result<Option<Content>, ValidationError> {
    let segments = parse_json_path(path)?;
    if segments.is_empty() {
        return Ok(Some(content.clone()));
    }
    Ok(extract_path(content, &segments))
}

/// Apply a JSON path to text content.
///
/// Non-text content cannot be walked and yields `None`. Text that is not
/// JSON, or a path that leads nowhere, yields empty text.
pub fn extract_path(content: &Content, segments: &[PathSegment]) -> Option<Content> {
    if !content.is_text() {
        return None;
    }
    let Ok(root) = serde_json::from_str::<Value>(content.as_text().unwrap_or_default()) else {
        return Some(Content::empty_text());
    };

    let mut current = &root;
    for segment in segments {
        let next = match segment {
            PathSegment::Key(key) => current.as_object().and_then(|obj| obj.get(key)),
            PathSegment::Index(idx) => current.as_array().and_then(|arr| arr.get(*idx)),
        };
        match next {
            Some(value) => current = value,
            None => return Some(Content::empty_text()),
        }
    }

    Some(match current {
        Value::String(s) => Content::text(s.clone()),
        other => Content::text(other.to_string()),
    })
}

/// Build a destination field map by applying mapping rules to `source`.
///
/// Rules whose source field is absent are skipped.
pub fn apply_field_adapters(
    confs: &[FieldConf],
    source: &FieldMap,
) -> Result<FieldMap, ValidationError> {
    let mut out = FieldMap::with_capacity(confs.len());
    for conf in confs {
        if let Some(content) = resolve_field(source, &conf.from_field)? {
            out.insert(conf.field_name.clone(), content);
        }
    }
    Ok(out)
}

/// Name of the source field an expression reads, used to check mappings
/// against a schema.
pub fn source_field_name(expr: &str) -> Result<String, ValidationError> {
    expr.parse::<FieldPath>().map(|path| path.field)
}

// ============================================================================
// TESTS
// ============================================================================
