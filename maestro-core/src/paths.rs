//! ABOUTME: Dotted-path traversal over JSON value trees
//! ABOUTME: Supports `a.b[3].c` grammar for context and template lookups

use serde_json::Value;

use crate::error::{MaestroError, Result};

/// One parsed path segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    /// Object key
    Key(String),
    /// Array index
    Index(usize),
}

/// Parse a dotted path with optional bracket-indexed array segments.
///
/// `a.b[3].c` parses to `[Key(a), Key(b), Index(3), Key(c)]`. Empty
/// segments, unbalanced brackets, and non-numeric indices are rejected.
pub fn parse_path(path: &str) -> Result<Vec<PathSegment>> {
    if path.is_empty() {
        return Err(MaestroError::validation("path cannot be empty"));
    }

    let mut segments = Vec::new();
    for part in path.split('.') {
        if part.is_empty() {
            return Err(MaestroError::validation(format!(
                "path '{}' contains an empty segment",
                path
            )));
        }

        let (key, mut rest) = match part.find('[') {
            Some(pos) => (&part[..pos], &part[pos..]),
            None => (part, ""),
        };

        if key.is_empty() {
            return Err(MaestroError::validation(format!(
                "path '{}' has an index without a key",
                path
            )));
        }
        if !is_identifier(key) {
            return Err(MaestroError::validation(format!(
                "path segment '{}' is not a valid identifier",
                key
            )));
        }
        segments.push(PathSegment::Key(key.to_string()));

        while !rest.is_empty() {
            let close = rest.find(']').ok_or_else(|| {
                MaestroError::validation(format!("path '{}' has an unclosed bracket", path))
            })?;
            let index_str = &rest[1..close];
            let index: usize = index_str.parse().map_err(|_| {
                MaestroError::validation(format!(
                    "path '{}' has a non-numeric index '{}'",
                    path, index_str
                ))
            })?;
            segments.push(PathSegment::Index(index));
            rest = &rest[close + 1..];
            if !rest.is_empty() && !rest.starts_with('[') {
                return Err(MaestroError::validation(format!(
                    "path '{}' has trailing characters after an index",
                    path
                )));
            }
        }
    }

    Ok(segments)
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

/// Read the value at `path`, or None when any segment is missing
pub fn get_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let segments = parse_path(path).ok()?;
    let mut current = root;
    for segment in &segments {
        current = match segment {
            PathSegment::Key(key) => current.as_object()?.get(key)?,
            PathSegment::Index(idx) => current.as_array()?.get(*idx)?,
        };
    }
    Some(current)
}

/// Write `value` at `path`, creating intermediate objects and arrays.
///
/// Intermediate nodes of the wrong shape are replaced (last-writer-wins);
/// arrays are padded with nulls up to the target index.
pub fn set_path(root: &mut Value, path: &str, value: Value) -> Result<()> {
    let segments = parse_path(path)?;
    let mut current = root;

    for (i, segment) in segments.iter().enumerate() {
        let last = i == segments.len() - 1;
        match segment {
            PathSegment::Key(key) => {
                if !current.is_object() {
                    *current = Value::Object(serde_json::Map::new());
                }
                let map = current.as_object_mut().expect("object ensured above");
                if last {
                    map.insert(key.clone(), value);
                    return Ok(());
                }
                current = map.entry(key.clone()).or_insert(Value::Null);
            }
            PathSegment::Index(idx) => {
                if !current.is_array() {
                    *current = Value::Array(Vec::new());
                }
                let arr = current.as_array_mut().expect("array ensured above");
                while arr.len() <= *idx {
                    arr.push(Value::Null);
                }
                if last {
                    arr[*idx] = value;
                    return Ok(());
                }
                current = &mut arr[*idx];
            }
        }
    }

    unreachable!("set_path writes on the final segment")
}

/// Number of segments in a path (0 when the path fails to parse)
pub fn path_depth(path: &str) -> usize {
    parse_path(path).map(|s| s.len()).unwrap_or(0)
}
