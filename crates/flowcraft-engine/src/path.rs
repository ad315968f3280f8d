//! Path parsing and navigation over JSON-shaped values.
//!
//! Paths use dotted property access and bracketed index/expression access,
//! e.g. `users[0].name`, `items["key with spaces"]`, `list[a[b]]`. Parsing
//! happens once; navigation walks an already-resolved [`serde_json::Value`]
//! segment by segment.

use flowcraft_core::error::PathError;
use serde_json::Value;

/// One parsed piece of a path.
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    /// `.name` or a leading bare identifier.
    Property(String),
    /// `[0]` or `["literal"]`.
    Index(IndexKey),
    /// `[expr]` where `expr` is neither a bare number nor a quoted string;
    /// evaluated by the caller-supplied callback.
    Expression(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum IndexKey {
    Number(i64),
    String(String),
}

/// Parse a path string into segments.
///
/// Grammar: an optional leading bare identifier, then any sequence of
/// `.identifier` or `[content]`. A dot may not appear before a bracket, at
/// the start, or doubled; brackets must be closed.
pub fn parse_path(path: &str) -> Result<Vec<Segment>, PathError> {
    let mut segments = Vec::new();
    let chars: Vec<char> = path.chars().collect();
    let mut i = 0;
    let n = chars.len();

    if n == 0 {
        return Err(PathError::Syntax {
            path: path.to_string(),
            reason: "empty path".to_string(),
        });
    }

    if chars[0] == '.' {
        return Err(PathError::Syntax {
            path: path.to_string(),
            reason: "path cannot start with '.'".to_string(),
        });
    }

    // Leading bare identifier (no dot, no bracket).
    if chars[0] != '[' {
        let start = i;
        while i < n && chars[i] != '.' && chars[i] != '[' {
            i += 1;
        }
        if i == start {
            return Err(PathError::Syntax {
                path: path.to_string(),
                reason: "expected identifier".to_string(),
            });
        }
        segments.push(Segment::Property(chars[start..i].iter().collect()));
    }

    while i < n {
        match chars[i] {
            '.' => {
                i += 1;
                if i >= n || chars[i] == '.' || chars[i] == '[' {
                    return Err(PathError::Syntax {
                        path: path.to_string(),
                        reason: "dot must be followed by a property name".to_string(),
                    });
                }
                let start = i;
                while i < n && chars[i] != '.' && chars[i] != '[' {
                    i += 1;
                }
                if i == start {
                    return Err(PathError::Syntax {
                        path: path.to_string(),
                        reason: "empty property segment".to_string(),
                    });
                }
                let ident: String = chars[start..i].iter().collect();
                if !is_identifier(&ident) {
                    return Err(PathError::Syntax {
                        path: path.to_string(),
                        reason: format!("'{ident}' is not a valid property name"),
                    });
                }
                segments.push(Segment::Property(ident));
            }
            '[' => {
                i += 1;
                let start = i;
                let mut depth = 1;
                while i < n && depth > 0 {
                    match chars[i] {
                        '[' => depth += 1,
                        ']' => depth -= 1,
                        _ => {}
                    }
                    if depth > 0 {
                        i += 1;
                    }
                }
                if depth != 0 {
                    return Err(PathError::Syntax {
                        path: path.to_string(),
                        reason: "unclosed '['".to_string(),
                    });
                }
                let inner: String = chars[start..i].iter().collect();
                i += 1; // consume ']'
                if inner.is_empty() {
                    return Err(PathError::Syntax {
                        path: path.to_string(),
                        reason: "empty '[]' segment".to_string(),
                    });
                }
                segments.push(classify_bracket_content(&inner));
            }
            _ => {
                return Err(PathError::Syntax {
                    path: path.to_string(),
                    reason: format!("unexpected character '{}'", chars[i]),
                });
            }
        }
    }

    Ok(segments)
}

fn classify_bracket_content(inner: &str) -> Segment {
    let trimmed = inner.trim();
    if let Ok(n) = trimmed.parse::<i64>() {
        return Segment::Index(IndexKey::Number(n));
    }
    if (trimmed.starts_with('"') && trimmed.ends_with('"') && trimmed.len() >= 2)
        || (trimmed.starts_with('\'') && trimmed.ends_with('\'') && trimmed.len() >= 2)
    {
        let quoted = &trimmed[1..trimmed.len() - 1];
        return Segment::Index(IndexKey::String(quoted.to_string()));
    }
    Segment::Expression(trimmed.to_string())
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' || c == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || c == '_' || c == '$')
}

/// Callback used to evaluate a bracketed expression segment into an index
/// key. Supports `a[b[c]]`-style dynamic indices.
pub trait ExpressionEvaluatorFn {
    fn eval_index(&self, expr: &str) -> Result<IndexKey, PathError>;
}

/// Navigate `value` following `segments`, using `eval` to resolve
/// [`Segment::Expression`] entries.
pub fn get_path<E: ExpressionEvaluatorFn>(
    value: &Value,
    segments: &[Segment],
    path_repr: &str,
    eval: &E,
) -> Result<Value, PathError> {
    let mut current = value.clone();
    let mut visited = String::new();

    for segment in segments {
        let key = match segment {
            Segment::Property(name) => IndexKey::String(name.clone()),
            Segment::Index(key) => key.clone(),
            Segment::Expression(expr) => eval.eval_index(expr)?,
        };

        current = access(&current, &key, path_repr, &visited)?;

        match &key {
            IndexKey::String(s) => {
                if !visited.is_empty() {
                    visited.push('.');
                }
                visited.push_str(s);
            }
            IndexKey::Number(n) => visited.push_str(&format!("[{n}]")),
        }
    }

    Ok(current)
}

fn access(value: &Value, key: &IndexKey, path_repr: &str, visited: &str) -> Result<Value, PathError> {
    if value.is_null() {
        return Err(PathError::PropertyAccess {
            path: path_repr.to_string(),
            segment: segment_repr(key),
            reason: format!("cannot access property of null at '{visited}'"),
        });
    }

    match key {
        IndexKey::String(name) => match value {
            Value::Object(map) => map.get(name).cloned().ok_or_else(|| PathError::PropertyAccess {
                path: path_repr.to_string(),
                segment: name.clone(),
                reason: format!("property '{name}' does not exist"),
            }),
            _ => Err(PathError::PropertyAccess {
                path: path_repr.to_string(),
                segment: name.clone(),
                reason: "value is not an object".to_string(),
            }),
        },
        IndexKey::Number(n) => match value {
            Value::Array(arr) => {
                if *n < 0 {
                    return Err(PathError::PropertyAccess {
                        path: path_repr.to_string(),
                        segment: segment_repr(key),
                        reason: format!("negative index {n}"),
                    });
                }
                arr.get(*n as usize).cloned().ok_or_else(|| PathError::PropertyAccess {
                    path: path_repr.to_string(),
                    segment: segment_repr(key),
                    reason: format!("index {n} out of bounds (len {})", arr.len()),
                })
            }
            _ => Err(PathError::PropertyAccess {
                path: path_repr.to_string(),
                segment: segment_repr(key),
                reason: "value is not an array".to_string(),
            }),
        },
    }
}

fn segment_repr(key: &IndexKey) -> String {
    match key {
        IndexKey::String(s) => s.clone(),
        IndexKey::Number(n) => n.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct NoExpr;
    impl ExpressionEvaluatorFn for NoExpr {
        fn eval_index(&self, expr: &str) -> Result<IndexKey, PathError> {
            Err(PathError::Syntax {
                path: expr.to_string(),
                reason: "no expression evaluator in this test".to_string(),
            })
        }
    }

    #[test]
    fn parses_dotted_and_bracketed_segments() {
        let segs = parse_path("users[0].name").unwrap();
        assert_eq!(
            segs,
            vec![
                Segment::Property("users".to_string()),
                Segment::Index(IndexKey::Number(0)),
                Segment::Property("name".to_string()),
            ]
        );
    }

    #[test]
    fn rejects_leading_dot() {
        assert!(parse_path(".foo").is_err());
    }

    #[test]
    fn rejects_unclosed_bracket() {
        assert!(parse_path("foo[0").is_err());
    }

    #[test]
    fn navigates_nested_value() {
        let value = json!({"users": [{"name": "Ada"}]});
        let segs = parse_path("users[0].name").unwrap();
        let result = get_path(&value, &segs, "users[0].name", &NoExpr).unwrap();
        assert_eq!(result, json!("Ada"));
    }

    #[test]
    fn out_of_bounds_index_fails() {
        let value = json!({"users": []});
        let segs = parse_path("users[0]").unwrap();
        assert!(get_path(&value, &segs, "users[0]", &NoExpr).is_err());
    }

    #[test]
    fn missing_property_fails() {
        let value = json!({"a": 1});
        let segs = parse_path("b").unwrap();
        assert!(get_path(&value, &segs, "b", &NoExpr).is_err());
    }
}
