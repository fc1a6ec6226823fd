//! Dot-notation lookup into JSON values.
//!
//! Assertion fields address node outputs with simple dot paths
//! (`meta.scores.0`). Segments index objects by key and arrays by decimal
//! position.

use serde_json::Value;

/// Resolve a dot-notation path against a JSON value.
///
/// Returns `None` when any segment fails to resolve. An empty path returns
/// the value itself.
///
/// # Examples
///
/// ```rust
/// use gauntlet::utils::json_path::lookup;
/// use serde_json::json;
///
/// let v = json!({"meta": {"scores": [0.1, 0.9]}});
/// assert_eq!(lookup(&v, "meta.scores.1"), Some(&json!(0.9)));
/// assert_eq!(lookup(&v, "meta.missing"), None);
/// ```
#[must_use]
pub fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => {
                let idx: usize = segment.parse().ok()?;
                items.get(idx)?
            }
            _ => return None,
        };
    }
    Some(current)
}
