//! Property paths for context values
//!
//! Accepted forms: `a.b.c`, `a[0].b`, `a["x.y"]`, `['a b'].c`. The first
//! segment is always a name: it selects the stored top-level key, the rest
//! address into its JSON value.

use crate::common::{Error, Result};
use serde_json::{Map, Value};
use std::iter::Peekable;
use std::str::{Chars, FromStr};

/// How far past the end of an array a write may reach
pub const MAX_ARRAY_GROWTH: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Index(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyPath {
    top: String,
    rest: Vec<Segment>,
}

impl PropertyPath {
    pub fn parse(expr: &str) -> Result<Self> {
        let invalid = |why: &str| Error::InvalidKey(format!("{}: {}", why, expr));
        let mut chars = expr.trim().chars().peekable();
        let mut segments = Vec::new();

        match chars.peek() {
            None => return Err(invalid("empty property path")),
            Some('[') => {
                chars.next();
                segments.push(bracket(&mut chars).map_err(|why| invalid(why))?);
            }
            Some(_) => segments.push(Segment::Key(name(&mut chars).map_err(|why| invalid(why))?)),
        }

        while let Some(c) = chars.next() {
            let segment = match c {
                '.' => Segment::Key(name(&mut chars).map_err(|why| invalid(why))?),
                '[' => bracket(&mut chars).map_err(|why| invalid(why))?,
                _ => return Err(invalid("unexpected character")),
            };
            segments.push(segment);
        }

        let mut segments = segments.into_iter();
        match segments.next() {
            Some(Segment::Key(top)) => Ok(Self {
                top,
                rest: segments.collect(),
            }),
            _ => Err(invalid("path must start with a name")),
        }
    }

    /// Stored top-level key
    pub fn top(&self) -> &str {
        &self.top
    }

    /// Segments below the top-level key
    pub fn rest(&self) -> &[Segment] {
        &self.rest
    }

    pub fn is_nested(&self) -> bool {
        !self.rest.is_empty()
    }
}

impl FromStr for PropertyPath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

fn name(chars: &mut Peekable<Chars<'_>>) -> std::result::Result<String, &'static str> {
    let mut out = String::new();
    while let Some(&c) = chars.peek() {
        if c == '.' || c == '[' {
            break;
        }
        if c == ']' {
            return Err("unbalanced ]");
        }
        out.push(c);
        chars.next();
    }
    if out.is_empty() {
        return Err("empty path segment");
    }
    Ok(out)
}

/// Parse the inside of `[...]`, the opening bracket already consumed
fn bracket(chars: &mut Peekable<Chars<'_>>) -> std::result::Result<Segment, &'static str> {
    let segment = match chars.peek() {
        Some(&quote) if quote == '"' || quote == '\'' => {
            chars.next();
            let mut out = String::new();
            loop {
                match chars.next() {
                    None => return Err("unterminated string"),
                    Some('\\') => match chars.next() {
                        Some(c) => out.push(c),
                        None => return Err("unterminated string"),
                    },
                    Some(c) if c == quote => break,
                    Some(c) => out.push(c),
                }
            }
            Segment::Key(out)
        }
        _ => {
            let mut digits = String::new();
            while let Some(&c) = chars.peek() {
                if !c.is_ascii_digit() {
                    break;
                }
                digits.push(c);
                chars.next();
            }
            Segment::Index(digits.parse().map_err(|_| "expected index or quoted name")?)
        }
    };
    match chars.next() {
        Some(']') => Ok(segment),
        _ => Err("missing ]"),
    }
}

/// Value at `path` below `value`
pub fn get_in<'a>(value: &'a Value, path: &[Segment]) -> Option<&'a Value> {
    path.iter().try_fold(value, |current, segment| match segment {
        Segment::Key(key) => current.as_object()?.get(key),
        Segment::Index(i) => current.as_array()?.get(*i),
    })
}

/// Write `new` at `path`, creating (or replacing) containers on the way.
///
/// Fails with [`Error::InvalidKey`] when an index lies more than
/// [`MAX_ARRAY_GROWTH`] slots past the end of its array.
pub fn set_in(value: &mut Value, path: &[Segment], new: Value) -> Result<()> {
    let Some((segment, rest)) = path.split_first() else {
        *value = new;
        return Ok(());
    };
    let child = match segment {
        Segment::Key(key) => {
            if !value.is_object() {
                *value = Value::Object(Map::new());
            }
            let Value::Object(map) = value else {
                return Ok(());
            };
            map.entry(key.clone()).or_insert(Value::Null)
        }
        Segment::Index(i) => {
            if !value.is_array() {
                *value = Value::Array(Vec::new());
            }
            let Value::Array(items) = value else {
                return Ok(());
            };
            if *i > items.len() + MAX_ARRAY_GROWTH {
                return Err(Error::InvalidKey(format!(
                    "array index {} out of range (length {})",
                    i,
                    items.len()
                )));
            }
            if items.len() <= *i {
                items.resize(*i + 1, Value::Null);
            }
            &mut items[*i]
        }
    };
    set_in(child, rest, new)
}

/// Remove the leaf at `path`; object fields are deleted, array slots become null.
/// Returns whether anything changed.
pub fn remove_in(value: &mut Value, path: &[Segment]) -> bool {
    let Some((last, parents)) = path.split_last() else {
        return false;
    };
    let mut current = value;
    for segment in parents {
        let next = match segment {
            Segment::Key(key) => current.as_object_mut().and_then(|m| m.get_mut(key)),
            Segment::Index(i) => current.as_array_mut().and_then(|a| a.get_mut(*i)),
        };
        match next {
            Some(next) => current = next,
            None => return false,
        }
    }
    match last {
        Segment::Key(key) => current
            .as_object_mut()
            .is_some_and(|m| m.remove(key).is_some()),
        Segment::Index(i) => match current.as_array_mut().and_then(|a| a.get_mut(*i)) {
            Some(slot) if !slot.is_null() => {
                *slot = Value::Null;
                true
            }
            _ => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path(expr: &str) -> PropertyPath {
        PropertyPath::parse(expr).unwrap()
    }

    #[test]
    fn test_parse_forms() {
        let p = path("a.b.c");
        assert_eq!(p.top(), "a");
        assert_eq!(p.rest(), &[Segment::Key("b".into()), Segment::Key("c".into())]);

        let p = path("list[2].name");
        assert_eq!(p.top(), "list");
        assert_eq!(p.rest(), &[Segment::Index(2), Segment::Key("name".into())]);

        let p = path(r#"cfg["x.y"]['z\'s']"#);
        assert_eq!(p.rest(), &[Segment::Key("x.y".into()), Segment::Key("z's".into())]);

        let p = path("['a b'].c");
        assert_eq!(p.top(), "a b");
        assert!(p.is_nested());

        assert!(!path("count").is_nested());
    }

    #[test]
    fn test_parse_errors() {
        for bad in ["", "a..b", "a.", "[0]", "a[", "a[x]", "a]b", "a[0", r#"a["x]"#, ".a"] {
            assert!(PropertyPath::parse(bad).is_err(), "{:?} should fail", bad);
        }
    }

    #[test]
    fn test_get_in() {
        let value = json!({"b": {"c": [10, 20]}});
        assert_eq!(get_in(&value, path("a.b.c[1]").rest()), Some(&json!(20)));
        assert_eq!(get_in(&value, path("a.b.missing").rest()), None);
        assert_eq!(get_in(&value, path("a.b.c.d").rest()), None);
        assert_eq!(get_in(&value, &[]), Some(&value));
    }

    #[test]
    fn test_set_in_creates_containers() {
        let mut value = json!({"keep": 1});
        set_in(&mut value, path("a.x.y").rest(), json!("deep")).unwrap();
        set_in(&mut value, path("a.list[2]").rest(), json!(true)).unwrap();
        assert_eq!(
            value,
            json!({"keep": 1, "x": {"y": "deep"}, "list": [null, null, true]})
        );

        let mut scalar = json!(5);
        set_in(&mut scalar, path("a.b").rest(), json!(1)).unwrap();
        assert_eq!(scalar, json!({"b": 1}));
    }

    #[test]
    fn test_set_in_rejects_far_index() {
        let huge = path("a[18446744073709551615]");
        assert_eq!(huge.rest(), &[Segment::Index(usize::MAX)]);
        let mut value = json!([]);
        let err = set_in(&mut value, huge.rest(), json!(1)).unwrap_err();
        assert!(matches!(err, Error::InvalidKey(_)));

        let err = set_in(&mut value, path("a[4000000000]").rest(), json!(1)).unwrap_err();
        assert!(matches!(err, Error::InvalidKey(_)));
        assert_eq!(value, json!([]));

        set_in(&mut value, &[Segment::Index(MAX_ARRAY_GROWTH)], json!(1)).unwrap();
        assert_eq!(value.as_array().unwrap().len(), MAX_ARRAY_GROWTH + 1);
    }

    #[test]
    fn test_remove_in_keeps_siblings() {
        let mut value = json!({"b": {"c": 1, "d": 2}, "list": [1, 2]});
        assert!(remove_in(&mut value, path("a.b.c").rest()));
        assert!(remove_in(&mut value, path("a.list[0]").rest()));
        assert!(!remove_in(&mut value, path("a.b.c").rest()));
        assert!(!remove_in(&mut value, path("a.nope.c").rest()));
        assert_eq!(value, json!({"b": {"d": 2}, "list": [null, 2]}));
    }
}
