//! Path expressions: `/step/step[key=value][key2=value2]/...`.
//!
//! Parsing ([`PathExpr::parse`]) is purely syntactic. Binding a parsed path
//! against a schema ([`resolve::bind`]) checks names, key arity and key
//! types and produces a [`BoundPath`], which can then be looked up in any
//! tree of that schema.

pub mod resolve;

use std::fmt;

use crate::data::{format_key, Key};
use crate::error::{ConfigError, Result};

pub use resolve::{bind, Bound};


// ---------------------------------------------------------------------------
// Syntax
// ---------------------------------------------------------------------------

/// One `name[k=v]...` step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub name: String,
    pub predicates: Vec<(String, String)>,
}

/// A parsed path; no steps means the root.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PathExpr {
    pub steps: Vec<Step>,
}

impl PathExpr {
    pub fn root() -> Self {
        PathExpr::default()
    }

    /// Parse a path string.
    ///
    /// `/` alone is the root and one trailing `/` is tolerated. Empty
    /// steps, unbalanced brackets and predicates without `=` are
    /// `MalformedPath`. Inside brackets `/` belongs to the value.
    pub fn parse(input: &str) -> Result<Self> {
        let text = input.trim();
        let body = text
            .strip_prefix('/')
            .ok_or_else(|| ConfigError::malformed(input, "path must start with '/'"))?;
        if body.is_empty() {
            return Ok(PathExpr::root());
        }
        let body = body.strip_suffix('/').unwrap_or(body);

        let mut steps = Vec::new();
        let mut chars = body.chars().peekable();
        loop {
            let mut name = String::new();
            while let Some(&c) = chars.peek() {
                if c == '/' || c == '[' {
                    break;
                }
                if c == ']' {
                    return Err(ConfigError::malformed(input, "unbalanced ']'"));
                }
                name.push(c);
                chars.next();
            }
            if name.is_empty() {
                return Err(ConfigError::malformed(input, "empty step"));
            }

            let mut predicates = Vec::new();
            while chars.peek() == Some(&'[') {
                chars.next();
                let mut inner = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    match c {
                        ']' => {
                            closed = true;
                            break;
                        }
                        '[' => return Err(ConfigError::malformed(input, "nested '['")),
                        _ => inner.push(c),
                    }
                }
                if !closed {
                    return Err(ConfigError::malformed(input, "unbalanced '['"));
                }
                let (k, v) = inner.split_once('=').ok_or_else(|| {
                    ConfigError::malformed(input, format!("predicate '[{}]' has no '='", inner))
                })?;
                let (k, v) = (k.trim(), v.trim());
                if k.is_empty() {
                    return Err(ConfigError::malformed(input, "predicate with empty key"));
                }
                predicates.push((k.to_string(), v.to_string()));
            }

            steps.push(Step { name, predicates });
            match chars.next() {
                None => break,
                Some('/') => {}
                Some(c) => {
                    return Err(ConfigError::malformed(
                        input,
                        format!("unexpected '{}' after predicate", c),
                    ))
                }
            }
        }
        Ok(PathExpr { steps })
    }

    pub fn is_root(&self) -> bool {
        self.steps.is_empty()
    }
}

impl fmt::Display for PathExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.steps.is_empty() {
            return f.write_str("/");
        }
        for step in &self.steps {
            write!(f, "/{}", step.name)?;
            for (k, v) in &step.predicates {
                write!(f, "[{}={}]", k, v)?;
            }
        }
        Ok(())
    }
}


// ---------------------------------------------------------------------------
// Bound paths
// ---------------------------------------------------------------------------

/// A step after binding: list steps carry a typed key tuple when the path
/// selected one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundStep {
    pub name: String,
    pub key: Option<Key>,
    pub key_names: Vec<&'static str>,
}

impl BoundStep {
    pub fn plain(name: &str) -> Self {
        BoundStep {
            name: name.to_string(),
            key: None,
            key_names: Vec::new(),
        }
    }

    pub fn keyed(name: &str, key_names: &[&'static str], key: Key) -> Self {
        BoundStep {
            name: name.to_string(),
            key: Some(key),
            key_names: key_names.to_vec(),
        }
    }
}


#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BoundPath {
    pub steps: Vec<BoundStep>,
}

impl BoundPath {
    pub fn root() -> Self {
        BoundPath::default()
    }

    pub fn is_root(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn prefix(&self, len: usize) -> BoundPath {
        BoundPath {
            steps: self.steps[..len.min(self.steps.len())].to_vec(),
        }
    }

    pub fn parent(&self) -> BoundPath {
        self.prefix(self.steps.len().saturating_sub(1))
    }

    pub fn last(&self) -> Option<&BoundStep> {
        self.steps.last()
    }

    pub fn child(&self, step: BoundStep) -> BoundPath {
        let mut out = self.clone();
        out.steps.push(step);
        out
    }

    /// True if `other` lies at or beneath this path.
    ///
    /// A keyless list step here covers every entry of that list.
    pub fn covers(&self, other: &BoundPath) -> bool {
        if self.steps.len() > other.steps.len() {
            return false;
        }
        self.steps.iter().zip(other.steps.iter()).all(|(mine, theirs)| {
            mine.name == theirs.name
                && match (&mine.key, &theirs.key) {
                    (None, _) => true,
                    (Some(a), Some(b)) => a == b,
                    (Some(_), None) => false,
                }
        })
    }
}

impl fmt::Display for BoundPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.steps.is_empty() {
            return f.write_str("/");
        }
        for step in &self.steps {
            write!(f, "/{}", step.name)?;
            if let Some(key) = &step.key {
                f.write_str(&format_key(&step.key_names, key))?;
            }
        }
        Ok(())
    }
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Value;

    // --- Parsing ---

    #[test]
    fn parse_root() {
        assert!(PathExpr::parse("/").unwrap().is_root());
    }

    #[test]
    fn parse_plain_steps() {
        let p = PathExpr::parse("/softwire-config/external-interface/ip").unwrap();
        let names: Vec<&str> = p.steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["softwire-config", "external-interface", "ip"]);
    }

    #[test]
    fn parse_predicates() {
        let p = PathExpr::parse(
            "/softwire-config/binding-table/softwire[ipv4=178.79.150.233][psid=7850]/b4-ipv6",
        )
        .unwrap();
        assert_eq!(
            p.steps[2].predicates,
            vec![
                ("ipv4".to_string(), "178.79.150.233".to_string()),
                ("psid".to_string(), "7850".to_string())
            ]
        );
        assert_eq!(p.steps[3].name, "b4-ipv6");
    }

    #[test]
    fn slash_inside_brackets_belongs_to_value() {
        let p = PathExpr::parse("/a/b[k=x/y]/c").unwrap();
        assert_eq!(p.steps[1].predicates[0].1, "x/y");
        assert_eq!(p.steps.len(), 3);
    }

    #[test]
    fn trailing_slash_is_tolerated() {
        let a = PathExpr::parse("/softwire-config/").unwrap();
        let b = PathExpr::parse("/softwire-config").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn display_round_trips() {
        let text = "/softwire-config/instance[device=00:05.0]/queue[id=0]";
        assert_eq!(PathExpr::parse(text).unwrap().to_string(), text);
    }

    // --- Parse errors ---

    #[test]
    fn malformed_paths() {
        for bad in [
            "",
            "softwire-config",
            "//",
            "/a//b",
            "/a/b[k=v",
            "/a/b]",
            "/a/b[kv]",
            "/a/b[=v]",
            "/a/b[k=v]x",
            "/a/[k=v]",
        ] {
            let err = PathExpr::parse(bad).unwrap_err();
            assert!(
                matches!(err, ConfigError::MalformedPath { .. }),
                "{} gave {:?}",
                bad,
                err
            );
        }
    }

    // --- Bound paths ---

    fn bound(names: &[&str]) -> BoundPath {
        BoundPath {
            steps: names.iter().map(|n| BoundStep::plain(n)).collect(),
        }
    }

    #[test]
    fn covers_by_prefix() {
        let prefix = bound(&["softwire-config"]);
        assert!(prefix.covers(&bound(&["softwire-config", "name"])));
        assert!(prefix.covers(&prefix));
        assert!(!prefix.covers(&bound(&["softwire-state"])));
        assert!(BoundPath::root().covers(&prefix));
        assert!(!bound(&["softwire-config", "name"]).covers(&prefix));
    }

    #[test]
    fn keyless_list_step_covers_every_entry() {
        let list = bound(&["softwire-config", "instance"]);
        let entry = bound(&["softwire-config"]).child(BoundStep::keyed(
            "instance",
            &["device"],
            vec![Value::Str("00:05.0".into())],
        ));
        assert!(list.covers(&entry));
        assert!(!entry.covers(&list));
    }

    #[test]
    fn bound_display_shows_keys() {
        let p = bound(&["softwire-config", "binding-table"]).child(BoundStep::keyed(
            "softwire",
            &["ipv4", "psid"],
            vec![Value::Ipv4("1.2.3.4".parse().unwrap()), Value::Uint(72)],
        ));
        assert_eq!(
            p.to_string(),
            "/softwire-config/binding-table/softwire[ipv4=1.2.3.4][psid=72]"
        );
        assert_eq!(BoundPath::root().to_string(), "/");
    }
}
