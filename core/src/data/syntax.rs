//! YANG-like text syntax for configuration data.
//!
//! ```text
//! softwire-config {
//!   external-interface { ip 10.10.10.10; mac 12:12:12:12:12:12; }
//!   binding-table {
//!     softwire { ipv4 178.79.150.233; psid 7850; b4-ipv6 ::1; br-address 8:9:a:b:c:d:e:f; }
//!   }
//! }
//! ```
//!
//! Statements are `keyword value;` or `keyword { ... }`; list entries are
//! repeated `keyword { ... }` blocks. `//` and `/* */` comments are skipped
//! and string values may be double-quoted. Parsing is schema driven: every
//! keyword must name a configuration node at that point.

use std::iter::Peekable;
use std::str::Chars;

use super::{format_key, Container, List, Node, Value};
use crate::error::{ConfigError, Result};
use crate::schema::{NodeKind, SchemaNode};


// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Quoted(String),
    Open,
    Close,
    Semi,
}


fn syntax_error(reason: impl Into<String>) -> ConfigError {
    ConfigError::invalid("parse", "data", reason)
}


fn tokenize(text: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '{' => {
                chars.next();
                tokens.push(Token::Open);
            }
            '}' => {
                chars.next();
                tokens.push(Token::Close);
            }
            ';' => {
                chars.next();
                tokens.push(Token::Semi);
            }
            '"' => {
                chars.next();
                tokens.push(Token::Quoted(read_quoted(&mut chars)?));
            }
            '/' if starts_comment(&chars) => skip_comment(&mut chars)?,
            _ => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() || matches!(c, '{' | '}' | ';' | '"') {
                        break;
                    }
                    word.push(c);
                    chars.next();
                }
                tokens.push(Token::Word(word));
            }
        }
    }
    Ok(tokens)
}


fn starts_comment(chars: &Peekable<Chars<'_>>) -> bool {
    let mut ahead = chars.clone();
    ahead.next();
    matches!(ahead.peek(), Some('/') | Some('*'))
}


fn skip_comment(chars: &mut Peekable<Chars<'_>>) -> Result<()> {
    chars.next();
    match chars.next() {
        Some('/') => {
            for c in chars.by_ref() {
                if c == '\n' {
                    break;
                }
            }
            Ok(())
        }
        _ => {
            let mut prev = '\0';
            for c in chars.by_ref() {
                if prev == '*' && c == '/' {
                    return Ok(());
                }
                prev = c;
            }
            Err(syntax_error("unterminated comment"))
        }
    }
}


fn read_quoted(chars: &mut Peekable<Chars<'_>>) -> Result<String> {
    let mut out = String::new();
    while let Some(c) = chars.next() {
        match c {
            '"' => return Ok(out),
            '\\' => match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some(other) => out.push(other),
                None => break,
            },
            _ => out.push(c),
        }
    }
    Err(syntax_error("unterminated string"))
}


// ---------------------------------------------------------------------------
// Statements
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Stmt {
    keyword: String,
    arg: Option<String>,
    body: Option<Vec<Stmt>>,
}


fn parse_stmts(tokens: &[Token], pos: &mut usize, nested: bool) -> Result<Vec<Stmt>> {
    let mut out = Vec::new();
    loop {
        let keyword = match tokens.get(*pos) {
            None if nested => return Err(syntax_error("missing '}'")),
            None => return Ok(out),
            Some(Token::Close) if nested => {
                *pos += 1;
                return Ok(out);
            }
            Some(Token::Close) => return Err(syntax_error("unbalanced '}'")),
            Some(Token::Word(w)) => w.clone(),
            Some(other) => return Err(syntax_error(format!("expected keyword, got {:?}", other))),
        };
        *pos += 1;

        let arg = match tokens.get(*pos) {
            Some(Token::Word(w)) | Some(Token::Quoted(w)) => {
                *pos += 1;
                Some(w.clone())
            }
            _ => None,
        };

        match tokens.get(*pos) {
            Some(Token::Semi) => {
                *pos += 1;
                out.push(Stmt { keyword, arg, body: None });
            }
            Some(Token::Open) => {
                *pos += 1;
                let body = parse_stmts(tokens, pos, true)?;
                out.push(Stmt { keyword, arg, body: Some(body) });
            }
            _ => {
                return Err(syntax_error(format!("expected ';' or '{{' after '{}'", keyword)));
            }
        }
    }
}


fn parse_text(text: &str) -> Result<Vec<Stmt>> {
    let tokens = tokenize(text)?;
    let mut pos = 0;
    parse_stmts(&tokens, &mut pos, false)
}


// ---------------------------------------------------------------------------
// Schema-driven build
// ---------------------------------------------------------------------------

fn join(at: &str, name: &str) -> String {
    if at == "/" || at.is_empty() {
        format!("/{}", name)
    } else {
        format!("{}/{}", at, name)
    }
}


fn build_container(node: &SchemaNode, at: &str, stmts: Vec<Stmt>) -> Result<Container> {
    let mut out = Container::new();
    for stmt in stmts {
        let child = node
            .child(&stmt.keyword)
            .filter(|c| c.config)
            .ok_or_else(|| ConfigError::UnknownNode {
                parent: if at.is_empty() { "/".into() } else { at.to_string() },
                name: stmt.keyword.clone(),
            })?;
        let here = join(at, child.name);
        match &child.kind {
            NodeKind::Leaf(spec) => {
                let literal = match (stmt.arg, stmt.body) {
                    (Some(lit), None) => lit,
                    _ => return Err(syntax_error(format!("leaf '{}' needs a single value", here))),
                };
                if out.get(child.name).is_some() {
                    return Err(syntax_error(format!("leaf '{}' given twice", here)));
                }
                out.set_leaf(child.name, spec.ty.parse(child.name, &literal)?);
            }
            NodeKind::Container(_) => {
                let body = match (stmt.arg, stmt.body) {
                    (None, Some(body)) => body,
                    _ => return Err(syntax_error(format!("'{}' needs a {{ }} block", here))),
                };
                if out.get(child.name).is_some() {
                    return Err(syntax_error(format!("container '{}' given twice", here)));
                }
                let built = build_container(child, &here, body)?;
                out.insert(child.name, Node::Container(built));
            }
            NodeKind::List { .. } => {
                let body = match (stmt.arg, stmt.body) {
                    (None, Some(body)) => body,
                    _ => return Err(syntax_error(format!("'{}' entries need a {{ }} block", here))),
                };
                let entry = build_container(child, &here, body)?;
                let key = entry_key(child, &entry)?;
                if let Err(key) = out.list_mut(child.name).insert_new(key, entry) {
                    return Err(ConfigError::DuplicateKey {
                        list: here,
                        key: format_key(child.keys(), &key),
                    });
                }
            }
        }
    }
    Ok(out)
}


/// Extract the key tuple of a list entry, in declared key order.
pub fn entry_key(list: &SchemaNode, entry: &Container) -> Result<Vec<Value>> {
    let mut key = Vec::with_capacity(list.keys().len());
    for name in list.keys() {
        match entry.leaf(name) {
            Some(v) => key.push(v.clone()),
            None => {
                let got: Vec<&str> = list
                    .keys()
                    .iter()
                    .copied()
                    .filter(|k| entry.leaf(k).is_some())
                    .collect();
                return Err(ConfigError::KeyMismatch {
                    list: list.name.to_string(),
                    expected: list.keys().join(" "),
                    got: got.join(" "),
                });
            }
        }
    }
    Ok(key)
}


/// Parse `text` as the body of `node` (a container, list entry or root).
///
/// A single pair of enclosing braces is accepted and stripped.
pub fn parse_container(node: &SchemaNode, at: &str, text: &str) -> Result<Container> {
    let trimmed = text.trim();
    let inner = match (trimmed.strip_prefix('{'), trimmed.ends_with('}')) {
        (Some(rest), true) => &rest[..rest.len() - 1],
        _ => trimmed,
    };
    build_container(node, at, parse_text(inner)?)
}


/// A leaf value literal as it arrives from a client: surrounding
/// whitespace, quotes and a trailing `;` are stripped.
pub fn leaf_literal(text: &str) -> String {
    let t = text.trim();
    let t = t.strip_suffix(';').unwrap_or(t).trim();
    match t.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
        Some(inner) => inner.to_string(),
        None => t.to_string(),
    }
}


// ---------------------------------------------------------------------------
// Defaults and mandatory leaves
// ---------------------------------------------------------------------------

/// Fill defaults, materialize configuration containers and check that
/// every mandatory leaf is present.
pub fn normalize(node: &SchemaNode, tree: &mut Container, at: &str) -> Result<()> {
    for child in node.children().iter().filter(|c| c.config) {
        let here = join(at, child.name);
        match &child.kind {
            NodeKind::Leaf(spec) => {
                if tree.get(child.name).is_some() {
                    continue;
                }
                if let Some(default) = spec.default {
                    tree.set_leaf(child.name, spec.ty.parse(child.name, default)?);
                } else if spec.mandatory {
                    return Err(ConfigError::invalid("validate", &here, "missing mandatory leaf"));
                }
            }
            NodeKind::Container(_) => {
                normalize(child, tree.container_mut(child.name), &here)?;
            }
            NodeKind::List { .. } => {
                if let Some(Node::List(list)) = tree.get_mut(child.name) {
                    for (key, entry) in list.iter_mut() {
                        let entry_at = format!("{}{}", here, format_key(child.keys(), key));
                        normalize(child, entry, &entry_at)?;
                    }
                }
            }
        }
    }
    Ok(())
}


/// Parse and normalize a whole document against a schema root.
pub fn parse_document(root: &SchemaNode, text: &str) -> Result<Container> {
    let mut tree = parse_container(root, "/", text)?;
    normalize(root, &mut tree, "/")?;
    Ok(tree)
}


// ---------------------------------------------------------------------------
// Printer
// ---------------------------------------------------------------------------

/// Render a leaf value, quoting strings that would not lex as one word.
pub fn render_value(value: &Value) -> String {
    match value {
        Value::Str(s) => {
            let plain = !s.is_empty()
                && !s.contains("//")
                && !s.contains("/*")
                && !s
                    .chars()
                    .any(|c| c.is_whitespace() || matches!(c, '{' | '}' | ';' | '"' | '\\'));
            if plain {
                s.clone()
            } else {
                format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
            }
        }
        other => other.to_string(),
    }
}


fn indent(out: &mut String, depth: usize) {
    for _ in 0..depth {
        out.push_str("  ");
    }
}


fn write_container(out: &mut String, node: &SchemaNode, tree: &Container, depth: usize) {
    for child in node.children() {
        match tree.get(child.name) {
            Some(Node::Leaf(v)) => {
                indent(out, depth);
                out.push_str(&format!("{} {};\n", child.name, render_value(v)));
            }
            Some(Node::Container(c)) => {
                if c.is_empty() {
                    continue;
                }
                indent(out, depth);
                out.push_str(&format!("{} {{\n", child.name));
                write_container(out, child, c, depth + 1);
                indent(out, depth);
                out.push_str("}\n");
            }
            Some(Node::List(list)) => write_list(out, child, list, depth),
            None => {}
        }
    }
}


fn write_list(out: &mut String, node: &SchemaNode, list: &List, depth: usize) {
    for (_, entry) in list.iter() {
        indent(out, depth);
        out.push_str(&format!("{} {{\n", node.name));
        write_container(out, node, entry, depth + 1);
        indent(out, depth);
        out.push_str("}\n");
    }
}


/// Print the children of a container (or list entry) in schema order.
pub fn print_container(node: &SchemaNode, tree: &Container) -> String {
    let mut out = String::new();
    write_container(&mut out, node, tree, 0);
    out
}


/// Print every entry of a list as a `name { ... }` block.
pub fn print_list(node: &SchemaNode, list: &List) -> String {
    let mut out = String::new();
    write_list(&mut out, node, list, 0);
    out
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::softwire;

    const DOC: &str = r#"
        // minimal lwaftr configuration
        softwire-config {
          name lwaftr;
          external-interface { ip 10.10.10.10; mac 12:12:12:12:12:12; }
          internal-interface { ip 8:9:a:b:c:d:e:f; mac 22:22:22:22:22:22; }
          binding-table {
            /* two softwires */
            softwire { ipv4 178.79.150.233; psid 7850; b4-ipv6 127:11:12:13:14:15:16:128; br-address 8:9:a:b:c:d:e:f; port-set { psid-length 16; } }
            softwire { ipv4 178.79.150.15; psid 0; b4-ipv6 127:22:33:44:55:66:77:128; br-address 8:9:a:b:c:d:e:f; }
          }
          instance { device "00:05.0"; queue { id 0; } }
        }
    "#;

    fn root() -> &'static SchemaNode {
        &softwire::schema().root
    }

    // --- Parsing ---

    #[test]
    fn parses_document_and_fills_defaults() {
        let tree = parse_document(root(), DOC).unwrap();
        let ext = tree.descend(&["softwire-config", "external-interface"]).unwrap();
        assert_eq!(ext.leaf("mtu"), Some(&Value::Uint(1460)));
        assert_eq!(ext.leaf("generate-icmp-errors"), Some(&Value::Bool(true)));
        let erl = ext.container("error-rate-limiting").unwrap();
        assert_eq!(erl.leaf("packets"), Some(&Value::Uint(600000)));
        let int = tree.descend(&["softwire-config", "internal-interface"]).unwrap();
        assert_eq!(int.leaf("hairpinning"), Some(&Value::Bool(true)));
    }

    #[test]
    fn list_entries_are_keyed_and_ordered() {
        let tree = parse_document(root(), DOC).unwrap();
        let bt = tree.descend(&["softwire-config", "binding-table"]).unwrap();
        let list = bt.list("softwire").unwrap();
        assert_eq!(list.len(), 2);
        let first = list.keys().next().unwrap();
        assert_eq!(first[0].to_string(), "178.79.150.15");
    }

    #[test]
    fn unknown_keyword_is_rejected() {
        let err = parse_document(root(), "softwire-config { bogus 1; }").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownNode { ref name, .. } if name == "bogus"));
    }

    #[test]
    fn state_keyword_is_rejected_in_config() {
        let err = parse_document(root(), "softwire-state { in-ipv4-bytes 1; }").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownNode { .. }));
    }

    #[test]
    fn bad_literal_is_type_mismatch() {
        let text = "softwire-config { external-interface { ip 300.1.1.1; } }";
        let err = parse_document(root(), text).unwrap_err();
        assert!(matches!(err, ConfigError::TypeMismatch { .. }));
    }

    #[test]
    fn duplicate_entry_is_rejected() {
        let text = "softwire-config { binding-table { \
            softwire { ipv4 1.1.1.1; psid 1; b4-ipv6 ::1; br-address ::2; } \
            softwire { ipv4 1.1.1.1; psid 1; b4-ipv6 ::3; br-address ::2; } } }";
        let err = parse_container(root(), "/", text).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateKey { .. }));
    }

    #[test]
    fn missing_key_leaf_is_key_mismatch() {
        let text = "softwire-config { binding-table { softwire { ipv4 1.1.1.1; b4-ipv6 ::1; } } }";
        let err = parse_container(root(), "/", text).unwrap_err();
        assert!(matches!(err, ConfigError::KeyMismatch { .. }));
    }

    #[test]
    fn missing_mandatory_leaf_fails_validation() {
        let text = "softwire-config { external-interface { ip 1.2.3.4; } }";
        let err = parse_document(root(), text).unwrap_err();
        assert!(err.to_string().contains("mac"), "{}", err);
    }

    #[test]
    fn unbalanced_braces_are_rejected() {
        assert!(parse_text("a { b 1;").is_err());
        assert!(parse_text("a 1; }").is_err());
        assert!(parse_text("a /* never closed").is_err());
    }

    #[test]
    fn fragment_braces_are_optional() {
        let sw = softwire::schema()
            .node_at(&["softwire-config", "binding-table", "softwire"])
            .unwrap();
        let a = parse_container(sw, "/x", "{ ipv4 1.2.3.4; psid 72; b4-ipv6 ::1; br-address ::2; }").unwrap();
        let b = parse_container(sw, "/x", "ipv4 1.2.3.4; psid 72; b4-ipv6 ::1; br-address ::2;").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn leaf_literal_strips_decoration() {
        assert_eq!(leaf_literal(" ::1; "), "::1");
        assert_eq!(leaf_literal("\"my name\""), "my name");
        assert_eq!(leaf_literal("42"), "42");
    }

    // --- Printing ---

    #[test]
    fn print_then_parse_is_identity() {
        let tree = parse_document(root(), DOC).unwrap();
        let text = print_container(root(), &tree);
        let again = parse_document(root(), &text).unwrap();
        assert_eq!(tree, again);
    }

    #[test]
    fn printer_quotes_when_needed() {
        assert_eq!(render_value(&Value::Str("lwaftr".into())), "lwaftr");
        assert_eq!(render_value(&Value::Str("two words".into())), "\"two words\"");
        assert_eq!(render_value(&Value::Str(String::new())), "\"\"");
    }

    #[test]
    fn printer_uses_schema_order_and_indent() {
        let tree = parse_document(root(), DOC).unwrap();
        let ext = tree.descend(&["softwire-config", "external-interface"]).unwrap();
        let node = softwire::schema()
            .node_at(&["softwire-config", "external-interface"])
            .unwrap();
        let text = print_container(node, ext);
        assert!(text.starts_with("ip 10.10.10.10;\nmac 12:12:12:12:12:12;\nmtu 1460;\n"));
        assert!(text.contains("error-rate-limiting {\n  packets 600000;\n  period 2;\n}\n"));
        assert!(!text.contains("next-hop"));
    }
}
