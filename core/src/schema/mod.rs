//! Schema model: the legal shape of a configuration/state tree.
//!
//! A [`Schema`] is a named, versioned tree of [`SchemaNode`]s. Each node is a
//! typed leaf, a container, or a keyed list, and is flagged as configuration
//! or operational state. Two schemas ship with the crate:
//! [`softwire`] (the canonical model) and [`ietf`] (a projection of it).

pub mod ietf;
pub mod softwire;

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};

use crate::data::{MacAddr, Value};
use crate::error::{ConfigError, Result};


// ---------------------------------------------------------------------------
// SchemaName
// ---------------------------------------------------------------------------

/// The schemas a session or request may be expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SchemaName {
    #[default]
    #[serde(rename = "snabb-softwire-v2")]
    SoftwireV2,
    #[serde(rename = "ietf-softwire-br")]
    IetfSoftwireBr,
}

impl SchemaName {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaName::SoftwireV2 => "snabb-softwire-v2",
            SchemaName::IetfSoftwireBr => "ietf-softwire-br",
        }
    }

    /// Accepts the full schema names plus the short `ietf-softwire` alias.
    pub fn parse(s: &str) -> Result<SchemaName> {
        match s {
            "snabb-softwire-v2" | "softwire" => Ok(SchemaName::SoftwireV2),
            "ietf-softwire-br" | "ietf-softwire" => Ok(SchemaName::IetfSoftwireBr),
            other => Err(ConfigError::SchemaMismatch(format!("unknown schema '{}'", other))),
        }
    }

    pub fn schema(&self) -> &'static Schema {
        match self {
            SchemaName::SoftwireV2 => softwire::schema(),
            SchemaName::IetfSoftwireBr => ietf::schema(),
        }
    }
}

impl fmt::Display for SchemaName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}


// ---------------------------------------------------------------------------
// LeafType
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafType {
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Boolean,
    Ipv4,
    Ipv6,
    Mac,
    String,
}

impl LeafType {
    pub fn name(&self) -> &'static str {
        match self {
            LeafType::Uint8 => "uint8",
            LeafType::Uint16 => "uint16",
            LeafType::Uint32 => "uint32",
            LeafType::Uint64 => "uint64",
            LeafType::Boolean => "boolean",
            LeafType::Ipv4 => "ipv4-address",
            LeafType::Ipv6 => "ipv6-address",
            LeafType::Mac => "mac-address",
            LeafType::String => "string",
        }
    }

    /// Parse a literal into this type's canonical value.
    pub fn parse(&self, leaf: &str, literal: &str) -> Result<Value> {
        let mismatch = || ConfigError::TypeMismatch {
            leaf: leaf.to_string(),
            expected: self.name().to_string(),
            literal: literal.to_string(),
        };
        let uint = |max: u64| -> Result<Value> {
            match literal.parse::<u64>() {
                Ok(n) if n <= max => Ok(Value::Uint(n)),
                _ => Err(mismatch()),
            }
        };
        match self {
            LeafType::Uint8 => uint(u8::MAX as u64),
            LeafType::Uint16 => uint(u16::MAX as u64),
            LeafType::Uint32 => uint(u32::MAX as u64),
            LeafType::Uint64 => uint(u64::MAX),
            LeafType::Boolean => match literal {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                _ => Err(mismatch()),
            },
            LeafType::Ipv4 => literal
                .parse::<Ipv4Addr>()
                .map(Value::Ipv4)
                .map_err(|_| mismatch()),
            LeafType::Ipv6 => literal
                .parse::<Ipv6Addr>()
                .map(Value::Ipv6)
                .map_err(|_| mismatch()),
            LeafType::Mac => literal
                .parse::<MacAddr>()
                .map(Value::Mac)
                .map_err(|_| mismatch()),
            LeafType::String => Ok(Value::Str(literal.to_string())),
        }
    }

    /// Whether an already-typed value is legal for this leaf type.
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (LeafType::Uint8, Value::Uint(n)) => *n <= u8::MAX as u64,
            (LeafType::Uint16, Value::Uint(n)) => *n <= u16::MAX as u64,
            (LeafType::Uint32, Value::Uint(n)) => *n <= u32::MAX as u64,
            (LeafType::Uint64, Value::Uint(_)) => true,
            (LeafType::Boolean, Value::Bool(_)) => true,
            (LeafType::Ipv4, Value::Ipv4(_)) => true,
            (LeafType::Ipv6, Value::Ipv6(_)) => true,
            (LeafType::Mac, Value::Mac(_)) => true,
            (LeafType::String, Value::Str(_)) => true,
            _ => false,
        }
    }
}


// ---------------------------------------------------------------------------
// SchemaNode
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LeafSpec {
    pub ty: LeafType,
    pub default: Option<&'static str>,
    pub mandatory: bool,
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    Leaf(LeafSpec),
    Container(Vec<SchemaNode>),
    List {
        keys: Vec<&'static str>,
        children: Vec<SchemaNode>,
    },
}

#[derive(Debug, Clone)]
pub struct SchemaNode {
    pub name: &'static str,
    /// False for operational-state nodes.
    pub config: bool,
    pub kind: NodeKind,
}

impl SchemaNode {
    pub fn children(&self) -> &[SchemaNode] {
        match &self.kind {
            NodeKind::Leaf(_) => &[],
            NodeKind::Container(children) => children,
            NodeKind::List { children, .. } => children,
        }
    }

    pub fn child(&self, name: &str) -> Option<&SchemaNode> {
        self.children().iter().find(|c| c.name == name)
    }

    pub fn keys(&self) -> &[&'static str] {
        match &self.kind {
            NodeKind::List { keys, .. } => keys,
            _ => &[],
        }
    }

    pub fn is_list(&self) -> bool {
        matches!(self.kind, NodeKind::List { .. })
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, NodeKind::Leaf(_))
    }

    pub fn leaf(&self) -> Option<&LeafSpec> {
        match &self.kind {
            NodeKind::Leaf(spec) => Some(spec),
            _ => None,
        }
    }

    /// True if this node or anything beneath it is operational state.
    pub fn has_state(&self) -> bool {
        !self.config || self.children().iter().any(|c| c.has_state())
    }

    /// Whether `child` is visible beneath this node in the given mode.
    ///
    /// State mode shows state nodes, the interior nodes leading to them and
    /// the key leaves of lists on the way.
    pub fn child_visible(&self, child: &SchemaNode, mode: Mode) -> bool {
        match mode {
            Mode::Config => child.config,
            Mode::State => child.has_state() || self.keys().contains(&child.name),
        }
    }

    fn state(mut self) -> Self {
        self.config = false;
        self
    }

    fn mandatory(mut self) -> Self {
        if let NodeKind::Leaf(spec) = &mut self.kind {
            spec.mandatory = true;
        }
        self
    }

    fn default(mut self, value: &'static str) -> Self {
        if let NodeKind::Leaf(spec) = &mut self.kind {
            spec.default = Some(value);
        }
        self
    }
}


/// Which half of the tree a request addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Config,
    State,
}


// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Schema {
    pub name: SchemaName,
    pub revision: &'static str,
    pub root: SchemaNode,
}

impl Schema {
    /// Walk a slash-separated sequence of plain names (no predicates).
    pub fn node_at(&self, names: &[&str]) -> Option<&SchemaNode> {
        let mut node = &self.root;
        for name in names {
            node = node.child(name)?;
        }
        Some(node)
    }
}


// ---------------------------------------------------------------------------
// Builders used by the schema definitions
// ---------------------------------------------------------------------------

fn leaf(name: &'static str, ty: LeafType) -> SchemaNode {
    SchemaNode {
        name,
        config: true,
        kind: NodeKind::Leaf(LeafSpec {
            ty,
            default: None,
            mandatory: false,
        }),
    }
}

fn container(name: &'static str, children: Vec<SchemaNode>) -> SchemaNode {
    SchemaNode {
        name,
        config: true,
        kind: NodeKind::Container(children),
    }
}

fn list(name: &'static str, keys: &[&'static str], children: Vec<SchemaNode>) -> SchemaNode {
    SchemaNode {
        name,
        config: true,
        kind: NodeKind::List {
            keys: keys.to_vec(),
            children,
        },
    }
}
