//! The `ietf-softwire-br` view of the binding table.
//!
//! Nothing is stored in this shape; `crate::projection` materializes it from
//! the canonical tree on read and translates writes back.

use std::sync::OnceLock;

use super::{container, leaf, list, LeafType, Schema, SchemaName, SchemaNode};


/// `(ietf traffic-stat leaf, canonical counter)` pairs.
pub const TRAFFIC_STAT: &[(&str, &str)] = &[
    ("discontinuity-time", "discontinuity-time"),
    ("sent-ipv4-packet", "out-ipv4-packets"),
    ("sent-ipv4-byte", "out-ipv4-bytes"),
    ("sent-ipv6-packet", "out-ipv6-packets"),
    ("sent-ipv6-byte", "out-ipv6-bytes"),
    ("rcvd-ipv4-packet", "in-ipv4-packets"),
    ("rcvd-ipv4-byte", "in-ipv4-bytes"),
    ("rcvd-ipv6-packet", "in-ipv6-packets"),
    ("rcvd-ipv6-byte", "in-ipv6-bytes"),
    ("dropped-ipv4-packet", "drop-all-ipv4-iface-packets"),
    ("dropped-ipv4-byte", "drop-all-ipv4-iface-bytes"),
    ("dropped-ipv6-packet", "drop-all-ipv6-iface-packets"),
    ("dropped-ipv6-byte", "drop-all-ipv6-iface-bytes"),
    ("hairpin-ipv4-packet", "hairpin-ipv4-packets"),
    ("hairpin-ipv4-byte", "hairpin-ipv4-bytes"),
];

/// The only br-instance id the projection exposes.
pub const BR_INSTANCE_ID: u64 = 1;


pub fn schema() -> &'static Schema {
    static SCHEMA: OnceLock<Schema> = OnceLock::new();
    SCHEMA.get_or_init(build)
}


fn build() -> Schema {
    let traffic_stat = container(
        "traffic-stat",
        TRAFFIC_STAT
            .iter()
            .map(|(name, _)| leaf(*name, LeafType::Uint64).state())
            .collect(),
    )
    .state();

    let binding_entry = list(
        "binding-entry",
        &["binding-ipv6info"],
        vec![
            leaf("binding-ipv6info", LeafType::Ipv6),
            leaf("binding-ipv4-addr", LeafType::Ipv4).mandatory(),
            leaf("br-ipv6-addr", LeafType::Ipv6).mandatory(),
            container(
                "port-set",
                vec![
                    leaf("psid", LeafType::Uint16).mandatory(),
                    leaf("psid-len", LeafType::Uint8).default("0"),
                    leaf("psid-offset", LeafType::Uint8).default("0"),
                ],
            ),
        ],
    );

    let br_instance = list(
        "br-instance",
        &["id"],
        vec![
            leaf("id", LeafType::Uint32),
            leaf("name", LeafType::String),
            container("binding-table", vec![binding_entry]),
            traffic_stat,
        ],
    );

    Schema {
        name: SchemaName::IetfSoftwireBr,
        revision: "2016-06-04",
        root: container(
            "",
            vec![container(
                "softwire-config",
                vec![container(
                    "binding",
                    vec![container(
                        "br",
                        vec![container("br-instances", vec![br_instance])],
                    )],
                )],
            )],
        ),
    }
}
