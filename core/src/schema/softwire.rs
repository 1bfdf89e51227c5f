//! The canonical `snabb-softwire-v2` schema.

use std::sync::OnceLock;

use super::{container, leaf, list, LeafType, Schema, SchemaName, SchemaNode};


/// Every per-instance counter, in report order.
pub const COUNTERS: &[&str] = &[
    "discontinuity-time",
    "drop-all-ipv4-iface-bytes",
    "drop-all-ipv4-iface-packets",
    "drop-all-ipv6-iface-bytes",
    "drop-all-ipv6-iface-packets",
    "drop-no-dest-softwire-ipv4-bytes",
    "drop-no-dest-softwire-ipv4-packets",
    "drop-no-source-softwire-ipv6-bytes",
    "drop-no-source-softwire-ipv6-packets",
    "hairpin-ipv4-bytes",
    "hairpin-ipv4-packets",
    "in-ipv4-bytes",
    "in-ipv4-packets",
    "in-ipv6-bytes",
    "in-ipv6-packets",
    "ingress-packet-drops",
    "out-icmpv4-bytes",
    "out-icmpv4-packets",
    "out-icmpv6-bytes",
    "out-icmpv6-packets",
    "out-ipv4-bytes",
    "out-ipv4-packets",
    "out-ipv6-bytes",
    "out-ipv6-packets",
];

/// Counters that carry a point-in-time value and must not be summed.
pub const NON_SUMMABLE: &[&str] = &["discontinuity-time"];


pub fn schema() -> &'static Schema {
    static SCHEMA: OnceLock<Schema> = OnceLock::new();
    SCHEMA.get_or_init(build)
}


fn build() -> Schema {
    Schema {
        name: SchemaName::SoftwireV2,
        revision: "2017-04-17",
        root: container(
            "",
            vec![
                container(
                    "softwire-config",
                    vec![
                        leaf("name", LeafType::String),
                        external_interface(),
                        internal_interface(),
                        binding_table(),
                        instance(),
                    ],
                ),
                counters("softwire-state"),
            ],
        ),
    }
}


fn counters(name: &'static str) -> SchemaNode {
    container(
        name,
        COUNTERS
            .iter()
            .map(|c| leaf(*c, LeafType::Uint64).state())
            .collect(),
    )
    .state()
}


fn next_hop(addr: LeafType) -> SchemaNode {
    container(
        "next-hop",
        vec![leaf("ip", addr), leaf("mac", LeafType::Mac)],
    )
}


fn interface_common(addr: LeafType) -> Vec<SchemaNode> {
    vec![
        leaf("ip", addr).mandatory(),
        leaf("mac", LeafType::Mac).mandatory(),
        leaf("mtu", LeafType::Uint16).default("1460"),
        leaf("vlan-tag", LeafType::Uint16),
        leaf("generate-icmp-errors", LeafType::Boolean).default("true"),
        leaf("allow-incoming-icmp", LeafType::Boolean).default("true"),
        container(
            "error-rate-limiting",
            vec![
                leaf("packets", LeafType::Uint32).default("600000"),
                leaf("period", LeafType::Uint32).default("2"),
            ],
        ),
        container(
            "reassembly",
            vec![
                leaf("max-fragments-per-packet", LeafType::Uint32).default("40"),
                leaf("max-packets", LeafType::Uint32).default("20000"),
            ],
        ),
        next_hop(addr),
    ]
}


fn external_interface() -> SchemaNode {
    container("external-interface", interface_common(LeafType::Ipv4))
}


fn internal_interface() -> SchemaNode {
    let mut children = interface_common(LeafType::Ipv6);
    children.push(leaf("hairpinning", LeafType::Boolean).default("true"));
    container("internal-interface", children)
}


fn binding_table() -> SchemaNode {
    container(
        "binding-table",
        vec![list(
            "softwire",
            &["ipv4", "psid"],
            vec![
                leaf("ipv4", LeafType::Ipv4),
                leaf("psid", LeafType::Uint16),
                leaf("b4-ipv6", LeafType::Ipv6).mandatory(),
                leaf("br-address", LeafType::Ipv6).mandatory(),
                container(
                    "port-set",
                    vec![
                        leaf("psid-length", LeafType::Uint8).default("0"),
                        leaf("reserved-ports-bit-count", LeafType::Uint8).default("0"),
                    ],
                ),
            ],
        )],
    )
}


fn queue_interface(name: &'static str, addr: LeafType) -> SchemaNode {
    container(
        name,
        vec![
            leaf("ip", addr),
            leaf("mac", LeafType::Mac),
            leaf("vlan-tag", LeafType::Uint16),
            next_hop(addr),
        ],
    )
}


fn instance() -> SchemaNode {
    list(
        "instance",
        &["device"],
        vec![
            leaf("device", LeafType::String),
            list(
                "queue",
                &["id"],
                vec![
                    leaf("id", LeafType::Uint8),
                    queue_interface("external-interface", LeafType::Ipv4),
                    queue_interface("internal-interface", LeafType::Ipv6),
                    counters("softwire-state"),
                ],
            ),
        ],
    )
}
