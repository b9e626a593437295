//! Wire payload shaping, per resource type and operation.
//!
//! Filters operate on a mutable copy of the recorded payload just before
//! dispatch; the journal's stored `data` is never touched. Create filters
//! strip fields the controller assigns itself, update filters additionally
//! strip immutable fields, and every payload gets the shared fixups
//! (project/tenant id sync, null stripping for unmapped keys).

use crate::resources::{Operation, ResourceType};

use serde_json::{Map, Value};

/// Null-valued keys the controller's receiver cannot map. A null followed
/// by a non-null sibling array corrupts the sibling on the receiving side,
/// so these are stripped when null.
const NETWORK_UNMAPPED_KEYS: &[&str] = &["qos_policy_id"];
const SUBNET_UNMAPPED_KEYS: &[&str] = &["segment_id", "subnetpool_id"];
const PORT_UNMAPPED_KEYS: &[&str] = &[
    "binding:profile",
    "dns_name",
    "port_security_enabled",
    "qos_policy_id",
];
const FLOATINGIP_UNMAPPED_KEYS: &[&str] = &["port_id", "fixed_ip_address", "router_id"];

/// Protocol names the controller understands natively; everything else is
/// translated to its numeric protocol value.
const KNOWN_PROTOCOL_NAMES: &[&str] = &["tcp", "udp", "icmp", "icmpv6"];

/// The orchestrator stores several aliases for ICMPv6; the controller
/// accepts exactly one.
const ICMPV6_ALIASES: &[&str] = &["icmp", "ipv6-icmp", "icmpv6"];
const ICMPV6_CANONICAL: &str = "icmpv6";

fn protocol_number(name: &str) -> Option<u16> {
    let number = match name {
        "ah" => 51,
        "dccp" => 33,
        "egp" => 8,
        "esp" => 50,
        "gre" => 47,
        "icmp" => 1,
        "igmp" => 2,
        "ipip" => 4,
        "ipv6-encap" => 41,
        "ipv6-frag" => 44,
        "ipv6-icmp" | "icmpv6" => 58,
        "ipv6-nonxt" => 59,
        "ipv6-opts" => 60,
        "ipv6-route" => 43,
        "ospf" => 89,
        "pgm" => 113,
        "rsvp" => 46,
        "sctp" => 132,
        "tcp" => 6,
        "udp" => 17,
        "udplite" => 136,
        "vrrp" => 112,
        _ => return None,
    };
    Some(number)
}

fn try_del(object: &mut Map<String, Value>, keys: &[&str]) {
    for key in keys {
        object.remove(*key);
    }
}

fn strip_unmapped_nulls(object: &mut Map<String, Value>, unmapped_keys: &[&str]) {
    for key in unmapped_keys {
        if object.get(*key).is_some_and(Value::is_null) {
            object.remove(*key);
        }
    }
}

/// Keep `project_id` and `tenant_id` in sync; whichever is present fills
/// the other.
fn populate_project_and_tenant_id(object: &mut Map<String, Value>) {
    let id = object
        .get("project_id")
        .or_else(|| object.get("tenant_id"))
        .filter(|v| !v.is_null())
        .cloned();
    if let Some(id) = id {
        object.entry("project_id").or_insert_with(|| id.clone());
        object.entry("tenant_id").or_insert(id);
    }
}

/// Container fields that must traverse the wire as a string.
fn stringify_field(object: &mut Map<String, Value>, key: &str) {
    if let Some(value) = object.get(key) {
        if !value.is_string() {
            let raw = value.to_string();
            object.insert(key.to_string(), Value::String(raw));
        }
    }
}

fn filter_network_create(network: &mut Map<String, Value>) {
    try_del(network, &["status", "subnets"]);
    strip_unmapped_nulls(network, NETWORK_UNMAPPED_KEYS);
}

fn filter_network_update(network: &mut Map<String, Value>) {
    try_del(
        network,
        &["id", "status", "subnets", "tenant_id", "project_id"],
    );
    strip_unmapped_nulls(network, NETWORK_UNMAPPED_KEYS);
}

fn filter_subnet_create(subnet: &mut Map<String, Value>) {
    strip_unmapped_nulls(subnet, SUBNET_UNMAPPED_KEYS);
}

fn filter_subnet_update(subnet: &mut Map<String, Value>) {
    try_del(
        subnet,
        &[
            "id",
            "network_id",
            "ip_version",
            "cidr",
            "allocation_pools",
            "tenant_id",
            "project_id",
        ],
    );
    strip_unmapped_nulls(subnet, SUBNET_UNMAPPED_KEYS);
}

fn filter_port_create(port: &mut Map<String, Value>) {
    try_del(port, &["status"]);
    strip_unmapped_nulls(port, PORT_UNMAPPED_KEYS);
    stringify_field(port, "binding:profile");
}

fn filter_port_update(port: &mut Map<String, Value>) {
    try_del(
        port,
        &[
            "id",
            "status",
            "network_id",
            "mac_address",
            "fixed_ips",
            "tenant_id",
            "project_id",
        ],
    );
    strip_unmapped_nulls(port, PORT_UNMAPPED_KEYS);
    stringify_field(port, "binding:profile");
}

fn filter_router_update(router: &mut Map<String, Value>) {
    try_del(router, &["id", "tenant_id", "project_id", "status"]);
}

fn filter_floatingip(fip: &mut Map<String, Value>) {
    strip_unmapped_nulls(fip, FLOATINGIP_UNMAPPED_KEYS);
}

fn filter_security_group_rule(rule: &mut Map<String, Value>) {
    // Canonicalize ICMPv6 aliases first, then translate any name the
    // controller does not know into its numeric value.
    let is_ipv6 = rule.get("ethertype").and_then(Value::as_str) == Some("IPv6");
    if let Some(protocol) = rule.get("protocol").and_then(Value::as_str) {
        let protocol = if is_ipv6 && ICMPV6_ALIASES.contains(&protocol) {
            ICMPV6_CANONICAL.to_string()
        } else {
            protocol.to_string()
        };

        let replacement = if KNOWN_PROTOCOL_NAMES.contains(&protocol.as_str()) {
            Value::String(protocol)
        } else if let Some(number) = protocol_number(&protocol) {
            Value::Number(number.into())
        } else {
            Value::String(protocol)
        };
        rule.insert("protocol".to_string(), replacement);
    }
}

/// Shape `data` for the wire. Non-object payloads (delete entries store a
/// parent-id list) pass through untouched.
pub fn filter_for_controller(object_type: ResourceType, operation: Operation, data: &mut Value) {
    let Some(object) = data.as_object_mut() else {
        return;
    };

    match (object_type, operation) {
        (ResourceType::Network, Operation::Create) => filter_network_create(object),
        (ResourceType::Network, Operation::Update) => filter_network_update(object),
        (ResourceType::Subnet, Operation::Create) => filter_subnet_create(object),
        (ResourceType::Subnet, Operation::Update) => filter_subnet_update(object),
        (ResourceType::Port, Operation::Create) => filter_port_create(object),
        (ResourceType::Port, Operation::Update) => filter_port_update(object),
        (ResourceType::Router, Operation::Update) => filter_router_update(object),
        (ResourceType::Floatingip, Operation::Update) => filter_floatingip(object),
        (ResourceType::SecurityGroupRule, Operation::Create | Operation::Update) => {
            filter_security_group_rule(object)
        }
        _ => {}
    }

    populate_project_and_tenant_id(object);
}
