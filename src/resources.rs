//! Resource type registry, URL shaping, and the plug-in contract.
//!
//! The journal treats orchestrator resources as opaque by-type identifiers.
//! This module is the one place that knows the closed set of types, how each
//! maps onto the controller's URL space, and how surrounding subsystems
//! (full-sync, recovery) fetch authoritative resource state.

use crate::error::Result;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Journal operations. `Add`/`Remove` are used only for relation resources
/// (router-interface attach/detach).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Update,
    Delete,
    Add,
    Remove,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::Add => "add",
            Operation::Remove => "remove",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(Operation::Create),
            "update" => Some(Operation::Update),
            "delete" => Some(Operation::Delete),
            "add" => Some(Operation::Add),
            "remove" => Some(Operation::Remove),
            _ => None,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The closed registry of resource types the journal can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceType {
    Network,
    Subnet,
    Port,
    Router,
    RouterInterface,
    Floatingip,
    SecurityGroup,
    SecurityGroupRule,
    QosPolicy,
    Trunk,
    L2Gateway,
    L2GatewayConnection,
    Bgpvpn,
    BgpvpnNetworkAssociation,
    BgpvpnRouterAssociation,
    SfcFlowClassifier,
    SfcPortPair,
    SfcPortPairGroup,
    SfcPortChain,
    Loadbalancer,
    Listener,
    Pool,
    Member,
    Healthmonitor,
}

impl ResourceType {
    /// All types, in no particular order. Full-sync uses
    /// [`ResourceType::FULL_SYNC_ORDER`] instead.
    pub const ALL: &'static [ResourceType] = &[
        ResourceType::Network,
        ResourceType::Subnet,
        ResourceType::Port,
        ResourceType::Router,
        ResourceType::RouterInterface,
        ResourceType::Floatingip,
        ResourceType::SecurityGroup,
        ResourceType::SecurityGroupRule,
        ResourceType::QosPolicy,
        ResourceType::Trunk,
        ResourceType::L2Gateway,
        ResourceType::L2GatewayConnection,
        ResourceType::Bgpvpn,
        ResourceType::BgpvpnNetworkAssociation,
        ResourceType::BgpvpnRouterAssociation,
        ResourceType::SfcFlowClassifier,
        ResourceType::SfcPortPair,
        ResourceType::SfcPortPairGroup,
        ResourceType::SfcPortChain,
        ResourceType::Loadbalancer,
        ResourceType::Listener,
        ResourceType::Pool,
        ResourceType::Member,
        ResourceType::Healthmonitor,
    ];

    /// Dependency-safe ordering for full resynchronization: parents before
    /// the resources that reference them.
    pub const FULL_SYNC_ORDER: &'static [ResourceType] = &[
        ResourceType::SecurityGroup,
        ResourceType::SecurityGroupRule,
        ResourceType::Network,
        ResourceType::Subnet,
        ResourceType::Router,
        ResourceType::Port,
        ResourceType::Floatingip,
        ResourceType::Loadbalancer,
        ResourceType::Listener,
        ResourceType::Pool,
        ResourceType::Member,
        ResourceType::Healthmonitor,
        ResourceType::QosPolicy,
        ResourceType::Trunk,
        ResourceType::Bgpvpn,
        ResourceType::BgpvpnNetworkAssociation,
        ResourceType::BgpvpnRouterAssociation,
        ResourceType::SfcFlowClassifier,
        ResourceType::SfcPortPair,
        ResourceType::SfcPortPairGroup,
        ResourceType::SfcPortChain,
        ResourceType::L2Gateway,
        ResourceType::L2GatewayConnection,
    ];

    /// Singular tag stored in the journal and used as the JSON root key.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Network => "network",
            ResourceType::Subnet => "subnet",
            ResourceType::Port => "port",
            ResourceType::Router => "router",
            ResourceType::RouterInterface => "router_interface",
            ResourceType::Floatingip => "floatingip",
            ResourceType::SecurityGroup => "security_group",
            ResourceType::SecurityGroupRule => "security_group_rule",
            ResourceType::QosPolicy => "policy",
            ResourceType::Trunk => "trunk",
            ResourceType::L2Gateway => "l2_gateway",
            ResourceType::L2GatewayConnection => "l2gateway_connection",
            ResourceType::Bgpvpn => "bgpvpn",
            ResourceType::BgpvpnNetworkAssociation => "bgpvpn_network_association",
            ResourceType::BgpvpnRouterAssociation => "bgpvpn_router_association",
            ResourceType::SfcFlowClassifier => "flowclassifier",
            ResourceType::SfcPortPair => "portpair",
            ResourceType::SfcPortPairGroup => "portpairgroup",
            ResourceType::SfcPortChain => "portchain",
            ResourceType::Loadbalancer => "loadbalancer",
            ResourceType::Listener => "listener",
            ResourceType::Pool => "pool",
            ResourceType::Member => "member",
            ResourceType::Healthmonitor => "healthmonitor",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        ResourceType::ALL.iter().copied().find(|t| t.as_str() == s)
    }

    /// Collection segment of the controller URL: pluralized, underscores
    /// replaced with hyphens, with explicit entries for prefixed resources.
    pub fn collection_path(&self) -> String {
        match self {
            ResourceType::QosPolicy => "qos/policies".to_string(),
            ResourceType::SfcFlowClassifier => "sfc/flowclassifiers".to_string(),
            ResourceType::SfcPortPair => "sfc/portpairs".to_string(),
            ResourceType::SfcPortPairGroup => "sfc/portpairgroups".to_string(),
            ResourceType::SfcPortChain => "sfc/portchains".to_string(),
            ResourceType::Loadbalancer => "lbaas/loadbalancers".to_string(),
            ResourceType::Listener => "lbaas/listeners".to_string(),
            ResourceType::Pool => "lbaas/pools".to_string(),
            ResourceType::Member => "lbaas/members".to_string(),
            ResourceType::Healthmonitor => "lbaas/healthmonitors".to_string(),
            ResourceType::BgpvpnNetworkAssociation => {
                "bgpvpn/bgpvpn-network-associations".to_string()
            }
            ResourceType::BgpvpnRouterAssociation => {
                "bgpvpn/bgpvpn-router-associations".to_string()
            }
            ResourceType::L2GatewayConnection => "l2-gateway-connections".to_string(),
            other => format!("{}s", other.as_str().replace('_', "-")),
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build the URL path for one journal operation.
///
/// Relation operations are explicit entries, not heuristics: router
/// interface add/remove target `routers/<id>/add_router_interface` and
/// `routers/<id>/remove_router_interface`.
pub fn url_for(object_type: ResourceType, object_uuid: &str, operation: Operation) -> String {
    if object_type == ResourceType::RouterInterface {
        let action = match operation {
            Operation::Remove => "remove_router_interface",
            _ => "add_router_interface",
        };
        return format!(
            "{}/{}/{}",
            ResourceType::Router.collection_path(),
            object_uuid,
            action
        );
    }

    match operation {
        Operation::Create => object_type.collection_path(),
        _ => format!("{}/{}", object_type.collection_path(), object_uuid),
    }
}

/// Authoritative resource access, implemented by the orchestrator-side
/// drivers. The core only ever consults this through [`PluginRegistry`].
#[async_trait]
pub trait ResourcePlugin: Send + Sync {
    /// Every live resource of the given type, used by full-sync.
    async fn get_resources(&self, resource_type: ResourceType) -> Result<Vec<Value>>;

    /// One resource by id, used by recovery. `None` when it no longer
    /// exists locally.
    async fn get_resource(&self, resource_type: ResourceType, uuid: &str)
        -> Result<Option<Value>>;

    /// Ports currently DOWN and unbound, used by the port-status sweep
    /// after a WebSocket reconnect.
    async fn get_down_ports(&self) -> Result<Vec<Value>> {
        Ok(Vec::new())
    }

    /// Orchestrator-side provisioning completion signal for a port.
    async fn provisioning_complete(&self, _port_id: &str) -> Result<()> {
        Ok(())
    }
}

/// String-keyed registry of drivers; populated at process startup.
#[derive(Default, Clone)]
pub struct PluginRegistry {
    plugins: HashMap<ResourceType, Arc<dyn ResourcePlugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a driver for the given resource types.
    pub fn register(&mut self, plugin: Arc<dyn ResourcePlugin>, types: &[ResourceType]) {
        for resource_type in types {
            self.plugins.insert(*resource_type, Arc::clone(&plugin));
        }
    }

    pub fn get(&self, resource_type: ResourceType) -> Option<&Arc<dyn ResourcePlugin>> {
        self.plugins.get(&resource_type)
    }

    pub fn registered_types(&self) -> impl Iterator<Item = ResourceType> + '_ {
        ResourceType::FULL_SYNC_ORDER
            .iter()
            .copied()
            .filter(|t| self.plugins.contains_key(t))
    }
}
