//! Dependency-edge calculation and claim-time validation.
//!
//! Edges are computed when an entry is recorded: an entry may not be
//! dispatched before every entry it depends on has completed. The claim
//! query enforces the edges; `validate` re-checks a just-claimed entry so a
//! dependency recorded concurrently still demotes it back to pending.

use crate::error::DbError;
use crate::journal::store::{self, JournalEntry};
use crate::resources::{Operation, ResourceType};

use serde_json::Value;
use sqlx::SqliteConnection;

/// Child resource types whose pending deletes must drain before the parent
/// type itself may be deleted.
fn delete_dependencies(object_type: ResourceType) -> &'static [ResourceType] {
    match object_type {
        ResourceType::Network => &[
            ResourceType::Subnet,
            ResourceType::Port,
            ResourceType::Router,
            ResourceType::L2GatewayConnection,
            ResourceType::Bgpvpn,
        ],
        ResourceType::Subnet => &[ResourceType::Port],
        ResourceType::Router => &[
            ResourceType::Port,
            ResourceType::Floatingip,
            ResourceType::Bgpvpn,
        ],
        ResourceType::Port => &[ResourceType::Trunk],
        ResourceType::SecurityGroup => &[ResourceType::SecurityGroupRule],
        ResourceType::L2Gateway => &[ResourceType::L2GatewayConnection],
        ResourceType::QosPolicy => &[ResourceType::Port, ResourceType::Network],
        ResourceType::SfcFlowClassifier => &[ResourceType::SfcPortChain],
        ResourceType::SfcPortPair => &[ResourceType::SfcPortPairGroup],
        ResourceType::SfcPortPairGroup => &[ResourceType::SfcPortChain],
        _ => &[],
    }
}

fn push_id(ids: &mut Vec<String>, value: Option<&Value>) {
    if let Some(id) = value.and_then(Value::as_str) {
        ids.push(id.to_string());
    }
}

fn push_ids(ids: &mut Vec<String>, value: Option<&Value>) {
    if let Some(list) = value.and_then(Value::as_array) {
        for item in list {
            push_id(ids, Some(item));
        }
    }
}

/// Parent object ids a create/update depends on, derived from the payload.
fn parent_ids(object_type: ResourceType, data: &Value) -> Vec<String> {
    let mut ids = Vec::new();
    match object_type {
        ResourceType::Network => {
            push_id(&mut ids, data.get("qos_policy_id"));
        }
        ResourceType::Subnet => {
            push_id(&mut ids, data.get("network_id"));
        }
        ResourceType::Port => {
            if let Some(fixed_ips) = data.get("fixed_ips").and_then(Value::as_array) {
                for fixed_ip in fixed_ips {
                    push_id(&mut ids, fixed_ip.get("subnet_id"));
                }
            }
            ids.dedup();
            push_id(&mut ids, data.get("network_id"));
            push_id(&mut ids, data.get("qos_policy_id"));
        }
        ResourceType::Router => {
            push_id(&mut ids, data.get("gw_port_id"));
        }
        ResourceType::RouterInterface => {
            push_id(&mut ids, data.get("id"));
            push_id(&mut ids, data.get("subnet_id"));
        }
        ResourceType::Floatingip => {
            push_id(&mut ids, data.get("floating_network_id"));
            push_id(&mut ids, data.get("port_id"));
            push_id(&mut ids, data.get("router_id"));
        }
        ResourceType::SecurityGroupRule => {
            push_id(&mut ids, data.get("security_group_id"));
        }
        ResourceType::Trunk => {
            if let Some(sub_ports) = data.get("sub_ports").and_then(Value::as_array) {
                for sub_port in sub_ports {
                    push_id(&mut ids, sub_port.get("port_id"));
                }
            }
            push_id(&mut ids, data.get("port_id"));
        }
        ResourceType::L2GatewayConnection => {
            push_id(&mut ids, data.get("network_id"));
            push_id(&mut ids, data.get("gateway_id"));
        }
        ResourceType::SfcPortPair => {
            push_id(&mut ids, data.get("ingress"));
            push_id(&mut ids, data.get("egress"));
        }
        ResourceType::SfcPortPairGroup => {
            push_ids(&mut ids, data.get("port_pairs"));
        }
        ResourceType::SfcPortChain => {
            push_ids(&mut ids, data.get("port_pair_groups"));
            push_ids(&mut ids, data.get("flow_classifiers"));
        }
        ResourceType::Bgpvpn => {
            push_ids(&mut ids, data.get("networks"));
            push_ids(&mut ids, data.get("routers"));
        }
        _ => {}
    }
    ids
}

async fn older_operations(
    conn: &mut SqliteConnection,
    object_ids: &[String],
) -> Result<Vec<i64>, DbError> {
    let mut deps = Vec::new();
    for object_id in object_ids {
        for entry in store::pending_or_processing_ops(conn, object_id, None).await? {
            deps.push(entry.seqnum);
        }
    }
    Ok(deps)
}

async fn delete_operation_dependencies(
    conn: &mut SqliteConnection,
    object_type: ResourceType,
    object_uuid: &str,
) -> Result<Vec<i64>, DbError> {
    // Older create/update on the object itself must land first.
    let mut deps: Vec<i64> = store::pending_or_processing_ops(
        conn,
        object_uuid,
        Some(&[Operation::Create, Operation::Update]),
    )
    .await?
    .into_iter()
    .map(|e| e.seqnum)
    .collect();

    // Pending deletes of dependent child resources must drain before the
    // parent goes away.
    for child_type in delete_dependencies(object_type) {
        for entry in store::pending_delete_ops_with_parent(conn, *child_type, object_uuid).await? {
            deps.push(entry.seqnum);
        }
    }

    Ok(deps)
}

/// Calculate the dependency edges for an entry about to be recorded.
pub async fn calculate(
    conn: &mut SqliteConnection,
    operation: Operation,
    object_type: ResourceType,
    object_uuid: &str,
    data: &Value,
) -> Result<Vec<i64>, DbError> {
    let mut deps = match operation {
        Operation::Delete | Operation::Remove => {
            return delete_operation_dependencies(conn, object_type, object_uuid).await;
        }
        Operation::Update => store::pending_or_processing_ops(
            conn,
            object_uuid,
            Some(&[Operation::Create, Operation::Update]),
        )
        .await?
        .into_iter()
        .map(|e| e.seqnum)
        .collect(),
        Operation::Create | Operation::Add => Vec::new(),
    };

    deps.extend(older_operations(conn, &parent_ids(object_type, data)).await?);
    deps.sort_unstable();
    deps.dedup();
    Ok(deps)
}

/// Claim-time re-check. A false result demotes the entry back to pending
/// without touching its retry count; this covers dependencies recorded
/// between the claim query and the dispatch.
pub async fn validate(
    conn: &mut SqliteConnection,
    entry: &JournalEntry,
) -> Result<bool, DbError> {
    // Any older pending/processing entry on the same uuid wins.
    let older = store::pending_or_processing_ops(conn, &entry.object_uuid, None)
        .await?
        .into_iter()
        .any(|e| e.seqnum < entry.seqnum);
    if older {
        return Ok(false);
    }

    match entry.operation {
        Operation::Delete | Operation::Remove => {
            for child_type in delete_dependencies(entry.object_type) {
                let blocked =
                    store::pending_delete_ops_with_parent(conn, *child_type, &entry.object_uuid)
                        .await?
                        .into_iter()
                        .any(|e| e.seqnum != entry.seqnum);
                if blocked {
                    return Ok(false);
                }
            }
        }
        Operation::Create | Operation::Update | Operation::Add => {
            for parent in parent_ids(entry.object_type, &entry.data) {
                if !store::pending_or_processing_ops(conn, &parent, None)
                    .await?
                    .is_empty()
                {
                    return Ok(false);
                }
            }
        }
    }

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::journal::store::create_pending_row;
    use serde_json::json;

    #[tokio::test]
    async fn subnet_create_depends_on_pending_network() {
        let pool = db::connect_in_memory().await.expect("db should open");
        let mut conn = pool.acquire().await.expect("conn");

        let network = create_pending_row(
            &mut conn,
            ResourceType::Network,
            "N1",
            Operation::Create,
            &json!({"id": "N1"}),
            &[],
        )
        .await
        .expect("insert");

        let deps = calculate(
            &mut conn,
            Operation::Create,
            ResourceType::Subnet,
            "S1",
            &json!({"id": "S1", "network_id": "N1"}),
        )
        .await
        .expect("calculate");
        assert_eq!(deps, vec![network.seqnum]);
    }

    #[tokio::test]
    async fn port_create_depends_on_network_and_fixed_ip_subnets() {
        let pool = db::connect_in_memory().await.expect("db should open");
        let mut conn = pool.acquire().await.expect("conn");

        let network = create_pending_row(
            &mut conn,
            ResourceType::Network,
            "N1",
            Operation::Create,
            &json!({"id": "N1"}),
            &[],
        )
        .await
        .expect("insert");
        let subnet = create_pending_row(
            &mut conn,
            ResourceType::Subnet,
            "S1",
            Operation::Create,
            &json!({"id": "S1", "network_id": "N1"}),
            &[network.seqnum],
        )
        .await
        .expect("insert");

        let deps = calculate(
            &mut conn,
            Operation::Create,
            ResourceType::Port,
            "P1",
            &json!({
                "id": "P1",
                "network_id": "N1",
                "fixed_ips": [{"subnet_id": "S1", "ip_address": "10.0.0.2"}]
            }),
        )
        .await
        .expect("calculate");
        let mut expected = vec![network.seqnum, subnet.seqnum];
        expected.sort_unstable();
        assert_eq!(deps, expected);
    }

    #[tokio::test]
    async fn update_depends_on_older_ops_for_same_uuid() {
        let pool = db::connect_in_memory().await.expect("db should open");
        let mut conn = pool.acquire().await.expect("conn");

        let create = create_pending_row(
            &mut conn,
            ResourceType::Network,
            "N1",
            Operation::Create,
            &json!({"id": "N1"}),
            &[],
        )
        .await
        .expect("insert");

        let deps = calculate(
            &mut conn,
            Operation::Update,
            ResourceType::Network,
            "N1",
            &json!({"id": "N1", "name": "renamed"}),
        )
        .await
        .expect("calculate");
        assert_eq!(deps, vec![create.seqnum]);
    }

    #[tokio::test]
    async fn network_delete_waits_for_pending_child_deletes() {
        let pool = db::connect_in_memory().await.expect("db should open");
        let mut conn = pool.acquire().await.expect("conn");

        let subnet_delete = create_pending_row(
            &mut conn,
            ResourceType::Subnet,
            "S1",
            Operation::Delete,
            &json!(["N1"]),
            &[],
        )
        .await
        .expect("insert");

        let deps = calculate(
            &mut conn,
            Operation::Delete,
            ResourceType::Network,
            "N1",
            &json!([]),
        )
        .await
        .expect("calculate");
        assert_eq!(deps, vec![subnet_delete.seqnum]);
    }

    #[tokio::test]
    async fn security_groups_have_no_cross_type_dependency() {
        let pool = db::connect_in_memory().await.expect("db should open");
        let mut conn = pool.acquire().await.expect("conn");

        create_pending_row(
            &mut conn,
            ResourceType::Network,
            "N1",
            Operation::Create,
            &json!({"id": "N1"}),
            &[],
        )
        .await
        .expect("insert");

        let deps = calculate(
            &mut conn,
            Operation::Create,
            ResourceType::SecurityGroup,
            "SG1",
            &json!({"id": "SG1"}),
        )
        .await
        .expect("calculate");
        assert!(deps.is_empty());
    }

    #[tokio::test]
    async fn validate_rejects_when_parent_still_queued() {
        let pool = db::connect_in_memory().await.expect("db should open");
        let mut conn = pool.acquire().await.expect("conn");

        create_pending_row(
            &mut conn,
            ResourceType::Network,
            "N1",
            Operation::Create,
            &json!({"id": "N1"}),
            &[],
        )
        .await
        .expect("insert");
        let subnet = create_pending_row(
            &mut conn,
            ResourceType::Subnet,
            "S1",
            Operation::Create,
            &json!({"id": "S1", "network_id": "N1"}),
            &[],
        )
        .await
        .expect("insert");

        assert!(!validate(&mut conn, &subnet).await.expect("validate"));
    }

    #[tokio::test]
    async fn validate_accepts_once_parent_completed() {
        let pool = db::connect_in_memory().await.expect("db should open");
        let mut conn = pool.acquire().await.expect("conn");

        let network = create_pending_row(
            &mut conn,
            ResourceType::Network,
            "N1",
            Operation::Create,
            &json!({"id": "N1"}),
            &[],
        )
        .await
        .expect("insert");
        let subnet = create_pending_row(
            &mut conn,
            ResourceType::Subnet,
            "S1",
            Operation::Create,
            &json!({"id": "S1", "network_id": "N1"}),
            &[],
        )
        .await
        .expect("insert");

        store::update_row_state(&mut conn, &network, crate::journal::store::EntryState::Completed)
            .await
            .expect("complete");
        assert!(validate(&mut conn, &subnet).await.expect("validate"));
    }
}
