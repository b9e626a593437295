//! Controller feature negotiation.
//!
//! The controller advertises optional behaviors under its operational tree.
//! The set is probed once at startup (retrying until the controller
//! answers) and published as an immutable snapshot; `operational-port-status`
//! decides whether the WebSocket receiver runs at all.

use crate::config::OdlConfig;
use crate::error::{Result, TransportError};
use crate::transport::{Method, RestClient};

use arc_swap::ArcSwap;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Controller pushes port operational status over the change stream.
pub const OPERATIONAL_PORT_STATUS: &str = "operational-port-status";

const FEATURES_PATH: &str = "operational/neutron:neutron/neutron:features";

/// Immutable set of advertised feature names, module prefixes stripped.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FeatureSet {
    names: HashSet<String>,
}

impl FeatureSet {
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn has(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Process-wide feature snapshot, swapped atomically after a (re)probe.
pub struct Features {
    current: ArcSwap<FeatureSet>,
}

impl Default for Features {
    fn default() -> Self {
        Self {
            current: ArcSwap::from_pointee(FeatureSet::default()),
        }
    }
}

impl Features {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Arc<FeatureSet> {
        self.current.load_full()
    }

    pub fn replace(&self, set: FeatureSet) {
        self.current.store(Arc::new(set));
    }
}

/// Parse the YANG-JSON features container. Feature names arrive as
/// `module:name`; only the name part matters here.
fn parse_features(body: &Value) -> FeatureSet {
    let entries = body
        .get("features")
        .and_then(|f| f.get("feature"))
        .and_then(Value::as_array);

    let Some(entries) = entries else {
        return FeatureSet::default();
    };

    let names = entries
        .iter()
        .filter_map(|e| e.get("service-provider-feature").and_then(Value::as_str))
        .map(|qualified| {
            qualified
                .rsplit(':')
                .next()
                .unwrap_or(qualified)
                .to_string()
        })
        .collect();
    FeatureSet { names }
}

/// One probe attempt. A controller that answers 400 or 404 simply predates
/// feature advertisement: that is an empty set, not an error.
async fn fetch(client: &RestClient) -> std::result::Result<FeatureSet, TransportError> {
    let response = client.request(Method::Get, FEATURES_PATH, None).await?;
    match response.status().as_u16() {
        200..=299 => {
            let body: Value = response
                .json()
                .await
                .map_err(|e| TransportError::InvalidResponse(e.to_string()))?;
            Ok(parse_features(&body))
        }
        400 | 404 => Ok(FeatureSet::default()),
        status => Err(TransportError::Http {
            status,
            body: String::new(),
        }),
    }
}

/// Resolve the feature set: static override from config, otherwise probe
/// until the controller answers or the stop channel flips.
pub async fn negotiate(
    features: &Features,
    config: &OdlConfig,
    client: &RestClient,
    mut stop: watch::Receiver<bool>,
) -> Result<()> {
    if let Some(configured) = &config.odl_features {
        features.replace(FeatureSet::from_names(configured.iter().cloned()));
        tracing::info!("using configured controller feature set");
        return Ok(());
    }

    let interval = Duration::from_secs(config.odl_features_retry_interval);
    loop {
        match fetch(client).await {
            Ok(set) => {
                tracing::info!(empty = set.is_empty(), "controller feature set resolved");
                features.replace(set);
                return Ok(());
            }
            Err(err) => {
                tracing::warn!(error = %err, "feature probe failed, retrying");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = stop.changed() => {}
        }
        if *stop.borrow() {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_yang_json_and_strips_module_prefixes() {
        let body = json!({
            "features": {
                "feature": [
                    {"service-provider-feature": "neutron-extensions:operational-port-status"},
                    {"service-provider-feature": "neutron-extensions:bgpvpn"}
                ]
            }
        });

        let set = parse_features(&body);
        assert!(set.has(OPERATIONAL_PORT_STATUS));
        assert!(set.has("bgpvpn"));
        assert!(!set.has("qos"));
    }

    #[test]
    fn missing_container_is_an_empty_set() {
        assert!(parse_features(&json!({})).is_empty());
        assert!(parse_features(&json!({"features": {}})).is_empty());
    }

    #[test]
    fn snapshot_swap_is_visible_to_existing_handle() {
        let features = Features::new();
        assert!(!features.snapshot().has(OPERATIONAL_PORT_STATUS));

        features.replace(FeatureSet::from_names([OPERATIONAL_PORT_STATUS]));
        assert!(features.snapshot().has(OPERATIONAL_PORT_STATUS));
    }

    #[tokio::test]
    async fn configured_override_skips_the_probe() {
        let features = Features::new();
        let config = OdlConfig {
            url: "http://ctl:8080/neutron".into(),
            odl_features: Some(vec![OPERATIONAL_PORT_STATUS.to_string()]),
            ..OdlConfig::default()
        };
        let client = RestClient::new(&config).expect("client");
        let (_tx, rx) = watch::channel(false);

        negotiate(&features, &config, &client, rx)
            .await
            .expect("negotiate");
        assert!(features.snapshot().has(OPERATIONAL_PORT_STATUS));
    }
}
