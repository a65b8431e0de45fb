//! Endpoint-triggered VIP election for Kubernetes Services
//!
//! This crate watches the Endpoints of LoadBalancer Services and runs a
//! leader election for the Service's virtual IP only while this node hosts
//! one of its endpoints.

pub mod annotations;
pub mod backoff;
pub mod controller;
pub mod election;
pub mod error;
pub mod lease;
pub mod resolver;
pub mod resources;
pub mod services;
pub mod snapshot;
pub mod watch;

pub use annotations::{AnnotationReconciler, KubeServiceStore, ServiceStore};
pub use backoff::RetryPolicy;
pub use controller::{ControllerPhase, ControllerState, EndpointWatchController, Flow};
pub use election::{ElectionLifecycleManager, LeaderElection};
pub use error::{OperatorError, Result};
pub use lease::{LeaseConfig, LeaseElection};
pub use resources::ServiceRef;
pub use services::ServiceWatcher;
pub use snapshot::{EndpointAddress, EndpointSnapshot};
pub use watch::{KubeEndpointsSource, RetryableWatchSession, WatchConfig, WatchEvent, WatchSource};

use k8s_openapi::api::core::v1::Service;
use kube::{api::Api, Client};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Operator configuration
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct OperatorConfig {
    /// Name of the node this instance runs on
    pub node_name: String,
    /// Namespace to watch (empty for all namespaces)
    pub namespace: Option<String>,
    /// Endpoint watch settings
    pub watch: WatchConfig,
    /// Retry policy for active-endpoint annotation updates
    pub annotation_retry: RetryPolicy,
    /// Lease election timing
    pub lease: LeaseConfig,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            node_name: std::env::var("HOSTNAME").unwrap_or_default(),
            namespace: None,
            watch: WatchConfig::default(),
            annotation_retry: RetryPolicy::default(),
            lease: LeaseConfig::default(),
        }
    }
}

impl OperatorConfig {
    /// Load configuration from a YAML file. Call [`validate`](Self::validate)
    /// once any overrides have been applied.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| OperatorError::config(format!("reading {}: {}", path.display(), e)))?;
        Ok(serde_yaml::from_str(&contents)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_name.is_empty() {
            return Err(OperatorError::config("node name is required"));
        }
        if self.annotation_retry.steps == 0 {
            return Err(OperatorError::config("annotation retry needs at least one step"));
        }
        self.lease.validate()
    }
}

/// Main operator that follows Service endpoints on this node
pub struct VipOperator {
    /// Kubernetes client
    client: Client,
    /// Operator configuration
    config: OperatorConfig,
}

impl VipOperator {
    /// Create a new VIP operator
    pub async fn new(config: OperatorConfig) -> Result<Self> {
        config.validate()?;
        let client = Client::try_default().await?;
        Ok(Self { client, config })
    }

    /// Run until `shutdown` is cancelled
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        tracing::info!("Starting VIP operator on node {}", self.config.node_name);

        let services: Api<Service> = match &self.config.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };

        let election = Arc::new(LeaseElection::new(
            self.client.clone(),
            self.config.node_name.clone(),
            self.config.lease.clone(),
        ));
        let annotations = Arc::new(AnnotationReconciler::new(
            KubeServiceStore::new(self.client.clone()),
            self.config.annotation_retry.clone(),
        ));

        ServiceWatcher::new(
            self.config.node_name.clone(),
            self.config.watch.clone(),
            election,
            annotations,
            KubeEndpointsSource::new(self.client.clone()),
        )
        .run(services, shutdown)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = OperatorConfig::default();
        assert_eq!(config.watch.initial_resource_version, "1");
        assert_eq!(config.annotation_retry.steps, 5);
        assert_eq!(config.lease.duration_secs, 15);
        assert!(config.namespace.is_none());
    }

    #[test]
    fn test_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "node_name: node-1\nnamespace: kube-system\nannotation_retry:\n  steps: 3\nwatch:\n  timeout_secs: 60\n"
        )
        .unwrap();

        let config = OperatorConfig::from_file(file.path()).unwrap();
        assert_eq!(config.node_name, "node-1");
        assert_eq!(config.namespace.as_deref(), Some("kube-system"));
        assert_eq!(config.annotation_retry.steps, 3);
        assert_eq!(config.annotation_retry.initial_delay_ms, 10);
        assert_eq!(config.watch.timeout_secs, 60);
        assert_eq!(config.watch.initial_resource_version, "1");
    }

    #[test]
    fn test_config_file_without_node_name_loads() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "node_name: \"\"\nnamespace: kube-system\n").unwrap();

        let config = OperatorConfig::from_file(file.path()).unwrap();
        assert!(config.node_name.is_empty());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_requires_node_name() {
        let config = OperatorConfig {
            node_name: String::new(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(OperatorError::ConfigError(_))));
    }
}
