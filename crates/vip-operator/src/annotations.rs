//! Persistence of the active-endpoint annotation on Services

use crate::{
    backoff::{Backoff, RetryPolicy},
    error::{OperatorError, Result},
    resources::{active_endpoint, ServiceRef, ACTIVE_ENDPOINT_ANNOTATION},
};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use kube::{
    api::{Api, PostParams},
    client::Client,
    ResourceExt,
};

/// Read/write access to stored Service objects
#[async_trait]
pub trait ServiceStore: Send + Sync + 'static {
    async fn get(&self, service: &ServiceRef) -> Result<Service>;

    /// Replace the stored object; fails with a 409 if its resource version is stale
    async fn replace(&self, service: &Service) -> Result<Service>;
}

/// Service store backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeServiceStore {
    client: Client,
}

impl KubeServiceStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ServiceStore for KubeServiceStore {
    async fn get(&self, service: &ServiceRef) -> Result<Service> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), &service.namespace);
        Ok(api.get(&service.name).await?)
    }

    async fn replace(&self, service: &Service) -> Result<Service> {
        let namespace = service.namespace().unwrap_or_default();
        let api: Api<Service> = Api::namespaced(self.client.clone(), &namespace);
        Ok(api
            .replace(&service.name_any(), &PostParams::default(), service)
            .await?)
    }
}

/// Writes the active-endpoint annotation with optimistic-concurrency retries
pub struct AnnotationReconciler<S> {
    store: S,
    policy: RetryPolicy,
}

impl<S: ServiceStore> AnnotationReconciler<S> {
    pub fn new(store: S, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Record `address` as the Service's active endpoint
    pub async fn set_active_endpoint(&self, service: &ServiceRef, address: &str) -> Result<()> {
        let attempts = self.policy.steps.max(1);
        let mut backoff = Backoff::new(self.policy.clone());

        for attempt in 1..=attempts {
            match self.try_set(service, address).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_conflict() => {
                    tracing::debug!(
                        "Conflict updating Service {} (attempt {}/{})",
                        service,
                        attempt,
                        attempts
                    );
                    if attempt < attempts {
                        tokio::time::sleep(backoff.next_delay()).await;
                    }
                }
                Err(e) => {
                    tracing::error!("Error updating Service {}: {}", service, e);
                    return Err(e);
                }
            }
        }

        tracing::error!("Failed to set active endpoint on Service {}: retries exhausted", service);
        Err(OperatorError::AnnotationConflict {
            service: service.to_string(),
            attempts,
        })
    }

    async fn try_set(&self, service: &ServiceRef, address: &str) -> Result<()> {
        let current = self.store.get(service).await?;
        if active_endpoint(&current) == Some(address) {
            tracing::debug!("Service {} already has active endpoint {}", service, address);
            return Ok(());
        }

        let mut updated = current.clone();
        updated
            .annotations_mut()
            .insert(ACTIVE_ENDPOINT_ANNOTATION.to_string(), address.to_string());
        self.store.replace(&updated).await?;

        tracing::info!("Set active endpoint of Service {} to {}", service, address);
        Ok(())
    }
}
