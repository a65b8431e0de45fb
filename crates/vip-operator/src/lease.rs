//! Lease-based leader election used by the binary

use crate::{
    backoff::sleep_or_cancelled,
    election::LeaderElection,
    error::{OperatorError, Result},
    resources::ServiceRef,
};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use kube::client::Client;
use kube_lease_manager::{LeaseManager, LeaseManagerBuilder, LeaseManagerError};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Lease timing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// How long a lease stays valid after its last renewal
    pub duration_secs: u64,
    /// How early before expiry the holder renews; doubles as tolerated clock skew
    pub grace_secs: u64,
    /// Pause before rejoining after the lease manager failed
    pub retry_period_secs: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            duration_secs: 15,
            grace_secs: 5,
            retry_period_secs: 2,
        }
    }
}

impl LeaseConfig {
    pub fn validate(&self) -> Result<()> {
        if self.duration_secs == 0 {
            return Err(OperatorError::config("lease duration must be positive"));
        }
        if self.grace_secs >= self.duration_secs {
            return Err(OperatorError::config("lease grace must be shorter than its duration"));
        }
        Ok(())
    }
}

/// Name of the Lease guarding a Service's VIP
pub fn lease_name(service: &ServiceRef) -> String {
    format!("kubevip-{}", service.name)
}

fn lease_error(e: LeaseManagerError) -> OperatorError {
    OperatorError::election(e.to_string())
}

/// Leader election over a `coordination.k8s.io/v1` Lease per Service
pub struct LeaseElection {
    client: Client,
    identity: String,
    config: LeaseConfig,
}

impl LeaseElection {
    pub fn new(client: Client, identity: impl Into<String>, config: LeaseConfig) -> Self {
        Self {
            client,
            identity: identity.into(),
            config,
        }
    }

    async fn manager(&self, key: &ServiceRef, name: &str) -> Result<LeaseManager> {
        LeaseManagerBuilder::new(self.client.clone(), name)
            .with_namespace(&key.namespace)
            .with_identity(&self.identity)
            .with_duration(self.config.duration_secs)
            .with_grace(self.config.grace_secs)
            .build()
            .await
            .map_err(lease_error)
    }

    /// Hold the election until `token` fires or the lease manager fails
    async fn contend(&self, key: &ServiceRef, name: &str, token: &CancellationToken) -> Result<()> {
        let manager = self.manager(key, name).await?;
        let (mut channel, task) = manager.watch().await;
        let mut leading = false;

        let cancelled = loop {
            tokio::select! {
                _ = token.cancelled() => break true,
                changed = channel.changed() => {
                    if changed.is_err() {
                        break false;
                    }
                }
            }

            let locked = *channel.borrow_and_update();
            if locked != leading {
                leading = locked;
                if leading {
                    tracing::info!("[{}] node {} is now leading the VIP for {}", name, self.identity, key);
                } else {
                    tracing::warn!("[{}] node {} lost the lease for {}", name, self.identity, key);
                }
            }
        };

        // Closing the channel ends the manager's background task
        drop(channel);
        let manager = task
            .await
            .map_err(|e| OperatorError::election(format!("lease task for {}: {}", key, e)))?
            .map_err(lease_error)?;

        if !cancelled {
            return Err(OperatorError::election(format!("lease manager for {} stopped", key)));
        }
        if leading {
            manager.release().await.map_err(lease_error)?;
            tracing::info!("[{}] released lease for {}", name, key);
        }
        Ok(())
    }
}

#[async_trait]
impl LeaderElection for LeaseElection {
    async fn run(&self, service: &Service, token: CancellationToken) -> Result<()> {
        let key = ServiceRef::from_service(service);
        let name = lease_name(&key);
        let period = Duration::from_secs(self.config.retry_period_secs);

        loop {
            match self.contend(&key, &name, &token).await {
                Ok(()) => break,
                Err(e) => tracing::warn!("[{}] lease election for {} interrupted: {}", name, key, e),
            }
            if sleep_or_cancelled(period, &token).await {
                break;
            }
        }
        Ok(())
    }
}
