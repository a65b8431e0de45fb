//! Lifecycle of the per-service leader election task

use crate::{error::Result, resources::ServiceRef};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;

/// Leader election protocol for a single Service's VIP.
///
/// `run` blocks for as long as this node takes part in the election and must
/// return promptly once `token` is cancelled.
#[async_trait]
pub trait LeaderElection: Send + Sync + 'static {
    async fn run(&self, service: &Service, token: CancellationToken) -> Result<()>;
}

/// Starts and stops the election task of one Service, keeping at most one alive
pub struct ElectionLifecycleManager<E> {
    election: Arc<E>,
    service: Arc<Service>,
    key: ServiceRef,
    running: Mutex<Option<RunningElection>>,
    epochs: AtomicU64,
}

struct RunningElection {
    epoch: u64,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl<E: LeaderElection> ElectionLifecycleManager<E> {
    pub fn new(election: Arc<E>, service: Arc<Service>) -> Self {
        let key = ServiceRef::from_service(&service);
        Self {
            election,
            service,
            key,
            running: Mutex::new(None),
            epochs: AtomicU64::new(0),
        }
    }

    /// Start an election under a fresh token unless one is already running.
    /// Returns true when a new task was started.
    pub async fn ensure_running(&self) -> bool {
        let mut running = self.running.lock().await;

        if let Some(current) = running.as_mut() {
            if !current.handle.is_finished() {
                return false;
            }
            // Only a panic ends the task without cancellation
            if let Err(e) = (&mut current.handle).await {
                tracing::error!("[election] epoch {} for {} aborted: {}", current.epoch, self.key, e);
            }
        }

        let epoch = self.epochs.fetch_add(1, Ordering::SeqCst) + 1;
        let token = CancellationToken::new();
        let handle = tokio::spawn(supervise(
            self.election.clone(),
            self.service.clone(),
            self.key.clone(),
            epoch,
            token.clone(),
        ));
        tracing::info!("[election] starting epoch {} for {}", epoch, self.key);

        *running = Some(RunningElection {
            epoch,
            token,
            handle,
        });
        true
    }

    /// Cancel the running election and wait for it to exit. No-op when idle.
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;

        if let Some(current) = running.as_mut() {
            current.token.cancel();
            if let Err(e) = (&mut current.handle).await {
                if e.is_panic() {
                    tracing::error!("[election] epoch {} for {} panicked: {}", current.epoch, self.key, e);
                }
            }
            tracing::info!("[election] stopped epoch {} for {}", current.epoch, self.key);
        }

        *running = None;
    }

    /// Whether an election task is currently alive
    pub async fn is_active(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|current| !current.handle.is_finished())
    }

    /// Epoch of the running election, if any
    pub async fn current_epoch(&self) -> Option<u64> {
        self.running.lock().await.as_ref().map(|current| current.epoch)
    }
}

async fn supervise<E: LeaderElection>(
    election: Arc<E>,
    service: Arc<Service>,
    key: ServiceRef,
    epoch: u64,
    token: CancellationToken,
) {
    while !token.is_cancelled() {
        let result = election.run(&service, token.clone()).await;
        if token.is_cancelled() {
            break;
        }

        match result {
            Ok(()) => tracing::warn!(
                "[election] epoch {} for {} returned before cancellation, restarting",
                epoch,
                key
            ),
            Err(e) => tracing::error!("[election] epoch {} for {} failed, restarting: {}", epoch, key, e),
        }
        tokio::task::yield_now().await;
    }

    tracing::debug!("[election] epoch {} for {} exited", epoch, key);
}
