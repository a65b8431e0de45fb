//! Endpoint watch controller: local endpoint presence drives the VIP election

use crate::{
    annotations::{AnnotationReconciler, ServiceStore},
    election::{ElectionLifecycleManager, LeaderElection},
    error::Result,
    resolver::{resolve, select_endpoint},
    resources::{egress_enabled, ServiceRef},
    snapshot::EndpointSnapshot,
    watch::{RetryableWatchSession, WatchEvent},
};
use k8s_openapi::api::core::v1::Service;
use kube::core::DynamicObject;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Controller phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerPhase {
    /// No local endpoint is tracked
    Idle,
    /// A local endpoint is tracked and its election is running
    Active,
    /// Watch ended, everything is being torn down
    Draining,
}

/// Mutable per-service state, owned by the event loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerState {
    pub phase: ControllerPhase,
    pub last_known_good: Option<String>,
    pub election_active: bool,
}

impl Default for ControllerState {
    fn default() -> Self {
        Self {
            phase: ControllerPhase::Idle,
            last_known_good: None,
            election_active: false,
        }
    }
}

/// Whether the event loop keeps going after an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

/// Watches one Service's endpoints and runs its election while a local endpoint exists
pub struct EndpointWatchController<E, S> {
    node_name: String,
    service: Arc<Service>,
    key: ServiceRef,
    elections: ElectionLifecycleManager<E>,
    annotations: Arc<AnnotationReconciler<S>>,
    state: ControllerState,
}

impl<E: LeaderElection, S: ServiceStore> EndpointWatchController<E, S> {
    pub fn new(
        node_name: impl Into<String>,
        service: Service,
        election: Arc<E>,
        annotations: Arc<AnnotationReconciler<S>>,
    ) -> Self {
        let service = Arc::new(service);
        Self {
            node_name: node_name.into(),
            key: ServiceRef::from_service(&service),
            elections: ElectionLifecycleManager::new(election, service.clone()),
            service,
            annotations,
            state: ControllerState::default(),
        }
    }

    pub fn service(&self) -> &ServiceRef {
        &self.key
    }

    pub fn state(&self) -> &ControllerState {
        &self.state
    }

    pub fn elections(&self) -> &ElectionLifecycleManager<E> {
        &self.elections
    }

    /// Consume `session` until the Endpoints are deleted, `shutdown` fires,
    /// the stream ends or an event cannot be decoded.
    pub async fn run(
        mut self,
        mut session: RetryableWatchSession,
        shutdown: CancellationToken,
    ) -> Result<()> {
        tracing::info!(
            "[endpoint] watching for service [{}] in namespace [{}]",
            self.key.name,
            self.key.namespace
        );

        // Either trigger stops the watch; the token tolerates both firing
        let exit = CancellationToken::new();
        let supervisor = {
            let shutdown = shutdown.clone();
            let exit = exit.clone();
            let stop = session.stop_handle();
            tokio::spawn(async move {
                tokio::select! {
                    _ = shutdown.cancelled() => tracing::debug!("[endpoint] shutdown called"),
                    _ = exit.cancelled() => tracing::debug!("[endpoint] function ending"),
                }
                stop.stop();
            })
        };
        let exit_guard = exit.drop_guard();

        let result = loop {
            let event = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break Ok(()),
                event = session.next() => event,
            };
            let Some(event) = event else {
                tracing::info!("[endpoints] watch stream for {} closed", self.key);
                break Ok(());
            };

            let outcome = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break Ok(()),
                outcome = self.handle_event(event) => outcome,
            };
            match outcome {
                Ok(Flow::Continue) => {}
                Ok(Flow::Exit) => break Ok(()),
                Err(e) => {
                    tracing::error!("[endpoint] stopping watch for {}: {}", self.key, e);
                    break Err(e);
                }
            }
        };

        self.drain().await;
        session.stop();
        drop(exit_guard);
        if let Err(e) = supervisor.await {
            tracing::warn!("[endpoint] watch supervisor for {} failed: {}", self.key, e);
        }

        tracing::info!(
            "[endpoints] stopping watching for [{}] in namespace [{}]",
            self.key.name,
            self.key.namespace
        );
        result
    }

    /// Apply one watch event to the controller state
    pub async fn handle_event(&mut self, event: WatchEvent) -> Result<Flow> {
        match event {
            WatchEvent::Added(object) | WatchEvent::Modified(object) => {
                self.on_endpoints(object).await?;
                Ok(Flow::Continue)
            }
            WatchEvent::Deleted => {
                tracing::info!(
                    "[endpoints] deleted stopping watching for [{}] in namespace [{}]",
                    self.key.name,
                    self.key.namespace
                );
                Ok(Flow::Exit)
            }
            WatchEvent::Error(cause) => {
                tracing::error!("endpoint -> {} ({}): {}", cause.reason, cause.code, cause.message);
                Ok(Flow::Continue)
            }
        }
    }

    async fn on_endpoints(&mut self, object: DynamicObject) -> Result<()> {
        let snapshot = EndpointSnapshot::try_from(object)?;
        let local = resolve(&snapshot, &self.node_name);
        self.state.election_active = self.elections.is_active().await;
        tracing::debug!(
            "[endpoint watcher] local endpoint(s) [{}], last known good [{}], active election [{}]",
            local.len(),
            self.state.last_known_good.as_deref().unwrap_or_default(),
            self.state.election_active
        );

        match self.state.last_known_good.clone() {
            None => {
                let Some(endpoint) = select_endpoint(&local).cloned() else {
                    return Ok(());
                };
                self.activate(endpoint).await;
            }
            Some(tracked) if local.is_empty() => {
                tracing::info!(
                    "[endpoint] no local endpoints left for {} (was {}), stopping election",
                    self.key,
                    tracked
                );
                self.deactivate().await;
            }
            Some(tracked) if !local.contains(&tracked) => {
                tracing::info!(
                    "[endpoint] tracked endpoint {} for {} is gone, restarting election",
                    tracked,
                    self.key
                );
                self.deactivate().await;
            }
            Some(tracked) if !self.state.election_active => {
                tracing::warn!(
                    "[endpoint] election for {} on {} is no longer running, restarting it",
                    self.key,
                    tracked
                );
                self.elections.ensure_running().await;
                self.state.election_active = self.elections.is_active().await;
            }
            Some(_) => {}
        }

        Ok(())
    }

    async fn activate(&mut self, endpoint: String) {
        tracing::info!("[endpoint] local endpoint {} selected for {}", endpoint, self.key);
        self.state.last_known_good = Some(endpoint.clone());

        if egress_enabled(&self.service) {
            if let Err(e) = self
                .annotations
                .set_active_endpoint(&self.key, &endpoint)
                .await
            {
                tracing::error!("Failed to set Services: {}", e);
            }
        }

        self.elections.ensure_running().await;
        self.state.election_active = self.elections.is_active().await;
        self.state.phase = ControllerPhase::Active;
    }

    async fn deactivate(&mut self) {
        self.state.last_known_good = None;
        self.elections.stop().await;
        self.state.election_active = false;
        self.state.phase = ControllerPhase::Idle;
    }

    async fn drain(&mut self) {
        self.state.phase = ControllerPhase::Draining;
        self.elections.stop().await;
        self.state.election_active = false;
        self.state.last_known_good = None;
    }
}
