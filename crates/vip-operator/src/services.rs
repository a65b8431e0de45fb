//! Discovery of Services whose VIP follows local endpoints

use crate::{
    annotations::{AnnotationReconciler, ServiceStore},
    controller::EndpointWatchController,
    election::LeaderElection,
    error::Result,
    resources::ServiceRef,
    watch::{RetryableWatchSession, WatchConfig, WatchSource},
};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Service;
use kube::{
    api::Api,
    runtime::{watcher, WatchStreamExt},
};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Only LoadBalancer Services with a local traffic policy follow their endpoints
pub fn is_endpoint_tracked(service: &Service) -> bool {
    service.spec.as_ref().is_some_and(|spec| {
        spec.type_.as_deref() == Some("LoadBalancer")
            && spec.external_traffic_policy.as_deref() == Some("Local")
    })
}

struct TrackedController {
    token: CancellationToken,
    handle: JoinHandle<Result<()>>,
}

/// Spawns one endpoint controller per tracked Service
pub struct ServiceWatcher<E, S, W> {
    node_name: String,
    watch_config: WatchConfig,
    election: Arc<E>,
    annotations: Arc<AnnotationReconciler<S>>,
    source: W,
    controllers: BTreeMap<ServiceRef, TrackedController>,
}

impl<E, S, W> ServiceWatcher<E, S, W>
where
    E: LeaderElection,
    S: ServiceStore,
    W: WatchSource + Clone,
{
    pub fn new(
        node_name: impl Into<String>,
        watch_config: WatchConfig,
        election: Arc<E>,
        annotations: Arc<AnnotationReconciler<S>>,
        source: W,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            watch_config,
            election,
            annotations,
            source,
            controllers: BTreeMap::new(),
        }
    }

    /// Services with a running endpoint controller
    pub fn tracked(&self) -> Vec<ServiceRef> {
        self.controllers.keys().cloned().collect()
    }

    /// Follow Services from `api` until `shutdown` fires
    pub async fn run(mut self, api: Api<Service>, shutdown: CancellationToken) -> Result<()> {
        tracing::info!("Watching services for node {}", self.node_name);
        let mut events = watcher(api, watcher::Config::default())
            .default_backoff()
            .boxed();

        loop {
            let event = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                event = events.next() => event,
            };

            match event {
                Some(Ok(event)) => self.apply(event, &shutdown).await,
                Some(Err(e)) => tracing::warn!("Service watch error: {}", e),
                None => break,
            }
            self.reap().await;
        }

        self.stop_all().await;
        tracing::info!("Stopped watching services");
        Ok(())
    }

    /// Update the set of endpoint controllers for one watcher event
    pub async fn apply(&mut self, event: watcher::Event<Service>, shutdown: &CancellationToken) {
        match event {
            watcher::Event::Applied(service) => self.observe(service, shutdown).await,
            watcher::Event::Deleted(service) => {
                self.forget(&ServiceRef::from_service(&service)).await
            }
            watcher::Event::Restarted(services) => {
                let seen: HashSet<ServiceRef> = services.iter().map(ServiceRef::from_service).collect();
                let stale: Vec<ServiceRef> = self
                    .controllers
                    .keys()
                    .filter(|key| !seen.contains(*key))
                    .cloned()
                    .collect();
                for key in stale {
                    self.forget(&key).await;
                }
                for service in services {
                    self.observe(service, shutdown).await;
                }
            }
        }
    }

    async fn observe(&mut self, service: Service, shutdown: &CancellationToken) {
        let key = ServiceRef::from_service(&service);
        let tracked = is_endpoint_tracked(&service);

        match (tracked, self.controllers.contains_key(&key)) {
            (true, false) => self.spawn(key, service, shutdown),
            (false, true) => self.forget(&key).await,
            _ => {}
        }
    }

    fn spawn(&mut self, key: ServiceRef, service: Service, shutdown: &CancellationToken) {
        let token = shutdown.child_token();
        let session =
            RetryableWatchSession::open(self.source.clone(), key.clone(), self.watch_config.clone());
        let controller = EndpointWatchController::new(
            self.node_name.clone(),
            service,
            self.election.clone(),
            self.annotations.clone(),
        );
        let handle = tokio::spawn(controller.run(session, token.clone()));

        tracing::info!("Tracking endpoints of service {}", key);
        self.controllers.insert(key, TrackedController { token, handle });
    }

    /// Cancel a Service's controller and wait for its election to stop
    async fn forget(&mut self, key: &ServiceRef) {
        if let Some(tracked) = self.controllers.remove(key) {
            tracing::info!("No longer tracking endpoints of service {}", key);
            tracked.token.cancel();
            Self::join(key, tracked.handle).await;
        }
    }

    async fn reap(&mut self) {
        let finished: Vec<ServiceRef> = self
            .controllers
            .iter()
            .filter(|(_, tracked)| tracked.handle.is_finished())
            .map(|(key, _)| key.clone())
            .collect();

        for key in finished {
            if let Some(tracked) = self.controllers.remove(&key) {
                Self::join(&key, tracked.handle).await;
            }
        }
    }

    async fn stop_all(&mut self) {
        for tracked in self.controllers.values() {
            tracked.token.cancel();
        }
        for (key, tracked) in std::mem::take(&mut self.controllers) {
            Self::join(&key, tracked.handle).await;
        }
    }

    async fn join(key: &ServiceRef, handle: JoinHandle<Result<()>>) {
        match handle.await {
            Ok(Ok(())) => tracing::debug!("Endpoint controller for {} finished", key),
            Ok(Err(e)) => tracing::error!("Endpoint controller for {} failed: {}", key, e),
            Err(e) => tracing::error!("Endpoint controller for {} aborted: {}", key, e),
        }
    }
}
