//! Endpoint watch that reconnects transparently from the last seen resource version

use crate::backoff::{sleep_or_cancelled, Backoff, RetryPolicy};
use crate::resources::ServiceRef;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Endpoints;
use kube::{
    api::{Api, WatchParams},
    core::{ApiResource, DynamicObject, ErrorResponse, WatchEvent as RawWatchEvent},
    Client, ResourceExt,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Stream of raw events from one watch connection
pub type RawEventStream = BoxStream<'static, kube::Result<RawWatchEvent<DynamicObject>>>;

/// Change event delivered to the endpoint controller
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Added(DynamicObject),
    Modified(DynamicObject),
    Deleted,
    Error(ErrorResponse),
}

/// Watch session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Resource version the first connection starts from
    pub initial_resource_version: String,
    /// Server-side timeout for a single watch connection, in seconds
    pub timeout_secs: u32,
    /// Delay policy between reconnects after a failure
    pub reconnect: RetryPolicy,
    /// Events buffered between the session and its consumer
    pub buffer: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            initial_resource_version: "1".to_string(),
            timeout_secs: 290,
            reconnect: RetryPolicy::reconnect(),
            buffer: 16,
        }
    }
}

/// Source of watch connections for a single Service's Endpoints
#[async_trait]
pub trait WatchSource: Send + Sync + 'static {
    async fn watch(
        &self,
        service: &ServiceRef,
        resource_version: &str,
        timeout_secs: u32,
    ) -> kube::Result<RawEventStream>;
}

/// Watches `v1/Endpoints` through the Kubernetes API
#[derive(Clone)]
pub struct KubeEndpointsSource {
    client: Client,
}

impl KubeEndpointsSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl WatchSource for KubeEndpointsSource {
    async fn watch(
        &self,
        service: &ServiceRef,
        resource_version: &str,
        timeout_secs: u32,
    ) -> kube::Result<RawEventStream> {
        let resource = ApiResource::erase::<Endpoints>(&());
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), &service.namespace, &resource);
        let params = WatchParams::default()
            .fields(&service.endpoints_field_selector())
            .timeout(timeout_secs);
        let stream = api.watch(&params, resource_version).await?;
        Ok(stream.boxed())
    }
}

/// Cloneable handle that stops a [`RetryableWatchSession`] from any task
#[derive(Debug, Clone)]
pub struct WatchStopHandle {
    token: CancellationToken,
}

impl WatchStopHandle {
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Endpoint watch with automatic reconnect
pub struct RetryableWatchSession {
    events: mpsc::Receiver<WatchEvent>,
    stop: WatchStopHandle,
}

impl RetryableWatchSession {
    /// Open a watch for the Endpoints of `service` and start consuming it in the background
    pub fn open<S: WatchSource>(source: S, service: ServiceRef, config: WatchConfig) -> Self {
        let (tx, events) = mpsc::channel(config.buffer.max(1));
        let token = CancellationToken::new();

        let task = WatchTask {
            source,
            service,
            cursor: config.initial_resource_version.clone(),
            config,
            tx,
            token: token.clone(),
        };
        tokio::spawn(task.run());

        Self {
            events,
            stop: WatchStopHandle { token },
        }
    }

    /// Next event, or `None` once the session is stopped
    pub async fn next(&mut self) -> Option<WatchEvent> {
        if self.stop.is_stopped() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.stop.token.cancelled() => None,
            event = self.events.recv() => event,
        }
    }

    pub fn stop(&self) {
        self.stop.stop();
    }

    pub fn stop_handle(&self) -> WatchStopHandle {
        self.stop.clone()
    }
}

impl Drop for RetryableWatchSession {
    fn drop(&mut self) {
        self.stop.stop();
    }
}

/// How one watch connection ended
enum Disconnect {
    Closed,
    Expired,
    Failed,
    Stopped,
}

struct WatchTask<S> {
    source: S,
    service: ServiceRef,
    config: WatchConfig,
    cursor: String,
    tx: mpsc::Sender<WatchEvent>,
    token: CancellationToken,
}

impl<S: WatchSource> WatchTask<S> {
    async fn run(mut self) {
        let mut backoff = Backoff::new(self.config.reconnect.clone());

        loop {
            let connected = tokio::select! {
                _ = self.token.cancelled() => break,
                result = self.source.watch(&self.service, &self.cursor, self.config.timeout_secs) => result,
            };

            let disconnect = match connected {
                Ok(stream) => self.consume(stream, &mut backoff).await,
                Err(e) => {
                    tracing::warn!(
                        "[endpoint] unable to watch endpoints for {} from version {}: {}",
                        self.service,
                        self.cursor,
                        e
                    );
                    Disconnect::Failed
                }
            };

            match disconnect {
                Disconnect::Stopped => break,
                Disconnect::Closed => {
                    tracing::debug!(
                        "[endpoint] watch for {} closed, resuming from version {}",
                        self.service,
                        self.cursor
                    );
                }
                Disconnect::Expired | Disconnect::Failed => {
                    let delay = backoff.next_delay();
                    tracing::debug!("[endpoint] reconnecting watch for {} in {:?}", self.service, delay);
                    if sleep_or_cancelled(delay, &self.token).await {
                        break;
                    }
                }
            }
        }

        tracing::debug!("[endpoint] watch session for {} stopped", self.service);
    }

    async fn consume(&mut self, mut stream: RawEventStream, backoff: &mut Backoff) -> Disconnect {
        loop {
            let item = tokio::select! {
                _ = self.token.cancelled() => return Disconnect::Stopped,
                item = stream.next() => item,
            };

            let event = match item {
                None => return Disconnect::Closed,
                Some(Err(e)) => {
                    tracing::warn!("[endpoint] watch stream for {} failed: {}", self.service, e);
                    return Disconnect::Failed;
                }
                Some(Ok(event)) => event,
            };

            let event = match event {
                RawWatchEvent::Added(object) => {
                    self.advance(&object);
                    WatchEvent::Added(object)
                }
                RawWatchEvent::Modified(object) => {
                    self.advance(&object);
                    WatchEvent::Modified(object)
                }
                RawWatchEvent::Deleted(object) => {
                    self.advance(&object);
                    WatchEvent::Deleted
                }
                RawWatchEvent::Bookmark(bookmark) => {
                    self.cursor = bookmark.metadata.resource_version;
                    continue;
                }
                RawWatchEvent::Error(response) => WatchEvent::Error(response),
            };
            let expired = matches!(&event, WatchEvent::Error(response) if response.code == 410);
            let progressed = !matches!(event, WatchEvent::Error(_));

            if !self.emit(event).await {
                return Disconnect::Stopped;
            }
            if progressed {
                backoff.reset();
            }
            if expired {
                tracing::info!(
                    "[endpoint] resource version {} expired for {}, restarting watch",
                    self.cursor,
                    self.service
                );
                self.cursor = self.config.initial_resource_version.clone();
                return Disconnect::Expired;
            }
        }
    }

    fn advance(&mut self, object: &DynamicObject) {
        if let Some(version) = object.resource_version() {
            self.cursor = version;
        }
    }

    async fn emit(&self, event: WatchEvent) -> bool {
        tokio::select! {
            _ = self.token.cancelled() => false,
            sent = self.tx.send(event) => sent.is_ok(),
        }
    }
}
