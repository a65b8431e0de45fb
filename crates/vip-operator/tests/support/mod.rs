//! In-memory stand-ins for the Kubernetes API and the election protocol
#![allow(dead_code)]

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::{DynamicObject, ErrorResponse, WatchEvent as RawWatchEvent};
use kube::ResourceExt;
use serde_json::json;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use vip_operator::{
    backoff::RetryPolicy, resources::EGRESS_ANNOTATION, watch::RawEventStream,
    AnnotationReconciler, LeaderElection, OperatorError, Result, ServiceRef, ServiceStore,
    WatchConfig, WatchSource,
};

/// Feeds raw events into one scripted watch connection
pub type RawEventSender = mpsc::UnboundedSender<kube::Result<RawWatchEvent<DynamicObject>>>;

pub fn api_error(code: u16, reason: &str) -> kube::Error {
    kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{} from test", reason),
        reason: reason.to_string(),
        code,
    })
}

/// Endpoints object as delivered by a watch, one address per `(ip, node)` pair
pub fn endpoints(version: &str, addresses: &[(&str, Option<&str>)]) -> DynamicObject {
    let addresses: Vec<serde_json::Value> = addresses
        .iter()
        .map(|(ip, node)| match node {
            Some(node) => json!({ "ip": ip, "nodeName": node }),
            None => json!({ "ip": ip }),
        })
        .collect();
    serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Endpoints",
        "metadata": { "name": "web", "namespace": "default", "resourceVersion": version },
        "subsets": [{ "addresses": addresses }]
    }))
    .unwrap()
}

/// An object the controller must refuse to treat as Endpoints
pub fn not_endpoints() -> DynamicObject {
    serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": { "name": "web", "namespace": "default", "resourceVersion": "9" },
        "data": { "key": "value" }
    }))
    .unwrap()
}

pub fn service(egress: bool) -> Service {
    let mut annotations = BTreeMap::new();
    if egress {
        annotations.insert(EGRESS_ANNOTATION.to_string(), "true".to_string());
    }
    Service {
        metadata: ObjectMeta {
            name: Some("web".to_string()),
            namespace: Some("default".to_string()),
            resource_version: Some("1".to_string()),
            annotations: Some(annotations),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn service_ref() -> ServiceRef {
    ServiceRef::new("default", "web")
}

pub fn fast_watch_config() -> WatchConfig {
    WatchConfig {
        reconnect: RetryPolicy {
            steps: u32::MAX,
            initial_delay_ms: 1,
            factor: 1.0,
            jitter: 0.0,
            max_delay_ms: 1,
        },
        ..Default::default()
    }
}

pub fn fast_retry(steps: u32) -> RetryPolicy {
    RetryPolicy {
        steps,
        initial_delay_ms: 1,
        factor: 2.0,
        jitter: 0.0,
        max_delay_ms: 5,
    }
}

/// Poll `check` until it holds or a few seconds pass
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

enum Connection {
    Open(mpsc::UnboundedReceiver<kube::Result<RawWatchEvent<DynamicObject>>>),
    Fail(kube::Error),
}

#[derive(Default)]
struct SourceState {
    connections: VecDeque<Connection>,
    cursors: Vec<String>,
}

/// Watch source whose connections are scripted by the test
#[derive(Clone, Default)]
pub struct ScriptedSource {
    state: Arc<Mutex<SourceState>>,
}

impl ScriptedSource {
    /// Queue a connection; events sent on the returned sender reach the session
    pub fn connection(&self) -> RawEventSender {
        let (tx, rx) = mpsc::unbounded();
        self.state
            .lock()
            .unwrap()
            .connections
            .push_back(Connection::Open(rx));
        tx
    }

    /// Queue a connection attempt that fails
    pub fn failure(&self, error: kube::Error) {
        self.state
            .lock()
            .unwrap()
            .connections
            .push_back(Connection::Fail(error));
    }

    /// Resource versions every connection attempt started from
    pub fn cursors(&self) -> Vec<String> {
        self.state.lock().unwrap().cursors.clone()
    }
}

#[async_trait]
impl WatchSource for ScriptedSource {
    async fn watch(
        &self,
        _service: &ServiceRef,
        resource_version: &str,
        _timeout_secs: u32,
    ) -> kube::Result<RawEventStream> {
        let next = {
            let mut state = self.state.lock().unwrap();
            state.cursors.push(resource_version.to_string());
            state.connections.pop_front()
        };
        match next {
            Some(Connection::Open(rx)) => Ok(rx.boxed()),
            Some(Connection::Fail(e)) => Err(e),
            None => Ok(futures::stream::pending().boxed()),
        }
    }
}

/// Election that runs until cancelled, counting live instances
#[derive(Default)]
pub struct FakeElection {
    pub starts: AtomicUsize,
    pub live: AtomicUsize,
    pub max_live: AtomicUsize,
    pub failures: AtomicUsize,
    pub tokens: Mutex<Vec<CancellationToken>>,
}

impl FakeElection {
    pub fn failing(times: usize) -> Self {
        let election = Self::default();
        election.failures.store(times, Ordering::SeqCst);
        election
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn max_live(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }

    pub fn tokens(&self) -> Vec<CancellationToken> {
        self.tokens.lock().unwrap().clone()
    }
}

#[async_trait]
impl LeaderElection for FakeElection {
    async fn run(&self, _service: &Service, token: CancellationToken) -> Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.tokens.lock().unwrap().push(token.clone());

        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_live.fetch_max(live, Ordering::SeqCst);

        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if !failed {
            token.cancelled().await;
        }

        self.live.fetch_sub(1, Ordering::SeqCst);
        if failed {
            Err(OperatorError::election("injected failure"))
        } else {
            Ok(())
        }
    }
}

#[derive(Default)]
struct StoreState {
    service: Option<Service>,
    version: u64,
}

/// Service store with resource-version checks and injectable conflicts
#[derive(Default)]
pub struct FakeStore {
    state: Mutex<StoreState>,
    pub conflicts: AtomicUsize,
    pub stalled: AtomicBool,
    pub gets: AtomicUsize,
    pub writes: AtomicUsize,
}

impl FakeStore {
    pub fn with(service: Service) -> Self {
        let store = Self::default();
        {
            let mut state = store.state.lock().unwrap();
            state.version = 1;
            let mut service = service;
            service.metadata.resource_version = Some("1".to_string());
            state.service = Some(service);
        }
        store
    }

    /// Make the next `n` writes lose a race against another writer
    pub fn conflict_next(self, n: usize) -> Self {
        self.conflicts.store(n, Ordering::SeqCst);
        self
    }

    /// Make every read hang, as against an unresponsive API server
    pub fn stall(self) -> Self {
        self.stalled.store(true, Ordering::SeqCst);
        self
    }

    pub fn stored(&self) -> Option<Service> {
        self.state.lock().unwrap().service.clone()
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ServiceStore for FakeStore {
    async fn get(&self, service: &ServiceRef) -> Result<Service> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        if self.stalled.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }
        self.state
            .lock()
            .unwrap()
            .service
            .clone()
            .ok_or_else(|| api_error(404, &format!("NotFound {}", service)).into())
    }

    async fn replace(&self, service: &Service) -> Result<Service> {
        let mut state = self.state.lock().unwrap();
        if state.service.is_none() {
            return Err(api_error(404, "NotFound").into());
        }

        let injected = self
            .conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            // Someone else wrote first
            state.version += 1;
            let version = state.version.to_string();
            if let Some(stored) = state.service.as_mut() {
                stored.metadata.resource_version = Some(version);
            }
        }

        let current = state.version.to_string();
        if service.resource_version().as_deref() != Some(current.as_str()) {
            return Err(api_error(409, "Conflict").into());
        }

        state.version += 1;
        let mut stored = service.clone();
        stored.metadata.resource_version = Some(state.version.to_string());
        state.service = Some(stored.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(stored)
    }
}

pub fn reconciler(store: FakeStore) -> Arc<AnnotationReconciler<FakeStore>> {
    Arc::new(AnnotationReconciler::new(store, fast_retry(5)))
}
