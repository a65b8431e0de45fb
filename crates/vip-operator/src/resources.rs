//! Identifiers and annotations for the cluster resources the operator touches

use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;
use std::fmt;

/// Service flag that enables egress handling for the VIP
pub const EGRESS_ANNOTATION: &str = "kube-vip.io/egress";

/// Address of the local endpoint currently backing the VIP
pub const ACTIVE_ENDPOINT_ANNOTATION: &str = "kube-vip.io/active-endpoint";

/// Namespaced name of a Service
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceRef {
    pub namespace: String,
    pub name: String,
}

impl ServiceRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn from_service(service: &Service) -> Self {
        Self::new(service.namespace().unwrap_or_default(), service.name_any())
    }

    /// Field selector matching the Endpoints object that shares this Service's name
    pub fn endpoints_field_selector(&self) -> String {
        format!("metadata.name={}", self.name)
    }
}

impl fmt::Display for ServiceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Whether the Service asks for the active endpoint to be recorded
pub fn egress_enabled(service: &Service) -> bool {
    service
        .annotations()
        .get(EGRESS_ANNOTATION)
        .is_some_and(|value| value == "true")
}

/// Currently recorded active endpoint, if any
pub fn active_endpoint(service: &Service) -> Option<&str> {
    service
        .annotations()
        .get(ACTIVE_ENDPOINT_ANNOTATION)
        .map(String::as_str)
}
