//! Point-in-time view of a Service's backend endpoints

use crate::error::{OperatorError, Result};
use k8s_openapi::api::core::v1::Endpoints;
use kube::core::DynamicObject;
use kube::ResourceExt;

/// A backend address and the node hosting it, if known
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointAddress {
    pub ip: String,
    pub node_name: Option<String>,
}

/// Ready addresses of one Endpoints object, in subset then address order
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EndpointSnapshot {
    pub name: String,
    pub namespace: String,
    pub resource_version: Option<String>,
    pub addresses: Vec<EndpointAddress>,
}

impl From<&Endpoints> for EndpointSnapshot {
    fn from(endpoints: &Endpoints) -> Self {
        let addresses = endpoints
            .subsets
            .iter()
            .flatten()
            .flat_map(|subset| subset.addresses.iter().flatten())
            .map(|address| EndpointAddress {
                ip: address.ip.clone(),
                node_name: address.node_name.clone(),
            })
            .collect();

        Self {
            name: endpoints.name_any(),
            namespace: endpoints.namespace().unwrap_or_default(),
            resource_version: endpoints.resource_version(),
            addresses,
        }
    }
}

impl TryFrom<DynamicObject> for EndpointSnapshot {
    type Error = OperatorError;

    fn try_from(object: DynamicObject) -> Result<Self> {
        let kind = object
            .types
            .as_ref()
            .map(|types| types.kind.clone())
            .unwrap_or_default();
        let value =
            serde_json::to_value(object).map_err(|e| OperatorError::decode(e.to_string()))?;
        let endpoints: Endpoints = serde_json::from_value(value).map_err(|e| {
            OperatorError::decode(format!("object of kind {:?} is not Endpoints: {}", kind, e))
        })?;
        Ok(Self::from(&endpoints))
    }
}
