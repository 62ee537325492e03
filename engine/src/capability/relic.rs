//! Relic adapter: HTTP POST into a long-running service endpoint.
//!
//! 5xx and network failures are transient; 4xx is not. The response body is
//! returned as JSON when it parses, as a string otherwise.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::action::ActionKind;

use super::{CapabilityAdapter, CapabilityError, CapabilityRequest};

/// Relic name to endpoint URL, from the deployment environment.
#[derive(Clone, Debug, Default)]
pub struct RelicRoutes {
    routes: HashMap<String, String>,
}

impl RelicRoutes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_route(mut self, name: impl Into<String>, url: impl Into<String>) -> Self {
        self.routes.insert(name.into(), url.into());
        self
    }

    pub fn url_for(&self, name: &str) -> Option<&str> {
        self.routes.get(name).map(String::as_str)
    }
}

pub struct RelicAdapter {
    routes: RelicRoutes,
    client: reqwest::Client,
}

impl RelicAdapter {
    pub fn new(routes: RelicRoutes) -> Self {
        Self {
            routes,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl CapabilityAdapter for RelicAdapter {
    fn kind(&self) -> ActionKind {
        ActionKind::Relic
    }

    async fn invoke(&self, req: CapabilityRequest<'_>) -> Result<Value, CapabilityError> {
        let Some(url) = self.routes.url_for(req.name) else {
            return Err(CapabilityError::permanent(format!(
                "no endpoint registered for relic '{}'",
                req.name
            )));
        };
        let send = self.client.post(url).json(&req.parameters).send();
        let response = tokio::select! {
            _ = req.cancel.cancelled() => {
                return Err(CapabilityError::permanent("relic call cancelled"));
            }
            r = send => r.map_err(|e| CapabilityError::transient(format!("relic '{}': {e}", req.name)))?,
        };
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| CapabilityError::transient(format!("relic '{}' body: {e}", req.name)))?;
        if status.is_server_error() {
            return Err(CapabilityError::transient(format!(
                "relic '{}' returned {status}: {text}",
                req.name
            )));
        }
        if !status.is_success() {
            return Err(CapabilityError::permanent(format!(
                "relic '{}' returned {status}: {text}",
                req.name
            )));
        }
        Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_lookup() {
        let routes = RelicRoutes::new().with_route("kv", "http://localhost:7700/exec");
        assert_eq!(routes.url_for("kv"), Some("http://localhost:7700/exec"));
        assert_eq!(routes.url_for("other"), None);
    }

    #[tokio::test]
    async fn unknown_relic_is_permanent_error() {
        let adapter = RelicAdapter::new(RelicRoutes::new());
        let cancel = CancellationToken::new();
        let err = adapter
            .invoke(CapabilityRequest {
                name: "ghost",
                parameters: Value::Null,
                mode: crate::action::ActionMode::Sync,
                cancel: &cancel,
            })
            .await
            .unwrap_err();
        assert!(!err.transient);
        assert!(err.message.contains("ghost"));
    }
}
