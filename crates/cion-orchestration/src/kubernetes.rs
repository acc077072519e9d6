//! ---
//! cion_section: "05-networking-external-interfaces"
//! cion_subsection: "module"
//! cion_type: "source"
//! cion_scope: "code"
//! cion_description: "Kubernetes API backend for service-account clusters."
//! cion_version: "v0.0.0-prealpha"
//! cion_owner: "tbd"
//! ---
use std::collections::BTreeSet;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::factory::expect_success;
use crate::{ClientError, Credentials, OrchestrationClient, Result};

const STRATEGIC_MERGE_PATCH: &str = "application/strategic-merge-patch+json";

/// Kubernetes client patching deployments in a single namespace.
#[derive(Debug)]
pub struct KubernetesClient {
    environment: String,
    base: String,
    namespace: String,
    token: String,
    http: reqwest::Client,
}

impl KubernetesClient {
    /// Create a client for the API server at `base`.
    pub fn new(
        environment: impl Into<String>,
        base: &str,
        namespace: impl Into<String>,
        token: impl Into<String>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            environment: environment.into(),
            base: base.trim_end_matches('/').to_owned(),
            namespace: namespace.into(),
            token: token.into(),
            http,
        }
    }

    fn deployments(&self) -> String {
        format!(
            "{}/apis/apps/v1/namespaces/{}/deployments",
            self.base, self.namespace
        )
    }

    /// Namespace whose deployments this client manages.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

/// Patch replacing the image of the container named after the deployment.
pub(crate) fn image_patch(service: &str, image: &str) -> Value {
    json!({
        "spec": {
            "template": {
                "spec": {
                    "containers": [
                        { "name": service, "image": image }
                    ]
                }
            }
        }
    })
}

#[async_trait]
impl OrchestrationClient for KubernetesClient {
    fn backend(&self) -> &'static str {
        "kubernetes"
    }

    async fn login(&self, credentials: &Credentials) -> Result<()> {
        // Image pulls are authorised by the cluster's own pull secrets.
        debug!(
            environment = %self.environment,
            username = %credentials.username,
            "registry login is not forwarded to kubernetes; the update may fail to pull"
        );
        Ok(())
    }

    async fn list_service_names(&self) -> Result<BTreeSet<String>> {
        let operation = "list deployments";
        let response = self
            .http
            .get(self.deployments())
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|err| ClientError::http(operation, err))?;
        let list: Value = expect_success(response, operation)
            .await?
            .json()
            .await
            .map_err(|err| ClientError::http(operation, err))?;
        let items = list
            .get("items")
            .and_then(Value::as_array)
            .ok_or_else(|| ClientError::protocol(operation, "missing items"))?;
        Ok(items
            .iter()
            .filter_map(|item| item.pointer("/metadata/name").and_then(Value::as_str))
            .map(str::to_owned)
            .collect())
    }

    async fn pull_and_update(&self, service: &str, image: &str) -> Result<()> {
        let operation = format!("patch deployment {service}");
        let response = self
            .http
            .patch(format!("{}/{}", self.deployments(), service))
            .bearer_auth(&self.token)
            .header(CONTENT_TYPE, STRATEGIC_MERGE_PATCH)
            .body(image_patch(service, image).to_string())
            .send()
            .await
            .map_err(|err| ClientError::http(&operation, err))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ClientError::ServiceNotFound(service.to_owned()));
        }
        expect_success(response, &operation).await?;
        info!(environment = %self.environment, namespace = %self.namespace, service, image, "deployment patched");
        Ok(())
    }
}
