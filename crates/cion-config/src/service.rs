//! ---
//! cion_section: "04-configuration-orchestration"
//! cion_subsection: "module"
//! cion_type: "source"
//! cion_scope: "code"
//! cion_description: "Entity parsers and the reactive configuration store."
//! cion_version: "v0.0.0-prealpha"
//! cion_owner: "tbd"
//! ---
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Collection, ConfigError};

#[derive(Debug, Deserialize)]
struct ServiceDocument {
    name: Option<String>,
    #[serde(rename = "image-name", alias = "image", alias = "image_name")]
    image: Option<String>,
    #[serde(default)]
    environments: Vec<String>,
}

/// A deployable unit tracking one image repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Service {
    pub name: String,
    /// Repository the service follows, e.g. `acme/widgets`.
    pub image: String,
    /// Environment names in rollout order.
    pub environments: Vec<String>,
}

impl Service {
    pub fn parse(document: &Value) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::validation(Collection::Services, reason);
        let raw: ServiceDocument =
            serde_json::from_value(document.clone()).map_err(|err| invalid(err.to_string()))?;
        let name = raw
            .name
            .filter(|name| !name.trim().is_empty())
            .ok_or_else(|| invalid("missing `name`".to_owned()))?;
        let image = raw
            .image
            .filter(|image| !image.trim().is_empty())
            .ok_or_else(|| invalid(format!("service '{name}' is missing `image-name`")))?;
        Ok(Self {
            name,
            image,
            environments: raw.environments,
        })
    }
}
