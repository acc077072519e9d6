//! ---
//! cion_section: "04-configuration-orchestration"
//! cion_subsection: "module"
//! cion_type: "source"
//! cion_scope: "code"
//! cion_description: "Entity parsers and the reactive configuration store."
//! cion_version: "v0.0.0-prealpha"
//! cion_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use cion_orchestration::{ClientFactory, ClientParameters, ConnectionSpec, OrchestrationClient};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::paths::{exists, resolve_user_path};
use crate::{Collection, ConfigError, Pattern};

const DEFAULT_NAMESPACE: &str = "default";

#[derive(Debug, Deserialize)]
struct EnvironmentDocument {
    name: Option<String>,
    #[serde(alias = "kind")]
    mode: Option<String>,
    #[serde(default)]
    sign: bool,
    #[serde(rename = "tag-match", alias = "tag_match")]
    tag_match: Option<String>,
    #[serde(default)]
    parameters: ClientParameters,
    tls: Option<TlsDocument>,
    namespace: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TlsDocument {
    url: Option<String>,
    cert: Option<String>,
    key: Option<String>,
    ca: Option<String>,
    token: Option<String>,
}

/// A deployment target cluster together with its orchestration client.
#[derive(Debug)]
pub struct Environment {
    name: String,
    sign: bool,
    tag_match: Option<Pattern>,
    connection: ConnectionSpec,
    client: Arc<dyn OrchestrationClient>,
}

impl Environment {
    /// Parse an environment document, building its client through `factory`.
    pub fn parse(document: &Value, factory: &dyn ClientFactory) -> Result<Self, ConfigError> {
        let raw: EnvironmentDocument = serde_json::from_value(document.clone())
            .map_err(|err| invalid(err.to_string()))?;
        let name = raw
            .name
            .filter(|name| !name.trim().is_empty())
            .ok_or_else(|| invalid("missing `name`"))?;
        let mode = raw
            .mode
            .ok_or_else(|| invalid(format!("environment '{name}' is missing `mode`")))?;
        let tag_match = raw
            .tag_match
            .as_deref()
            .map(|source| Pattern::compile("tag-match", source))
            .transpose()?;

        let connection = match mode.as_str() {
            "from_env" => ConnectionSpec::FromEnv {
                parameters: raw.parameters,
            },
            "tls" => {
                let tls = raw.tls.unwrap_or_default();
                ConnectionSpec::Tls {
                    url: required(&name, "url", tls.url)?,
                    cert: credential_file(&name, "cert", tls.cert)?,
                    key: credential_file(&name, "key", tls.key)?,
                    ca: credential_file(&name, "ca", tls.ca)?,
                    parameters: raw.parameters,
                }
            }
            "k8s_serviceaccount" => {
                let tls = raw.tls.unwrap_or_default();
                ConnectionSpec::ServiceAccount {
                    url: required(&name, "url", tls.url)?,
                    ca: credential_file(&name, "ca", tls.ca)?,
                    token: decode_token(&name, &required(&name, "token", tls.token)?)?,
                    namespace: raw
                        .namespace
                        .unwrap_or_else(|| DEFAULT_NAMESPACE.to_owned()),
                }
            }
            other => {
                return Err(invalid(format!(
                    "environment '{name}' has unknown mode '{other}'"
                )))
            }
        };

        let client = factory
            .connect(&name, &connection)
            .map_err(|source| ConfigError::ClientSetup {
                environment: name.clone(),
                source,
            })?;
        debug!(environment = %name, mode = connection.mode(), backend = client.backend(), "environment parsed");

        Ok(Self {
            name,
            sign: raw.sign,
            tag_match,
            connection,
            client,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> &'static str {
        self.connection.mode()
    }

    pub fn sign(&self) -> bool {
        self.sign
    }

    /// Source of the `tag-match` pattern, if any.
    pub fn tag_match(&self) -> Option<&str> {
        self.tag_match.as_ref().map(Pattern::source)
    }

    pub fn connection(&self) -> &ConnectionSpec {
        &self.connection
    }

    pub fn client(&self) -> &Arc<dyn OrchestrationClient> {
        &self.client
    }

    /// Whether a freshly published `tag` should be rolled out here.
    ///
    /// Environments without `tag-match` never receive automatic pushes.
    pub fn should_push(&self, tag: &str) -> bool {
        self.tag_match
            .as_ref()
            .is_some_and(|pattern| pattern.is_full_match(tag))
    }
}

fn invalid(reason: impl Into<String>) -> ConfigError {
    ConfigError::validation(Collection::Environments, reason)
}

fn required(environment: &str, field: &str, value: Option<String>) -> Result<String, ConfigError> {
    value
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| invalid(format!("environment '{environment}' is missing `tls.{field}`")))
}

fn credential_file(
    environment: &str,
    field: &str,
    value: Option<String>,
) -> Result<PathBuf, ConfigError> {
    let path = resolve_user_path(&required(environment, field, value)?);
    if !exists(&path) {
        return Err(ConfigError::MissingCredentialFile { path });
    }
    Ok(path)
}

fn decode_token(environment: &str, encoded: &str) -> Result<String, ConfigError> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|err| invalid(format!("environment '{environment}' has an invalid token: {err}")))?;
    let token = String::from_utf8(bytes).map_err(|_| {
        invalid(format!("environment '{environment}' token is not valid UTF-8"))
    })?;
    Ok(token.trim().to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cion_orchestration::ClientError;
    use cion_testharness::RecordingFactory;
    use serde_json::json;
    use std::fs;

    fn certificates(dir: &tempfile::TempDir) -> (String, String, String) {
        let path = |name: &str| {
            let path = dir.path().join(name);
            fs::write(&path, "-----BEGIN TEST-----").unwrap();
            path.display().to_string()
        };
        (path("cert.pem"), path("key.pem"), path("ca.pem"))
    }

    #[test]
    fn missing_mode_is_a_validation_error() {
        let err = Environment::parse(&json!({"name": "prod"}), &RecordingFactory::new()).unwrap_err();
        assert!(matches!(err, ConfigError::Validation { .. }));
    }

    #[test]
    fn unknown_mode_is_rejected() {
        let err = Environment::parse(
            &json!({"name": "prod", "mode": "nomad"}),
            &RecordingFactory::new(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown mode 'nomad'"));
    }

    #[test]
    fn from_env_environment_builds_a_client() {
        let factory = RecordingFactory::new();
        let env = Environment::parse(
            &json!({"name": "staging", "kind": "from_env", "tag-match": "rc.*", "sign": true}),
            &factory,
        )
        .unwrap();
        assert_eq!(env.mode(), "from_env");
        assert!(env.sign());
        assert_eq!(env.tag_match(), Some("rc.*"));
        assert!(factory.client("staging").is_some());
    }

    #[test]
    fn tag_match_is_a_full_match() {
        let env = Environment::parse(
            &json!({"name": "prod", "mode": "from_env", "tag-match": "v.*"}),
            &RecordingFactory::new(),
        )
        .unwrap();
        assert!(env.should_push("v2"));
        assert!(!env.should_push("rc-v2"));
    }

    #[test]
    fn environments_without_tag_match_never_push() {
        let env = Environment::parse(
            &json!({"name": "prod", "mode": "from_env"}),
            &RecordingFactory::new(),
        )
        .unwrap();
        assert!(!env.should_push("latest"));
        assert!(!env.should_push(""));
    }

    #[test]
    fn invalid_tag_match_rejects_the_document() {
        let err = Environment::parse(
            &json!({"name": "prod", "mode": "from_env", "tag-match": "v(["}),
            &RecordingFactory::new(),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::PatternCompile { .. }));
    }

    #[test]
    fn tls_requires_existing_certificates() {
        let dir = tempfile::tempdir().unwrap();
        let (cert, key, _) = certificates(&dir);
        let missing = dir.path().join("missing-ca.pem");
        let err = Environment::parse(
            &json!({
                "name": "prod",
                "mode": "tls",
                "tls": {"url": "tcp://swarm:2376", "cert": cert, "key": key, "ca": missing},
            }),
            &RecordingFactory::new(),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingCredentialFile { path } if path == missing));
    }

    #[test]
    fn tls_without_block_is_a_validation_error() {
        let err = Environment::parse(&json!({"name": "prod", "mode": "tls"}), &RecordingFactory::new())
            .unwrap_err();
        assert!(matches!(err, ConfigError::Validation { .. }));
    }

    #[test]
    fn tls_environment_carries_resolved_paths() {
        let dir = tempfile::tempdir().unwrap();
        let (cert, key, ca) = certificates(&dir);
        let env = Environment::parse(
            &json!({
                "name": "prod",
                "mode": "tls",
                "tls": {"url": "tcp://swarm:2376", "cert": cert, "key": key, "ca": ca},
                "parameters": {"version": "1.41"},
            }),
            &RecordingFactory::new(),
        )
        .unwrap();
        match env.connection() {
            ConnectionSpec::Tls { url, ca: ca_path, parameters, .. } => {
                assert_eq!(url, "tcp://swarm:2376");
                assert_eq!(ca_path, &PathBuf::from(&ca));
                assert_eq!(parameters.version.as_deref(), Some("1.41"));
            }
            other => panic!("unexpected connection {other:?}"),
        }
    }

    #[test]
    fn service_account_token_is_decoded() {
        let dir = tempfile::tempdir().unwrap();
        let (_, _, ca) = certificates(&dir);
        let env = Environment::parse(
            &json!({
                "name": "k8s",
                "mode": "k8s_serviceaccount",
                "tls": {"url": "https://api:6443", "ca": ca, "token": STANDARD.encode("jwt-token\n")},
            }),
            &RecordingFactory::new(),
        )
        .unwrap();
        match env.connection() {
            ConnectionSpec::ServiceAccount { token, namespace, .. } => {
                assert_eq!(token, "jwt-token");
                assert_eq!(namespace, "default");
            }
            other => panic!("unexpected connection {other:?}"),
        }
    }

    #[test]
    fn undecodable_token_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (_, _, ca) = certificates(&dir);
        let err = Environment::parse(
            &json!({
                "name": "k8s",
                "mode": "k8s_serviceaccount",
                "tls": {"url": "https://api:6443", "ca": ca, "token": "%%%"},
            }),
            &RecordingFactory::new(),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Validation { .. }));
    }

    #[derive(Debug)]
    struct RefusingFactory;

    impl ClientFactory for RefusingFactory {
        fn connect(
            &self,
            _environment: &str,
            _spec: &ConnectionSpec,
        ) -> cion_orchestration::Result<Arc<dyn OrchestrationClient>> {
            Err(ClientError::Configuration("no engine".into()))
        }
    }

    #[test]
    fn client_setup_failures_are_reported() {
        let err = Environment::parse(&json!({"name": "prod", "mode": "from_env"}), &RefusingFactory)
            .unwrap_err();
        assert!(matches!(err, ConfigError::ClientSetup { environment, .. } if environment == "prod"));
    }

    #[test]
    fn parsing_twice_behaves_identically() {
        let document = json!({"name": "prod", "mode": "from_env", "tag-match": "v[0-9]+"});
        let factory = RecordingFactory::new();
        let first = Environment::parse(&document, &factory).unwrap();
        let second = Environment::parse(&document, &factory).unwrap();
        assert_eq!(first.tag_match(), second.tag_match());
        assert_eq!(first.mode(), second.mode());
        for tag in ["v1", "v12", "v", "rc1", "latest"] {
            assert_eq!(first.should_push(tag), second.should_push(tag), "tag {tag}");
        }
    }
}
