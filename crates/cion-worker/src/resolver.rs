//! ---
//! cion_section: "01-core-functionality"
//! cion_subsection: "module"
//! cion_type: "source"
//! cion_scope: "code"
//! cion_description: "Image routing, update dispatch and worker lifecycle."
//! cion_version: "v0.0.0-prealpha"
//! cion_owner: "tbd"
//! ---
use cion_config::ConfigSnapshot;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// One `(environment, service, image)` triple to roll out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentTarget {
    pub environment: String,
    pub service: String,
    pub image: String,
}

/// Deployment targets for `image` in `snapshot`.
///
/// Services are visited in store order and each service's environments in
/// list order. A target is produced for every environment whose tag pattern
/// accepts the image tag; the same pair appears more than once when a service
/// lists the same environment twice. An empty result is not an error.
pub fn distribute_to(snapshot: &ConfigSnapshot, image: &str) -> Vec<DeploymentTarget> {
    let policy = snapshot.policy_for(image);
    let Some(parts) = policy.glob.extract(image) else {
        info!(image, glob = policy.glob.source(), "image does not match the routing glob");
        return Vec::new();
    };
    debug!(
        image,
        repository = %parts.repository,
        tag = %parts.tag,
        revision = snapshot.revision(),
        "routing image"
    );

    let mut targets = Vec::new();
    let mut services = 0usize;
    for service in snapshot.services_for_image(&parts.repository) {
        services += 1;
        for name in &service.environments {
            let Some(environment) = snapshot.environment(name) else {
                warn!(
                    service = %service.name,
                    environment = %name,
                    "service references an unknown environment; skipped"
                );
                continue;
            };
            if !environment.should_push(&parts.tag) {
                debug!(
                    service = %service.name,
                    environment = %name,
                    tag = %parts.tag,
                    tag_match = ?environment.tag_match(),
                    "tag not accepted by environment"
                );
                continue;
            }
            targets.push(DeploymentTarget {
                environment: environment.name().to_owned(),
                service: service.name.clone(),
                image: image.to_owned(),
            });
        }
    }

    if targets.is_empty() {
        warn!(image, services, "no deployment targets for image");
    } else {
        info!(image, services, targets = targets.len(), "deployment targets resolved");
    }
    targets
}

#[cfg(test)]
mod tests {
    use super::*;
    use cion_config::{parse_document, Collection, ConfigStore, DEFAULT_GLOB};
    use cion_testharness::{documents, RecordingFactory};
    use serde_json::{json, Value};

    fn store(documents: &[(Collection, Value)]) -> ConfigStore {
        let store = ConfigStore::with_default_glob(DEFAULT_GLOB).unwrap();
        let factory = RecordingFactory::new();
        for (collection, document) in documents {
            let entity = parse_document(*collection, document, &factory).unwrap();
            let key = entity.key().to_owned();
            store.apply_update(*collection, &key, Some(entity)).unwrap();
        }
        store
    }

    fn target(environment: &str, service: &str, image: &str) -> DeploymentTarget {
        DeploymentTarget {
            environment: environment.to_owned(),
            service: service.to_owned(),
            image: image.to_owned(),
        }
    }

    #[test]
    fn matching_tag_targets_the_environment() {
        let store = store(&[
            (Collection::Environments, documents::environment("prod", Some("v.*"))),
            (
                Collection::Services,
                documents::service("widgets", "acme/widgets", &["prod"]),
            ),
        ]);
        assert_eq!(
            distribute_to(&store.snapshot(), "acme/widgets:v2"),
            vec![target("prod", "widgets", "acme/widgets:v2")]
        );
    }

    #[test]
    fn rejected_tag_yields_nothing() {
        let store = store(&[
            (Collection::Environments, documents::environment("prod", Some("rc.*"))),
            (
                Collection::Services,
                documents::service("widgets", "acme/widgets", &["prod"]),
            ),
        ]);
        assert!(distribute_to(&store.snapshot(), "acme/widgets:v2").is_empty());
    }

    #[test]
    fn environments_without_tag_match_are_never_targeted() {
        let store = store(&[
            (Collection::Environments, documents::environment("manual", None)),
            (Collection::Environments, documents::environment("prod", Some(".*"))),
            (
                Collection::Services,
                documents::service("widgets", "acme/widgets", &["manual", "prod"]),
            ),
        ]);
        assert_eq!(
            distribute_to(&store.snapshot(), "acme/widgets:anything"),
            vec![target("prod", "widgets", "acme/widgets:anything")]
        );
    }

    #[test]
    fn dangling_environments_are_skipped() {
        let store = store(&[
            (Collection::Environments, documents::environment("prod", Some("v.*"))),
            (
                Collection::Services,
                documents::service("widgets", "acme/widgets", &["gone", "prod"]),
            ),
        ]);
        assert_eq!(
            distribute_to(&store.snapshot(), "acme/widgets:v1"),
            vec![target("prod", "widgets", "acme/widgets:v1")]
        );
    }

    #[test]
    fn targets_follow_store_then_list_order() {
        let store = store(&[
            (Collection::Environments, documents::environment("prod", Some("v.*"))),
            (Collection::Environments, documents::environment("staging", Some(".*"))),
            (
                Collection::Services,
                documents::service("api", "acme/widgets", &["staging", "prod"]),
            ),
            (Collection::Services, documents::service("other", "acme/other", &["prod"])),
            (
                Collection::Services,
                documents::service("worker", "acme/widgets", &["prod", "prod"]),
            ),
        ]);
        assert_eq!(
            distribute_to(&store.snapshot(), "acme/widgets:v3"),
            vec![
                target("staging", "api", "acme/widgets:v3"),
                target("prod", "api", "acme/widgets:v3"),
                target("prod", "worker", "acme/widgets:v3"),
                target("prod", "worker", "acme/widgets:v3"),
            ]
        );
    }

    #[test]
    fn images_outside_the_glob_yield_nothing() {
        let store = store(&[
            (Collection::Environments, documents::environment("prod", Some(".*"))),
            (Collection::Services, documents::service("widgets", "widgets", &["prod"])),
        ]);
        assert!(distribute_to(&store.snapshot(), "widgets").is_empty());
        assert!(distribute_to(&store.snapshot(), "acme/unknown:v1").is_empty());
    }

    #[test]
    fn repo_policy_glob_overrides_the_default() {
        let store = store(&[
            (Collection::Environments, documents::environment("prod", Some(".*"))),
            (Collection::Services, documents::service("widgets", "acme/widgets", &["prod"])),
            (
                Collection::Repos,
                json!({
                    "user": "acme",
                    "repos": [{"repo": "widgets", "glob": "(acme/widgets):(release-.*)"}],
                }),
            ),
        ]);
        let snapshot = store.snapshot();
        assert!(distribute_to(&snapshot, "acme/widgets:v1").is_empty());
        assert_eq!(
            distribute_to(&snapshot, "acme/widgets:release-7"),
            vec![target("prod", "widgets", "acme/widgets:release-7")]
        );
    }
}
