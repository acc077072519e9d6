//! ---
//! cion_section: "04-configuration-orchestration"
//! cion_subsection: "module"
//! cion_type: "source"
//! cion_scope: "code"
//! cion_description: "Entity parsers and the reactive configuration store."
//! cion_version: "v0.0.0-prealpha"
//! cion_owner: "tbd"
//! ---
use std::sync::Arc;

use indexmap::IndexMap;

use crate::repo::split_user_repo;
use crate::{Collection, Entity, Environment, Glob, ResolvedPolicy, Service, UserRepoPolicies};

/// Immutable, point-in-time view of every configuration collection.
///
/// Iteration follows first-insertion order: a replaced entity keeps its
/// position, a removed and re-created one moves to the end.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    revision: u64,
    environments: IndexMap<String, Arc<Environment>>,
    services: IndexMap<String, Arc<Service>>,
    repos: IndexMap<String, Arc<UserRepoPolicies>>,
    default_glob: Arc<Glob>,
}

impl ConfigSnapshot {
    pub(crate) fn empty(default_glob: Glob) -> Self {
        Self {
            revision: 0,
            environments: IndexMap::new(),
            services: IndexMap::new(),
            repos: IndexMap::new(),
            default_glob: Arc::new(default_glob),
        }
    }

    /// Copy of `self` with one entity replaced or removed.
    ///
    /// Returns `None` when the change is a removal of an absent key.
    pub(crate) fn with_change(
        &self,
        collection: Collection,
        key: &str,
        entity: Option<&Entity>,
    ) -> Option<Self> {
        let mut next = self.clone();
        let changed = match entity {
            None => next.remove(collection, key),
            Some(entity) => {
                next.insert(key, entity);
                true
            }
        };
        if !changed {
            return None;
        }
        next.revision += 1;
        Some(next)
    }

    /// Copy of `self` with the entity under `previous` moved to `key`.
    ///
    /// Both halves land in one revision. An absent `previous` is skipped and
    /// the result is a plain insert.
    pub(crate) fn with_rename(
        &self,
        collection: Collection,
        previous: &str,
        key: &str,
        entity: &Entity,
    ) -> Self {
        let mut next = self.clone();
        if previous != key {
            next.remove(collection, previous);
        }
        next.insert(key, entity);
        next.revision += 1;
        next
    }

    fn insert(&mut self, key: &str, entity: &Entity) {
        match entity {
            Entity::Environment(env) => {
                self.environments.insert(key.to_owned(), Arc::clone(env));
            }
            Entity::Service(service) => {
                self.services.insert(key.to_owned(), Arc::clone(service));
            }
            Entity::Repos(repos) => {
                self.repos.insert(key.to_owned(), Arc::clone(repos));
            }
        }
    }

    fn remove(&mut self, collection: Collection, key: &str) -> bool {
        match collection {
            Collection::Environments => self.environments.shift_remove(key).is_some(),
            Collection::Services => self.services.shift_remove(key).is_some(),
            Collection::Repos => self.repos.shift_remove(key).is_some(),
        }
    }

    /// Incremented on every applied change.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn environment(&self, name: &str) -> Option<&Arc<Environment>> {
        self.environments.get(name)
    }

    pub fn environments(&self) -> impl Iterator<Item = &Arc<Environment>> {
        self.environments.values()
    }

    pub fn service(&self, name: &str) -> Option<&Arc<Service>> {
        self.services.get(name)
    }

    pub fn services(&self) -> impl Iterator<Item = &Arc<Service>> {
        self.services.values()
    }

    /// Services tracking `repository`, in store order.
    pub fn services_for_image<'a>(
        &'a self,
        repository: &'a str,
    ) -> impl Iterator<Item = &'a Arc<Service>> + 'a {
        self.services
            .values()
            .filter(move |service| service.image == repository)
    }

    pub fn repo_policies(&self) -> impl Iterator<Item = &Arc<UserRepoPolicies>> {
        self.repos.values()
    }

    pub fn default_glob(&self) -> &Glob {
        &self.default_glob
    }

    /// Policy in effect for `image`. Never fails: unknown images get the
    /// default policy (no login, default glob).
    pub fn policy_for(&self, image: &str) -> ResolvedPolicy<'_> {
        let policy = split_user_repo(image).and_then(|(user, repo)| {
            self.repos
                .get(user)
                .map(|policies| policies.policy_for(repo))
        });
        match policy {
            Some(policy) => ResolvedPolicy {
                login: policy.login(),
                glob: policy.glob().unwrap_or(&self.default_glob),
            },
            None => ResolvedPolicy {
                login: None,
                glob: &self.default_glob,
            },
        }
    }

    pub fn len(&self, collection: Collection) -> usize {
        match collection {
            Collection::Environments => self.environments.len(),
            Collection::Services => self.services.len(),
            Collection::Repos => self.repos.len(),
        }
    }

    /// Keys of `collection` in iteration order.
    pub fn keys(&self, collection: Collection) -> Vec<&str> {
        match collection {
            Collection::Environments => self.environments.keys().map(String::as_str).collect(),
            Collection::Services => self.services.keys().map(String::as_str).collect(),
            Collection::Repos => self.repos.keys().map(String::as_str).collect(),
        }
    }
}
