//! ---
//! cion_section: "04-configuration-orchestration"
//! cion_subsection: "module"
//! cion_type: "source"
//! cion_scope: "code"
//! cion_description: "Entity parsers and the reactive configuration store."
//! cion_version: "v0.0.0-prealpha"
//! cion_owner: "tbd"
//! ---
//! Per-user repository policies: registry logins and image globs.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::Value;

use crate::paths::resolve_user_path;
use crate::{Collection, ConfigError, Glob};

#[derive(Debug, Deserialize)]
struct ReposDocument {
    user: Option<String>,
    default_login: Option<String>,
    default_glob: Option<String>,
    #[serde(default)]
    repos: Vec<RepoEntryDocument>,
}

#[derive(Debug, Deserialize)]
struct RepoEntryDocument {
    repo: Option<String>,
    login: Option<String>,
    glob: Option<String>,
}

/// Login and glob rules for one repository.
///
/// A policy without its own glob defers to the process-wide default glob.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepoPolicy {
    login: Option<PathBuf>,
    glob: Option<Glob>,
}

impl RepoPolicy {
    pub fn login(&self) -> Option<&Path> {
        self.login.as_deref()
    }

    pub fn glob(&self) -> Option<&Glob> {
        self.glob.as_ref()
    }
}

/// All repository policies of one registry user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRepoPolicies {
    user: String,
    default: RepoPolicy,
    repos: IndexMap<String, RepoPolicy>,
}

impl UserRepoPolicies {
    pub fn parse(document: &Value) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::validation(Collection::Repos, reason);
        let raw: ReposDocument =
            serde_json::from_value(document.clone()).map_err(|err| invalid(err.to_string()))?;
        let user = raw
            .user
            .filter(|user| !user.trim().is_empty())
            .ok_or_else(|| invalid("missing `user`".to_owned()))?;

        let default = RepoPolicy {
            login: raw.default_login.as_deref().map(resolve_user_path),
            glob: raw.default_glob.as_deref().map(Glob::compile).transpose()?,
        };
        let mut repos = IndexMap::with_capacity(raw.repos.len());
        for entry in raw.repos {
            let repo = entry
                .repo
                .filter(|repo| !repo.trim().is_empty())
                .ok_or_else(|| invalid(format!("a repo of user '{user}' is missing `repo`")))?;
            let policy = RepoPolicy {
                login: match entry.login.as_deref() {
                    Some(login) => Some(resolve_user_path(login)),
                    None => default.login.clone(),
                },
                glob: match entry.glob.as_deref() {
                    Some(glob) => Some(Glob::compile(glob)?),
                    None => default.glob.clone(),
                },
            };
            repos.insert(repo, policy);
        }
        Ok(Self {
            user,
            default,
            repos,
        })
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    /// Policy for `repo`, or the user's defaults when the repo is not listed.
    pub fn policy_for(&self, repo: &str) -> &RepoPolicy {
        self.repos.get(repo).unwrap_or(&self.default)
    }

    pub fn repos(&self) -> impl Iterator<Item = (&str, &RepoPolicy)> {
        self.repos.iter().map(|(name, policy)| (name.as_str(), policy))
    }
}

/// Policy in effect for one image reference, with the glob already defaulted.
#[derive(Debug, Clone, Copy)]
pub struct ResolvedPolicy<'a> {
    pub login: Option<&'a Path>,
    pub glob: &'a Glob,
}

impl ResolvedPolicy<'_> {
    pub fn requires_login(&self) -> bool {
        self.login.is_some()
    }
}

/// Split `user/repo[:tag]` into `(user, repo)` for policy lookup.
///
/// Anything other than exactly two path segments has no user-level policy.
pub fn split_user_repo(image: &str) -> Option<(&str, &str)> {
    let mut segments = image.split('/');
    let (user, rest) = (segments.next()?, segments.next()?);
    if segments.next().is_some() {
        return None;
    }
    let repo = rest.split(':').next().unwrap_or(rest);
    Some((user, repo))
}
