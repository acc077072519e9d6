//! ---
//! cion_section: "04-configuration-orchestration"
//! cion_subsection: "module"
//! cion_type: "source"
//! cion_scope: "code"
//! cion_description: "Entity parsers and the reactive configuration store."
//! cion_version: "v0.0.0-prealpha"
//! cion_owner: "tbd"
//! ---
//! Compiled, full-match patterns used by tag filters and image globs.

use std::fmt;

use regex::{Captures, Regex};
use serde::Serialize;

use crate::ConfigError;

/// A regex that only matches the whole input, keeping its source text.
#[derive(Clone)]
pub struct Pattern {
    source: String,
    regex: Regex,
}

impl Pattern {
    /// Compile `source`; `field` names the document key in errors.
    pub fn compile(field: &'static str, source: &str) -> Result<Self, ConfigError> {
        let regex = Regex::new(&format!("^(?:{source})$")).map_err(|err| {
            ConfigError::PatternCompile {
                field,
                pattern: source.to_owned(),
                reason: err.to_string(),
            }
        })?;
        Ok(Self {
            source: source.to_owned(),
            regex,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn is_full_match(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }

    fn captures<'t>(&self, text: &'t str) -> Option<Captures<'t>> {
        self.regex.captures(text)
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for Pattern {}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pattern").field(&self.source).finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GlobShape {
    UserRepoTag,
    RepositoryTag,
    Named,
}

/// Image-reference glob splitting a published image into its parts.
///
/// Accepted shapes are three positional groups `(user)(repo)(tag)`, two
/// positional groups `(repository)(tag)`, or the named groups `tag` together
/// with either `repository` or both `user` and `repo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Glob {
    pattern: Pattern,
    shape: GlobShape,
}

impl Glob {
    pub fn compile(source: &str) -> Result<Self, ConfigError> {
        let pattern = Pattern::compile("glob", source)?;
        let names: Vec<&str> = pattern.regex.capture_names().flatten().collect();
        let has = |name: &str| names.contains(&name);
        let shape = if has("tag") {
            if has("repository") || (has("user") && has("repo")) {
                GlobShape::Named
            } else {
                return Err(shape_error(source, "named `tag` needs `repository` or `user` and `repo`"));
            }
        } else {
            match pattern.regex.captures_len() - 1 {
                3 => GlobShape::UserRepoTag,
                2 => GlobShape::RepositoryTag,
                groups => {
                    return Err(shape_error(
                        source,
                        &format!("expected 2 or 3 capture groups, found {groups}"),
                    ))
                }
            }
        };
        Ok(Self { pattern, shape })
    }

    pub fn source(&self) -> &str {
        self.pattern.source()
    }

    /// Split `image` into its parts, or `None` when the glob does not match it fully.
    pub fn extract(&self, image: &str) -> Option<ImageParts> {
        let captures = self.pattern.captures(image)?;
        let group = |index: usize| captures.get(index).map_or("", |m| m.as_str()).to_owned();
        let named = |name: &str| captures.name(name).map(|m| m.as_str().to_owned());
        let parts = match self.shape {
            GlobShape::UserRepoTag => {
                let (user, repo) = (group(1), group(2));
                ImageParts {
                    repository: format!("{user}/{repo}"),
                    user: Some(user),
                    repo: Some(repo),
                    tag: group(3),
                }
            }
            GlobShape::RepositoryTag => ImageParts {
                user: None,
                repo: None,
                repository: group(1),
                tag: group(2),
            },
            GlobShape::Named => {
                let user = named("user");
                let repo = named("repo");
                let repository = match named("repository") {
                    Some(repository) => repository,
                    None => format!(
                        "{}/{}",
                        user.as_deref().unwrap_or_default(),
                        repo.as_deref().unwrap_or_default()
                    ),
                };
                ImageParts {
                    user,
                    repo,
                    repository,
                    tag: named("tag").unwrap_or_default(),
                }
            }
        };
        Some(parts)
    }
}

fn shape_error(source: &str, reason: &str) -> ConfigError {
    ConfigError::PatternCompile {
        field: "glob",
        pattern: source.to_owned(),
        reason: reason.to_owned(),
    }
}

/// Components of an image reference extracted by a [`Glob`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageParts {
    pub user: Option<String>,
    pub repo: Option<String>,
    /// Repository compared against a service's tracked image.
    pub repository: String,
    pub tag: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DEFAULT_GLOB;

    #[test]
    fn patterns_match_the_whole_input() {
        let pattern = Pattern::compile("tag-match", "v.*").unwrap();
        assert!(pattern.is_full_match("v2"));
        assert!(!pattern.is_full_match("rc-v2"));

        let alternation = Pattern::compile("tag-match", "v1|v2").unwrap();
        assert!(alternation.is_full_match("v2"));
        assert!(!alternation.is_full_match("v22"));
    }

    #[test]
    fn invalid_patterns_are_rejected() {
        let err = Pattern::compile("tag-match", "v(").unwrap_err();
        assert!(matches!(err, ConfigError::PatternCompile { field: "tag-match", .. }));
    }

    #[test]
    fn default_glob_splits_user_repo_and_tag() {
        let glob = Glob::compile(DEFAULT_GLOB).unwrap();
        let parts = glob.extract("acme/widgets:v2").unwrap();
        assert_eq!(parts.user.as_deref(), Some("acme"));
        assert_eq!(parts.repo.as_deref(), Some("widgets"));
        assert_eq!(parts.repository, "acme/widgets");
        assert_eq!(parts.tag, "v2");
        assert!(glob.extract("widgets").is_none());
    }

    #[test]
    fn two_group_globs_yield_the_repository_directly() {
        let glob = Glob::compile("(registry:5000/.*):(.*)").unwrap();
        let parts = glob.extract("registry:5000/acme/widgets:rc1").unwrap();
        assert_eq!(parts.repository, "registry:5000/acme/widgets");
        assert_eq!(parts.tag, "rc1");
        assert_eq!(parts.user, None);
    }

    #[test]
    fn named_globs_are_supported() {
        let glob = Glob::compile(r"(?P<user>[^/]+)/(?P<repo>[^:]+):(?P<tag>.+)").unwrap();
        let parts = glob.extract("acme/widgets:v2").unwrap();
        assert_eq!(parts.repository, "acme/widgets");
        assert_eq!(parts.tag, "v2");
    }

    #[test]
    fn globs_with_unusable_shapes_are_rejected() {
        assert!(Glob::compile("(.*)").is_err());
        assert!(Glob::compile("(.*)/(.*)/(.*):(.*)").is_err());
        assert!(Glob::compile("(?P<tag>.*)").is_err());
    }
}
