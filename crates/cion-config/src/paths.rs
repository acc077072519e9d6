//! ---
//! cion_section: "04-configuration-orchestration"
//! cion_subsection: "module"
//! cion_type: "source"
//! cion_scope: "code"
//! cion_description: "Entity parsers and the reactive configuration store."
//! cion_version: "v0.0.0-prealpha"
//! cion_owner: "tbd"
//! ---
use std::path::{Path, PathBuf};

use path_absolutize::Absolutize;

/// Expand a leading `~` and make the path absolute against the working directory.
pub(crate) fn resolve_user_path(raw: &str) -> PathBuf {
    let expanded = match raw.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => match dirs::home_dir() {
            Some(home) => home.join(rest.trim_start_matches('/')),
            None => PathBuf::from(raw),
        },
        _ => PathBuf::from(raw),
    };
    match expanded.absolutize() {
        Ok(absolute) => absolute.into_owned(),
        Err(_) => expanded,
    }
}

pub(crate) fn exists(path: &Path) -> bool {
    path.is_file()
}
