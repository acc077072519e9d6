//! ---
//! cion_section: "15-testing-qa-runbook"
//! cion_subsection: "harness"
//! cion_type: "source"
//! cion_scope: "code"
//! cion_description: "Test harness clients and fixtures shared across crates."
//! cion_version: "v0.0.0-prealpha"
//! cion_owner: "tbd"
//! ---
//! Raw document builders.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde_json::{json, Value};

/// `from_env` environment, optionally with a `tag-match` pattern.
pub fn environment(name: &str, tag_match: Option<&str>) -> Value {
    let mut document = json!({"name": name, "mode": "from_env"});
    if let Some(pattern) = tag_match {
        document["tag-match"] = json!(pattern);
    }
    document
}

pub fn service(name: &str, image: &str, environments: &[&str]) -> Value {
    json!({
        "name": name,
        "image-name": image,
        "environments": environments,
    })
}

/// Repo-policy document for `user` with one entry per `(repo, login)`.
pub fn repos(user: &str, repos: &[(&str, Option<&Path>)]) -> Value {
    let entries: Vec<Value> = repos
        .iter()
        .map(|(repo, login)| match login {
            Some(login) => json!({"repo": repo, "login": login}),
            None => json!({"repo": repo}),
        })
        .collect();
    json!({"user": user, "repos": entries})
}

/// Write a registry credential file into `dir`.
pub fn credentials_file(dir: &Path, username: &str, password: &str) -> io::Result<PathBuf> {
    let path = dir.join(format!("{username}.json"));
    fs::write(
        &path,
        json!({"username": username, "password": password}).to_string(),
    )?;
    Ok(path)
}
