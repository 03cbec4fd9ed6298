//! Command line path resolution
//!
//! Maps `-p` arguments onto the namespaces they belong to. With a single
//! namespace, plain absolute paths are enough. With several, every path
//! must name its namespace as `ns://<namespace>/<path>`.

use std::collections::BTreeMap;
use thiserror::Error;
use url::Url;

use crate::connector::NamespaceId;

/// URI scheme naming a namespace in a qualified path
pub const NAMESPACE_SCHEME: &str = "ns";

/// Path resolution errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("No namespace configured")]
    NoNamespaces,

    #[error("The path {0} is not absolute")]
    NotAbsolute(String),

    #[error("The path {0} does not contain scheme and authority thus cannot identify its namespace")]
    MissingAuthority(String),

    #[error("Cannot resolve the path {path}. The namespaces specified: {known:?}")]
    Unresolved { path: String, known: Vec<String> },
}

pub type Result<T> = std::result::Result<T, PathError>;

/// Paths to process per namespace; `None` means the whole namespace
pub type NamespacePaths = BTreeMap<NamespaceId, Option<Vec<String>>>;

/// A command line path, split into namespace and path
enum Target {
    Plain(String),
    Qualified { scheme: String, authority: String, path: String },
    /// Has a scheme but no authority
    Unqualified,
}

fn parse_target(raw: &str) -> Target {
    match Url::parse(raw) {
        Ok(url) => match url.host_str().filter(|h| !h.is_empty()) {
            Some(host) => {
                let path = match url.path() {
                    "" => "/".to_string(),
                    p => p.to_string(),
                };
                Target::Qualified {
                    scheme: url.scheme().to_string(),
                    authority: host.to_string(),
                    path,
                }
            }
            None => Target::Unqualified,
        },
        // No scheme at all
        Err(_) => Target::Plain(raw.to_string()),
    }
}

fn push_unique(paths: &mut Vec<String>, path: String) {
    if !paths.contains(&path) {
        paths.push(path);
    }
}

/// Resolve command line paths against the configured namespaces
pub fn resolve_namespace_paths(namespaces: &[NamespaceId], paths: &[String]) -> Result<NamespacePaths> {
    if namespaces.is_empty() {
        return Err(PathError::NoNamespaces);
    }

    let mut resolved = NamespacePaths::new();
    if paths.is_empty() {
        for ns in namespaces {
            resolved.insert(ns.clone(), None);
        }
        return Ok(resolved);
    }

    let unresolved = |path: &str| PathError::Unresolved {
        path: path.to_string(),
        known: namespaces.iter().map(|n| n.to_string()).collect(),
    };

    for raw in paths {
        let (namespace, path) = match parse_target(raw) {
            Target::Plain(path) if namespaces.len() == 1 => {
                if !path.starts_with('/') {
                    return Err(PathError::NotAbsolute(path));
                }
                (namespaces[0].clone(), path)
            }
            Target::Plain(_) | Target::Unqualified => {
                return Err(PathError::MissingAuthority(raw.clone()));
            }
            Target::Qualified {
                scheme,
                authority,
                path,
            } => {
                if scheme != NAMESPACE_SCHEME {
                    return Err(unresolved(raw));
                }
                let namespace = namespaces
                    .iter()
                    .find(|n| n.as_str() == authority)
                    .ok_or_else(|| unresolved(raw))?;
                (namespace.clone(), path)
            }
        };

        if let Some(list) = resolved.entry(namespace).or_insert_with(|| Some(Vec::new())) {
            push_unique(list, path);
        }
    }

    Ok(resolved)
}
