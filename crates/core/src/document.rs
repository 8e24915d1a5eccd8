//! Declarative document loading and reference resolution
//!
//! A configuration document is a YAML tree that may contain *reference
//! nodes*: single-key mappings of the form `{ $include: <target> }`,
//! where the target is either a path relative to the directory of the
//! referencing document, or an `http(s)` URI. Loading inlines every
//! reference recursively; the returned tree contains no reference nodes.
//!
//! The resolution base is threaded explicitly through every recursive
//! call, so the loader never touches the process working directory and
//! is safe to invoke concurrently for independent documents.

use std::fs;
use std::path::{Path, PathBuf};

use serde_yaml::Value;
use tracing::debug;

use crate::{Error, Result};

/// Mapping key marking a reference node
pub const REFERENCE_KEY: &str = "$include";

/// A fully-resolved declarative document tree
pub type Document = Value;

/// Load a root document and splice in every referenced document
///
/// Fails with [`Error::DocumentNotFound`] if the root file is
/// unreadable, [`Error::ReferenceResolution`] if a reference cannot be
/// fetched or parsed, and [`Error::CyclicReference`] if resolution
/// re-enters a document already on the resolution stack.
pub fn load(path: &Path) -> Result<Document> {
    let text = fs::read_to_string(path).map_err(|_| Error::DocumentNotFound {
        path: path.display().to_string(),
    })?;
    let root: Value = serde_yaml::from_str(&text).map_err(|e| Error::ReferenceResolution {
        reference: path.display().to_string(),
        message: e.to_string(),
    })?;

    let base = ResolveBase::for_local(path);
    let mut stack = vec![source_id(path)];
    resolve(&root, &base, &mut stack)
}

/// Where relative reference targets are resolved from
#[derive(Debug, Clone)]
enum ResolveBase {
    /// Directory containing the referencing local document
    Local(PathBuf),
    /// URI prefix of the referencing remote document, ending in `/`
    Remote(String),
}

impl ResolveBase {
    fn for_local(document: &Path) -> Self {
        let dir = document
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        ResolveBase::Local(dir)
    }

    fn for_remote(uri: &str) -> Self {
        let prefix = match uri.rfind('/') {
            Some(idx) => &uri[..=idx],
            None => uri,
        };
        ResolveBase::Remote(prefix.to_string())
    }
}

fn is_remote(target: &str) -> bool {
    target.starts_with("http://") || target.starts_with("https://")
}

fn source_id(path: &Path) -> String {
    // Canonicalize when possible so `a/../a` and `a` collide on the stack
    fs::canonicalize(path)
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| path.display().to_string())
}

/// Extract the target of a reference node, if `value` is one
fn reference_target(value: &Value) -> Option<&str> {
    let mapping = value.as_mapping()?;
    if mapping.len() != 1 {
        return None;
    }
    let (key, target) = mapping.iter().next()?;
    if key.as_str() == Some(REFERENCE_KEY) {
        target.as_str()
    } else {
        None
    }
}

fn resolve(value: &Value, base: &ResolveBase, stack: &mut Vec<String>) -> Result<Value> {
    if let Some(target) = reference_target(value) {
        return splice(target, base, stack);
    }

    match value {
        Value::Mapping(mapping) => {
            let mut resolved = serde_yaml::Mapping::with_capacity(mapping.len());
            for (key, entry) in mapping {
                resolved.insert(key.clone(), resolve(entry, base, stack)?);
            }
            Ok(Value::Mapping(resolved))
        }
        Value::Sequence(items) => {
            let mut resolved = Vec::with_capacity(items.len());
            for item in items {
                resolved.push(resolve(item, base, stack)?);
            }
            Ok(Value::Sequence(resolved))
        }
        Value::Tagged(tagged) => {
            let resolved = resolve(&tagged.value, base, stack)?;
            Ok(Value::Tagged(Box::new(serde_yaml::value::TaggedValue {
                tag: tagged.tag.clone(),
                value: resolved,
            })))
        }
        other => Ok(other.clone()),
    }
}

/// Fetch, parse and recursively resolve one referenced document
fn splice(target: &str, base: &ResolveBase, stack: &mut Vec<String>) -> Result<Value> {
    let (id, text, next_base) = if is_remote(target) {
        (
            target.to_string(),
            fetch_remote(target)?,
            ResolveBase::for_remote(target),
        )
    } else {
        match base {
            ResolveBase::Local(dir) => {
                let path = dir.join(target);
                let text = fs::read_to_string(&path).map_err(|e| Error::ReferenceResolution {
                    reference: target.to_string(),
                    message: format!("{}: {}", path.display(), e),
                })?;
                (source_id(&path), text, ResolveBase::for_local(&path))
            }
            ResolveBase::Remote(prefix) => {
                let uri = format!("{}{}", prefix, target);
                (uri.clone(), fetch_remote(&uri)?, ResolveBase::for_remote(&uri))
            }
        }
    };

    if stack.contains(&id) {
        return Err(Error::CyclicReference {
            chain: format!("{} -> {}", stack.join(" -> "), id),
        });
    }

    debug!("Splicing referenced document {}", id);

    let parsed: Value = serde_yaml::from_str(&text).map_err(|e| Error::ReferenceResolution {
        reference: target.to_string(),
        message: e.to_string(),
    })?;

    stack.push(id);
    let resolved = resolve(&parsed, &next_base, stack);
    stack.pop();
    resolved
}

fn fetch_remote(uri: &str) -> Result<String> {
    let response = reqwest::blocking::get(uri).map_err(|e| Error::ReferenceResolution {
        reference: uri.to_string(),
        message: e.to_string(),
    })?;
    if !response.status().is_success() {
        return Err(Error::ReferenceResolution {
            reference: uri.to_string(),
            message: format!("unexpected status {}", response.status()),
        });
    }
    response.text().map_err(|e| Error::ReferenceResolution {
        reference: uri.to_string(),
        message: e.to_string(),
    })
}
