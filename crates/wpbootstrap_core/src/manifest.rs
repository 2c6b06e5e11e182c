use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::warn;

use crate::model::{TaxonomyType, TermDescriptor};

pub const MANIFEST_SUFFIX: &str = "_manifest.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TaxonomyManifest {
    pub kind: TaxonomyType,
    pub term_descriptor: TermDescriptor,
}

pub fn manifest_path(snapshot_root: &Path, taxonomy_slug: &str) -> PathBuf {
    snapshot_root.join(format!("{taxonomy_slug}{MANIFEST_SUFFIX}"))
}

/// Read `<root>/<slug>_manifest.json`. Never fails: anything missing or
/// unusable falls back to `standard` / `indirect`.
pub fn read_manifest(snapshot_root: &Path, taxonomy_slug: &str) -> TaxonomyManifest {
    let path = manifest_path(snapshot_root, taxonomy_slug);
    let mut manifest = TaxonomyManifest::default();
    if !path.is_file() {
        return manifest;
    }

    let parsed = match fs::read_to_string(&path)
        .map_err(anyhow::Error::from)
        .and_then(|content| serde_json::from_str::<Value>(&content).map_err(anyhow::Error::from))
    {
        Ok(parsed) => parsed,
        Err(error) => {
            warn!(path = %path.display(), %error, "ignoring unreadable taxonomy manifest");
            return manifest;
        }
    };

    if let Some(value) = parsed.get("type").and_then(Value::as_str) {
        match TaxonomyType::parse(value) {
            Some(kind) => manifest.kind = kind,
            None => warn!(path = %path.display(), value, "unknown taxonomy type in manifest"),
        }
    }
    if let Some(value) = parsed.get("termDescriptor").and_then(Value::as_str) {
        match TermDescriptor::parse(value) {
            Some(descriptor) => manifest.term_descriptor = descriptor,
            None => warn!(path = %path.display(), value, "unknown termDescriptor in manifest"),
        }
    }
    manifest
}
