use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::TaxonomyError;
use crate::manifest::read_manifest;
use crate::model::{SnapshotModel, Taxonomy, TermRecord};
use crate::phpserial;

/// Fields of one exported term, in either PHP-serialized or JSON form.
#[derive(Debug, Clone, Deserialize)]
struct SerializedTerm {
    #[serde(deserialize_with = "lenient_i64")]
    term_id: i64,
    #[serde(deserialize_with = "lenient_i64")]
    parent: i64,
    #[serde(deserialize_with = "lenient_string")]
    name: String,
    #[serde(deserialize_with = "lenient_string")]
    slug: String,
    #[serde(default, deserialize_with = "lenient_string")]
    description: String,
    #[serde(default, deserialize_with = "lenient_i64")]
    term_group: i64,
}

/// Discover every taxonomy under `snapshot_root`. Touches only the filesystem.
///
/// A taxonomy with an unreadable term file is left out of the model and
/// reported in `corrupt`; the remaining taxonomies still load.
pub fn load(snapshot_root: &Path) -> Result<SnapshotModel> {
    let mut model = SnapshotModel {
        root: snapshot_root.to_path_buf(),
        taxonomies: Vec::new(),
        corrupt: Vec::new(),
    };
    if !snapshot_root.is_dir() {
        debug!(root = %snapshot_root.display(), "snapshot root missing; nothing to load");
        return Ok(model);
    }

    for directory in list_entries(snapshot_root, EntryKind::Directory)? {
        let Some(slug) = file_name(&directory) else {
            continue;
        };
        match load_taxonomy(snapshot_root, &slug, &directory) {
            Ok(Ok(taxonomy)) => {
                debug!(
                    taxonomy = %taxonomy.slug,
                    kind = taxonomy.kind.as_str(),
                    terms = taxonomy.terms.len(),
                    "loaded taxonomy snapshot"
                );
                model.taxonomies.push(taxonomy);
            }
            Ok(Err(corrupt)) => {
                warn!(taxonomy = %slug, error = %corrupt, "skipping corrupt taxonomy snapshot");
                model.corrupt.push(corrupt);
            }
            Err(error) => return Err(error),
        }
    }
    Ok(model)
}

/// Outer error: filesystem failure. Inner error: the snapshot itself is bad.
fn load_taxonomy(
    snapshot_root: &Path,
    slug: &str,
    directory: &Path,
) -> Result<std::result::Result<Taxonomy, TaxonomyError>> {
    let manifest = read_manifest(snapshot_root, slug);
    let mut terms = Vec::new();
    let mut seen_ids = HashSet::new();

    for path in list_entries(directory, EntryKind::File)? {
        let Some(source_slug) = file_name(&path) else {
            continue;
        };
        let bytes = fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
        let serialized = match decode_term(&bytes) {
            Ok(serialized) => serialized,
            Err(error) => {
                return Ok(Err(TaxonomyError::CorruptSnapshot {
                    taxonomy: slug.to_string(),
                    path,
                    reason: format!("{error:#}"),
                }));
            }
        };
        if !seen_ids.insert(serialized.term_id) {
            return Ok(Err(TaxonomyError::CorruptSnapshot {
                taxonomy: slug.to_string(),
                path,
                reason: format!("duplicate term_id {}", serialized.term_id),
            }));
        }

        terms.push(TermRecord {
            source_slug,
            foreign_term_id: serialized.term_id,
            foreign_parent_id: serialized.parent,
            name: serialized.name,
            slug: serialized.slug,
            description: serialized.description,
            term_group: serialized.term_group,
            content_hash: compute_hash(&bytes),
            materialized: false,
            target_id: None,
        });
    }

    Ok(Ok(Taxonomy {
        slug: slug.to_string(),
        kind: manifest.kind,
        term_descriptor: manifest.term_descriptor,
        terms,
    }))
}

fn decode_term(bytes: &[u8]) -> Result<SerializedTerm> {
    let value = if phpserial::looks_serialized(bytes) {
        phpserial::unserialize(bytes).context("invalid PHP serialized term")?
    } else {
        serde_json::from_slice::<Value>(bytes).context("invalid JSON term")?
    };
    serde_json::from_value(value).context("term does not have the expected fields")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryKind {
    Directory,
    File,
}

/// Direct children of `base` of the given kind, hidden entries excluded, sorted.
fn list_entries(base: &Path, kind: EntryKind) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in WalkDir::new(base)
        .min_depth(1)
        .max_depth(1)
        .follow_links(true)
        .sort_by_file_name()
    {
        let entry = entry.with_context(|| format!("failed to walk {}", base.display()))?;
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        let matches = match kind {
            EntryKind::Directory => entry.file_type().is_dir(),
            EntryKind::File => entry.file_type().is_file(),
        };
        if matches {
            out.push(entry.into_path());
        }
    }
    Ok(out)
}

fn file_name(path: &Path) -> Option<String> {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
}

fn compute_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

pub(crate) fn lenient_i64<'de, D>(deserializer: D) -> std::result::Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Number(number) => number
            .as_i64()
            .ok_or_else(|| serde::de::Error::custom(format!("expected an integer, got {number}"))),
        Value::String(text) => text
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("expected an integer, got \"{text}\""))),
        Value::Null => Ok(0),
        other => Err(serde::de::Error::custom(format!(
            "expected an integer, got {other}"
        ))),
    }
}

pub(crate) fn lenient_string<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(text) => Ok(text),
        Value::Number(number) => Ok(number.to_string()),
        Value::Null => Ok(String::new()),
        other => Err(serde::de::Error::custom(format!(
            "expected a string, got {other}"
        ))),
    }
}
