use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Maps a foreign post identifier (id or slug) to the post's id in the target site.
pub trait PostIdIndex {
    fn resolve_target_post_id(&self, foreign: &str) -> Option<i64>;
}

/// A post already migrated by the content importer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigratedObject {
    pub target_object_id: i64,
    /// Foreign term slugs per taxonomy slug, as the post had them in the source site.
    pub taxonomies: BTreeMap<String, BTreeSet<String>>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct PostMapEntry {
    pub foreign_id: i64,
    #[serde(default)]
    pub foreign_slug: Option<String>,
    pub target_id: i64,
    #[serde(default)]
    pub taxonomies: BTreeMap<String, BTreeSet<String>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct PostMapFile {
    #[serde(default)]
    posts: Vec<PostMapEntry>,
}

/// The post importer's output: the post-id index and the migrated objects.
#[derive(Debug, Clone, Default)]
pub struct MigratedPosts {
    entries: Vec<PostMapEntry>,
}

impl MigratedPosts {
    pub fn new(entries: Vec<PostMapEntry>) -> Self {
        Self { entries }
    }

    /// Load the JSON post map. A missing file means nothing was migrated.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read post map {}", path.display()))?;
        let parsed: PostMapFile = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse post map {}", path.display()))?;
        Ok(Self::new(parsed.posts))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn objects(&self) -> Vec<MigratedObject> {
        self.entries
            .iter()
            .map(|entry| MigratedObject {
                target_object_id: entry.target_id,
                taxonomies: entry.taxonomies.clone(),
            })
            .collect()
    }
}

impl PostIdIndex for MigratedPosts {
    fn resolve_target_post_id(&self, foreign: &str) -> Option<i64> {
        let foreign = foreign.trim();
        let foreign_id = foreign.parse::<i64>().ok();
        self.entries
            .iter()
            .find(|entry| {
                foreign_id == Some(entry.foreign_id)
                    || entry.foreign_slug.as_deref() == Some(foreign)
            })
            .map(|entry| entry.target_id)
    }
}
