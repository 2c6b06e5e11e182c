use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::TaxonomyError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaxonomyType {
    #[default]
    Standard,
    /// Term slugs name a post in the source site and follow the post to its new id.
    Postid,
}

impl TaxonomyType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Postid => "postid",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        if value.eq_ignore_ascii_case("standard") {
            return Some(Self::Standard);
        }
        if value.eq_ignore_ascii_case("postid") {
            return Some(Self::Postid);
        }
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TermDescriptor {
    Direct,
    #[default]
    Indirect,
}

impl TermDescriptor {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Indirect => "indirect",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        if value.eq_ignore_ascii_case("direct") {
            return Some(Self::Direct);
        }
        if value.eq_ignore_ascii_case("indirect") {
            return Some(Self::Indirect);
        }
        None
    }
}

/// One term loaded from a snapshot file.
///
/// `slug` and `name` start out as the serialized values and may be rewritten
/// by the materializer; `source_slug` always stays the snapshot file name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TermRecord {
    pub source_slug: String,
    pub foreign_term_id: i64,
    pub foreign_parent_id: i64,
    pub name: String,
    pub slug: String,
    pub description: String,
    pub term_group: i64,
    pub content_hash: String,
    pub materialized: bool,
    pub target_id: Option<i64>,
}

impl TermRecord {
    pub fn is_root(&self) -> bool {
        self.foreign_parent_id == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Taxonomy {
    pub slug: String,
    pub kind: TaxonomyType,
    pub term_descriptor: TermDescriptor,
    pub terms: Vec<TermRecord>,
}

impl Taxonomy {
    pub fn is_fully_materialized(&self) -> bool {
        self.terms
            .iter()
            .all(|term| term.materialized && term.target_id.is_some())
    }

    /// Final slug for a foreign term slug, falling back to the foreign slug.
    pub fn resolve_term_slug<'a>(&'a self, foreign_slug: &'a str) -> (&'a str, bool) {
        match self
            .terms
            .iter()
            .find(|term| term.source_slug == foreign_slug)
        {
            Some(term) => (term.slug.as_str(), true),
            None => (foreign_slug, false),
        }
    }
}

/// Everything discovered under a snapshot root. Built without touching the target store.
#[derive(Debug)]
pub struct SnapshotModel {
    pub root: PathBuf,
    pub taxonomies: Vec<Taxonomy>,
    pub corrupt: Vec<TaxonomyError>,
}

impl SnapshotModel {
    pub fn term_count(&self) -> usize {
        self.taxonomies
            .iter()
            .map(|taxonomy| taxonomy.terms.len())
            .sum()
    }
}

#[derive(Debug)]
pub enum TaxonomyOutcome {
    Materialized {
        slug: String,
        inserted: usize,
        updated: usize,
        passes: usize,
    },
    Skipped {
        slug: String,
    },
    Failed {
        slug: String,
        error: TaxonomyError,
    },
}

impl TaxonomyOutcome {
    pub fn slug(&self) -> &str {
        match self {
            Self::Materialized { slug, .. } | Self::Skipped { slug } | Self::Failed { slug, .. } => {
                slug
            }
        }
    }

    pub fn is_materialized(&self) -> bool {
        matches!(self, Self::Materialized { .. })
    }
}

#[derive(Debug)]
pub struct MaterializedModel {
    pub taxonomies: Vec<Taxonomy>,
    pub outcomes: Vec<TaxonomyOutcome>,
}

impl MaterializedModel {
    /// Taxonomies whose every term reached the target store during this run.
    pub fn materialized_taxonomies(&self) -> impl Iterator<Item = &Taxonomy> {
        self.taxonomies.iter().filter(|taxonomy| {
            self.outcomes
                .iter()
                .any(|outcome| outcome.is_materialized() && outcome.slug() == taxonomy.slug)
        })
    }

    pub fn taxonomy(&self, slug: &str) -> Option<&Taxonomy> {
        self.materialized_taxonomies()
            .find(|taxonomy| taxonomy.slug == slug)
    }

    pub fn find_target_term_id(&self, foreign_term_id: i64) -> Option<i64> {
        self.materialized_taxonomies()
            .flat_map(|taxonomy| taxonomy.terms.iter())
            .find(|term| term.foreign_term_id == foreign_term_id)
            .and_then(|term| term.target_id)
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &TaxonomyError)> {
        self.outcomes.iter().filter_map(|outcome| match outcome {
            TaxonomyOutcome::Failed { slug, error } => Some((slug.as_str(), error)),
            _ => None,
        })
    }
}
