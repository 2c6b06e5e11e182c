use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// A term that could not be placed because its parent never materialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnresolvedTerm {
    pub source_slug: String,
    pub foreign_term_id: i64,
    pub foreign_parent_id: i64,
}

impl fmt::Display for UnresolvedTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (term_id {}, parent {})",
            self.source_slug, self.foreign_term_id, self.foreign_parent_id
        )
    }
}

/// Failures scoped to a single taxonomy. None of them stop other taxonomies.
#[derive(Debug, Error)]
pub enum TaxonomyError {
    #[error("corrupt snapshot for taxonomy `{taxonomy}` at {}: {reason}", path.display())]
    CorruptSnapshot {
        taxonomy: String,
        path: PathBuf,
        reason: String,
    },
    #[error(
        "unresolvable parent dependency in taxonomy `{taxonomy}`: {}",
        join_unresolved(unresolved)
    )]
    UnresolvableDependency {
        taxonomy: String,
        unresolved: Vec<UnresolvedTerm>,
    },
    #[error("store write failed for taxonomy `{taxonomy}` ({}): {source:#}", describe_target(*foreign_term_id, *object_id))]
    StoreWriteFailure {
        taxonomy: String,
        foreign_term_id: Option<i64>,
        object_id: Option<i64>,
        #[source]
        source: anyhow::Error,
    },
}

impl TaxonomyError {
    pub fn taxonomy(&self) -> &str {
        match self {
            Self::CorruptSnapshot { taxonomy, .. }
            | Self::UnresolvableDependency { taxonomy, .. }
            | Self::StoreWriteFailure { taxonomy, .. } => taxonomy,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::CorruptSnapshot { .. } => "corrupt_snapshot",
            Self::UnresolvableDependency { .. } => "unresolvable_dependency",
            Self::StoreWriteFailure { .. } => "store_write_failure",
        }
    }

    pub(crate) fn store_term(taxonomy: &str, foreign_term_id: Option<i64>, source: anyhow::Error) -> Self {
        Self::StoreWriteFailure {
            taxonomy: taxonomy.to_string(),
            foreign_term_id,
            object_id: None,
            source,
        }
    }

    pub(crate) fn store_object(taxonomy: &str, object_id: i64, source: anyhow::Error) -> Self {
        Self::StoreWriteFailure {
            taxonomy: taxonomy.to_string(),
            foreign_term_id: None,
            object_id: Some(object_id),
            source,
        }
    }
}

fn join_unresolved(unresolved: &[UnresolvedTerm]) -> String {
    unresolved
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn describe_target(foreign_term_id: Option<i64>, object_id: Option<i64>) -> String {
    match (foreign_term_id, object_id) {
        (Some(term_id), _) => format!("foreign term {term_id}"),
        (None, Some(object_id)) => format!("object {object_id}"),
        (None, None) => "term listing".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unresolvable_dependency_names_every_offender() {
        let error = TaxonomyError::UnresolvableDependency {
            taxonomy: "category".to_string(),
            unresolved: vec![
                UnresolvedTerm {
                    source_slug: "a".to_string(),
                    foreign_term_id: 1,
                    foreign_parent_id: 2,
                },
                UnresolvedTerm {
                    source_slug: "b".to_string(),
                    foreign_term_id: 2,
                    foreign_parent_id: 1,
                },
            ],
        };
        let message = error.to_string();
        assert!(message.contains("a (term_id 1, parent 2)"));
        assert!(message.contains("b (term_id 2, parent 1)"));
        assert_eq!(error.kind(), "unresolvable_dependency");
    }

    #[test]
    fn store_failure_reports_context() {
        let error = TaxonomyError::store_term("post_tag", Some(42), anyhow::anyhow!("boom"));
        let message = error.to_string();
        assert!(message.contains("post_tag"));
        assert!(message.contains("foreign term 42"));
        assert!(message.contains("boom"));
        assert_eq!(error.taxonomy(), "post_tag");
    }
}
