use serde::Serialize;
use tracing::{debug, warn};

use crate::error::TaxonomyError;
use crate::model::MaterializedModel;
use crate::posts::MigratedObject;
use crate::store::TaxonomyStore;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AssignReport {
    pub objects: usize,
    pub assigned: usize,
    /// Foreign slugs with no matching snapshot term, assigned unchanged.
    pub fallbacks: usize,
    /// Associations to taxonomies that were not materialized in this run.
    pub skipped: usize,
}

/// Re-attach migrated objects to the re-created terms.
///
/// Assignments are additive. Must run after every taxonomy has been
/// materialized, since it reads the final slugs from `model`.
pub fn assign_objects<S: TaxonomyStore>(
    model: &MaterializedModel,
    objects: &[MigratedObject],
    store: &mut S,
) -> Result<AssignReport, TaxonomyError> {
    let mut report = AssignReport::default();

    for object in objects {
        report.objects += 1;
        for (taxonomy_slug, foreign_slugs) in &object.taxonomies {
            let Some(taxonomy) = model.taxonomy(taxonomy_slug) else {
                debug!(
                    taxonomy = %taxonomy_slug,
                    object_id = object.target_object_id,
                    "taxonomy not materialized; skipping associations"
                );
                report.skipped += foreign_slugs.len();
                continue;
            };

            for foreign_slug in foreign_slugs {
                let (term_slug, found) = taxonomy.resolve_term_slug(foreign_slug);
                if !found {
                    warn!(
                        taxonomy = %taxonomy_slug,
                        foreign_slug = %foreign_slug,
                        object_id = object.target_object_id,
                        "no snapshot term for foreign slug; assigning it unchanged"
                    );
                    report.fallbacks += 1;
                }
                store
                    .set_object_terms(
                        object.target_object_id,
                        &[term_slug.to_string()],
                        taxonomy_slug,
                    )
                    .map_err(|error| {
                        TaxonomyError::store_object(taxonomy_slug, object.target_object_id, error)
                    })?;
                report.assigned += 1;
            }
        }
    }

    Ok(report)
}
