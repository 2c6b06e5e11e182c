use std::collections::HashMap;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::error::{TaxonomyError, UnresolvedTerm};
use crate::model::{MaterializedModel, SnapshotModel, Taxonomy, TaxonomyOutcome, TaxonomyType, TermRecord};
use crate::posts::PostIdIndex;
use crate::store::{TaxonomyStore, TermPayload};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaxonomyStats {
    pub inserted: usize,
    pub updated: usize,
    pub passes: usize,
}

/// Rewrites a payload (and the record it came from) before it is written.
type PayloadRewrite = fn(&mut TermRecord, &mut TermPayload, &dyn PostIdIndex);

fn payload_rewrite(kind: TaxonomyType) -> PayloadRewrite {
    match kind {
        TaxonomyType::Standard => keep_payload,
        TaxonomyType::Postid => follow_migrated_post,
    }
}

fn keep_payload(_record: &mut TermRecord, _payload: &mut TermPayload, _posts: &dyn PostIdIndex) {}

fn follow_migrated_post(record: &mut TermRecord, payload: &mut TermPayload, posts: &dyn PostIdIndex) {
    match posts.resolve_target_post_id(&record.source_slug) {
        Some(target_post_id) => {
            let identity = target_post_id.to_string();
            payload.slug = identity.clone();
            payload.name = identity.clone();
            record.slug = identity.clone();
            record.name = identity;
        }
        None => warn!(
            source_slug = %record.source_slug,
            "post id not migrated; keeping original term slug"
        ),
    }
}

/// Upsert every registered taxonomy of `model` into `store`.
///
/// Taxonomies the store does not know are skipped. Corrupt snapshots and
/// per-taxonomy failures end up as `Failed` outcomes; only a failure to list
/// the registered taxonomies aborts the whole run.
pub fn materialize<S: TaxonomyStore>(
    model: SnapshotModel,
    store: &mut S,
    posts: &dyn PostIdIndex,
) -> Result<MaterializedModel> {
    let registered = store
        .list_registered_taxonomies()
        .context("failed to list registered taxonomies in the target store")?;

    let mut outcomes = model
        .corrupt
        .into_iter()
        .map(|error| TaxonomyOutcome::Failed {
            slug: error.taxonomy().to_string(),
            error,
        })
        .collect::<Vec<_>>();
    let mut taxonomies = model.taxonomies;

    for taxonomy in &mut taxonomies {
        if !registered.contains(&taxonomy.slug) {
            info!(taxonomy = %taxonomy.slug, "taxonomy not registered in target; skipping");
            outcomes.push(TaxonomyOutcome::Skipped {
                slug: taxonomy.slug.clone(),
            });
            continue;
        }
        match materialize_taxonomy(taxonomy, store, posts) {
            Ok(stats) => {
                info!(
                    taxonomy = %taxonomy.slug,
                    inserted = stats.inserted,
                    updated = stats.updated,
                    passes = stats.passes,
                    "taxonomy materialized"
                );
                outcomes.push(TaxonomyOutcome::Materialized {
                    slug: taxonomy.slug.clone(),
                    inserted: stats.inserted,
                    updated: stats.updated,
                    passes: stats.passes,
                });
            }
            Err(error) => {
                warn!(taxonomy = %taxonomy.slug, %error, "taxonomy materialization failed");
                outcomes.push(TaxonomyOutcome::Failed {
                    slug: taxonomy.slug.clone(),
                    error,
                });
            }
        }
    }

    Ok(MaterializedModel {
        taxonomies,
        outcomes,
    })
}

/// Fixed-point resolution: each pass writes every term whose parent already
/// has a target id; a pass that writes nothing means the rest never will.
pub fn materialize_taxonomy<S: TaxonomyStore>(
    taxonomy: &mut Taxonomy,
    store: &mut S,
    posts: &dyn PostIdIndex,
) -> std::result::Result<TaxonomyStats, TaxonomyError> {
    let slug = taxonomy.slug.clone();
    let existing = store
        .list_terms(&slug)
        .map_err(|error| TaxonomyError::store_term(&slug, None, error))?;
    let mut target_by_slug = existing
        .into_iter()
        .map(|term| (term.slug, term.id))
        .collect::<HashMap<_, _>>();
    let position_by_foreign_id = taxonomy
        .terms
        .iter()
        .enumerate()
        .map(|(position, term)| (term.foreign_term_id, position))
        .collect::<HashMap<_, _>>();

    let rewrite = payload_rewrite(taxonomy.kind);
    let max_passes = taxonomy.terms.len() + 1;
    let mut stats = TaxonomyStats::default();

    loop {
        let pending = taxonomy
            .terms
            .iter()
            .enumerate()
            .filter(|(_, term)| !term.materialized)
            .map(|(position, _)| position)
            .collect::<Vec<_>>();
        if pending.is_empty() {
            return Ok(stats);
        }
        if stats.passes >= max_passes {
            return Err(unresolvable(&slug, &taxonomy.terms));
        }
        stats.passes += 1;

        let mut written = 0usize;
        for position in pending {
            let Some(parent) = resolved_parent_id(&taxonomy.terms, &position_by_foreign_id, position)
            else {
                continue;
            };

            let record = &mut taxonomy.terms[position];
            let mut payload = TermPayload::from_record(record, parent);
            rewrite(record, &mut payload, posts);

            let target_id = match target_by_slug.get(&payload.slug).copied() {
                Some(existing_id) => {
                    store
                        .update_term(existing_id, &slug, &payload)
                        .map_err(|error| {
                            TaxonomyError::store_term(&slug, Some(record.foreign_term_id), error)
                        })?;
                    stats.updated += 1;
                    existing_id
                }
                None => {
                    let inserted_id = store
                        .insert_term(&payload.name, &slug, &payload)
                        .map_err(|error| {
                            TaxonomyError::store_term(&slug, Some(record.foreign_term_id), error)
                        })?;
                    target_by_slug.insert(payload.slug.clone(), inserted_id);
                    stats.inserted += 1;
                    inserted_id
                }
            };
            debug!(
                taxonomy = %slug,
                foreign_term_id = record.foreign_term_id,
                target_id,
                parent,
                slug = %payload.slug,
                "term materialized"
            );
            record.target_id = Some(target_id);
            record.materialized = true;
            written += 1;
        }

        debug!(taxonomy = %slug, pass = stats.passes, written, "resolution pass finished");
        if written == 0 {
            return Err(unresolvable(&slug, &taxonomy.terms));
        }
    }
}

/// `Some(0)` for roots, the parent's target id once it has one, else `None`.
fn resolved_parent_id(
    terms: &[TermRecord],
    position_by_foreign_id: &HashMap<i64, usize>,
    position: usize,
) -> Option<i64> {
    let record = &terms[position];
    if record.is_root() {
        return Some(0);
    }
    let parent = &terms[*position_by_foreign_id.get(&record.foreign_parent_id)?];
    if parent.materialized { parent.target_id } else { None }
}

fn unresolvable(taxonomy: &str, terms: &[TermRecord]) -> TaxonomyError {
    TaxonomyError::UnresolvableDependency {
        taxonomy: taxonomy.to_string(),
        unresolved: terms
            .iter()
            .filter(|term| !term.materialized)
            .map(|term| UnresolvedTerm {
                source_slug: term.source_slug.clone(),
                foreign_term_id: term.foreign_term_id,
                foreign_parent_id: term.foreign_parent_id,
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};
    use std::path::PathBuf;

    use anyhow::bail;

    use super::*;
    use crate::model::TermDescriptor;
    use crate::posts::{MigratedPosts, PostMapEntry};
    use crate::store::{MemoryStore, StoreWrite, StoredTerm};

    fn record(source_slug: &str, foreign_term_id: i64, foreign_parent_id: i64) -> TermRecord {
        TermRecord {
            source_slug: source_slug.to_string(),
            foreign_term_id,
            foreign_parent_id,
            name: source_slug.to_uppercase(),
            slug: source_slug.to_string(),
            description: format!("{source_slug} description"),
            term_group: 0,
            content_hash: String::new(),
            materialized: false,
            target_id: None,
        }
    }

    fn taxonomy(slug: &str, kind: TaxonomyType, terms: Vec<TermRecord>) -> Taxonomy {
        Taxonomy {
            slug: slug.to_string(),
            kind,
            term_descriptor: TermDescriptor::Indirect,
            terms,
        }
    }

    fn model(taxonomies: Vec<Taxonomy>) -> SnapshotModel {
        SnapshotModel {
            root: PathBuf::from("/snapshot"),
            taxonomies,
            corrupt: Vec::new(),
        }
    }

    fn no_posts() -> MigratedPosts {
        MigratedPosts::default()
    }

    fn target_of(taxonomy: &Taxonomy, source_slug: &str) -> i64 {
        taxonomy
            .terms
            .iter()
            .find(|term| term.source_slug == source_slug)
            .and_then(|term| term.target_id)
            .expect("target id")
    }

    /// Deepest chain first so discovery order is the worst case.
    fn deep_chain() -> Vec<TermRecord> {
        vec![
            record("d", 4, 3),
            record("c", 3, 2),
            record("b", 2, 1),
            record("a", 1, 0),
        ]
    }

    #[test]
    fn root_then_child_scenario() {
        let mut store = MemoryStore::with_registered(["category"]);
        let mut category = taxonomy(
            "category",
            TaxonomyType::Standard,
            vec![record("child", 2, 1), record("root", 1, 0)],
        );

        let stats = materialize_taxonomy(&mut category, &mut store, &no_posts()).expect("materialize");

        assert_eq!(stats.inserted, 2);
        assert_eq!(stats.passes, 2);
        let root_id = target_of(&category, "root");
        let child = store.term_by_slug("category", "child").expect("child");
        assert_eq!(child.payload.parent, root_id);
        assert_eq!(
            store.writes()[0],
            StoreWrite::Insert {
                taxonomy: "category".to_string(),
                id: root_id,
                slug: "root".to_string(),
                parent: 0,
            }
        );
    }

    #[test]
    fn every_record_gets_a_target_and_parents_line_up() {
        let mut store = MemoryStore::with_registered(["category"]);
        let mut terms = deep_chain();
        terms.push(record("sibling", 5, 1));
        terms.push(record("other-root", 6, 0));
        let mut category = taxonomy("category", TaxonomyType::Standard, terms);

        materialize_taxonomy(&mut category, &mut store, &no_posts()).expect("materialize");

        assert!(category.is_fully_materialized());
        let by_foreign = category
            .terms
            .iter()
            .map(|term| (term.foreign_term_id, term.target_id.expect("target")))
            .collect::<BTreeMap<_, _>>();
        for term in &category.terms {
            let stored = store.term_by_slug("category", &term.slug).expect("stored");
            let expected_parent = if term.is_root() {
                0
            } else {
                by_foreign[&term.foreign_parent_id]
            };
            assert_eq!(stored.payload.parent, expected_parent, "parent of {}", term.slug);
            assert_eq!(stored.payload.description, term.description);
        }
    }

    #[test]
    fn passes_are_bounded_by_depth() {
        let mut store = MemoryStore::with_registered(["category"]);
        let mut category = taxonomy("category", TaxonomyType::Standard, deep_chain());
        let stats = materialize_taxonomy(&mut category, &mut store, &no_posts()).expect("materialize");
        assert_eq!(stats.passes, 4);
    }

    #[test]
    fn roots_are_written_in_the_first_pass() {
        let mut store = MemoryStore::with_registered(["category"]);
        let mut category = taxonomy(
            "category",
            TaxonomyType::Standard,
            vec![record("leaf", 3, 2), record("mid", 2, 1), record("r1", 1, 0), record("r2", 9, 0)],
        );
        materialize_taxonomy(&mut category, &mut store, &no_posts()).expect("materialize");
        let first_two = store.writes()[..2]
            .iter()
            .map(|write| match write {
                StoreWrite::Insert { slug, parent, .. } => (slug.clone(), *parent),
                other => panic!("unexpected write {other:?}"),
            })
            .collect::<BTreeSet<_>>();
        assert!(first_two.contains(&("r1".to_string(), 0)));
        assert!(first_two.contains(&("r2".to_string(), 0)));
    }

    #[test]
    fn second_run_reuses_targets_without_duplicates() {
        let mut store = MemoryStore::with_registered(["category"]);
        let mut first = taxonomy("category", TaxonomyType::Standard, deep_chain());
        materialize_taxonomy(&mut first, &mut store, &no_posts()).expect("first run");

        let mut second = taxonomy("category", TaxonomyType::Standard, deep_chain());
        let stats = materialize_taxonomy(&mut second, &mut store, &no_posts()).expect("second run");

        assert_eq!(stats.inserted, 0);
        assert_eq!(stats.updated, 4);
        assert_eq!(store.terms("category").len(), 4);
        for term in &first.terms {
            assert_eq!(target_of(&second, &term.source_slug), term.target_id.expect("target"));
        }
    }

    #[test]
    fn pre_existing_term_is_updated_in_place() {
        let mut store = MemoryStore::with_registered(["category"]);
        let legacy_id = store.seed_term("category", "root", "Old Root");
        let mut category = taxonomy(
            "category",
            TaxonomyType::Standard,
            vec![record("root", 1, 0), record("child", 2, 1)],
        );
        let stats = materialize_taxonomy(&mut category, &mut store, &no_posts()).expect("materialize");
        assert_eq!(stats.updated, 1);
        assert_eq!(stats.inserted, 1);
        assert_eq!(target_of(&category, "root"), legacy_id);
        assert_eq!(
            store.term_by_slug("category", "root").expect("root").payload.name,
            "ROOT"
        );
        assert_eq!(
            store.term_by_slug("category", "child").expect("child").payload.parent,
            legacy_id
        );
    }

    #[test]
    fn dangling_parent_stalls_with_offenders() {
        let mut store = MemoryStore::with_registered(["category"]);
        let mut category = taxonomy(
            "category",
            TaxonomyType::Standard,
            vec![record("root", 1, 0), record("lost", 2, 99)],
        );
        let error = materialize_taxonomy(&mut category, &mut store, &no_posts()).expect_err("must stall");
        match error {
            TaxonomyError::UnresolvableDependency { taxonomy, unresolved } => {
                assert_eq!(taxonomy, "category");
                assert_eq!(
                    unresolved,
                    vec![UnresolvedTerm {
                        source_slug: "lost".to_string(),
                        foreign_term_id: 2,
                        foreign_parent_id: 99,
                    }]
                );
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(category.terms[0].materialized);
    }

    #[test]
    fn cycle_stalls_instead_of_looping() {
        let mut store = MemoryStore::with_registered(["category"]);
        let mut category = taxonomy(
            "category",
            TaxonomyType::Standard,
            vec![record("a", 1, 2), record("b", 2, 1)],
        );
        let error = materialize_taxonomy(&mut category, &mut store, &no_posts()).expect_err("must stall");
        assert_eq!(error.kind(), "unresolvable_dependency");
        assert!(store.writes().is_empty());
    }

    #[test]
    fn self_parent_is_a_cycle() {
        let mut store = MemoryStore::with_registered(["category"]);
        let mut category = taxonomy("category", TaxonomyType::Standard, vec![record("me", 1, 1)]);
        assert!(materialize_taxonomy(&mut category, &mut store, &no_posts()).is_err());
    }

    #[test]
    fn postid_terms_follow_migrated_posts() {
        let posts = MigratedPosts::new(vec![PostMapEntry {
            foreign_id: 12,
            foreign_slug: None,
            target_id: 450,
            taxonomies: BTreeMap::new(),
        }]);
        let mut store = MemoryStore::with_registered(["related"]);
        let mut related = taxonomy(
            "related",
            TaxonomyType::Postid,
            vec![record("12", 1, 0), record("13", 2, 0)],
        );

        materialize_taxonomy(&mut related, &mut store, &posts).expect("materialize");

        let rewritten = store.term_by_slug("related", "450").expect("rewritten");
        assert_eq!(rewritten.payload.name, "450");
        assert_eq!(related.terms[0].slug, "450");
        assert_eq!(related.terms[0].name, "450");
        assert_eq!(related.terms[0].source_slug, "12");

        let untouched = store.term_by_slug("related", "13").expect("fallback");
        assert_eq!(untouched.payload.name, "13");
        assert_eq!(related.terms[1].slug, "13");
        assert_eq!(related.terms[1].name, "13");
        assert_eq!(related.terms[1].source_slug, "13");
    }

    #[test]
    fn postid_rerun_matches_rewritten_slug() {
        let posts = MigratedPosts::new(vec![PostMapEntry {
            foreign_id: 12,
            foreign_slug: None,
            target_id: 450,
            taxonomies: BTreeMap::new(),
        }]);
        let mut store = MemoryStore::with_registered(["related"]);
        let mut first = taxonomy("related", TaxonomyType::Postid, vec![record("12", 1, 0)]);
        materialize_taxonomy(&mut first, &mut store, &posts).expect("first");
        let mut second = taxonomy("related", TaxonomyType::Postid, vec![record("12", 1, 0)]);
        let stats = materialize_taxonomy(&mut second, &mut store, &posts).expect("second");
        assert_eq!(stats.updated, 1);
        assert_eq!(second.terms[0].target_id, first.terms[0].target_id);
    }

    #[test]
    fn shared_slug_within_snapshot_updates_one_term() {
        let mut store = MemoryStore::with_registered(["post_tag"]);
        let mut first = record("rust", 1, 0);
        first.slug = "lang".to_string();
        let mut second = record("rust-lang", 2, 0);
        second.slug = "lang".to_string();
        let mut tags = taxonomy("post_tag", TaxonomyType::Standard, vec![first, second]);
        let stats = materialize_taxonomy(&mut tags, &mut store, &no_posts()).expect("materialize");
        assert_eq!((stats.inserted, stats.updated), (1, 1));
        assert_eq!(tags.terms[0].target_id, tags.terms[1].target_id);
    }

    struct FailingStore {
        inner: MemoryStore,
        fail_slug: String,
    }

    impl TaxonomyStore for FailingStore {
        fn list_registered_taxonomies(&mut self) -> anyhow::Result<BTreeSet<String>> {
            self.inner.list_registered_taxonomies()
        }

        fn list_terms(&mut self, taxonomy: &str) -> anyhow::Result<Vec<StoredTerm>> {
            self.inner.list_terms(taxonomy)
        }

        fn insert_term(
            &mut self,
            name: &str,
            taxonomy: &str,
            payload: &TermPayload,
        ) -> anyhow::Result<i64> {
            if payload.slug == self.fail_slug {
                bail!("database went away");
            }
            self.inner.insert_term(name, taxonomy, payload)
        }

        fn update_term(&mut self, id: i64, taxonomy: &str, payload: &TermPayload) -> anyhow::Result<()> {
            self.inner.update_term(id, taxonomy, payload)
        }

        fn set_object_terms(
            &mut self,
            object_id: i64,
            terms: &[String],
            taxonomy: &str,
        ) -> anyhow::Result<()> {
            self.inner.set_object_terms(object_id, terms, taxonomy)
        }

        fn request_count(&self) -> usize {
            self.inner.request_count()
        }
    }

    #[test]
    fn store_failure_aborts_only_that_taxonomy() {
        let mut store = FailingStore {
            inner: MemoryStore::with_registered(["category", "post_tag"]),
            fail_slug: "news".to_string(),
        };
        let snapshot = model(vec![
            taxonomy(
                "category",
                TaxonomyType::Standard,
                vec![record("news", 1, 0), record("local", 2, 1)],
            ),
            taxonomy("post_tag", TaxonomyType::Standard, vec![record("rust", 7, 0)]),
        ]);

        let materialized = materialize(snapshot, &mut store, &no_posts()).expect("materialize");

        let failures = materialized.failures().collect::<Vec<_>>();
        assert_eq!(failures.len(), 1);
        let (slug, error) = failures[0];
        assert_eq!(slug, "category");
        match error {
            TaxonomyError::StoreWriteFailure {
                foreign_term_id, ..
            } => assert_eq!(*foreign_term_id, Some(1)),
            other => panic!("unexpected error: {other}"),
        }
        assert!(materialized.taxonomy("post_tag").is_some());
        assert!(store.inner.term_by_slug("post_tag", "rust").is_some());
        assert!(store.inner.term_by_slug("category", "local").is_none());
    }

    #[test]
    fn unregistered_and_corrupt_taxonomies_are_reported() {
        let mut store = MemoryStore::with_registered(["category"]);
        let mut snapshot = model(vec![
            taxonomy("category", TaxonomyType::Standard, vec![record("news", 1, 0)]),
            taxonomy("genre", TaxonomyType::Standard, vec![record("jazz", 1, 0)]),
        ]);
        snapshot.corrupt.push(TaxonomyError::CorruptSnapshot {
            taxonomy: "broken".to_string(),
            path: PathBuf::from("/snapshot/broken/x"),
            reason: "bad".to_string(),
        });

        let materialized = materialize(snapshot, &mut store, &no_posts()).expect("materialize");

        let statuses = materialized
            .outcomes
            .iter()
            .map(|outcome| match outcome {
                TaxonomyOutcome::Materialized { slug, .. } => format!("{slug}:ok"),
                TaxonomyOutcome::Skipped { slug } => format!("{slug}:skipped"),
                TaxonomyOutcome::Failed { slug, .. } => format!("{slug}:failed"),
            })
            .collect::<Vec<_>>();
        assert_eq!(statuses, vec!["broken:failed", "category:ok", "genre:skipped"]);
        assert!(store.terms("genre").is_empty());
        let genre = materialized
            .taxonomies
            .iter()
            .find(|taxonomy| taxonomy.slug == "genre")
            .expect("genre kept in model");
        assert!(!genre.terms[0].materialized);
        assert_eq!(materialized.find_target_term_id(1), Some(target_of(&materialized.taxonomies[0], "news")));
    }

    #[test]
    fn registry_failure_aborts_the_run() {
        struct DownStore;
        impl TaxonomyStore for DownStore {
            fn list_registered_taxonomies(&mut self) -> anyhow::Result<BTreeSet<String>> {
                bail!("connection refused")
            }
            fn list_terms(&mut self, _taxonomy: &str) -> anyhow::Result<Vec<StoredTerm>> {
                unreachable!()
            }
            fn insert_term(&mut self, _: &str, _: &str, _: &TermPayload) -> anyhow::Result<i64> {
                unreachable!()
            }
            fn update_term(&mut self, _: i64, _: &str, _: &TermPayload) -> anyhow::Result<()> {
                unreachable!()
            }
            fn set_object_terms(&mut self, _: i64, _: &[String], _: &str) -> anyhow::Result<()> {
                unreachable!()
            }
            fn request_count(&self) -> usize {
                0
            }
        }

        let error = materialize(model(Vec::new()), &mut DownStore, &no_posts()).expect_err("must fail");
        assert!(error.to_string().contains("registered taxonomies"));
    }
}
