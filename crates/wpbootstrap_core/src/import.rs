use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, warn};

use crate::assign::{AssignReport, assign_objects};
use crate::config::BootstrapConfig;
use crate::ledger;
use crate::materialize::materialize;
use crate::model::{MaterializedModel, SnapshotModel, TaxonomyOutcome};
use crate::posts::MigratedPosts;
use crate::runtime::ResolvedPaths;
use crate::snapshot;
use crate::store::{MemoryStore, StoreWrite, TaxonomyStore};
use crate::wpcli::{WpCliStore, WpCliTarget};

/// Where an import reads from and writes to.
#[derive(Debug, Clone)]
pub struct ImportSettings {
    pub snapshot_dir: PathBuf,
    pub post_map_path: PathBuf,
    pub db_path: PathBuf,
    pub wp_target: WpCliTarget,
}

impl ImportSettings {
    pub fn resolve(paths: &ResolvedPaths, config: &BootstrapConfig) -> Self {
        Self {
            snapshot_dir: config.snapshot_dir(paths),
            post_map_path: config.post_map_path(paths),
            db_path: paths.db_path.clone(),
            wp_target: WpCliTarget::from_config(config),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportOptions {
    pub dry_run: bool,
    pub assign_objects: bool,
    pub record_ledger: bool,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            assign_objects: true,
            record_ledger: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TaxonomyReport {
    pub taxonomy: String,
    pub status: &'static str,
    pub kind: Option<&'static str>,
    pub term_descriptor: Option<&'static str>,
    pub terms: usize,
    pub inserted: usize,
    pub updated: usize,
    pub passes: usize,
    pub error_kind: Option<&'static str>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportReport {
    pub snapshot_dir: String,
    pub dry_run: bool,
    pub migrated_posts: usize,
    pub taxonomies: Vec<TaxonomyReport>,
    pub assignment: Option<AssignReport>,
    pub assignment_error: Option<String>,
    pub ledger_rows: Option<usize>,
    pub ledger_error: Option<String>,
    pub request_count: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub writes: Vec<StoreWrite>,
}

impl ImportReport {
    pub fn failed_taxonomies(&self) -> usize {
        self.taxonomies
            .iter()
            .filter(|taxonomy| taxonomy.status == "failed")
            .count()
    }

    pub fn success(&self) -> bool {
        self.failed_taxonomies() == 0
            && self.assignment_error.is_none()
            && self.ledger_error.is_none()
    }
}

/// Load the snapshot and post map, then import against wp-cli, or against an
/// in-memory store that knows every loaded taxonomy when `dry_run` is set.
pub fn import_taxonomies(settings: &ImportSettings, options: ImportOptions) -> Result<ImportReport> {
    let snapshot = snapshot::load(&settings.snapshot_dir).with_context(|| {
        format!(
            "failed to load taxonomy snapshot {}",
            settings.snapshot_dir.display()
        )
    })?;
    let posts = MigratedPosts::load(&settings.post_map_path)?;
    info!(
        snapshot = %settings.snapshot_dir.display(),
        taxonomies = snapshot.taxonomies.len(),
        corrupt = snapshot.corrupt.len(),
        terms = snapshot.term_count(),
        migrated_posts = posts.len(),
        dry_run = options.dry_run,
        "starting taxonomy import"
    );

    if options.dry_run {
        let mut store = MemoryStore::with_registered(
            snapshot
                .taxonomies
                .iter()
                .map(|taxonomy| taxonomy.slug.clone())
                .collect::<Vec<_>>(),
        );
        let mut report = run_import(snapshot, &mut store, &posts, options, None)?;
        report.writes = store.writes().to_vec();
        return Ok(report);
    }

    let mut store = WpCliStore::new(settings.wp_target.clone());
    let ledger_path = options.record_ledger.then_some(settings.db_path.as_path());
    run_import(snapshot, &mut store, &posts, options, ledger_path)
}

/// Materialize, record the ledger, then assign objects, against any store.
pub fn run_import<S: TaxonomyStore>(
    snapshot: SnapshotModel,
    store: &mut S,
    posts: &MigratedPosts,
    options: ImportOptions,
    ledger_path: Option<&Path>,
) -> Result<ImportReport> {
    let snapshot_dir = snapshot.root.to_string_lossy().replace('\\', "/");
    let model = materialize(snapshot, store, posts)?;

    let (ledger_rows, ledger_error) = match ledger_path {
        Some(path) => match ledger::record_materialized(path, &model) {
            Ok(rows) => (Some(rows), None),
            Err(error) => {
                let message = format!("{error:#}");
                warn!(error = %message, "failed to record term ledger");
                (None, Some(message))
            }
        },
        None => (None, None),
    };

    let (assignment, assignment_error) = if options.assign_objects {
        match assign_objects(&model, &posts.objects(), store) {
            Ok(report) => (Some(report), None),
            Err(error) => {
                warn!(%error, "object assignment aborted");
                (None, Some(error.to_string()))
            }
        }
    } else {
        (None, None)
    };

    Ok(ImportReport {
        snapshot_dir,
        dry_run: options.dry_run,
        migrated_posts: posts.len(),
        taxonomies: taxonomy_reports(&model),
        assignment,
        assignment_error,
        ledger_rows,
        ledger_error,
        request_count: store.request_count(),
        writes: Vec::new(),
    })
}

fn taxonomy_reports(model: &MaterializedModel) -> Vec<TaxonomyReport> {
    model
        .outcomes
        .iter()
        .map(|outcome| {
            let loaded = model
                .taxonomies
                .iter()
                .find(|taxonomy| taxonomy.slug == outcome.slug());
            let mut report = TaxonomyReport {
                taxonomy: outcome.slug().to_string(),
                status: "skipped",
                kind: loaded.map(|taxonomy| taxonomy.kind.as_str()),
                term_descriptor: loaded.map(|taxonomy| taxonomy.term_descriptor.as_str()),
                terms: loaded.map(|taxonomy| taxonomy.terms.len()).unwrap_or(0),
                inserted: 0,
                updated: 0,
                passes: 0,
                error_kind: None,
                error: None,
            };
            match outcome {
                TaxonomyOutcome::Materialized {
                    inserted,
                    updated,
                    passes,
                    ..
                } => {
                    report.status = "materialized";
                    report.inserted = *inserted;
                    report.updated = *updated;
                    report.passes = *passes;
                }
                TaxonomyOutcome::Skipped { .. } => {}
                TaxonomyOutcome::Failed { error, .. } => {
                    report.status = "failed";
                    report.error_kind = Some(error.kind());
                    report.error = Some(error.to_string());
                }
            }
            report
        })
        .collect()
}
