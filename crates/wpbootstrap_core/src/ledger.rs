use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use tracing::debug;

use crate::model::MaterializedModel;

struct Migration {
    version: u32,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "term_ledger",
        sql: include_str!("migrations/v001_term_ledger.sql"),
    },
    Migration {
        version: 2,
        name: "indexes",
        sql: include_str!("migrations/v002_indexes.sql"),
    },
];

/// One foreign term and where it landed in the target store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerEntry {
    pub taxonomy: String,
    pub foreign_term_id: i64,
    pub source_slug: String,
    pub target_term_id: i64,
    pub target_slug: String,
    pub snapshot_hash: String,
    pub recorded_at_unix: i64,
}

/// Upsert every record of the materialized taxonomies. Returns the row count.
/// Creates the database, its parent directories and pending schema migrations.
pub fn record_materialized(db_path: &Path, model: &MaterializedModel) -> Result<usize> {
    ensure_db_parent(db_path)?;
    let mut connection = open_connection(db_path)?;
    migrate_connection(&connection)?;
    let now = unix_timestamp()?;

    let transaction = connection
        .transaction()
        .context("failed to start ledger transaction")?;
    let mut written = 0usize;
    {
        let mut statement = transaction
            .prepare(
                "INSERT INTO term_ledger (
                    taxonomy, foreign_term_id, source_slug, target_term_id, target_slug,
                    snapshot_hash, recorded_at_unix
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT(taxonomy, foreign_term_id) DO UPDATE SET
                    source_slug = excluded.source_slug,
                    target_term_id = excluded.target_term_id,
                    target_slug = excluded.target_slug,
                    snapshot_hash = excluded.snapshot_hash,
                    recorded_at_unix = excluded.recorded_at_unix",
            )
            .context("failed to prepare ledger upsert")?;

        for taxonomy in model.materialized_taxonomies() {
            for term in &taxonomy.terms {
                let Some(target_term_id) = term.target_id else {
                    continue;
                };
                statement
                    .execute(params![
                        taxonomy.slug,
                        term.foreign_term_id,
                        term.source_slug,
                        target_term_id,
                        term.slug,
                        term.content_hash,
                        now,
                    ])
                    .with_context(|| {
                        format!(
                            "failed to upsert ledger row for {} term {}",
                            taxonomy.slug, term.foreign_term_id
                        )
                    })?;
                written += 1;
            }
        }
    }
    transaction
        .commit()
        .context("failed to commit ledger transaction")?;
    debug!(rows = written, db = %db_path.display(), "term ledger updated");
    Ok(written)
}

/// Target id recorded for a foreign term, optionally scoped to one taxonomy.
///
/// Without a scope the first taxonomy in slug order wins. A missing ledger
/// yields `None`.
pub fn lookup_target_term_id(
    db_path: &Path,
    foreign_term_id: i64,
    taxonomy: Option<&str>,
) -> Result<Option<LedgerEntry>> {
    if !db_path.exists() {
        return Ok(None);
    }
    let connection = open_connection(db_path)?;
    if current_version_if_present(&connection)? == 0 {
        return Ok(None);
    }

    connection
        .query_row(
            "SELECT taxonomy, foreign_term_id, source_slug, target_term_id, target_slug,
                    snapshot_hash, recorded_at_unix
             FROM term_ledger
             WHERE foreign_term_id = ?1 AND (?2 IS NULL OR taxonomy = ?2)
             ORDER BY taxonomy
             LIMIT 1",
            params![foreign_term_id, taxonomy],
            |row| {
                Ok(LedgerEntry {
                    taxonomy: row.get(0)?,
                    foreign_term_id: row.get(1)?,
                    source_slug: row.get(2)?,
                    target_term_id: row.get(3)?,
                    target_slug: row.get(4)?,
                    snapshot_hash: row.get(5)?,
                    recorded_at_unix: row.get(6)?,
                })
            },
        )
        .optional()
        .with_context(|| format!("failed to look up foreign term {foreign_term_id}"))
}

/// Returns the highest applied migration version, or 0 if none applied.
fn current_version(connection: &Connection) -> Result<u32> {
    let version: i64 = connection
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .context("failed to read current migration version")?;
    u32::try_from(version).context("migration version does not fit into u32")
}

fn current_version_if_present(connection: &Connection) -> Result<u32> {
    let exists: i64 = connection
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'schema_migrations')",
            [],
            |row| row.get(0),
        )
        .context("failed to inspect sqlite_master")?;
    if exists == 0 {
        return Ok(0);
    }
    current_version(connection)
}

fn migrate_connection(connection: &Connection) -> Result<()> {
    ensure_schema_migrations_table(connection)?;

    let current = current_version(connection)?;
    for migration in MIGRATIONS {
        if migration.version <= current {
            continue;
        }
        apply_migration(connection, migration).with_context(|| {
            format!(
                "failed to apply migration v{:03}_{}",
                migration.version, migration.name
            )
        })?;
        debug!(
            version = migration.version,
            name = migration.name,
            "applied ledger migration"
        );
    }
    Ok(())
}

fn ensure_schema_migrations_table(connection: &Connection) -> Result<()> {
    connection
        .execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at_unix INTEGER NOT NULL
            );",
        )
        .context("failed to create schema_migrations table")
}

fn apply_migration(connection: &Connection, migration: &Migration) -> Result<()> {
    connection
        .execute_batch("SAVEPOINT migration_apply")
        .context("failed to create savepoint")?;

    let result = (|| -> Result<()> {
        connection
            .execute_batch(migration.sql)
            .with_context(|| format!("SQL execution failed for v{:03}", migration.version))?;
        connection
            .execute(
                "INSERT INTO schema_migrations (version, name, applied_at_unix) VALUES (?1, ?2, ?3)",
                params![i64::from(migration.version), migration.name, unix_timestamp()?],
            )
            .context("failed to record migration")?;
        Ok(())
    })();

    match result {
        Ok(()) => {
            connection
                .execute_batch("RELEASE SAVEPOINT migration_apply")
                .context("failed to release savepoint")?;
            Ok(())
        }
        Err(err) => {
            let _ = connection.execute_batch("ROLLBACK TO SAVEPOINT migration_apply");
            let _ = connection.execute_batch("RELEASE SAVEPOINT migration_apply");
            Err(err)
        }
    }
}

fn open_connection(db_path: &Path) -> Result<Connection> {
    let connection =
        Connection::open(db_path).with_context(|| format!("failed to open {}", db_path.display()))?;
    connection
        .busy_timeout(Duration::from_secs(5))
        .context("failed to set sqlite busy timeout")?;
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to enable WAL journal mode")?;
    Ok(connection)
}

fn ensure_db_parent(db_path: &Path) -> Result<()> {
    let parent = db_path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("db path has no parent: {}", db_path.display()))?;
    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create database parent directory {}",
            parent.display()
        )
    })
}

fn unix_timestamp() -> Result<i64> {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .context("system clock error")?
        .as_secs();
    i64::try_from(now).context("timestamp does not fit into i64")
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::error::TaxonomyError;
    use crate::model::{Taxonomy, TaxonomyOutcome, TaxonomyType, TermDescriptor, TermRecord};

    fn record(source_slug: &str, foreign_term_id: i64, target_id: Option<i64>) -> TermRecord {
        TermRecord {
            source_slug: source_slug.to_string(),
            foreign_term_id,
            foreign_parent_id: 0,
            name: source_slug.to_string(),
            slug: source_slug.to_string(),
            description: String::new(),
            term_group: 0,
            content_hash: format!("hash-{source_slug}"),
            materialized: target_id.is_some(),
            target_id,
        }
    }

    fn taxonomy(slug: &str, terms: Vec<TermRecord>) -> Taxonomy {
        Taxonomy {
            slug: slug.to_string(),
            kind: TaxonomyType::Standard,
            term_descriptor: TermDescriptor::Indirect,
            terms,
        }
    }

    fn model() -> MaterializedModel {
        MaterializedModel {
            taxonomies: vec![
                taxonomy("category", vec![record("news", 3, Some(30)), record("sport", 4, Some(31))]),
                taxonomy("post_tag", vec![record("rust", 3, Some(90))]),
                taxonomy("genre", vec![record("jazz", 5, None)]),
            ],
            outcomes: vec![
                TaxonomyOutcome::Materialized {
                    slug: "category".to_string(),
                    inserted: 2,
                    updated: 0,
                    passes: 1,
                },
                TaxonomyOutcome::Materialized {
                    slug: "post_tag".to_string(),
                    inserted: 1,
                    updated: 0,
                    passes: 1,
                },
                TaxonomyOutcome::Failed {
                    slug: "genre".to_string(),
                    error: TaxonomyError::UnresolvableDependency {
                        taxonomy: "genre".to_string(),
                        unresolved: Vec::new(),
                    },
                },
            ],
        }
    }

    #[test]
    fn migrations_apply_once_across_recordings() {
        let temp = tempdir().expect("tempdir");
        let db_path = temp.path().join("data").join("wpbootstrap.db");
        record_materialized(&db_path, &model()).expect("first");
        record_materialized(&db_path, &model()).expect("second");

        let connection = open_connection(&db_path).expect("open");
        assert_eq!(current_version(&connection).expect("version"), 2);
        let applied: i64 = connection
            .query_row("SELECT COUNT(*) FROM schema_migrations", [], |row| row.get(0))
            .expect("count");
        assert_eq!(applied, i64::try_from(MIGRATIONS.len()).expect("len"));
    }

    #[test]
    fn records_only_materialized_taxonomies() {
        let temp = tempdir().expect("tempdir");
        let db_path = temp.path().join("wpbootstrap.db");

        let written = record_materialized(&db_path, &model()).expect("record");
        assert_eq!(written, 3);

        let news = lookup_target_term_id(&db_path, 3, Some("category"))
            .expect("lookup")
            .expect("news recorded");
        assert_eq!(news.target_term_id, 30);
        assert_eq!(news.target_slug, "news");
        assert_eq!(news.snapshot_hash, "hash-news");

        let tag = lookup_target_term_id(&db_path, 3, Some("post_tag"))
            .expect("lookup")
            .expect("tag recorded");
        assert_eq!(tag.target_term_id, 90);

        let unscoped = lookup_target_term_id(&db_path, 3, None)
            .expect("lookup")
            .expect("unscoped");
        assert_eq!(unscoped.taxonomy, "category");

        assert!(lookup_target_term_id(&db_path, 5, None).expect("lookup").is_none());
    }

    #[test]
    fn rerun_overwrites_rows() {
        let temp = tempdir().expect("tempdir");
        let db_path = temp.path().join("wpbootstrap.db");
        record_materialized(&db_path, &model()).expect("first");

        let mut changed = model();
        changed.taxonomies[0].terms[0].target_id = Some(77);
        record_materialized(&db_path, &changed).expect("second");

        let news = lookup_target_term_id(&db_path, 3, Some("category"))
            .expect("lookup")
            .expect("news");
        assert_eq!(news.target_term_id, 77);
    }

    #[test]
    fn lookup_without_ledger_is_none() {
        let temp = tempdir().expect("tempdir");
        let db_path = temp.path().join("missing.db");
        assert!(lookup_target_term_id(&db_path, 1, None).expect("lookup").is_none());
        assert!(!db_path.exists());
    }
}
