use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::Command;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use tracing::debug;

use crate::config::BootstrapConfig;
use crate::store::{StoredTerm, TaxonomyStore, TermPayload};

/// How to reach the target installation through wp-cli.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WpCliTarget {
    pub binary: String,
    pub wordpress_path: Option<PathBuf>,
    pub url: Option<String>,
    pub allow_root: bool,
}

impl WpCliTarget {
    pub fn from_config(config: &BootstrapConfig) -> Self {
        Self {
            binary: config.wp_cli(),
            wordpress_path: config.wordpress_path(),
            url: config.wordpress_url(),
            allow_root: config.wordpress.allow_root,
        }
    }

    fn global_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(path) = &self.wordpress_path {
            args.push(format!("--path={}", path.display()));
        }
        if let Some(url) = &self.url {
            args.push(format!("--url={url}"));
        }
        if self.allow_root {
            args.push("--allow-root".to_string());
        }
        args
    }
}

/// Taxonomy store backed by the `wp` command line of a live installation.
#[derive(Debug)]
pub struct WpCliStore {
    target: WpCliTarget,
    request_count: usize,
}

impl WpCliStore {
    pub fn new(target: WpCliTarget) -> Self {
        Self {
            target,
            request_count: 0,
        }
    }

    fn run(&mut self, args: Vec<String>) -> Result<String> {
        self.request_count += 1;
        let mut full_args = args;
        full_args.extend(self.target.global_args());
        debug!(binary = %self.target.binary, args = ?full_args, "running wp-cli");

        let output = Command::new(&self.target.binary)
            .args(&full_args)
            .output()
            .with_context(|| format!("failed to execute {}", self.target.binary))?;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "`{} {}` exited with {}: {}",
                self.target.binary,
                full_args.join(" "),
                output
                    .status
                    .code()
                    .map(|code| code.to_string())
                    .unwrap_or_else(|| "signal".to_string()),
                stderr.trim()
            );
        }
        Ok(stdout)
    }
}

impl TaxonomyStore for WpCliStore {
    fn list_registered_taxonomies(&mut self) -> Result<BTreeSet<String>> {
        let stdout = self.run(taxonomy_list_args())?;
        parse_taxonomy_names(&stdout)
    }

    fn list_terms(&mut self, taxonomy: &str) -> Result<Vec<StoredTerm>> {
        let stdout = self.run(term_list_args(taxonomy))?;
        parse_term_list(&stdout)
    }

    fn insert_term(&mut self, name: &str, taxonomy: &str, payload: &TermPayload) -> Result<i64> {
        ensure_positional("term name", name)?;
        let stdout = self.run(term_create_args(name, taxonomy, payload))?;
        parse_porcelain_id(&stdout)
    }

    fn update_term(&mut self, id: i64, taxonomy: &str, payload: &TermPayload) -> Result<()> {
        self.run(term_update_args(id, taxonomy, payload))?;
        Ok(())
    }

    fn set_object_terms(
        &mut self,
        object_id: i64,
        terms: &[String],
        taxonomy: &str,
    ) -> Result<()> {
        if terms.is_empty() {
            return Ok(());
        }
        for term in terms {
            ensure_positional("term slug", term)?;
        }
        self.run(post_term_add_args(object_id, terms, taxonomy))?;
        Ok(())
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

/// wp-cli reads any positional argument starting with `--` as an option.
fn ensure_positional(what: &str, value: &str) -> Result<()> {
    if value.starts_with("--") {
        bail!("{what} `{value}` would be parsed by wp-cli as an option");
    }
    Ok(())
}

fn strings(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|part| part.to_string()).collect()
}

pub fn taxonomy_list_args() -> Vec<String> {
    strings(&["taxonomy", "list", "--format=json", "--fields=name"])
}

pub fn term_list_args(taxonomy: &str) -> Vec<String> {
    strings(&[
        "term",
        "list",
        taxonomy,
        "--format=json",
        "--fields=term_id,slug",
        "--hide_empty=0",
    ])
}

pub fn term_create_args(name: &str, taxonomy: &str, payload: &TermPayload) -> Vec<String> {
    let mut args = strings(&["term", "create", taxonomy, name]);
    args.push(format!("--slug={}", payload.slug));
    args.push(format!("--description={}", payload.description));
    args.push(format!("--parent={}", payload.parent));
    args.push("--porcelain".to_string());
    args
}

pub fn term_update_args(id: i64, taxonomy: &str, payload: &TermPayload) -> Vec<String> {
    let mut args = strings(&["term", "update", taxonomy]);
    args.push(id.to_string());
    args.push(format!("--name={}", payload.name));
    args.push(format!("--slug={}", payload.slug));
    args.push(format!("--description={}", payload.description));
    args.push(format!("--parent={}", payload.parent));
    args
}

/// `post term add` appends; `post term set` would replace existing terms.
pub fn post_term_add_args(object_id: i64, terms: &[String], taxonomy: &str) -> Vec<String> {
    let mut args = strings(&["post", "term", "add"]);
    args.push(object_id.to_string());
    args.push(taxonomy.to_string());
    args.extend(terms.iter().cloned());
    args
}

#[derive(Debug, Deserialize)]
struct TaxonomyRow {
    name: String,
}

#[derive(Debug, Deserialize)]
struct TermRow {
    #[serde(deserialize_with = "crate::snapshot::lenient_i64")]
    term_id: i64,
    #[serde(deserialize_with = "crate::snapshot::lenient_string")]
    slug: String,
}

pub fn parse_taxonomy_names(stdout: &str) -> Result<BTreeSet<String>> {
    let rows: Vec<TaxonomyRow> =
        serde_json::from_str(stdout.trim()).context("failed to parse taxonomy list output")?;
    Ok(rows.into_iter().map(|row| row.name).collect())
}

pub fn parse_term_list(stdout: &str) -> Result<Vec<StoredTerm>> {
    let rows: Vec<TermRow> =
        serde_json::from_str(stdout.trim()).context("failed to parse term list output")?;
    Ok(rows
        .into_iter()
        .map(|row| StoredTerm {
            id: row.term_id,
            slug: row.slug,
        })
        .collect())
}

pub fn parse_porcelain_id(stdout: &str) -> Result<i64> {
    let trimmed = stdout.trim();
    trimmed
        .parse::<i64>()
        .with_context(|| format!("expected a term id from `term create`, got `{trimmed}`"))
}
