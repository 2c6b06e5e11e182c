use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use wpbootstrap_core::config::load_config;
use wpbootstrap_core::import::{ImportOptions, ImportReport, ImportSettings, import_taxonomies};
use wpbootstrap_core::ledger::lookup_target_term_id;
use wpbootstrap_core::runtime::{
    PathOverrides, ResolutionContext, ResolvedPaths, inspect_runtime, resolve_paths,
};
use wpbootstrap_core::snapshot;

#[derive(Debug, Parser)]
#[command(
    name = "wpbootstrap",
    version,
    about = "Re-create exported WordPress taxonomies in a target installation"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    project_root: Option<PathBuf>,
    config: Option<PathBuf>,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            project_root: cli.project_root.clone(),
            config: cli.config.clone(),
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Show resolved paths and whether they exist")]
    Status,
    Taxonomies(TaxonomiesArgs),
}

#[derive(Debug, Args)]
struct TaxonomiesArgs {
    #[command(subcommand)]
    command: TaxonomiesSubcommand,
}

#[derive(Debug, Subcommand)]
enum TaxonomiesSubcommand {
    #[command(about = "Load the taxonomy snapshot without touching WordPress")]
    Inspect,
    #[command(about = "Materialize the snapshot and re-attach migrated posts")]
    Import(ImportArgs),
    #[command(about = "Look up the target term id recorded for a foreign term id")]
    Lookup(LookupArgs),
}

#[derive(Debug, Args)]
struct ImportArgs {
    #[arg(long, help = "Run against an in-memory store and print the writes")]
    dry_run: bool,
    #[arg(long, help = "Skip re-attaching migrated posts to terms")]
    no_assign: bool,
    #[arg(long, help = "Do not record the term ledger")]
    no_ledger: bool,
    #[arg(long, help = "Print the report as JSON")]
    json: bool,
}

#[derive(Debug, Args)]
struct LookupArgs {
    foreign_term_id: i64,
    #[arg(long, value_name = "SLUG")]
    taxonomy: Option<String>,
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Status) => run_status(&runtime),
        Some(Commands::Taxonomies(TaxonomiesArgs { command })) => match command {
            TaxonomiesSubcommand::Inspect => run_inspect(&runtime),
            TaxonomiesSubcommand::Import(args) => run_import(&runtime, args),
            TaxonomiesSubcommand::Lookup(args) => run_lookup(&runtime, args),
        },
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn run_status(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let status = inspect_runtime(&paths)?;
    let config = load_config(&paths.config_path)?;

    println!("runtime status");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!(
        "project_root_exists: {}",
        format_flag(status.project_root_exists)
    );
    println!(
        "bootstrap_dir_exists: {}",
        format_flag(status.bootstrap_dir_exists)
    );
    println!("state_dir_exists: {}", format_flag(status.state_dir_exists));
    println!("db_exists: {}", format_flag(status.db_exists));
    println!(
        "db_size_bytes: {}",
        status
            .db_size_bytes
            .map(|size| size.to_string())
            .unwrap_or_else(|| "n/a".to_string())
    );
    println!("config_exists: {}", format_flag(status.config_exists));
    println!(
        "snapshot_dir: {}",
        normalize_path(&config.snapshot_dir(&paths))
    );
    println!("post_map: {}", normalize_path(&config.post_map_path(&paths)));
    println!("wp_cli: {}", config.wp_cli());
    println!(
        "wordpress_path: {}",
        config
            .wordpress_path()
            .map(|path| normalize_path(&path))
            .unwrap_or_else(|| "<cwd>".to_string())
    );
    if !status.warnings.is_empty() {
        println!("warnings:");
        for warning in &status.warnings {
            println!("  - {warning}");
        }
    }
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }

    Ok(())
}

fn run_inspect(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    let snapshot_dir = config.snapshot_dir(&paths);
    let model = snapshot::load(&snapshot_dir)?;

    println!("taxonomy snapshot");
    println!("snapshot_dir: {}", normalize_path(&snapshot_dir));
    println!("taxonomies: {}", model.taxonomies.len());
    println!("terms: {}", model.term_count());
    for taxonomy in &model.taxonomies {
        let roots = taxonomy.terms.iter().filter(|term| term.is_root()).count();
        println!(
            "  - {} (type: {}, descriptor: {}, terms: {}, roots: {})",
            taxonomy.slug,
            taxonomy.kind.as_str(),
            taxonomy.term_descriptor.as_str(),
            taxonomy.terms.len(),
            roots
        );
    }
    println!("corrupt: {}", model.corrupt.len());
    for error in &model.corrupt {
        println!("  - {error}");
    }
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }

    if !model.corrupt.is_empty() {
        bail!("{} taxonomy snapshot(s) are corrupt", model.corrupt.len());
    }
    Ok(())
}

fn run_import(runtime: &RuntimeOptions, args: ImportArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    let settings = ImportSettings::resolve(&paths, &config);
    let report = import_taxonomies(
        &settings,
        ImportOptions {
            dry_run: args.dry_run,
            assign_objects: !args.no_assign,
            record_ledger: !args.no_ledger,
        },
    )?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_import_report(&report);
    }
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }

    if !report.success() {
        let mut problems = vec![format!("{} failed taxonomies", report.failed_taxonomies())];
        if report.assignment_error.is_some() {
            problems.push("an aborted object assignment".to_string());
        }
        if report.ledger_error.is_some() {
            problems.push("an unrecorded term ledger".to_string());
        }
        bail!("taxonomy import finished with {}", problems.join(", "));
    }
    Ok(())
}

fn print_import_report(report: &ImportReport) {
    println!("taxonomy import{}", if report.dry_run { " (dry run)" } else { "" });
    println!("snapshot_dir: {}", report.snapshot_dir);
    println!("migrated_posts: {}", report.migrated_posts);
    println!("taxonomies: {}", report.taxonomies.len());
    for taxonomy in &report.taxonomies {
        match taxonomy.status {
            "materialized" => println!(
                "  - {}: materialized (inserted: {}, updated: {}, passes: {})",
                taxonomy.taxonomy, taxonomy.inserted, taxonomy.updated, taxonomy.passes
            ),
            "failed" => println!(
                "  - {}: failed [{}] {}",
                taxonomy.taxonomy,
                taxonomy.error_kind.unwrap_or("unknown"),
                taxonomy.error.as_deref().unwrap_or_default()
            ),
            status => println!("  - {}: {status}", taxonomy.taxonomy),
        }
    }
    match (&report.assignment, &report.assignment_error) {
        (Some(assignment), _) => {
            println!("assignment.objects: {}", assignment.objects);
            println!("assignment.assigned: {}", assignment.assigned);
            println!("assignment.fallbacks: {}", assignment.fallbacks);
            println!("assignment.skipped: {}", assignment.skipped);
        }
        (None, Some(error)) => println!("assignment: aborted ({error})"),
        (None, None) => println!("assignment: skipped"),
    }
    match (report.ledger_rows, &report.ledger_error) {
        (Some(rows), _) => println!("ledger_rows: {rows}"),
        (None, Some(error)) => println!("ledger: failed ({error})"),
        (None, None) => println!("ledger_rows: n/a"),
    }
    println!("requests: {}", report.request_count);
    if !report.writes.is_empty() {
        println!("writes:");
        for write in &report.writes {
            match serde_json::to_string(write) {
                Ok(line) => println!("  {line}"),
                Err(error) => println!("  <unprintable write: {error}>"),
            }
        }
    }
}

fn run_lookup(runtime: &RuntimeOptions, args: LookupArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let entry = lookup_target_term_id(
        &paths.db_path,
        args.foreign_term_id,
        args.taxonomy.as_deref(),
    )?;

    println!("term lookup");
    println!("foreign_term_id: {}", args.foreign_term_id);
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    let Some(entry) = entry else {
        bail!(
            "no recorded target term for foreign id {}{}",
            args.foreign_term_id,
            args.taxonomy
                .as_deref()
                .map(|taxonomy| format!(" in {taxonomy}"))
                .unwrap_or_default()
        );
    };
    println!("taxonomy: {}", entry.taxonomy);
    println!("source_slug: {}", entry.source_slug);
    println!("target_term_id: {}", entry.target_term_id);
    println!("target_slug: {}", entry.target_slug);
    println!("recorded_at_unix: {}", entry.recorded_at_unix);
    Ok(())
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        project_root: runtime.project_root.clone(),
        config: runtime.config.clone(),
    };

    let initial = resolve_paths(&context, &overrides)?;
    let project_env = initial.project_root.join(".env");
    if project_env.exists() {
        let _ = dotenvy::from_path_override(&project_env);
    }

    let paths = resolve_paths(&context, &overrides)?;
    debug!(
        project_root = %paths.project_root.display(),
        root_source = paths.root_source.as_str(),
        config = %paths.config_path.display(),
        "resolved runtime paths"
    );
    Ok(paths)
}

/// Logs go to stderr so stdout stays a clean report.
fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "wpbootstrap=info,wpbootstrap_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
