use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand};
use frametrack_core::catalog::{Category, ItemFilter, load_catalog, require_catalog};
use frametrack_core::config::{TrackerConfig, load_config};
use frametrack_core::import::{apply_bulk_import, read_name_list};
use frametrack_core::lookup::{BrowserOpener, LookupOutcome, run_lookup};
use frametrack_core::progress::{
    ProgressStore, ProgressSummary, orphaned_ids, prune_orphans, render_progress_toml,
};
use frametrack_core::refresh::{
    DatasetSource, HttpDatasetSource, HttpSourceConfig, ListDirectorySource, RefreshReport,
    refresh,
};
use frametrack_core::runtime::{
    PathOverrides, ResolutionContext, ResolvedPaths, init_layout, inspect_runtime,
    normalize_for_display, resolve_paths,
};
use frametrack_core::server::serve;
use frametrack_core::web::WebApp;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "frametrack",
    version,
    about = "Track Warframe collection progress and look up items on the wiki"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    data_dir: Option<PathBuf>,
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
    data_dir: Option<PathBuf>,
    config: Option<PathBuf>,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            project_root: cli.project_root.clone(),
            data_dir: cli.data_dir.clone(),
            config: cli.config.clone(),
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Create the runtime layout and a default config file")]
    Init(InitArgs),
    #[command(about = "Show runtime paths, catalog and progress state")]
    Status,
    #[command(about = "Re-download the item list and replace the resource file")]
    Refresh(RefreshArgs),
    #[command(about = "List catalog items with optional filters")]
    Items(ItemsArgs),
    #[command(about = "Serve the progress tracker page")]
    Serve(ServeArgs),
    #[command(about = "Pick an item interactively and open its wiki page")]
    Lookup,
    Progress(ProgressArgs),
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Overwrite an existing config file")]
    force: bool,
}

#[derive(Debug, Args)]
struct RefreshArgs {
    #[arg(
        long,
        value_name = "DIR",
        help = "Build the catalog from <slug>.txt name lists instead of downloading"
    )]
    from_lists: Option<PathBuf>,
    #[arg(long, value_name = "URL", help = "Override the data set URL")]
    dataset_url: Option<String>,
}

#[derive(Debug, Args)]
struct ItemsArgs {
    #[arg(short = 'c', long, value_name = "NAME", help = "Filter by category")]
    category: Option<String>,
    #[arg(short = 'n', long, value_name = "TEXT", help = "Filter by name substring")]
    name: Option<String>,
}

#[derive(Debug, Args)]
struct ServeArgs {
    #[arg(long, value_name = "ADDR", help = "Address to listen on")]
    bind: Option<String>,
}

#[derive(Debug, Args)]
struct ProgressArgs {
    #[command(subcommand)]
    command: ProgressSubcommand,
}

#[derive(Debug, Subcommand)]
enum ProgressSubcommand {
    Stats,
    #[command(about = "Mark every item named in FILE (one per line) as owned and completed")]
    Import { file: PathBuf },
    #[command(about = "Write progress as TOML")]
    Export {
        #[arg(long, value_name = "FILE")]
        output: Option<PathBuf>,
    },
    #[command(about = "List stored progress for items no longer in the catalog")]
    Orphans,
    #[command(about = "Delete stored progress for items no longer in the catalog")]
    Prune,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Init(args)) => run_init(&runtime, args),
        Some(Commands::Status) => run_status(&runtime),
        Some(Commands::Refresh(args)) => run_refresh(&runtime, args),
        Some(Commands::Items(args)) => run_items(&runtime, args),
        Some(Commands::Serve(args)) => run_serve(&runtime, args),
        Some(Commands::Lookup) => run_lookup_command(&runtime),
        Some(Commands::Progress(ProgressArgs { command })) => match command {
            ProgressSubcommand::Stats => run_progress_stats(&runtime),
            ProgressSubcommand::Import { file } => run_progress_import(&runtime, &file),
            ProgressSubcommand::Export { output } => {
                run_progress_export(&runtime, output.as_deref())
            }
            ProgressSubcommand::Orphans => run_progress_orphans(&runtime),
            ProgressSubcommand::Prune => run_progress_prune(&runtime),
        },
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn run_init(runtime: &RuntimeOptions, args: InitArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = init_layout(&paths, args.force)?;

    println!("Initialized frametrack runtime layout");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!("state_dir: {}", normalize_path(&paths.state_dir));
    println!("data_dir: {}", normalize_path(&paths.data_dir));
    println!("db_path: {}", normalize_path(&paths.db_path));
    println!("config_path: {}", normalize_path(&paths.config_path));
    println!("resources_path: {}", normalize_path(&paths.resources_path));
    println!("created_dirs: {}", report.created_dirs.len());
    println!("wrote_config: {}", report.wrote_config);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_status(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let status = inspect_runtime(&paths)?;

    println!("runtime status");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!("state_dir_exists: {}", format_flag(status.state_dir_exists));
    println!("config_exists: {}", format_flag(status.config_exists));
    println!("resources_exists: {}", format_flag(status.resources_exists));
    println!(
        "resources_size_bytes: {}",
        format_size(status.resources_size_bytes)
    );
    println!("db_exists: {}", format_flag(status.db_exists));
    println!("db_size_bytes: {}", format_size(status.db_size_bytes));

    if let Some(catalog) = load_catalog(&paths.resources_path)? {
        let progress = ProgressStore::new(&paths.db_path).load()?;
        println!(
            "catalog.source: {}",
            catalog.source.as_deref().unwrap_or("<unknown>")
        );
        print_summary(&ProgressSummary::compute(&catalog, &progress));
    }
    if !status.warnings.is_empty() {
        println!("warnings:");
        for warning in &status.warnings {
            println!("  - {warning}");
        }
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_refresh(runtime: &RuntimeOptions, args: RefreshArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_runtime_config(&paths)?;

    let mut source: Box<dyn DatasetSource> = match args.from_lists {
        Some(dir) => Box::new(ListDirectorySource::new(&dir)),
        None => {
            let mut http = HttpSourceConfig::from_config(&config);
            if let Some(url) = args.dataset_url {
                http.dataset_url = url;
            }
            Box::new(HttpDatasetSource::new(http)?)
        }
    };

    let report = refresh(source.as_mut(), &paths.resources_path, &config.wiki_url())
        .context("resource refresh failed; the previous resource file was left unchanged")?;
    print_refresh_report(&report);

    let progress = ProgressStore::new(&paths.db_path).load()?;
    if let Some(catalog) = load_catalog(&paths.resources_path)? {
        let orphans = orphaned_ids(&progress, &catalog);
        if !orphans.is_empty() {
            println!(
                "orphaned_progress: {} (review with `frametrack progress orphans`)",
                orphans.len()
            );
        }
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_items(runtime: &RuntimeOptions, args: ItemsArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let catalog = require_catalog(&paths.resources_path)?;
    let progress = ProgressStore::new(&paths.db_path).load()?;
    let filter = ItemFilter {
        category: args.category.as_deref().map(Category::parse).transpose()?,
        name: args.name,
    };

    let items = catalog.filter(&filter);
    println!("items.count: {}", items.len());
    if items.is_empty() {
        println!("items: <none>");
    }
    for item in items {
        let entry = progress.get(&item.id).copied().unwrap_or_default().normalized();
        println!(
            "[{}{}] {} | {} | {}",
            if entry.blueprint { "B" } else { "-" },
            if entry.completed { "C" } else { "-" },
            item.id,
            item.name,
            item.url
        );
    }
    Ok(())
}

fn run_serve(runtime: &RuntimeOptions, args: ServeArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_runtime_config(&paths)?;
    let catalog = require_catalog(&paths.resources_path)?;
    let bind = args.bind.unwrap_or_else(|| config.bind());

    println!("serving: http://{bind}/");
    println!("items: {}", catalog.items.len());
    println!("db_path: {}", normalize_path(&paths.db_path));
    print_diagnostics(runtime, &paths);

    let app = WebApp::new(catalog, ProgressStore::new(&paths.db_path));
    serve(&app, &bind)
}

fn run_lookup_command(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let catalog = require_catalog(&paths.resources_path)?;

    let stdin = io::stdin();
    let mut input = stdin.lock();
    let mut output = io::stdout();
    match run_lookup(&catalog, &mut input, &mut output, &mut BrowserOpener)? {
        LookupOutcome::Opened(_) => {}
        LookupOutcome::Cancelled => println!("lookup cancelled"),
    }
    Ok(())
}

fn run_progress_stats(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let catalog = require_catalog(&paths.resources_path)?;
    let progress = ProgressStore::new(&paths.db_path).load()?;

    println!("progress stats");
    println!("db_path: {}", normalize_path(&paths.db_path));
    println!("entries: {}", progress.len());
    print_summary(&ProgressSummary::compute(&catalog, &progress));
    Ok(())
}

fn run_progress_import(runtime: &RuntimeOptions, file: &Path) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let catalog = require_catalog(&paths.resources_path)?;
    let store = ProgressStore::new(&paths.db_path);
    let names = read_name_list(file)?;

    let mut progress = store.load()?;
    let report = apply_bulk_import(&mut progress, &catalog, &names);
    let saved = store.save(&progress)?;

    println!("progress import");
    println!("file: {}", normalize_path(file));
    println!("requested: {}", report.requested);
    println!("matched: {}", report.matched.len());
    println!("changed: {}", saved.changed);
    if report.unmatched.is_empty() {
        println!("unmatched: <none>");
    } else {
        for name in &report.unmatched {
            println!("unmatched.name: {name}");
        }
    }
    Ok(())
}

fn run_progress_export(runtime: &RuntimeOptions, output: Option<&Path>) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let progress = ProgressStore::new(&paths.db_path).load()?;
    let rendered = render_progress_toml(&progress)?;

    match output {
        Some(path) => {
            fs::write(path, rendered)
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("exported: {} entries to {}", progress.len(), normalize_path(path));
        }
        None => print!("{rendered}"),
    }
    Ok(())
}

fn run_progress_orphans(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let catalog = require_catalog(&paths.resources_path)?;
    let progress = ProgressStore::new(&paths.db_path).load()?;

    println!("progress orphans");
    println!("mode: report-only");
    print_orphans(&orphaned_ids(&progress, &catalog));
    Ok(())
}

fn run_progress_prune(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let catalog = require_catalog(&paths.resources_path)?;
    let store = ProgressStore::new(&paths.db_path);

    let mut progress = store.load()?;
    let pruned = prune_orphans(&mut progress, &catalog);
    let report = store.save(&progress)?;

    println!("progress prune");
    print_orphans(&pruned);
    println!("removed_rows: {}", report.removed);
    Ok(())
}

fn print_orphans(orphans: &[String]) {
    println!("orphans.count: {}", orphans.len());
    if orphans.is_empty() {
        println!("orphans: <none>");
    }
    for id in orphans {
        println!("orphans.id: {id}");
    }
}

fn print_refresh_report(report: &RefreshReport) {
    println!("resource refresh");
    println!("source: {}", report.source);
    println!("resources_path: {}", report.resources_path);
    println!("total_items: {}", report.total_items);
    for (category, count) in &report.by_category {
        println!("category.{category}: {count}");
    }
    println!("added: {}", report.added.len());
    println!("removed: {}", report.removed.len());
    println!("changed: {}", format_flag(report.changed));
    println!("content_hash: {}", report.content_hash);
}

fn print_summary(summary: &ProgressSummary) {
    for (category, counts) in &summary.by_category {
        println!(
            "progress.{}: {}/{} completed, {} blueprints",
            category.label(),
            counts.completed,
            counts.total,
            counts.blueprint
        );
    }
    let totals = summary.totals();
    println!(
        "progress.total: {}/{} completed, {} blueprints",
        totals.completed, totals.total, totals.blueprint
    );
    println!("progress.orphaned: {}", summary.orphaned);
}

fn print_diagnostics(runtime: &RuntimeOptions, paths: &ResolvedPaths) {
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
}

fn load_runtime_config(paths: &ResolvedPaths) -> Result<TrackerConfig> {
    load_config(&paths.config_path)
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    dotenvy::dotenv().ok();

    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        project_root: runtime.project_root.clone(),
        data_dir: runtime.data_dir.clone(),
        config: runtime.config.clone(),
    };

    let initial = resolve_paths(&context, &overrides)?;
    let project_env = initial.project_root.join(".env");
    if project_env.exists() {
        let _ = dotenvy::from_path_override(&project_env);
    }

    let paths = resolve_paths(&context, &overrides)?;
    debug!(
        project_root = %normalize_path(&paths.project_root),
        root_source = paths.root_source.as_str(),
        "resolved runtime paths"
    );
    Ok(paths)
}

fn normalize_path(path: &Path) -> String {
    normalize_for_display(path)
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}

fn format_size(value: Option<u64>) -> String {
    value
        .map(|size| size.to_string())
        .unwrap_or_else(|| "n/a".to_string())
}
