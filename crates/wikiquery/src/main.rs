use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use wikiquery_core::config::DEFAULT_STATE_DIR;
use wikiquery_core::{
    EngineConfig, ParameterSet, QueryCursor, Request, ResponseCache, Site, load_config,
};

#[derive(Debug, Parser)]
#[command(
    name = "wikiquery",
    version,
    about = "Submit and iterate MediaWiki API queries with retry, continuation and caching"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(short, long, global = true, action = clap::ArgAction::Count, help = "Raise log verbosity (-v debug, -vv trace)")]
    verbose: u8,
    #[arg(long, global = true, help = "Log in with WIKI_BOT_USER/WIKI_BOT_PASS before the request")]
    login: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Submit one request and print the decoded document")]
    Submit(SubmitArgs),
    #[command(about = "Iterate the items of a continued query, one JSON document per line")]
    Iterate(IterateArgs),
    Cache(CacheArgs),
}

#[derive(Debug, Args)]
struct SubmitArgs {
    #[arg(value_name = "KEY=VALUE", required = true)]
    params: Vec<String>,
    #[arg(long, help = "Answer from the response cache when a fresh entry exists")]
    cached: bool,
}

#[derive(Debug, Args)]
struct IterateArgs {
    #[arg(value_name = "KEY=VALUE", required = true)]
    params: Vec<String>,
    #[arg(long, value_name = "N", help = "Stop after N items")]
    limit: Option<usize>,
    #[arg(long, value_name = "N", help = "Preferred items per request")]
    step: Option<u64>,
    #[arg(long, value_name = "FIELD", help = "Stitch items split across pages by this field")]
    merge_by: Option<String>,
    #[arg(long, value_name = "NS", value_delimiter = ',', help = "Restrict to namespaces")]
    namespace: Vec<i64>,
}

#[derive(Debug, Args)]
struct CacheArgs {
    #[command(subcommand)]
    command: CacheSubcommand,
}

#[derive(Debug, Subcommand)]
enum CacheSubcommand {
    #[command(about = "Delete expired and unreadable cache entries")]
    Purge {
        #[arg(long, value_name = "SECONDS", help = "Maximum entry age (defaults to cache.expiry_secs)")]
        max_age: Option<u64>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();
    init_logging(cli.verbose);
    let config = resolve_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Submit(args) => run_submit(config, cli.login, args),
        Commands::Iterate(args) => run_iterate(config, cli.login, args),
        Commands::Cache(CacheArgs {
            command: CacheSubcommand::Purge { max_age },
        }) => run_cache_purge(&config, max_age),
    }
}

fn init_logging(verbosity: u8) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(match verbosity {
            0 => "info",
            1 => "debug",
            _ => "trace",
        })
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn resolve_config(path: Option<&PathBuf>) -> Result<EngineConfig> {
    let path = path
        .cloned()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DIR).join("config.toml"));
    let config = load_config(&path)?.with_env_overrides();
    if config.api_url().is_none() {
        bail!(
            "no API endpoint configured\nSet WIKI_API_URL or [site].api_url in {}",
            path.display()
        );
    }
    Ok(config)
}

fn parse_params(pairs: &[String]) -> Result<ParameterSet> {
    let mut params = ParameterSet::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("expected KEY=VALUE, got '{pair}'");
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("empty parameter name in '{pair}'");
        }
        params.set(key, value);
    }
    Ok(params)
}

fn open_site(config: EngineConfig, login: bool) -> Result<Site> {
    let mut site = Site::new(config).context("failed to initialize MediaWiki client")?;
    if login {
        site.login().context("failed to log in")?;
    }
    Ok(site)
}

fn run_submit(config: EngineConfig, login: bool, args: SubmitArgs) -> Result<()> {
    let params = parse_params(&args.params)?;
    let cache = args.cached.then(|| ResponseCache::from_config(&config));
    let mut site = open_site(config, login)?;

    let document = {
        let mut request = Request::new(&mut site, params)?;
        match &cache {
            Some(cache) => cache.submit(&mut request)?,
            None => request.submit()?,
        }
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&document).context("failed to render response")?
    );
    tracing::debug!(requests = site.request_count(), "done");
    Ok(())
}

fn run_iterate(config: EngineConfig, login: bool, args: IterateArgs) -> Result<()> {
    let params = parse_params(&args.params)?;
    let mut site = open_site(config, login)?;

    let mut cursor = match &args.merge_by {
        Some(field) => QueryCursor::merging(&mut site, params, field)?,
        None => QueryCursor::new(&mut site, params)?,
    };
    cursor.set_maximum_items(args.limit);
    if let Some(step) = args.step {
        cursor.set_query_increment(step);
    }
    if !args.namespace.is_empty() {
        cursor.set_namespaces(&args.namespace);
    }

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut count = 0usize;
    for item in cursor {
        let item = item?;
        writeln!(out, "{item}").context("failed to write item")?;
        count += 1;
    }
    out.flush().context("failed to flush output")?;
    tracing::info!(items = count, requests = site.request_count(), "iteration complete");
    Ok(())
}

fn run_cache_purge(config: &EngineConfig, max_age: Option<u64>) -> Result<()> {
    let cache = ResponseCache::from_config(config);
    let max_age = max_age.map_or_else(|| cache.expiry(), Duration::from_secs);
    let report = cache
        .purge(max_age)
        .with_context(|| format!("failed to purge {}", cache.dir().display()))?;
    println!("cache: {}", cache.dir().display());
    println!("kept: {}", report.kept);
    println!("expired: {}", report.expired);
    println!("corrupt: {}", report.corrupt);
    Ok(())
}
