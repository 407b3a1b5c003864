mod cancel;
mod client;
mod config;
mod coordinator;
mod input;
mod pool;
mod progress;
mod retry;
mod search;
mod sink;
mod transport;
mod walker;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use eyre::{eyre, Result};

use cancel::CancelFlag;
use client::{EndpointClient, SearchFilters};
use config::CrawlConfig;
use coordinator::Coordinator;
use input::NoteList;
use pool::CredentialPool;
use transport::{PlainSigner, Transport};

const EXIT_OK: u8 = 0;
const EXIT_CONFIG: u8 = 1;
const EXIT_PARTIAL: u8 = 2;
const EXIT_CANCELLED: u8 = 130;

#[derive(Parser, Debug)]
#[command(
    name = "xhs-harvester",
    version,
    about = "Resumable note/comment crawler with credential-pool rotation"
)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Crawl notes (body + full reply tree) from an input list or note URLs.
    Crawl(CrawlArgs),

    /// Search a keyword and write an input list consumable by `crawl`.
    Search(SearchArgs),

    /// Inspect and manage the credential pool.
    Pool(PoolArgs),
}

#[derive(Args, Debug)]
struct NetArgs {
    /// Base URL for platform API calls.
    #[arg(long, env = "XHS_API_BASE", default_value = "https://edith.xiaohongshu.com")]
    api_base: String,

    /// Host used when synthesizing note URLs from (note_id, xsec_token).
    #[arg(long, env = "XHS_EXPLORE_HOST", default_value = "www.xiaohongshu.com")]
    explore_host: String,

    /// Optional proxy URL for all platform calls.
    #[arg(long, env = "XHS_PROXY")]
    proxy: Option<String>,

    /// HTTP timeout per request, in seconds.
    #[arg(long, default_value_t = 30)]
    timeout_seconds: u64,

    /// Attempts per credential for transient (network/server) failures.
    #[arg(long, default_value_t = 3)]
    per_credential_attempts: u32,

    /// Full-pool wait rounds before one request gives up.
    #[arg(long, default_value_t = 3)]
    max_wait_rounds: u32,

    /// Seconds to sleep per wait round when the whole pool is unavailable.
    #[arg(long, default_value_t = 10)]
    cooldown_wait_seconds: u64,

    /// Base short-backoff in milliseconds; doubles per attempt.
    #[arg(long, default_value_t = 1000)]
    short_backoff_ms: u64,

    /// Pacing between successful top-level comment pages (ms).
    #[arg(long, default_value_t = 500)]
    top_page_delay_ms: u64,

    /// Pacing between successful sub-comment pages (ms).
    #[arg(long, default_value_t = 3000)]
    sub_page_delay_ms: u64,

    /// Deepest reply level to expand.
    #[arg(long, default_value_t = 10)]
    max_level: u32,

    /// Credential pool config file.
    #[arg(long, env = "XHS_CREDENTIALS", default_value = "cookie_pool_config.json")]
    credentials: PathBuf,
}

#[derive(Args, Debug)]
struct CrawlArgs {
    #[command(flatten)]
    net: NetArgs,

    /// Input list JSON: `{query, notes: [...]}` or a bare descriptor array.
    #[arg(long, required_unless_present = "note")]
    input: Option<PathBuf>,

    /// Crawl these note URLs directly instead of an input file (repeatable).
    #[arg(long = "note", conflicts_with = "input")]
    note: Vec<String>,

    /// Output directory. Defaults to `parsed_<input-stem>` so reruns resume;
    /// pass an explicit directory to keep runs apart.
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Fetch note metadata only, skip all comments.
    #[arg(long)]
    no_comments: bool,

    /// Keep short completed notes as completed instead of re-walking them.
    #[arg(long)]
    no_recheck: bool,
}

#[derive(Args, Debug)]
struct SearchArgs {
    #[command(flatten)]
    net: NetArgs,

    /// Search keyword.
    query: String,

    /// How many note descriptors to collect.
    #[arg(long, default_value_t = 20)]
    num: usize,

    /// Output JSON path (default: search_results/search_<query>_<timestamp>.json).
    #[arg(long)]
    output: Option<PathBuf>,

    /// Sort: 0 default, 1 newest, 2 most liked, 3 most commented, 4 most collected.
    #[arg(long, default_value_t = 0)]
    sort: u8,

    /// Note type: 0 all, 1 video, 2 image.
    #[arg(long, default_value_t = 0)]
    note_type: u8,
}

#[derive(Args, Debug)]
struct PoolArgs {
    /// Credential pool config file.
    #[arg(long, env = "XHS_CREDENTIALS", default_value = "cookie_pool_config.json")]
    credentials: PathBuf,

    #[command(subcommand)]
    cmd: PoolCommand,
}

#[derive(Subcommand, Debug)]
enum PoolCommand {
    /// Add one credential (the opaque cookie string).
    Add {
        cookie: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long, default_value = "")]
        remark: String,
    },

    /// Remove a credential by fingerprint.
    Remove { fingerprint: String },

    /// Show pool status and per-account counters.
    List,

    /// Clear cooldowns and error counters for one account, or `--all`.
    Reset {
        fingerprint: Option<String>,
        #[arg(long)]
        all: bool,
    },

    /// Batch import from a text file: `cookie`, `name|cookie` or
    /// `name|cookie|remark` per line; `#` starts a comment.
    Import { file: PathBuf },

    /// Import credentials from the COOKIES env var (double-newline
    /// separated), typically set through `.env`.
    ImportEnv,

    /// Set the rotation strategy: round_robin, random or least_used.
    SetStrategy { strategy: String },

    /// Update daily_limit / min_interval for one account or all of them.
    Tune {
        #[arg(long)]
        fingerprint: Option<String>,
        #[arg(long)]
        daily_limit: Option<u32>,
        #[arg(long)]
        min_interval: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            tracing::error!(error = %err, "fatal");
            ExitCode::from(EXIT_CONFIG)
        }
    }
}

async fn run(cli: Cli) -> Result<u8> {
    match cli.cmd {
        Command::Crawl(args) => run_crawl(args).await,
        Command::Search(args) => run_search(args).await,
        Command::Pool(args) => run_pool(args),
    }
}

fn build_config(net: &NetArgs, include_comments: bool, recheck: bool) -> Result<CrawlConfig> {
    CrawlConfig::from_cli(
        net.api_base.clone(),
        net.explore_host.clone(),
        net.proxy.clone(),
        net.timeout_seconds,
        net.per_credential_attempts,
        net.max_wait_rounds,
        net.cooldown_wait_seconds,
        net.short_backoff_ms,
        net.top_page_delay_ms,
        net.sub_page_delay_ms,
        net.max_level,
        include_comments,
        recheck,
    )
}

fn open_pool_for_crawling(path: &PathBuf) -> Result<CredentialPool> {
    let pool = CredentialPool::open(path)?;
    if pool.is_empty() {
        // Last resort before refusing: the environment may carry cookies.
        pool.import_env()?;
    }
    if pool.is_empty() {
        return Err(eyre::Report::new(retry::CrawlFailure::new(
            retry::FailureKind::Config,
            format!(
                "credential pool {} is empty; add accounts with `pool add` or `pool import`",
                path.display()
            ),
        )));
    }
    Ok(pool)
}

fn build_client(cfg: &CrawlConfig) -> Result<EndpointClient> {
    let transport = Transport::new(
        &cfg.api_base,
        cfg.proxy.as_deref(),
        cfg.request_timeout,
        Arc::new(PlainSigner),
    )?;
    Ok(EndpointClient::new(transport))
}

async fn run_crawl(args: CrawlArgs) -> Result<u8> {
    let cfg = build_config(&args.net, !args.no_comments, !args.no_recheck)?;
    let pool = open_pool_for_crawling(&args.net.credentials)?;
    let client = build_client(&cfg)?;

    let (list, source_reference, default_dir) = if let Some(input) = &args.input {
        let list = input::load_note_list(input, &cfg.explore_host)?;
        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "input".to_string());
        (
            list,
            input.display().to_string(),
            PathBuf::from(format!("parsed_{stem}")),
        )
    } else {
        let notes = input::descriptors_from_urls(&args.note)?;
        let source = format!("direct_data_{}_notes", notes.len());
        (
            NoteList { query: None, notes },
            source,
            PathBuf::from("parsed_direct_data"),
        )
    };
    let output_dir = args.output_dir.unwrap_or(default_dir);

    let cancel = CancelFlag::new();
    cancel::install_ctrl_c(cancel.clone());

    tracing::info!(
        notes = list.notes.len(),
        output_dir = %output_dir.display(),
        credentials = pool.len(),
        strategy = %pool.strategy(),
        "crawl starting"
    );

    let coordinator = Coordinator {
        client: &client,
        pool: &pool,
        policy: &cfg.retry,
        walker_cfg: &cfg.walker,
        cancel: &cancel,
        include_comments: cfg.include_comments,
        recheck_incomplete: cfg.recheck_incomplete,
    };
    let report = coordinator.run(&list, &output_dir, &source_reference).await?;

    Ok(if report.cancelled {
        EXIT_CANCELLED
    } else if report.failed > 0 {
        EXIT_PARTIAL
    } else {
        EXIT_OK
    })
}

async fn run_search(args: SearchArgs) -> Result<u8> {
    let cfg = build_config(&args.net, true, true)?;
    let pool = open_pool_for_crawling(&args.net.credentials)?;
    let client = build_client(&cfg)?;

    let cancel = CancelFlag::new();
    cancel::install_ctrl_c(cancel.clone());

    let filters = SearchFilters {
        sort_type: args.sort,
        note_type: args.note_type,
    };
    let notes = search::search_notes(
        &client,
        &pool,
        &cfg.retry,
        &cancel,
        &args.query,
        args.num,
        &filters,
        &cfg.explore_host,
    )
    .await?;

    let output = args
        .output
        .unwrap_or_else(|| search::default_output_path(&args.query));
    search::write_search_results(&output, &args.query, args.num, &notes)?;
    println!("{}", output.display());

    Ok(if cancel.is_cancelled() {
        EXIT_CANCELLED
    } else {
        EXIT_OK
    })
}

fn run_pool(args: PoolArgs) -> Result<u8> {
    let pool = CredentialPool::open(&args.credentials)?;
    match args.cmd {
        PoolCommand::Add { cookie, name, remark } => {
            match pool.add(&cookie, name.as_deref(), &remark)? {
                Some(fingerprint) => println!("added {}", &fingerprint[..16]),
                None => println!("already present"),
            }
        }
        PoolCommand::Remove { fingerprint } => {
            if pool.remove(&fingerprint)? {
                println!("removed");
            } else {
                return Err(eyre!("no credential with fingerprint '{fingerprint}'"));
            }
        }
        PoolCommand::List => print_pool(&pool),
        PoolCommand::Reset { fingerprint, all } => match (fingerprint, all) {
            (Some(fp), false) => {
                if pool.reset(&fp)? {
                    println!("reset");
                } else {
                    return Err(eyre!("no credential with fingerprint '{fp}'"));
                }
            }
            (None, true) => {
                let n = pool.reset_all()?;
                println!("reset {n} accounts");
            }
            _ => return Err(eyre!("pass a fingerprint or --all")),
        },
        PoolCommand::Import { file } => {
            let contents = std::fs::read_to_string(&file)
                .map_err(|e| eyre!("failed to read {}: {e}", file.display()))?;
            let added = pool.import_lines(&contents)?;
            println!("imported {added} accounts");
        }
        PoolCommand::ImportEnv => {
            let added = pool.import_env()?;
            println!("imported {added} accounts from COOKIES");
        }
        PoolCommand::SetStrategy { strategy } => {
            pool.set_strategy(strategy.parse()?)?;
            println!("strategy set to {strategy}");
        }
        PoolCommand::Tune {
            fingerprint,
            daily_limit,
            min_interval,
        } => {
            if daily_limit.is_none() && min_interval.is_none() {
                return Err(eyre!("pass --daily-limit and/or --min-interval"));
            }
            let touched = pool.tune(fingerprint.as_deref(), daily_limit, min_interval)?;
            println!("updated {touched} accounts");
        }
    }
    Ok(EXIT_OK)
}

fn print_pool(pool: &CredentialPool) {
    let snap = pool.snapshot();
    println!(
        "accounts: {} total, {} active, {} available now | strategy: {}",
        snap.total, snap.active, snap.available, snap.strategy
    );
    for account in &snap.accounts {
        println!("---");
        println!("  name:        {}", account.name);
        println!("  fingerprint: {}", &account.fingerprint[..16]);
        if !account.remark.is_empty() {
            println!("  remark:      {}", account.remark);
        }
        println!("  active:      {}", account.is_active);
        println!(
            "  usage:       {} total, {}/{} today, min interval {}s",
            account.use_count, account.daily_use_count, account.daily_limit, account.min_interval
        );
        println!(
            "  results:     {} ok / {} failed, {} consecutive errors, {} notes",
            account.success_count, account.fail_count, account.error_count, account.total_notes
        );
        if let Some(last) = account.last_use_time {
            println!("  last used:   {last}");
        }
        if let Some(until) = account.cooldown_until {
            println!("  cooldown:    until {until}");
        }
    }
}
