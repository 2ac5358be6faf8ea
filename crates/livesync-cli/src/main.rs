use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use livesync_cli::cli::{
    init_tracing, render_json, render_text, replay, resolve_config, Fixture, ReplayOptions,
};
use livesync_core::Scope;

#[derive(Parser)]
#[command(name = "livesync-cli")]
#[command(about = "Replay a fixture through a live collection and print what it renders")]
struct Cli {
    /// Fixture JSON (entities per scope plus realtime events)
    #[arg(long, short = 'f')]
    fixture: PathBuf,

    /// Collection scope as kind:id, e.g. channel:general or post:abc
    #[arg(long, short = 's')]
    scope: String,

    /// Path to JSON config file (pageSize, maxResubscribeAttempts, ...)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Older pages to load after the initial window
    #[arg(long, default_value_t = 0)]
    pages: usize,

    /// Print the projection as JSON
    #[arg(long)]
    json: bool,

    /// Pretty-print JSON output
    #[arg(long, short)]
    pretty: bool,

    /// Open every top-level comment's reply thread (post scopes)
    #[arg(long)]
    expand_all: bool,

    /// Debug logging when LIVESYNC_LOG is not set
    #[arg(long, short)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = resolve_config(cli.config.as_deref())?;
    let fixture = Fixture::load(&cli.fixture)?;
    let scope: Scope = cli
        .scope
        .parse()
        .with_context(|| format!("Invalid --scope {:?}", cli.scope))?;

    let options = ReplayOptions {
        scope,
        pages: cli.pages,
        expand_all: cli.expand_all,
    };
    let report = replay(&fixture, config, &options).await?;

    if cli.json {
        println!("{}", render_json(&report, cli.pretty)?);
    } else {
        print!("{}", render_text(&report));
    }
    Ok(())
}
