use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use log::info;
use serde::Serialize;
use tdb_store::{
    Expiration, HardCacheApi, ThingStore, Timestamp, load_or_init_config, open_hardcache,
};
use tracing_subscriber::filter::LevelFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();
    match cli.command {
        Command::Bootstrap(args) => bootstrap(args).await,
        Command::SweepHardcache(args) => sweep_hardcache(args).await,
        Command::CacheGet(args) => cache_get(args).await,
        Command::Health(args) => check_health(args).await,
    }
}

#[derive(Parser)]
#[command(author, version, about = "Operator utilities for thing store deployments")]
struct Cli {
    /// Log at debug level.
    #[arg(long, global = true, default_value_t = false)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create missing tables and print the resolved type ids.
    Bootstrap(BootstrapArgs),
    /// Delete expired hard cache rows from every master engine.
    SweepHardcache(SweepArgs),
    /// Print one hard cache entry as JSON.
    CacheGet(CacheGetArgs),
    /// Ping every configured engine.
    Health(HealthArgs),
}

#[derive(Parser)]
struct BootstrapArgs {
    /// Directory holding tdb.json (created with a SQLite default when absent).
    #[arg(long, default_value = ".tdb")]
    config_dir: PathBuf,
    /// Print the type ids as JSON instead of a table.
    #[arg(long, default_value_t = false)]
    json: bool,
}

#[derive(Parser)]
struct SweepArgs {
    #[arg(long, default_value = ".tdb")]
    config_dir: PathBuf,
    /// Rows deleted per statement.
    #[arg(long, default_value_t = 1000)]
    batch: u64,
    /// Only rows that expired before this unix time (seconds).
    #[arg(long)]
    before: Option<i64>,
}

#[derive(Parser)]
struct CacheGetArgs {
    #[arg(long, default_value = ".tdb")]
    config_dir: PathBuf,
    /// `<category>-<ids>`
    key: String,
    /// Read from the master instead of a replica.
    #[arg(long, default_value_t = false)]
    master: bool,
}

#[derive(Parser)]
struct HealthArgs {
    #[arg(long, default_value = ".tdb")]
    config_dir: PathBuf,
    /// Only print failures.
    #[arg(long, default_value_t = false)]
    quiet: bool,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
struct TypeIdReport {
    things: Vec<(String, i64)>,
    relations: Vec<(String, i64)>,
}

async fn open(config_dir: &Path) -> Result<ThingStore> {
    let config = load_or_init_config(config_dir)
        .with_context(|| format!("load config under {}", config_dir.display()))?;
    ThingStore::connect(&config, config_dir)
        .await
        .with_context(|| format!("connect engines for '{}'", config.app_name))
}

fn type_report(store: &ThingStore) -> TypeIdReport {
    let registry = store.registry();
    TypeIdReport {
        things: registry
            .thing_types()
            .map(|thing| (thing.name.clone(), thing.id.as_i64()))
            .collect(),
        relations: registry
            .rel_types()
            .map(|rel| (rel.name.clone(), rel.id.as_i64()))
            .collect(),
    }
}

async fn bootstrap(args: BootstrapArgs) -> Result<()> {
    let store = open(&args.config_dir).await?;
    let report = type_report(&store);
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    for (name, id) in &report.things {
        println!("thing    {name:<24} {id}");
    }
    for (name, id) in &report.relations {
        println!("relation {name:<24} {id}");
    }
    Ok(())
}

async fn sweep_hardcache(args: SweepArgs) -> Result<()> {
    let store = open(&args.config_dir).await?;
    let cache = open_hardcache(&args.config_dir, &store, None)?;
    let expiration = match args.before {
        Some(seconds) => Expiration::Before(Timestamp::from_seconds(seconds)),
        None => Expiration::Now,
    };
    let removed = cache.delete_expired(expiration, args.batch).await?;
    info!("sweep finished");
    println!("removed {removed} expired hard cache rows");
    Ok(())
}

async fn cache_get(args: CacheGetArgs) -> Result<()> {
    let store = open(&args.config_dir).await?;
    let cache = open_hardcache(&args.config_dir, &store, None)?;
    let value = if args.master {
        HardCacheApi::get_master(&cache, &args.key).await?
    } else {
        HardCacheApi::get(&cache, &args.key).await?
    };
    match value {
        Some(value) => {
            println!("{}", serde_json::to_string(&value)?);
            Ok(())
        }
        None => Err(anyhow!("'{}' is not cached", args.key)),
    }
}

async fn check_health(args: HealthArgs) -> Result<()> {
    let store = open(&args.config_dir).await?;
    let report = store.engines().health().await;
    let down: Vec<&str> = report
        .iter()
        .filter(|(_, ok)| !ok)
        .map(|(name, _)| name.as_str())
        .collect();
    if !args.quiet {
        for (name, ok) in &report {
            println!("{name:<16} {}", if *ok { "ok" } else { "down" });
        }
    }
    if !down.is_empty() {
        return Err(anyhow!("engines down: {}", down.join(", ")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn cli_parses_sweep_flags() {
        let cli = Cli::parse_from([
            "xtask",
            "sweep-hardcache",
            "--config-dir",
            "/tmp/tdb",
            "--batch",
            "50",
            "--before",
            "1700000000",
        ]);
        match cli.command {
            Command::SweepHardcache(args) => {
                assert_eq!(args.config_dir, PathBuf::from("/tmp/tdb"));
                assert_eq!(args.batch, 50);
                assert_eq!(args.before, Some(1_700_000_000));
            }
            _ => panic!("expected sweep-hardcache command"),
        }
    }

    #[test]
    fn cli_parses_health_defaults() {
        let cli = Cli::parse_from(["xtask", "health"]);
        assert!(!cli.verbose);
        match cli.command {
            Command::Health(args) => {
                assert_eq!(args.config_dir, PathBuf::from(".tdb"));
                assert!(!args.quiet);
            }
            _ => panic!("expected health command"),
        }
    }

    #[tokio::test]
    async fn bootstrap_reports_configured_types() {
        let dir = tempdir().expect("tempdir");
        let mut config = load_or_init_config(dir.path()).expect("config");
        config.things.push(tdb_store::ThingTypeConfig {
            name: "link".to_string(),
            engines: vec!["main".to_string()],
            avoid_master_reads: false,
        });
        let store = ThingStore::connect(&config, dir.path())
            .await
            .expect("store");
        let report = type_report(&store);
        assert_eq!(report.things.len(), 1);
        assert_eq!(report.things[0].0, "link");
        assert!(report.relations.is_empty());
    }
}
