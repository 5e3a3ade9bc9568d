use anyhow::Result;
use clap::{Parser, Subcommand};
use proxy_sentinel::{
    cache::{MemoryStore, SharedStore},
    database::ProxyDatabase,
    dispatch::{Dispatcher, GOOD_LIST_KEY},
    proxy::{CheckJob, CheckerConfig, Endpoint, EndpointChecker, Protocol, ProxyParser},
    queue::MemoryQueue,
    stream::StreamServer,
    worker::Worker,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// A proxy validator with protocol detection and live result streaming
#[derive(Parser)]
#[command(name = "proxy-sentinel")]
#[command(about = "A proxy validator with protocol detection and live result streaming")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Database file path
    #[arg(short, long, default_value = "proxies.db", env = "PROXY_SENTINEL_DB")]
    database: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Add proxies from a file without checking them
    Add {
        /// Input file containing proxy lines
        input: PathBuf,
    },
    /// Check stored and newly added proxies, streaming good ones live
    Run {
        /// Optional input file of proxies to add before checking
        #[arg(short, long)]
        input: Option<PathBuf>,
        /// Restrict the check to one protocol (socks4, socks5, http, https)
        #[arg(short = 't', long)]
        protocol: Option<String>,
        /// Re-check every stored proxy instead of only unchecked ones
        #[arg(short, long)]
        all: bool,
        /// Address to serve the good-proxy stream on
        #[arg(long, default_value = "127.0.0.1:9025")]
        stream_addr: String,
        /// Number of concurrent checks
        #[arg(short = 'n', long, default_value = "10")]
        threads: usize,
        /// Per-attempt timeout in seconds
        #[arg(long, default_value = "10")]
        timeout: u64,
        /// Attempts per protocol probe
        #[arg(long, default_value = "3")]
        retries: u32,
    },
    /// Check proxies from a file once and save the results
    Check {
        /// Input file containing proxy lines
        input: PathBuf,
        /// Output file for good proxies
        #[arg(short, long)]
        good: Option<PathBuf>,
        /// Output file for bad proxies
        #[arg(short, long)]
        bad: Option<PathBuf>,
        /// Number of concurrent checks
        #[arg(short = 'n', long, default_value = "10")]
        threads: usize,
        /// Per-attempt timeout in seconds
        #[arg(long, default_value = "10")]
        timeout: u64,
        /// Attempts per protocol probe
        #[arg(long, default_value = "3")]
        retries: u32,
    },
    /// Export stored proxies
    Export {
        /// Output file; prints to stdout when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Export every stored proxy, not only confirmed-alive ones
        #[arg(short, long)]
        all: bool,
        /// One line per confirmed protocol instead of one per proxy
        #[arg(short, long)]
        protocols: bool,
    },
    /// Delete dead and never-checked proxies from the database
    Purge,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let db = ProxyDatabase::new(&cli.database).await?;

    match cli.command {
        Commands::Add { input } => {
            let added = ingest_file(&db, &input).await?;
            println!("Added {} proxies from {:?}", added.len(), input);
        }
        Commands::Run {
            input,
            protocol,
            all,
            stream_addr,
            threads,
            timeout,
            retries,
        } => {
            let protocol = protocol.as_deref().map(str::parse::<Protocol>).transpose()?;

            // per-line protocols from the input file, e.g. `socks5://…`,
            // scope that endpoint's check to the claimed protocol
            let mut line_protocols: HashMap<i64, Protocol> = HashMap::new();
            if let Some(input) = input {
                let added = ingest_file(&db, &input).await?;
                println!("Added {} proxies from {:?}", added.len(), input);
                for (endpoint, claimed) in added {
                    if let Some(claimed) = claimed {
                        line_protocols.insert(endpoint.id, claimed);
                    }
                }
            }

            let endpoints = if all {
                db.get_all().await?
            } else {
                db.get_unchecked().await?
            };
            if endpoints.is_empty() {
                println!("Nothing to check.");
                return Ok(());
            }

            let config = CheckerConfig::new()
                .with_timeout(Duration::from_secs(timeout))
                .with_retries(retries)
                .with_concurrency(threads);

            let queue = Arc::new(MemoryQueue::new());
            let store = Arc::new(MemoryStore::new());
            let dispatcher = Dispatcher::new(
                Arc::clone(&queue),
                Arc::clone(&store),
                config.retry_policy(),
            );

            let listener = TcpListener::bind(&stream_addr).await?;
            println!("Streaming good proxies on {}", stream_addr);
            let stream_store = Arc::clone(&store);
            tokio::spawn(async move {
                let _ = StreamServer::new(stream_store).serve(listener).await;
            });

            let jobs: Vec<CheckJob> = endpoints
                .iter()
                .map(|e| CheckJob::new(e.id, line_protocols.get(&e.id).copied().or(protocol)))
                .collect();
            let initial_len = dispatcher.dispatch_jobs(jobs).await?;
            println!("Checking {} proxies", initial_len);

            let worker = Arc::new(
                Worker::new(
                    Arc::clone(&queue),
                    Arc::clone(&store),
                    db.clone(),
                    EndpointChecker::with_config(config),
                )
                .with_concurrency(threads),
            );
            let running = tokio::spawn(worker.run_until_drained());

            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;
                let progress = dispatcher.get_progress().await?;
                info!("Progress: {}", serde_json::to_string(&progress)?);
                if progress.progressbar_width >= 100.0 {
                    break;
                }
            }
            running.await??;

            let alive = db.get_alive().await?;
            println!("Done: {} alive of {}", alive.len(), initial_len);

            // give connected subscribers a moment to drain the backlog
            while store.llen(GOOD_LIST_KEY).await? > 0 {
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }
        Commands::Check {
            input,
            good,
            bad,
            threads,
            timeout,
            retries,
        } => {
            let (parsed, invalid) = ProxyParser::parse_file(&input)?;
            report_invalid(&invalid);
            println!("Loaded {} proxies from {:?}", parsed.len(), input);
            println!("Checking with {} tasks, timeout: {}s", threads, timeout);
            println!();

            let endpoints: Vec<Endpoint> =
                parsed.into_iter().map(|p| p.into_endpoint()).collect();

            let config = CheckerConfig::new()
                .with_concurrency(threads)
                .with_timeout(Duration::from_secs(timeout))
                .with_retries(retries);
            let checker = EndpointChecker::with_config(config);

            let checked = checker.check_many(endpoints).await;
            let (good_results, bad_results): (Vec<_>, Vec<_>) =
                checked.into_iter().partition(|e| e.is_alive());

            println!(
                "Results: {} good, {} bad",
                good_results.len(),
                bad_results.len()
            );

            if let Some(good_path) = good {
                let lines: Vec<String> =
                    good_results.iter().map(|e| e.to_string()).collect();
                ProxyParser::save_to_file(&lines, &good_path)?;
                println!("Saved {} good proxies to {:?}", lines.len(), good_path);
            }

            if let Some(bad_path) = bad {
                let lines: Vec<String> =
                    bad_results.iter().map(|e| e.credentials_ip_port()).collect();
                ProxyParser::save_to_file(&lines, &bad_path)?;
                println!("Saved {} bad proxies to {:?}", lines.len(), bad_path);
            }

            if !good_results.is_empty() {
                println!("\nWorking proxies:");
                for endpoint in &good_results {
                    if let Some(latency) = endpoint.latency {
                        println!("  {} ({:.0}ms)", endpoint, latency);
                    }
                }
            }
        }
        Commands::Export {
            output,
            all,
            protocols,
        } => {
            let lines: Vec<String> = if all {
                db.get_all()
                    .await?
                    .iter()
                    .map(|e| e.credentials_ip_port())
                    .collect()
            } else if protocols {
                db.get_alive()
                    .await?
                    .iter()
                    .flat_map(|e| e.urls_for_all_protocols())
                    .collect()
            } else {
                // one line per proxy, formatted with its best protocol
                db.get_alive().await?.iter().map(|e| e.to_string()).collect()
            };

            if let Some(output_path) = output {
                ProxyParser::save_to_file(&lines, &output_path)?;
                println!("Saved {} proxies to {:?}", lines.len(), output_path);
            } else {
                for line in &lines {
                    println!("{}", line);
                }
            }
        }
        Commands::Purge => {
            let before = db.count().await?;
            db.purge_dead().await?;
            let after = db.count().await?;
            println!("Purged {} proxies, {} remain", before - after, after);
        }
    }

    Ok(())
}

/// Parse a proxy file and upsert every valid line into the database.
/// Returns each stored endpoint with the protocol its line claimed, if any.
async fn ingest_file(
    db: &ProxyDatabase,
    input: &PathBuf,
) -> Result<Vec<(Endpoint, Option<Protocol>)>> {
    let (parsed, invalid) = ProxyParser::parse_file(input)?;
    report_invalid(&invalid);

    let mut added = Vec::with_capacity(parsed.len());
    for proxy in parsed {
        let claimed = proxy.protocol;
        let stored = db.insert(&proxy.into_endpoint()).await?;
        added.push((stored, claimed));
    }
    Ok(added)
}

fn report_invalid(invalid: &[String]) {
    for line in invalid {
        eprintln!("Skipping invalid line: {}", line);
    }
}
