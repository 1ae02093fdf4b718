//! Tiercache demo node.
//!
//! Runs one cache node and serves a line console on stdin:
//!
//! ```text
//! get <key>                 read through both tiers
//! put <key> <value> [ttl]   write through both tiers (ttl like 30s, 5m)
//! del <key>                 remove everywhere
//! has <key>                 check the local tier only
//! clear                     drop every entry of the demo cache
//! stats                     counters and breaker state
//! quit
//! ```
//!
//! With `TIERCACHE_REDIS_URL` set, the remote tier and bus are Redis, so
//! several nodes can be started against the same server. Otherwise the
//! node runs on in-process tiers.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

use tiercache::cache::{CacheCoordinator, CacheManager};
use tiercache::config::Settings;
use tiercache::metrics::{FacadeMetricsCollector, describe_metrics};
use tiercache::remote::{InMemoryRemoteTier, RedisRemoteTier};
use tiercache::sync::{MemoryBroker, RedisBus};
use tiercache::utils::{format_duration, parse_duration};

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

const DEMO_CACHE: &str = "demo";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Default to info for our crate when RUST_LOG is not set
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tiercache=info"));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting tiercache node...");

    let settings = Settings::from_env()?;
    info!("Configuration loaded successfully");

    describe_metrics();
    let manager = build_manager(&settings).await?;
    manager.start().await?;

    let cache = manager.get_cache::<String>(DEMO_CACHE)?;
    info!(node = %manager.node_id(), cache = DEMO_CACHE, "Node ready, type `help` for commands");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            break;
        };

        let reply = match Command::parse(&line) {
            Ok(Command::Quit) => break,
            Ok(command) => execute(&manager, &cache, command).await,
            Err(message) => message,
        };
        if !reply.is_empty() {
            stdout.write_all(reply.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
        }
    }

    manager.shutdown().await;
    info!("Node stopped");
    Ok(())
}

async fn build_manager(settings: &Settings) -> anyhow::Result<CacheManager> {
    let mut builder = CacheManager::builder()
        .defaults(settings.cache.clone())
        .resilience(settings.resilience.clone())
        .retry(settings.retry.clone())
        .metrics(Arc::new(FacadeMetricsCollector::new()));

    if let Some(node_id) = &settings.node_id {
        builder = builder.node_id(node_id.clone());
    }

    builder = match &settings.redis_url {
        Some(url) => {
            info!("Connecting to Redis...");
            let remote = RedisRemoteTier::connect(url).await?;
            let bus = RedisBus::connect(url, settings.channel.clone()).await?;
            info!(channel = %settings.channel, "Redis connected");
            builder.remote(Arc::new(remote)).bus(Arc::new(bus))
        }
        None => {
            info!("TIERCACHE_REDIS_URL not set, using in-process tiers");
            let broker = MemoryBroker::new();
            builder
                .remote(Arc::new(InMemoryRemoteTier::new()))
                .bus(Arc::new(broker.bus()))
        }
    };

    Ok(builder.build())
}

/// A parsed console line.
#[derive(Debug, PartialEq)]
enum Command {
    Get(String),
    Put {
        key: String,
        value: String,
        ttl: Option<Duration>,
    },
    Del(String),
    Has(String),
    Clear,
    Stats,
    Help,
    Quit,
    Nothing,
}

const USAGE: &str = "commands: get <key> | put <key> <value> [ttl] | del <key> | has <key> | clear | stats | quit";

impl Command {
    fn parse(line: &str) -> Result<Self, String> {
        let mut parts = line.split_whitespace();
        let Some(verb) = parts.next() else {
            return Ok(Command::Nothing);
        };
        let args: Vec<&str> = parts.collect();

        let command = match (verb.to_ascii_lowercase().as_str(), args.as_slice()) {
            ("get", [key]) => Command::Get(key.to_string()),
            ("put", [key, value]) => Command::Put {
                key: key.to_string(),
                value: value.to_string(),
                ttl: None,
            },
            ("put", [key, value, ttl]) => Command::Put {
                key: key.to_string(),
                value: value.to_string(),
                ttl: Some(parse_duration(ttl).ok_or_else(|| format!("invalid ttl '{ttl}'"))?),
            },
            ("del", [key]) => Command::Del(key.to_string()),
            ("has", [key]) => Command::Has(key.to_string()),
            ("clear", []) => Command::Clear,
            ("stats", []) => Command::Stats,
            ("help", []) => Command::Help,
            ("quit" | "exit", []) => Command::Quit,
            _ => return Err(USAGE.to_string()),
        };
        Ok(command)
    }
}

async fn execute(manager: &CacheManager, cache: &CacheCoordinator<String>, command: Command) -> String {
    let result = match command {
        Command::Get(key) => cache
            .get(&key)
            .await
            .map(|value| value.unwrap_or_else(|| "(nil)".to_string())),
        Command::Put { key, value, ttl } => {
            let stored = match ttl {
                Some(ttl) => cache.put_with_ttl(&key, value, ttl).await,
                None => cache.put(&key, value).await,
            };
            stored.map(|()| "OK".to_string())
        }
        Command::Del(key) => cache
            .remove(&key)
            .await
            .map(|existed| if existed { "1" } else { "0" }.to_string()),
        Command::Has(key) => Ok(cache.contains_key(&key).to_string()),
        Command::Clear => cache.clear().await.map(|()| "OK".to_string()),
        Command::Stats => {
            let stats = cache.stats();
            Ok(format!(
                "hits={} (l1={} l2={}) misses={} hit_rate={:.2} loads={}/{} avg_load={} puts={} removes={} evictions={} l1_size={} breaker={}",
                stats.hits,
                stats.l1_hits,
                stats.l2_hits,
                stats.misses,
                stats.hit_rate(),
                stats.load_successes,
                stats.load_successes + stats.load_failures,
                format_duration(stats.average_load_time()),
                stats.puts,
                stats.removes,
                stats.evictions,
                stats.l1_size,
                manager.breaker().state(),
            ))
        }
        Command::Help => Ok(USAGE.to_string()),
        Command::Quit | Command::Nothing => Ok(String::new()),
    };

    result.unwrap_or_else(|e| format!("error: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse("get a"), Ok(Command::Get("a".into())));
        assert_eq!(
            Command::parse("put a 1 30s"),
            Ok(Command::Put {
                key: "a".into(),
                value: "1".into(),
                ttl: Some(Duration::from_secs(30)),
            })
        );
        assert_eq!(Command::parse("  "), Ok(Command::Nothing));
        assert_eq!(Command::parse("QUIT"), Ok(Command::Quit));
        assert!(Command::parse("put a 1 soon").is_err());
        assert!(Command::parse("get").is_err());
    }

    #[tokio::test]
    async fn test_execute_against_in_process_node() {
        let manager = CacheManager::builder()
            .remote(Arc::new(InMemoryRemoteTier::new()))
            .build();
        let cache = manager.get_cache::<String>(DEMO_CACHE).unwrap();

        let put = Command::parse("put k v").unwrap();
        assert_eq!(execute(&manager, &cache, put).await, "OK");
        assert_eq!(execute(&manager, &cache, Command::Get("k".into())).await, "v");
        assert_eq!(execute(&manager, &cache, Command::Has("k".into())).await, "true");
        assert_eq!(execute(&manager, &cache, Command::Del("k".into())).await, "1");
        assert_eq!(execute(&manager, &cache, Command::Get("k".into())).await, "(nil)");
        assert!(execute(&manager, &cache, Command::Stats).await.contains("breaker=closed"));
    }
}
