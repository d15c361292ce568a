//! Shardwarden CLI
//!
//! ```text
//! shardwarden keygen
//! shardwarden split   --threshold 3 --shares 5 --secret "..."
//! shardwarden combine <share-hex> <share-hex> ...
//! shardwarden encode  --input file --out-dir dir --key <hex>
//! shardwarden decode  --dir dir --output file --key <hex>
//! shardwarden simulate --providers 12 --lose 4
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use rand::RngCore;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use shardwarden::adapters::{InMemoryKeyResolver, InMemoryProviderNetwork, InMemoryStore, TracingEventPublisher};
use shardwarden::codec::{CodingMode, FileContext, FileManifest, MasterKey, Shard, ShardCodec, ShardLocation};
use shardwarden::config::EngineConfig;
use shardwarden::domain::ports::{namespaces, EventPublisher, ProviderNetwork, ProviderRequirements, StateStore};
use shardwarden::error::{Error, Result};
use shardwarden::metrics::EngineMetrics;
use shardwarden::monitor::{RedundancyMonitor, RepairEngine};
use shardwarden::sss::{self, Share};

const MANIFEST_FILE: &str = "manifest.json";

// =============================================================================
// CLI Arguments
// =============================================================================

/// Shardwarden - threshold-split encrypted shards with repair and guardian recovery
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, short, env = "SHARDWARDEN_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long, env = "LOG_LEVEL", global = true)]
    log_level: Option<String>,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON", global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a random 256-bit master key
    Keygen,

    /// Split a secret into Shamir shares, one hex share per line
    Split {
        #[arg(long, short = 'k')]
        threshold: usize,

        #[arg(long, short = 'n')]
        shares: usize,

        /// Secret as UTF-8 text
        #[arg(long, conflicts_with = "secret_hex", required_unless_present = "secret_hex")]
        secret: Option<String>,

        /// Secret as hex
        #[arg(long)]
        secret_hex: Option<String>,
    },

    /// Reconstruct a secret from hex shares
    Combine {
        #[arg(required = true)]
        shares: Vec<String>,

        /// Print the secret as hex instead of text
        #[arg(long)]
        hex: bool,
    },

    /// Encrypt and shard a file into a directory
    Encode {
        #[arg(long, short)]
        input: PathBuf,

        #[arg(long, short)]
        out_dir: PathBuf,

        /// Master key, hex
        #[arg(long, env = "SHARDWARDEN_KEY", hide_env_values = true)]
        key: String,

        /// K; defaults to the configured coding threshold
        #[arg(long, short = 'k')]
        threshold: Option<usize>,

        /// N; defaults to the configured total
        #[arg(long, short = 'n')]
        total: Option<usize>,

        /// shamir or erasure
        #[arg(long)]
        mode: Option<CodingMode>,

        #[arg(long)]
        file_id: Option<String>,
    },

    /// Rebuild a file from a shard directory
    Decode {
        #[arg(long, short)]
        dir: PathBuf,

        #[arg(long, short)]
        output: PathBuf,

        /// Master key, hex
        #[arg(long, env = "SHARDWARDEN_KEY", hide_env_values = true)]
        key: String,
    },

    /// Run monitor and repair against a simulated provider network
    Simulate {
        #[arg(long, default_value = "12")]
        providers: usize,

        /// Providers to take offline after placement
        #[arg(long, default_value = "3")]
        lose: usize,

        /// Size of the random test file in bytes
        #[arg(long, default_value = "4096")]
        size: usize,

        /// Seconds to wait for repair
        #[arg(long, default_value = "60")]
        wait: u64,
    },
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };

    let level = args.log_level.clone().unwrap_or_else(|| config.logging.level.clone());
    init_logging(&level, args.log_json || config.logging.json);

    let result = match args.command {
        Command::Keygen => {
            println!("{}", MasterKey::generate().to_hex());
            Ok(())
        }
        Command::Split {
            threshold,
            shares,
            secret,
            secret_hex,
        } => split(threshold, shares, secret, secret_hex),
        Command::Combine { shares, hex } => combine(&shares, hex),
        Command::Encode {
            input,
            out_dir,
            key,
            threshold,
            total,
            mode,
            file_id,
        } => {
            let mut params = config.coding;
            if let Some(k) = threshold {
                params.threshold = k;
            }
            if let Some(n) = total {
                params.total = n;
            }
            if let Some(mode) = mode {
                params.mode = mode;
            }
            encode(&input, &out_dir, &key, params, file_id)
        }
        Command::Decode { dir, output, key } => decode(&dir, &output, &key),
        Command::Simulate {
            providers,
            lose,
            size,
            wait,
        } => simulate(config, providers, lose, size, Duration::from_secs(wait)).await,
    };

    if let Err(e) = &result {
        error!(error = %e, "Command failed");
    }
    result
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(level: &str, json: bool) {
    let level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    if let Ok(directive) = "tokio=warn".parse() {
        filter = filter.add_directive(directive);
    }

    // Logs go to stderr so command output stays pipeable
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}

// =============================================================================
// Commands
// =============================================================================

fn split(threshold: usize, total: usize, secret: Option<String>, secret_hex: Option<String>) -> Result<()> {
    let secret = match (secret, secret_hex) {
        (Some(text), _) => text.into_bytes(),
        (None, Some(encoded)) => {
            hex::decode(encoded.trim()).map_err(|e| Error::InvalidConfig(format!("secret is not valid hex: {}", e)))?
        }
        (None, None) => return Err(Error::InvalidConfig("a secret is required".into())),
    };

    for share in sss::split(&secret, threshold, total)? {
        println!("{}", hex::encode(share.to_bytes()?));
    }
    info!(threshold, total, "Secret split");
    Ok(())
}

fn combine(encoded: &[String], as_hex: bool) -> Result<()> {
    let shares = encoded
        .iter()
        .map(|s| {
            let bytes = hex::decode(s.trim()).map_err(|e| Error::InvalidShare(format!("not valid hex: {}", e)))?;
            Share::from_bytes(&bytes)
        })
        .collect::<Result<Vec<_>>>()?;

    let secret = sss::reconstruct(&shares)?;
    match String::from_utf8(secret) {
        Ok(text) if !as_hex => println!("{}", text),
        Ok(text) => println!("{}", hex::encode(text.as_bytes())),
        Err(raw) => println!("{}", hex::encode(raw.into_bytes())),
    }
    Ok(())
}

fn shard_path(dir: &Path, index: u8) -> PathBuf {
    dir.join(format!("shard-{:03}.bin", index))
}

fn encode(
    input: &Path,
    out_dir: &Path,
    key: &str,
    params: shardwarden::CodingParams,
    file_id: Option<String>,
) -> Result<()> {
    let key = MasterKey::from_hex(key)?;
    let data = std::fs::read(input)?;
    let file_name = input
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unnamed".to_string());
    let file_id = file_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let context = FileContext::new(file_id, file_name);

    let encoded = ShardCodec::new().encode(&data, params, &key, &context)?;

    std::fs::create_dir_all(out_dir)?;
    for shard in &encoded.shards {
        std::fs::write(shard_path(out_dir, shard.index), &shard.payload)?;
    }
    std::fs::write(
        out_dir.join(MANIFEST_FILE),
        serde_json::to_vec_pretty(&encoded.manifest)?,
    )?;

    info!(
        file_id = %encoded.manifest.file_id,
        shards = encoded.shards.len(),
        out_dir = %out_dir.display(),
        "File encoded"
    );
    println!("{}", encoded.manifest.file_id);
    Ok(())
}

fn decode(dir: &Path, output: &Path, key: &str) -> Result<()> {
    let key = MasterKey::from_hex(key)?;
    let manifest: FileManifest = serde_json::from_slice(&std::fs::read(dir.join(MANIFEST_FILE))?)?;

    let mut shards = Vec::new();
    for index in manifest.indices() {
        match std::fs::read(shard_path(dir, index)) {
            Ok(payload) => shards.push(Shard::new(manifest.file_id.clone(), index, payload)),
            Err(e) => warn!(index, error = %e, "Shard file unavailable"),
        }
    }

    let context = FileContext::new(manifest.file_id.clone(), manifest.file_name.clone());
    let decoded = ShardCodec::new().decode_detailed(&shards, &manifest, &key, &context)?;
    for rejected in &decoded.rejected {
        warn!(index = rejected.index, error = %rejected.error, "Shard rejected");
    }

    std::fs::write(output, &decoded.plaintext)?;
    info!(
        bytes = decoded.plaintext.len(),
        valid = decoded.valid_indices.len(),
        output = %output.display(),
        "File decoded"
    );
    Ok(())
}

async fn simulate(config: EngineConfig, providers: usize, lose: usize, size: usize, wait: Duration) -> Result<()> {
    let network = Arc::new(InMemoryProviderNetwork::with_providers(
        providers,
        &["eu-west", "us-east", "ap-south"],
    ));
    let state = StateStore::new(Arc::new(InMemoryStore::new()));
    let metrics = Arc::new(EngineMetrics::new()?);
    let events: Arc<dyn EventPublisher> = Arc::new(TracingEventPublisher::verbose());
    let key = MasterKey::generate();

    let repair = RepairEngine::new(
        config.repair.clone(),
        network.clone(),
        state.clone(),
        Arc::new(InMemoryKeyResolver::with_fallback(key.clone())),
        events.clone(),
        metrics.clone(),
    );
    let monitor = RedundancyMonitor::new(
        config.monitor.clone(),
        network.clone(),
        state.clone(),
        events,
        metrics.clone(),
        repair.clone(),
    );

    // Encode and place one random file
    let mut data = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut data);
    let context = FileContext::new("simulated-file", "simulated.bin");
    let codec = ShardCodec::new();
    let encoded = codec.encode(&data, config.coding, &key, &context)?;

    let targets = network
        .find_candidate_providers(encoded.shards.len(), &ProviderRequirements::new())
        .await?;
    if targets.len() < encoded.shards.len() {
        return Err(Error::Placement(format!(
            "{} shards need {} providers, network has {}",
            encoded.shards.len(),
            encoded.shards.len(),
            targets.len()
        )));
    }
    let mut manifest = encoded.manifest;
    for (shard, provider) in encoded.shards.iter().zip(&targets) {
        let receipt = network.send_shard(&provider.id, shard).await?;
        let storage_id = receipt
            .storage_id
            .ok_or_else(|| Error::Placement(format!("provider {} refused shard {}", provider.id, shard.index)))?;
        manifest.set_location(shard.index, ShardLocation::new(provider.id.clone(), storage_id));
    }
    metrics.record_shards_stored(encoded.shards.len());
    monitor.register_file(&manifest).await?;

    let initial = monitor.check_file(&manifest.file_id).await?;
    println!(
        "placed    {}/{} shards, status {}",
        initial.available_shards, initial.total_shards, initial.status
    );

    // Knock providers out and let the monitor react
    let mut notices = repair.subscribe();
    for provider in targets.iter().take(lose) {
        network.set_online(&provider.id, false);
    }
    let degraded = monitor.check_file(&manifest.file_id).await?;
    println!(
        "lost      {} providers, {}/{} available, status {}",
        lose.min(targets.len()),
        degraded.available_shards,
        degraded.total_shards,
        degraded.status
    );

    if degraded.status.needs_repair() && config.monitor.auto_repair {
        let file_id = manifest.file_id.clone();
        let outcome = tokio::time::timeout(wait, async {
            loop {
                match notices.recv().await {
                    Ok(notice) if notice.file_id == file_id && notice.status.is_terminal() => {
                        return Some(notice.status)
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return None,
                }
            }
        })
        .await;
        match outcome {
            Ok(Some(status)) => println!("repair    {}", status),
            Ok(None) => println!("repair    notice channel closed"),
            Err(_) => println!("repair    still running after {:?}", wait),
        }
    }

    let after = monitor.check_file(&manifest.file_id).await?;
    println!(
        "now       {}/{} available, status {}",
        after.available_shards, after.total_shards, after.status
    );

    // Read the file back through whatever placement survived
    let current: FileManifest = state
        .get(namespaces::MANIFESTS, &manifest.file_id)
        .await?
        .ok_or_else(|| Error::FileNotFound(manifest.file_id.clone()))?;
    let mut shards = Vec::new();
    for location in current.locations.values() {
        if let Ok(shard) = network.fetch_shard(&location.provider_id, &location.storage_id).await {
            shards.push(shard);
        }
    }
    match codec.decode(&shards, &current, &key, &context) {
        Ok(plaintext) if plaintext == data => println!("readback  ok ({} bytes)", plaintext.len()),
        Ok(_) => println!("readback  MISMATCH"),
        Err(e) => println!("readback  failed: {}", e),
    }

    println!();
    print!("{}", metrics.render()?);
    Ok(())
}
