use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use async_trait::async_trait;
use clap::{Args, Parser, Subcommand};
use reqwest::Client;
use serde_json::{Value, json};
use streamroute::{
    broadcast::{BroadcastHub, LocalPublisher, PublishError},
    builder::{RuleBuilder, StorageRuleBuilder},
    cache::RuleCache,
    config::{ConfigManager, EnvConfigManager, PipelineSettings},
    frame::Include,
    logger::{LogConfig, Telemetry, TelemetryGuard, init_tracing},
    output::RemoteWriteRegistry,
    pipeline::{Pipeline, RuleGetter, data_to_channel_frames},
    registry,
    schema::write_schema,
    secret::EnvSecrets,
    storage::{FileStorage, InMemoryStorage, Storage, load_rule_file, validate_rule_set},
    stream::{FrameCache, ManagedStreamRunner},
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "streamroute",
    about = "Channel-rule routing and frame pipelines for real-time telemetry",
    version
)]
struct Cli {
    /// Log level filter (e.g. error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Also write daily rolling logs into this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    /// OpenTelemetry endpoint for logs and metrics (e.g. http://localhost:4318)
    #[arg(long, global = true)]
    otel_endpoint: Option<String>,

    /// .env file to load settings from
    #[arg(long, global = true, default_value = ".env")]
    env_file: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Push `org channel payload` lines from stdin through the pipeline
    Run(RunArgs),

    /// Validate a rules file
    Validate { file: PathBuf },

    /// Convert a payload with the rule matching a channel, without outputs
    Convert(ConvertArgs),

    /// Print the catalog of stage types
    Entities,

    /// Emit the JSON schema of the rule file format
    Schema {
        #[arg(long, default_value = "schemas")]
        out: PathBuf,
    },

    /// Read or change settings kept in the env file
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Print every known setting
    List,
    /// Write a setting into the env file
    Set { key: String, value: String },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Overrides STREAMROUTE_RULES_DIR
    #[arg(long)]
    rules_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct ConvertArgs {
    #[arg(long)]
    rules_dir: Option<PathBuf>,
    #[arg(long, default_value_t = 1)]
    org: i64,
    #[arg(long)]
    channel: String,
    /// Payload file
    #[arg(long)]
    data: PathBuf,
}

/// Logs every broadcast before handing it to the in-process hub.
#[derive(Debug)]
struct LoggingPublisher {
    hub: Arc<BroadcastHub>,
}

#[async_trait]
impl LocalPublisher for LoggingPublisher {
    async fn publish(&self, org_id: i64, channel: &str, data: Vec<u8>) -> Result<(), PublishError> {
        info!(org_id, %channel, payload = %String::from_utf8_lossy(&data), "broadcast");
        self.hub.publish(org_id, channel, data).await
    }
}

/// Shared runtime pieces, wired the same way for every command.
struct Runtime {
    cache: Arc<RuleCache>,
    remote_write: Arc<RemoteWriteRegistry>,
    cancel: CancellationToken,
}

fn runtime(settings: &PipelineSettings, storage: Arc<dyn Storage>) -> anyhow::Result<Runtime> {
    let publisher = Arc::new(LoggingPublisher {
        hub: BroadcastHub::new(),
    });
    let runner = ManagedStreamRunner::new(FrameCache::new(), publisher.clone());
    let client = Client::builder()
        .timeout(settings.http_timeout)
        .build()
        .context("building http client")?;
    let cancel = CancellationToken::new();
    let remote_write = RemoteWriteRegistry::new(
        settings.flush_interval,
        settings.max_buffered_samples,
        settings.http_timeout,
        client.clone(),
        cancel.child_token(),
    );
    let builder = StorageRuleBuilder::new(
        storage,
        runner,
        publisher,
        Arc::new(EnvSecrets),
        remote_write.clone(),
        client,
        settings.http_timeout,
    );
    let cache = RuleCache::new(Arc::new(builder), settings.fetch_timeout, settings.refresh_interval);
    Ok(Runtime {
        cache,
        remote_write,
        cancel,
    })
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let (telemetry, guard) = init_tracing(&LogConfig {
        log_level: cli.log_level.clone(),
        log_dir: cli.log_dir.clone(),
        json: cli.log_json,
        otel_endpoint: cli.otel_endpoint.clone(),
        ..LogConfig::default()
    })?;
    let config = ConfigManager(EnvConfigManager::new(cli.env_file.clone()));
    let settings = PipelineSettings::from_config(&config).await;

    let result = match cli.command {
        Commands::Run(args) => run(settings, args, telemetry).await,
        Commands::Validate { file } => validate(file).await,
        Commands::Convert(args) => convert(settings, args).await,
        Commands::Entities => {
            println!("{}", serde_json::to_string_pretty(&registry::entities())?);
            Ok(())
        }
        Commands::Schema { out } => {
            write_schema(&out)?;
            println!("schema written to {}", out.display());
            Ok(())
        }
        Commands::Config { command } => config_command(&config, command).await,
    };
    shutdown(guard, &result);
    result
}

fn shutdown(guard: TelemetryGuard, result: &anyhow::Result<()>) {
    if let Err(e) = result {
        error!(error = %e, "command failed");
    }
    guard.shutdown();
}

async fn run(mut settings: PipelineSettings, args: RunArgs, telemetry: Telemetry) -> anyhow::Result<()> {
    if let Some(dir) = args.rules_dir {
        settings.rules_dir = dir;
    }
    info!(rules_dir = %settings.rules_dir.display(), "starting streamroute");
    let rt = runtime(&settings, Arc::new(FileStorage::new(&settings.rules_dir)))?;
    let refresh = rt.cache.spawn_refresh(rt.cancel.child_token());
    let pipeline = Pipeline::new(rt.cache.clone(), telemetry, settings.max_redirect_depth);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                let mut parts = line.splitn(3, ' ');
                let (Some(org), Some(channel), Some(payload)) = (parts.next(), parts.next(), parts.next()) else {
                    warn!(%line, "expected `org channel payload`");
                    continue;
                };
                let Ok(org_id) = org.parse::<i64>() else {
                    warn!(%org, "org must be a number");
                    continue;
                };
                match pipeline.process_input(org_id, channel, payload.as_bytes()).await {
                    Ok(true) => {}
                    Ok(false) => warn!(org_id, %channel, "no rule for channel"),
                    Err(e) => error!(org_id, %channel, error = %e, "pipeline failed"),
                }
            }
        }
    }

    rt.cancel.cancel();
    rt.remote_write.flush_all().await;
    refresh.await?;
    Ok(())
}

async fn config_command(config: &ConfigManager, command: ConfigCommands) -> anyhow::Result<()> {
    match command {
        ConfigCommands::List => {
            // sorted and deduplicated by the manager
            for key in config.0.keys().await {
                println!("{key}={}", config.0.get(&key).await.unwrap_or_default());
            }
        }
        ConfigCommands::Set { key, value } => {
            config.0.set(&key, &value).await?;
            info!(%key, "setting saved");
            println!("{key} updated");
        }
    }
    Ok(())
}

async fn validate(file: PathBuf) -> anyhow::Result<()> {
    let rule_file = load_rule_file(&file)?;
    validate_rule_set(&rule_file.rules)?;

    // building catches broken expressions and write-config references
    let orgs: BTreeSet<i64> = rule_file
        .rules
        .iter()
        .map(|r| if r.org_id == 0 { 1 } else { r.org_id })
        .collect();
    let storage = InMemoryStorage::new(rule_file.rules.clone(), rule_file.write_configs.clone());
    let settings = PipelineSettings::default();
    let client = Client::new();
    let cancel = CancellationToken::new();
    let hub = BroadcastHub::new();
    let builder = StorageRuleBuilder::new(
        Arc::new(storage),
        ManagedStreamRunner::new(FrameCache::new(), hub.clone()),
        hub,
        Arc::new(EnvSecrets),
        RemoteWriteRegistry::new(
            settings.flush_interval,
            settings.max_buffered_samples,
            settings.http_timeout,
            client.clone(),
            cancel.clone(),
        ),
        client,
        settings.http_timeout,
    );
    let mut built = 0;
    for org_id in orgs {
        built += builder.build_rules(org_id).await?.len();
    }
    cancel.cancel();
    println!(
        "{}: {} rules, {} write configs, ok",
        file.display(),
        built,
        rule_file.write_configs.len()
    );
    Ok(())
}

async fn convert(mut settings: PipelineSettings, args: ConvertArgs) -> anyhow::Result<()> {
    if let Some(dir) = args.rules_dir {
        settings.rules_dir = dir;
    }
    let data = std::fs::read(&args.data).with_context(|| format!("reading {}", args.data.display()))?;
    let rt = runtime(&settings, Arc::new(FileStorage::new(&settings.rules_dir)))?;
    let Some((rule, params)) = rt.cache.get(args.org, &args.channel).await? else {
        rt.cancel.cancel();
        bail!("no rule matches `{}` in org {}", args.channel, args.org);
    };

    let frames = data_to_channel_frames(&rule, args.org, &args.channel, &data)?;
    let mut out = Vec::with_capacity(frames.len());
    for cf in frames {
        let encoded = cf.frame.to_json()?.bytes(Include::All);
        out.push(json!({
            "channel": cf.channel,
            "frame": serde_json::from_slice::<Value>(&encoded)?,
        }));
    }
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "pattern": rule.pattern,
            "params": params
                .0
                .into_iter()
                .map(|(k, v)| (k, Value::String(v)))
                .collect::<serde_json::Map<String, Value>>(),
            "channelFrames": out,
        }))?
    );
    rt.cancel.cancel();
    Ok(())
}
