//! courier — personal AI assistant runtime.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use courier_domain::config::Config;
use courier_gateway::alerts::AlertService;
use courier_gateway::audit::AuditLogger;
use courier_gateway::bus::MessageBus;
use courier_gateway::compliance::ComplianceService;
use courier_gateway::distributed::DistributedManager;
use courier_gateway::ratelimit::RateLimiter;
use courier_gateway::runtime::AgentLoop;
use courier_gateway::secrets::SecretStore;
use courier_gateway::state::{default_data_dir, AgentDeps};
use courier_gateway::usage::UsageTracker;
use courier_providers::{
    FailoverCandidate, FailoverProvider, LlmProvider, OpenAiCompatProvider,
};

const HEALTH_SCAN_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "courier", about = "Personal AI assistant runtime", version)]
struct Cli {
    /// Path to the TOML config file (default: <workspace>/courier.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Agent workspace directory (default: current directory).
    #[arg(long, global = true)]
    workspace: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the agent service, consuming messages from the bus.
    Serve,
    /// Process one message directly and print the reply.
    Chat {
        /// The message to send.
        message: Vec<String>,
        /// Session key override.
        #[arg(long, default_value = "cli:direct")]
        session: String,
        /// Model override (e.g. `anthropic/claude-opus-4-5`).
        #[arg(long)]
        model: Option<String>,
    },
    /// Run a compliance retention sweep and print the summary.
    Sweep,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let workspace = match &cli.workspace {
        Some(path) => path.clone(),
        None => std::env::current_dir().context("resolving current directory")?,
    };
    let config = load_config(&cli, &workspace)?;
    let data_dir = default_data_dir();
    std::fs::create_dir_all(&data_dir).context("creating data directory")?;

    match cli.command {
        Command::Serve => serve(config, workspace, data_dir).await,
        Command::Chat {
            message,
            session,
            model,
        } => {
            let content = message.join(" ");
            if content.trim().is_empty() {
                bail!("empty message");
            }
            chat_once(config, workspace, data_dir, &content, &session, model.as_deref()).await
        }
        Command::Sweep => {
            let usage = Arc::new(UsageTracker::new(
                &data_dir.join("usage.jsonl"),
                config.usage.clone(),
            ));
            let compliance = ComplianceService::new(
                &workspace,
                &data_dir,
                config.retention.clone(),
                Some(usage),
            );
            let summary = compliance.sweep();
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
    }
}

fn load_config(cli: &Cli, workspace: &std::path::Path) -> anyhow::Result<Config> {
    let path = cli
        .config
        .clone()
        .unwrap_or_else(|| workspace.join("courier.toml"));
    if path.exists() {
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        Ok(Config::from_toml_str(&raw)
            .with_context(|| format!("parsing {}", path.display()))?)
    } else {
        tracing::info!(path = %path.display(), "no config file, using defaults");
        Ok(Config::default())
    }
}

/// Build the provider chain from config: each candidate becomes an
/// OpenAI-compatible adapter; more than one (or failover enabled) wraps
/// them in the failover provider.
fn build_provider(
    config: &Config,
    secrets: &SecretStore,
) -> anyhow::Result<Arc<dyn LlmProvider>> {
    let mut candidates = Vec::new();
    for entry in &config.providers.candidates {
        let api_key = if !entry.api_key_secret.is_empty() {
            secrets.get(&entry.api_key_secret).unwrap_or_default()
        } else if !entry.api_key_env.is_empty() {
            std::env::var(&entry.api_key_env).unwrap_or_default()
        } else {
            String::new()
        };
        let provider = OpenAiCompatProvider::new(
            entry.name.clone(),
            entry.api_base.clone(),
            api_key,
            config.providers.default_model.clone(),
        )
        .with_context(|| format!("building provider '{}'", entry.name))?
        .with_extra_headers(entry.extra_headers.clone().into_iter().collect());
        candidates.push(FailoverCandidate {
            name: entry.name.clone(),
            provider: Arc::new(provider),
        });
    }

    match candidates.len() {
        0 => bail!(
            "no LLM providers configured; add [[providers.candidates]] entries to courier.toml"
        ),
        1 if !config.failover.enabled => Ok(candidates.remove(0).provider),
        _ => Ok(Arc::new(FailoverProvider::new(
            candidates,
            config.providers.default_model.clone(),
            config.failover.clone(),
        ))),
    }
}

fn build_agent(
    config: Config,
    workspace: PathBuf,
    data_dir: PathBuf,
) -> anyhow::Result<(AgentLoop, Arc<MessageBus>, Arc<UsageTracker>)> {
    let secrets = SecretStore::new(&config.secrets, &data_dir)
        .context("initializing secret store")?;
    tracing::info!(backend = secrets.backend_name(), "secret store ready");

    let provider = build_provider(&config, &secrets)?;
    let bus = Arc::new(MessageBus::new());

    let rate_limiter = if config.rate_limit.enabled {
        Some(Arc::new(RateLimiter::new(&config.rate_limit)))
    } else {
        None
    };
    let audit = if config.audit.enabled {
        Some(Arc::new(AuditLogger::new(
            data_dir.join("audit.log"),
            config.audit.level,
        )))
    } else {
        None
    };
    let usage = Arc::new(UsageTracker::new(
        &data_dir.join("usage.jsonl"),
        config.usage.clone(),
    ));

    let agent = AgentLoop::new(AgentDeps {
        config,
        workspace,
        data_dir,
        bus: bus.clone(),
        provider,
        rate_limiter,
        audit,
        usage: Some(usage.clone()),
    });
    Ok((agent, bus, usage))
}

async fn serve(config: Config, workspace: PathBuf, data_dir: PathBuf) -> anyhow::Result<()> {
    let alerts = Arc::new(AlertService::new(config.alerts.clone(), 120, 500));
    let distributed = if config.distributed.enabled {
        Some(Arc::new(DistributedManager::new(
            &data_dir.join("distributed.json"),
            &config.distributed,
        )))
    } else {
        None
    };

    let (agent, bus, _usage) = build_agent(config, workspace, data_dir)?;

    // Outbound consumer: the CLI channel prints; other channels belong to
    // external adapters and are logged until one attaches.
    {
        let bus = bus.clone();
        tokio::spawn(async move {
            while let Some(msg) = bus.consume_outbound().await {
                if msg.control.is_some() {
                    continue;
                }
                if msg.channel == "cli" {
                    println!("{}", msg.content);
                } else {
                    tracing::info!(
                        channel = %msg.channel,
                        chat_id = %msg.chat_id,
                        "outbound message (no adapter attached)"
                    );
                }
            }
        });
    }

    // Alert wiring: run events plus a periodic health scan.
    if alerts.enabled() {
        let mut events = bus.register_run_listener();
        let alerts_events = alerts.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                alerts_events.observe_run_event(&event);
            }
        });

        let alerts_scan = alerts.clone();
        let agent_scan = agent.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEALTH_SCAN_INTERVAL);
            loop {
                interval.tick().await;
                if let Some(distributed) = &distributed {
                    alerts_scan.scan_distributed(distributed);
                }
                let snapshot = agent_scan.queue_snapshot();
                let sessions: Vec<(String, usize)> = snapshot
                    .sessions
                    .iter()
                    .map(|s| (s.session_key.clone(), s.queued.len()))
                    .collect();
                alerts_scan.scan_queue(&sessions, snapshot.max_backlog);
            }
        });
    }

    let loop_agent = agent.clone();
    let loop_task = tokio::spawn(async move { loop_agent.run().await });

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("shutting down");
    agent.stop();
    loop_task.abort();
    Ok(())
}

async fn chat_once(
    config: Config,
    workspace: PathBuf,
    data_dir: PathBuf,
    content: &str,
    session_key: &str,
    model_override: Option<&str>,
) -> anyhow::Result<()> {
    let (agent, _bus, _usage) = build_agent(config, workspace, data_dir)?;
    let reply = agent
        .process_direct(content, session_key, "cli", "direct", model_override)
        .await;
    println!("{reply}");
    Ok(())
}
