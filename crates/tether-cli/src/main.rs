use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use tether_channels::manager::ChannelManager;
use tether_channels::telegram::TelegramChannel;
use tether_channels::web::WebChannel;
use tether_channels::health;
use tether_config::{find_config_path, load_config, resolve_workspace, Config};
use tether_core::cron::{CronService, NewJob, CronSchedule, JobTarget, ScheduleKind};
use tether_core::gateway::Gateway;

#[derive(Parser)]
#[command(name = "tether", about = "Chat-platform gateway for a conversational AI backend", version)]
struct Cli {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway with all enabled channels
    Serve,
    /// Initialize configuration and workspace
    Onboard,
    /// Show system status and configuration
    Status,
    /// Manage scheduled jobs
    Cron {
        #[command(subcommand)]
        action: CronCommands,
    },
}

#[derive(Subcommand)]
enum CronCommands {
    /// List scheduled jobs
    List {
        /// Include disabled jobs
        #[arg(short, long)]
        all: bool,
    },
    /// Add a new scheduled job
    Add {
        /// Job name
        #[arg(long)]
        name: String,
        /// Message to deliver (or prompt for the agent with --agent)
        #[arg(long)]
        message: String,
        /// Interval in seconds (recurring)
        #[arg(long)]
        every: Option<u64>,
        /// Cron expression (e.g. "0 9 * * *")
        #[arg(long)]
        cron: Option<String>,
        /// One-time execution at ISO datetime (e.g. "2026-09-01T09:00:00Z")
        #[arg(long)]
        at: Option<String>,
        /// Target channel for delivery
        #[arg(long)]
        channel: String,
        /// Target chat_id for delivery
        #[arg(long)]
        to: String,
        /// Run the message through the agent instead of posting it verbatim
        #[arg(long)]
        agent: bool,
    },
    /// Remove a job by ID
    Remove {
        /// Job ID to remove
        job_id: String,
    },
    /// Enable or disable a job
    Enable {
        /// Job ID
        job_id: String,
        /// Disable instead of enable
        #[arg(long)]
        disable: bool,
    },
}

fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tether")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(find_config_path);

    match cli.command {
        Commands::Onboard => run_onboard(&config_path),
        Commands::Status => run_status(&config_path),
        Commands::Cron { action } => {
            let config = load_config(&config_path)?;
            run_cron_command(action, &config)
        }
        Commands::Serve => {
            let config = load_config(&config_path)?;
            let workspace = resolve_workspace(&config.agent.workspace);
            std::fs::create_dir_all(&workspace)?;
            run_serve(config, config_path).await
        }
    }
}

async fn run_serve(config: Config, config_path: PathBuf) -> Result<()> {
    tracing::info!("Starting gateway...");

    let data = data_dir();
    std::fs::create_dir_all(&data)?;

    let mut gateway = Gateway::new(config.clone(), config_path, &data)?;
    gateway.start().await?;

    let mut channel_manager = ChannelManager::new(gateway.outbound_sender().subscribe());

    if config.channels.telegram.enabled {
        match TelegramChannel::new(config.channels.telegram.clone()) {
            Ok(tg) => {
                channel_manager.register(Arc::new(tg)).await;
                tracing::info!("Telegram channel registered");
            }
            Err(e) => {
                tracing::error!("Failed to create Telegram channel: {e}");
            }
        }
    }

    let mut router = health::router(channel_manager.status_handle());
    if config.channels.web.enabled {
        let web = WebChannel::new(config.channels.web.clone());
        router = router.merge(web.router());
        channel_manager.register(Arc::new(web)).await;
        tracing::info!("Web channel registered");
    }

    // A gateway that cannot expose its status port should not come up
    let addr: SocketAddr = format!("{}:{}", config.gateway.host, config.gateway.port)
        .parse()
        .context("invalid gateway listen address")?;
    let listener = health::bind(addr).await?;
    tokio::spawn(health::serve(listener, router));

    let enabled = channel_manager.enabled_channels().await;
    if enabled.is_empty() {
        tracing::warn!("No channels enabled. Configure channels in config.json.");
    } else {
        tracing::info!("Starting channels: {}", enabled.join(", "));
    }
    channel_manager.start_all(gateway.inbound_sender()).await?;

    tracing::info!("Gateway running. Press Ctrl-C to stop.");
    gateway.run().await?;

    channel_manager.stop_all().await?;
    tracing::info!("Gateway stopped");
    Ok(())
}

fn run_onboard(config_path: &Path) -> Result<()> {
    let data = data_dir();
    std::fs::create_dir_all(&data)?;

    if config_path.exists() {
        println!("Config already exists: {}", config_path.display());
        println!("To reset, delete it and run `tether onboard` again.");
    } else {
        let default_config = Config::default();
        let json = serde_json::to_string_pretty(&default_config)?;
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(config_path, json)?;
        println!("Created config: {}", config_path.display());
    }

    let config = load_config(config_path)?;
    let workspace = resolve_workspace(&config.agent.workspace);
    std::fs::create_dir_all(&workspace)?;
    println!("Workspace: {}", workspace.display());

    let memory_dir = workspace.join("memory");
    std::fs::create_dir_all(&memory_dir)?;

    let memory_file = workspace.join("MEMORY.md");
    if !memory_file.exists() {
        std::fs::write(
            &memory_file,
            "# Memory\n\nImportant information the agent should keep across sessions.\n",
        )?;
        println!("  Created MEMORY.md");
    }

    println!();
    println!("Setup complete! Next steps:");
    println!(
        "  1. Edit {} to set your backend API key or local command",
        config_path.display()
    );
    println!("  2. Enable a channel (telegram or web) in the same file");
    println!("  3. Run `tether serve` to start the gateway");

    Ok(())
}

/// Show system status and configuration summary.
fn run_status(config_path: &Path) -> Result<()> {
    println!("tether status");
    println!();

    if config_path.exists() {
        println!("  Config:    {} (found)", config_path.display());
    } else {
        println!(
            "  Config:    {} (not found; run `tether onboard`)",
            config_path.display()
        );
        return Ok(());
    }

    let config = load_config(config_path)?;
    let workspace = resolve_workspace(&config.agent.workspace);

    if workspace.exists() {
        println!("  Workspace: {} (found)", workspace.display());
    } else {
        println!("  Workspace: {} (not found)", workspace.display());
    }

    println!("  Agent:     {}", config.agent.id);
    println!(
        "  Provider:  {} ({})",
        config.agent.provider,
        if config.agent.model.is_empty() {
            "default model"
        } else {
            &config.agent.model
        }
    );
    println!();

    println!("  Providers:");
    let remote = &config.providers.remote;
    let remote_key = remote
        .api_key
        .as_deref()
        .map(|k| !k.is_empty())
        .unwrap_or(false)
        || std::env::var("TETHER_API_KEY").is_ok();
    println!(
        "    remote: {} (key {})",
        remote.api_base,
        if remote_key { "set" } else { "not set" }
    );
    if config.providers.local.command.is_empty() {
        println!("    local:  not configured");
    } else {
        println!("    local:  {}", config.providers.local.command);
    }
    println!();

    println!("  Channels:");
    println!(
        "    telegram: {}",
        if config.channels.telegram.enabled {
            "enabled"
        } else {
            "disabled"
        }
    );
    println!(
        "    web:      {}",
        if config.channels.web.enabled {
            "enabled"
        } else {
            "disabled"
        }
    );
    println!();
    println!(
        "  Gateway:   http://{}:{}",
        config.gateway.host, config.gateway.port
    );

    Ok(())
}

/// Handle cron CLI subcommands against the on-disk job store.
fn run_cron_command(action: CronCommands, config: &Config) -> Result<()> {
    let store_path = data_dir().join("cron").join("jobs.json");

    // The CLI only edits the store; firing is the gateway's job
    let (fired_tx, _fired_rx) = tokio::sync::mpsc::channel(1);
    let mut cron_service = CronService::new(store_path, fired_tx);

    match action {
        CronCommands::List { all } => {
            let jobs = cron_service.list_jobs(all);
            if jobs.is_empty() {
                println!("No scheduled jobs.");
                return Ok(());
            }
            println!(
                "{:<10} {:<8} {:<20} {:<15} {}",
                "ID", "Enabled", "Name", "Schedule", "Next Run"
            );
            println!("{}", "-".repeat(75));
            for job in &jobs {
                println!(
                    "{:<10} {:<8} {:<20} {:<15} {}",
                    job.id,
                    if job.enabled { "yes" } else { "no" },
                    job.name.chars().take(20).collect::<String>(),
                    describe_schedule(&job.schedule),
                    format_timestamp(job.state.next_run_at_ms),
                );
            }
        }
        CronCommands::Add {
            name,
            message,
            every,
            cron,
            at,
            channel,
            to,
            agent,
        } => {
            let schedule = if let Some(secs) = every {
                CronSchedule::every(secs as i64 * 1000)
            } else if let Some(expr) = cron {
                CronSchedule::cron(&expr)
            } else if let Some(at_str) = at {
                let dt = chrono::DateTime::parse_from_rfc3339(&at_str).map_err(|e| {
                    anyhow::anyhow!(
                        "Invalid datetime (use RFC3339 format, e.g. 2026-09-01T09:00:00Z): {e}"
                    )
                })?;
                CronSchedule::at(dt.timestamp_millis())
            } else {
                anyhow::bail!("Must specify one of --every, --cron, or --at");
            };

            let job = cron_service.add_job(NewJob {
                name,
                schedule,
                message,
                invoke_agent: agent,
                session_key: format!("{}:{channel}:{to}", config.agent.id),
                target: JobTarget {
                    channel,
                    chat_id: to,
                },
            })?;
            println!("Added job '{}' (id: {})", job.name, job.id);
        }
        CronCommands::Remove { job_id } => {
            if cron_service.remove_job(&job_id) {
                println!("Removed job {job_id}");
            } else {
                println!("Job {job_id} not found");
            }
        }
        CronCommands::Enable { job_id, disable } => {
            let enabled = !disable;
            match cron_service.enable_job(&job_id, enabled) {
                Some(job) => {
                    println!(
                        "Job '{}' (id: {}) {}",
                        job.name,
                        job.id,
                        if enabled { "enabled" } else { "disabled" }
                    );
                }
                None => {
                    println!("Job {job_id} not found");
                }
            }
        }
    }

    Ok(())
}

fn describe_schedule(schedule: &CronSchedule) -> String {
    match schedule.kind {
        ScheduleKind::Every => {
            let secs = schedule.every_ms.unwrap_or(0) / 1000;
            if secs >= 3600 {
                format!("every {}h", secs / 3600)
            } else if secs >= 60 {
                format!("every {}m", secs / 60)
            } else {
                format!("every {}s", secs)
            }
        }
        ScheduleKind::Cron => schedule.expr.clone().unwrap_or_else(|| "?".into()),
        ScheduleKind::At => format_timestamp(schedule.at_ms),
    }
}

fn format_timestamp(ms: Option<i64>) -> String {
    match ms {
        Some(ms) => chrono::DateTime::from_timestamp_millis(ms)
            .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".into()),
        None => "-".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedules_described_in_short_form() {
        assert_eq!(describe_schedule(&CronSchedule::every(90_000)), "every 1m");
        assert_eq!(describe_schedule(&CronSchedule::every(7_200_000)), "every 2h");
        assert_eq!(describe_schedule(&CronSchedule::every(5_000)), "every 5s");
        assert_eq!(describe_schedule(&CronSchedule::cron("0 9 * * *")), "0 9 * * *");
    }

    #[test]
    fn timestamps_render_plain_ascii() {
        assert_eq!(format_timestamp(None), "-");
        assert!(format_timestamp(Some(0)).starts_with("1970-01-01"));
        assert!(format_timestamp(Some(0)).is_ascii());
    }
}
