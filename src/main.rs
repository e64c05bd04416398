//! # NudgeClaw
//!
//! Background task scheduler and progressive nudge engine.
//!
//! Usage:
//!   nudgeclaw serve                          # Gateway + internal dispatch loop
//!   nudgeclaw serve --no-loop                # Gateway only, cron hits /scheduler/run
//!   nudgeclaw run-once                       # One dispatch cycle, print the report
//!   nudgeclaw task add --owner u1 --message "Stand up" --in-secs 600
//!   nudgeclaw link --owner u1 --telegram 123456

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use nudgeclaw_core::config::NudgeClawConfig;
use nudgeclaw_scheduler::{
    NewTask, NotifyTarget, SchedulerService, TaskKind, TaskPayload, after_ms, after_secs,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "nudgeclaw",
    version,
    about = "⏰ NudgeClaw: lease-based scheduler and nudge engine"
)]
struct Cli {
    /// Config file (default: ~/.nudgeclaw/config.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default config file if none exists
    Init,
    /// Start the HTTP gateway
    Serve {
        /// Override the configured port
        #[arg(short, long)]
        port: Option<u16>,
        /// Do not run the internal dispatch loop
        #[arg(long)]
        no_loop: bool,
    },
    /// Run a single dispatch cycle and print the report
    RunOnce,
    /// Manage scheduled tasks
    #[command(subcommand)]
    Task(TaskCommand),
    /// Link a delivery channel to an owner
    Link(LinkArgs),
    /// Schedule daily check-ins and nudges for an owner
    Enable {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        locale: Option<String>,
    },
    /// Remove an owner's daily check-ins and nudges
    Disable {
        #[arg(long)]
        owner: String,
    },
}

#[derive(Subcommand)]
enum TaskCommand {
    /// Add a task
    Add {
        #[arg(long)]
        owner: String,
        /// daily_check | reminder | nudge | custom
        #[arg(long, default_value = "reminder")]
        kind: String,
        /// Reminder text
        #[arg(long)]
        message: Option<String>,
        /// Prompt hint for daily_check
        #[arg(long)]
        hint: Option<String>,
        /// Locale for nudge
        #[arg(long)]
        locale: Option<String>,
        /// First run (RFC 3339)
        #[arg(long)]
        at: Option<DateTime<Utc>>,
        /// First run, seconds from now
        #[arg(long)]
        in_secs: Option<i64>,
        /// Recurrence in milliseconds
        #[arg(long)]
        every_ms: Option<u64>,
    },
    /// List an owner's tasks
    List {
        #[arg(long)]
        owner: String,
    },
    /// Remove a task by id
    Remove { id: String },
}

#[derive(Args)]
struct LinkArgs {
    #[arg(long)]
    owner: String,
    #[command(flatten)]
    target: LinkTarget,
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct LinkTarget {
    /// Telegram chat id
    #[arg(long)]
    telegram: Option<String>,
    /// Discord webhook URL
    #[arg(long)]
    discord: Option<String>,
    /// Generic webhook URL
    #[arg(long)]
    webhook: Option<String>,
    /// Remove the current link
    #[arg(long)]
    unlink: bool,
}

fn load_config(path: Option<&str>) -> Result<NudgeClawConfig> {
    let config = match path {
        Some(p) => {
            let p = PathBuf::from(shellexpand::tilde(p).to_string());
            NudgeClawConfig::load_from(&p)?
        }
        None => NudgeClawConfig::load()?,
    };
    Ok(config.with_env_overrides())
}

fn build_payload(
    kind: &str,
    message: Option<String>,
    hint: Option<String>,
    locale: Option<String>,
) -> Result<TaskPayload> {
    let kind = TaskKind::parse(kind).with_context(|| format!("unknown task kind '{kind}'"))?;
    Ok(match kind {
        TaskKind::DailyCheck => TaskPayload::DailyCheck { prompt_hint: hint },
        TaskKind::Reminder => TaskPayload::Reminder {
            message: message.unwrap_or_default(),
        },
        TaskKind::Nudge => TaskPayload::Nudge { locale },
        TaskKind::Custom => TaskPayload::Custom {
            name: message.unwrap_or_else(|| "custom".into()),
            data: serde_json::Value::Null,
        },
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        "nudgeclaw=debug,nudgeclaw_scheduler=debug,nudgeclaw_gateway=debug,tower_http=debug"
    } else {
        "nudgeclaw=info,nudgeclaw_scheduler=info,nudgeclaw_gateway=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();
    tracing::debug!("⏰ NudgeClaw v{}", env!("CARGO_PKG_VERSION"));

    if let Command::Init = cli.command {
        let path = NudgeClawConfig::default_path();
        if path.exists() {
            println!("⚠️  Config already exists: {}", path.display());
        } else {
            NudgeClawConfig::default().save()?;
            println!("✅ Config written: {}", path.display());
        }
        return Ok(());
    }

    let config = load_config(cli.config.as_deref())?;
    let service = SchedulerService::from_config(&config)
        .with_context(|| format!("opening {}", config.database.resolved_path().display()))?;

    match cli.command {
        Command::Init => {}
        Command::Serve { port, no_loop } => {
            let mut gateway = config.gateway.clone();
            if let Some(port) = port {
                gateway.port = port;
            }
            let dispatch_loop = if no_loop { None } else { service.spawn_loop() };
            let served = nudgeclaw_gateway::start_server(&gateway, service.clone()).await;
            if let Some(handle) = dispatch_loop {
                handle.abort();
            }
            served?;
        }
        Command::RunOnce => {
            let report = service.run_once().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Task(TaskCommand::Add {
            owner,
            kind,
            message,
            hint,
            locale,
            at,
            in_secs,
            every_ms,
        }) => {
            let payload = build_payload(&kind, message, hint, locale)?;
            let mut task = NewTask::new(&owner, payload);
            task.interval_ms = every_ms;
            let now = Utc::now();
            task.next_run_at = Some(match (at, in_secs, every_ms) {
                (Some(at), _, _) => at,
                (None, Some(secs), _) => after_secs(now, secs)?,
                (None, None, Some(ms)) => after_ms(now, ms)?,
                (None, None, None) => now,
            });
            let task = service.manager.create(task).await?;
            println!("✅ Task {} scheduled for {}", task.id, task.next_run_at);
        }
        Command::Task(TaskCommand::List { owner }) => {
            let tasks = service.manager.list_by_owner(&owner).await?;
            if tasks.is_empty() {
                println!("No tasks for {owner}");
            }
            for t in tasks {
                let every = t
                    .interval_ms
                    .map(|ms| format!("every {}s", ms / 1000))
                    .unwrap_or_else(|| "once".into());
                println!(
                    "{}  {:<12} next {}  {}  failures {}",
                    t.id,
                    t.payload.kind_name(),
                    t.next_run_at.format("%Y-%m-%d %H:%M:%S UTC"),
                    every,
                    t.failure_count
                );
            }
        }
        Command::Task(TaskCommand::Remove { id }) => {
            service.manager.delete(&id).await?;
            println!("🗑️  Removed {id}");
        }
        Command::Link(args) => {
            let LinkTarget {
                telegram,
                discord,
                webhook,
                ..
            } = args.target;
            let target = if let Some(chat_id) = telegram {
                Some(NotifyTarget::Telegram { chat_id })
            } else if let Some(webhook_url) = discord {
                Some(NotifyTarget::Discord { webhook_url })
            } else {
                webhook.map(|url| NotifyTarget::Webhook {
                    url,
                    headers: Vec::new(),
                })
            };
            match target {
                Some(target) => {
                    service.db.link_channel(&args.owner, &target)?;
                    println!("🔗 {} linked via {}", args.owner, target.label());
                }
                None => {
                    let removed = service.db.unlink_channel(&args.owner)?;
                    println!("🔗 {} unlinked: {removed}", args.owner);
                }
            }
        }
        Command::Enable { owner, locale } => {
            let daily = service.manager.enable_daily_check(&owner).await?;
            let nudge = service.manager.enable_nudges(&owner, locale).await?;
            println!("✅ Daily check {} and nudges {} active for {owner}", daily.id, nudge.id);
        }
        Command::Disable { owner } => {
            let removed = service.manager.disable_notifications(&owner).await?;
            println!("🔕 Removed {removed} task(s) for {owner}");
        }
    }

    service.shutdown().await?;
    Ok(())
}
