mod logging;
mod routes;

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use crew_agent::ClaudeExecutor;
use crew_core::{
    bootstrap, config,
    db::Db,
    dispatcher::{Dispatcher, DispatcherConfig},
    events::EventBus,
    merge::{MergeCoordinator, WorktreeLocks},
    migrate, network, paths,
    router::Router,
    singleton,
    types::{AgentProfile, Approval},
};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "crew", version, about = "Single-host orchestrator for a team of autonomous coding agents")]
struct Cli {
    /// Home directory (default: ~/.crew)
    #[arg(long, global = true, env = "CREW_HOME")]
    home: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the daemon
    Start {
        #[arg(long, default_value_t = 3548)]
        port: u16,
        /// Scheduling interval in seconds
        #[arg(long, default_value_t = 1.0)]
        interval: f64,
        #[arg(long, default_value_t = 32)]
        max_concurrent: usize,
        /// Session rotation threshold in input tokens
        #[arg(long)]
        token_budget: Option<u64>,
        /// Run in the current process instead of spawning a background daemon
        #[arg(long)]
        foreground: bool,
    },
    /// Stop the running daemon
    Stop,
    /// Show daemon status
    Status,
    Team {
        #[command(subcommand)]
        command: TeamCommand,
    },
    Agent {
        #[command(subcommand)]
        command: AgentCommand,
    },
    Member {
        #[command(subcommand)]
        command: MemberCommand,
    },
    Repo {
        #[command(subcommand)]
        command: RepoCommand,
    },
    Network {
        #[command(subcommand)]
        command: NetworkCommand,
    },
    /// Delete the entire home directory (requires confirmation phrase)
    Nuke,
}

#[derive(Subcommand)]
enum TeamCommand {
    Add {
        slug: String,
        /// Agent count, or comma-separated agent names
        #[arg(long, default_value = "2")]
        agents: String,
        #[arg(long)]
        repo: Option<PathBuf>,
        #[arg(long)]
        model: Option<String>,
    },
    List,
    Remove {
        slug: String,
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
enum AgentCommand {
    Add {
        team: String,
        name: Option<String>,
        #[arg(long, default_value = "engineer")]
        role: String,
        #[arg(long, default_value = "")]
        model: String,
        #[arg(long)]
        bio: Option<String>,
    },
}

#[derive(Subcommand)]
enum MemberCommand {
    Add { name: String },
    List,
    Remove { name: String },
}

#[derive(Subcommand)]
enum RepoCommand {
    Add {
        team: String,
        path: PathBuf,
        #[arg(long)]
        name: Option<String>,
        #[arg(long, default_value = "auto")]
        approval: String,
        /// Legacy single test command, wrapped as a one-step pipeline
        #[arg(long)]
        test_cmd: Option<String>,
    },
}

#[derive(Subcommand)]
enum NetworkCommand {
    Show,
    Allow { domain: String },
    Disallow { domain: String },
    Reset,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let home = cli.home.clone().unwrap_or_else(paths::default_home);

    match cli.command {
        Command::Start {
            port,
            interval,
            max_concurrent,
            token_budget,
            foreground,
        } => start(&home, port, interval, max_concurrent, token_budget, foreground),
        Command::Stop => {
            if singleton::stop_daemon(&home, singleton::STOP_TIMEOUT)? {
                println!("daemon stopped");
            } else {
                println!("no running daemon");
            }
            Ok(())
        }
        Command::Status => {
            match singleton::is_running(&home) {
                Some(pid) => println!("daemon running (pid {pid})"),
                None => println!("daemon not running"),
            }
            Ok(())
        }
        Command::Team { command } => team_command(&home, command),
        Command::Agent { command } => agent_command(&home, command),
        Command::Member { command } => member_command(&home, command),
        Command::Repo { command } => repo_command(&home, command),
        Command::Network { command } => network_command(&home, command),
        Command::Nuke => nuke(&home),
    }
}

fn open_db(home: &std::path::Path) -> Result<Db> {
    paths::ensure_protected(home).context("create protected dir")?;
    let db = Db::open(&paths::db_path(home))?;
    db.migrate()?;
    Ok(db)
}

// ── start ─────────────────────────────────────────────────────────────────

fn start(
    home: &std::path::Path,
    port: u16,
    interval: f64,
    max_concurrent: usize,
    token_budget: Option<u64>,
    foreground: bool,
) -> Result<()> {
    if let Some(pid) = singleton::is_running(home) {
        bail!("daemon already running with PID {pid}");
    }

    if !foreground {
        // Re-exec ourselves detached; the child acquires its own lock.
        let exe = std::env::current_exe().context("resolve current executable")?;
        std::fs::create_dir_all(home)?;
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(paths::log_file_path(home))?;
        let mut cmd = std::process::Command::new(exe);
        cmd.arg("--home")
            .arg(home)
            .arg("start")
            .arg("--foreground")
            .arg("--port")
            .arg(port.to_string())
            .arg("--interval")
            .arg(interval.to_string())
            .arg("--max-concurrent")
            .arg(max_concurrent.to_string())
            .stdout(std::process::Stdio::null())
            .stderr(log);
        if let Some(budget) = token_budget {
            cmd.arg("--token-budget").arg(budget.to_string());
        }
        let child = cmd.spawn().context("spawn background daemon")?;
        println!("daemon started with PID {} on port {port}", child.id());
        return Ok(());
    }

    // The lock fd must stay open for the daemon's lifetime.
    let _lock = singleton::DaemonLock::acquire(home)?;
    logging::init(home, true);

    migrate::run_all(home).context("filesystem migrations")?;
    let db = Arc::new(open_db(home)?);
    // Touching the network config migrates legacy wildcard entries.
    let _ = network::get_allowed_domains(home);

    let runtime = tokio::runtime::Runtime::new().context("build tokio runtime")?;
    runtime.block_on(run_daemon(
        home.to_path_buf(),
        db,
        port,
        Duration::from_secs_f64(interval),
        max_concurrent,
        token_budget,
    ))
}

async fn run_daemon(
    home: PathBuf,
    db: Arc<Db>,
    port: u16,
    interval: Duration,
    max_concurrent: usize,
    token_budget: Option<u64>,
) -> Result<()> {
    let bus = EventBus::new();
    let locks = WorktreeLocks::new();
    let executor = Arc::new(ClaudeExecutor::new("claude").with_timeout(1000));

    let dispatcher = Dispatcher::new(
        Arc::clone(&db),
        bus.clone(),
        Arc::clone(&locks),
        executor,
        home.clone(),
        DispatcherConfig {
            max_concurrent,
            interval,
            token_budget,
        },
    );

    // Dispatcher loop
    tokio::spawn(Arc::clone(&dispatcher).run());

    // Router loop — same cadence as the dispatcher
    let router = Arc::new(Router::new(Arc::clone(&db), bus.clone(), home.clone()));
    {
        let router = Arc::clone(&router);
        let db_router = Arc::clone(&db);
        let router_interval = interval;
        tokio::spawn(async move {
            loop {
                match db_router.list_teams() {
                    Ok(teams) => {
                        for team in teams {
                            if let Err(e) = router.route_once(&team) {
                                warn!("route_once {team}: {e}");
                            }
                        }
                    }
                    Err(e) => error!("router list_teams: {e}"),
                }
                tokio::time::sleep(router_interval).await;
            }
        });
    }

    // Merge loop
    {
        let coordinator = MergeCoordinator::new(
            Arc::clone(&db),
            home.clone(),
            Arc::clone(&locks),
            bus.clone(),
        );
        let db_merge = Arc::clone(&db);
        let merge_interval = interval;
        tokio::spawn(async move {
            loop {
                match db_merge.list_teams() {
                    Ok(teams) => {
                        for team in teams {
                            if let Err(e) = coordinator.merge_once(&team).await {
                                warn!("merge_once {team}: {e}");
                            }
                        }
                    }
                    Err(e) => error!("merge list_teams: {e}"),
                }
                tokio::time::sleep(merge_interval).await;
            }
        });
    }

    let state = Arc::new(routes::AppState {
        db,
        bus,
        home,
        start_time: Instant::now(),
        dispatcher: Arc::clone(&dispatcher),
        router,
    });

    let addr = format!("0.0.0.0:{port}");
    info!("listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;

    axum::serve(listener, routes::router(state))
        .with_graceful_shutdown(shutdown_signal(dispatcher))
        .await?;
    Ok(())
}

async fn shutdown_signal(dispatcher: Arc<Dispatcher>) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown requested — draining in-flight turns");
    dispatcher.shutdown(Duration::from_secs(15)).await;
}

// ── team / agent / member ─────────────────────────────────────────────────

fn team_command(home: &std::path::Path, command: TeamCommand) -> Result<()> {
    match command {
        TeamCommand::Add {
            slug,
            agents,
            repo,
            model,
        } => {
            let db = open_db(home)?;
            let model = model.unwrap_or_default();
            let names: Vec<String> = match agents.parse::<usize>() {
                Ok(n) => bootstrap::default_agent_names(n),
                Err(_) => agents
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            };
            let mut profiles = vec![AgentProfile {
                name: format!("{slug}-manager"),
                role: "manager".into(),
                model: model.clone(),
            }];
            profiles.extend(names.into_iter().map(|name| AgentProfile {
                name,
                role: "engineer".into(),
                model: model.clone(),
            }));
            bootstrap::bootstrap(home, &db, &slug, &profiles)?;
            if let Some(repo) = repo {
                bootstrap::register_repo(home, &db, &slug, &repo, None, Approval::Auto, None)?;
            }
            println!("team '{slug}' created with {} agents", profiles.len());
            Ok(())
        }
        TeamCommand::List => {
            let db = open_db(home)?;
            for team in db.list_teams()? {
                let agents = config::read_roster(home, &team)?;
                println!(
                    "{team}  ({})",
                    agents
                        .iter()
                        .map(|a| a.name.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                );
            }
            Ok(())
        }
        TeamCommand::Remove { slug, yes } => {
            if !yes {
                bail!("refusing to remove team '{slug}' without --yes");
            }
            let db = open_db(home)?;
            db.remove_team(&slug)?;
            let dir = paths::team_dir(home, &slug);
            if dir.is_dir() {
                std::fs::remove_dir_all(&dir)?;
            }
            println!("team '{slug}' removed");
            Ok(())
        }
    }
}

fn agent_command(home: &std::path::Path, command: AgentCommand) -> Result<()> {
    match command {
        AgentCommand::Add {
            team,
            name,
            role,
            model,
            bio,
        } => {
            let db = open_db(home)?;
            if !db.team_exists(&team)? {
                bail!("unknown team '{team}'");
            }
            let existing = config::read_roster(home, &team)?.len();
            let name = name.unwrap_or_else(|| {
                bootstrap::default_agent_names(existing + 1)
                    .pop()
                    .unwrap_or_else(|| format!("agent{}", existing + 1))
            });
            bootstrap::add_agent(
                home,
                &team,
                &AgentProfile {
                    name: name.clone(),
                    role,
                    model,
                },
                bio.as_deref(),
            )?;
            println!("agent '{name}' added to team '{team}'");
            Ok(())
        }
    }
}

fn member_command(home: &std::path::Path, command: MemberCommand) -> Result<()> {
    match command {
        MemberCommand::Add { name } => {
            config::add_member(home, &name)?;
            if config::get_boss(home).is_none() {
                config::set_boss(home, &name)?;
            }
            println!("member '{name}' added");
            Ok(())
        }
        MemberCommand::List => {
            for member in config::list_members(home)? {
                println!("{}", member.name);
            }
            Ok(())
        }
        MemberCommand::Remove { name } => {
            if config::remove_member(home, &name)? {
                println!("member '{name}' removed");
                Ok(())
            } else {
                bail!("no such member '{name}'");
            }
        }
    }
}

// ── repo / network / nuke ─────────────────────────────────────────────────

fn repo_command(home: &std::path::Path, command: RepoCommand) -> Result<()> {
    match command {
        RepoCommand::Add {
            team,
            path,
            name,
            approval,
            test_cmd,
        } => {
            let db = open_db(home)?;
            if !db.team_exists(&team)? {
                bail!("unknown team '{team}'");
            }
            let approval = Approval::parse(&approval)
                .ok_or_else(|| anyhow::anyhow!("approval must be 'auto' or 'manual'"))?;
            let name = bootstrap::register_repo(
                home,
                &db,
                &team,
                &path,
                name.as_deref(),
                approval,
                test_cmd.as_deref(),
            )?;
            println!("repo '{name}' registered for team '{team}'");
            Ok(())
        }
    }
}

fn network_command(home: &std::path::Path, command: NetworkCommand) -> Result<()> {
    match command {
        NetworkCommand::Show => {
            for domain in network::get_allowed_domains(home) {
                println!("{domain}");
            }
            Ok(())
        }
        NetworkCommand::Allow { domain } => {
            network::allow_domain(home, &domain)?;
            println!("allowed {domain}");
            Ok(())
        }
        NetworkCommand::Disallow { domain } => {
            network::disallow_domain(home, &domain)?;
            println!("disallowed {domain}");
            Ok(())
        }
        NetworkCommand::Reset => {
            network::reset_config(home)?;
            println!("network allowlist reset to defaults");
            Ok(())
        }
    }
}

fn nuke(home: &std::path::Path) -> Result<()> {
    println!("This will delete {home:?} and everything in it.");
    print!("Type 'delete everything' to confirm: ");
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    if line.trim() != "delete everything" {
        bail!("confirmation phrase did not match; nothing deleted");
    }
    if home.is_dir() {
        std::fs::remove_dir_all(home)?;
    }
    println!("deleted {home:?}");
    Ok(())
}
