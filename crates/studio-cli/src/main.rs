mod config;
mod local_state;
mod state_dir;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use config::StudioConfig;
use local_state::LocalState;
use serde::Serialize;
use serde_json::{Value, json};
use state_dir::StateDir;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use studio_core::agent_config::{
    AgentHeartbeat, AgentOverrides, HeartbeatActiveHours, HeartbeatUpdate, create_agent,
    delete_agent, list_agents, remove_heartbeat_override, rename_agent, update_agent_overrides,
    update_heartbeat,
};
use studio_core::guided_setup::{AgentGuidedSetup, apply_guided_agent_setup, create_agent_with_optional_setup};
use studio_core::heartbeat::{list_heartbeats_for_agent, trigger_heartbeat_now};
use studio_core::history::{HistorySyncRequest, run_history_sync};
use studio_core::pending_store::{load_pending_setups, persist_pending_setups};
use studio_core::permissions::{
    AgentPermissionsDraft, CommandMode, ExecutionRole, resolve_agent_permissions_draft,
    update_agent_permissions,
};
use studio_core::reconcile::run_agent_reconcile;
use studio_core::recovery::{apply_pending_setup, upsert_pending_setup};
use studio_core::session_keys::{build_agent_main_session_key, build_agent_studio_session_key};
use studio_core::sessions::{delete_sessions, list_agent_studio_sessions, reconcile_studio_sessions};
use studio_core::{
    AgentState, AgentStore, StudioContext, StudioError, execute_commands,
};
use studio_gateway::{ConnectOptions, GatewayClient, GatewayEndpoint, GatewayStatus};

/// Refetches allowed when history keeps moving under a sync.
const MAX_HISTORY_ATTEMPTS: usize = 3;

#[derive(Parser)]
#[command(name = "studio", about = "OpenClaw Studio gateway control CLI")]
struct Cli {
    /// Gateway URL: unix:/path, tcp://host:port or ws://host:port.
    #[arg(long, global = true)]
    url: Option<String>,
    /// Gateway auth token.
    #[arg(long, global = true)]
    token: Option<String>,
    /// Config file (default: $XDG_CONFIG_HOME/openclaw-studio/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// State directory.
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Manage agents in the gateway config.
    #[command(subcommand)]
    Agents(AgentsCommand),
    /// Inspect and edit agent heartbeats.
    #[command(subcommand)]
    Heartbeat(HeartbeatCommand),
    /// Reconcile studio sessions.
    #[command(subcommand)]
    Sessions(SessionsCommand),
    /// Fetch an agent's chat history and merge it into the local transcript.
    History {
        agent_id: String,
        /// Number of messages to fetch.
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Settle runs that finished while no one was listening.
    Reconcile,
    /// Guided setups waiting to be applied.
    #[command(subcommand)]
    Setup(SetupCommand),
    /// Agent permission presets.
    #[command(subcommand)]
    Permissions(PermissionsCommand),
    /// Print gateway events until interrupted.
    Watch,
}

#[derive(Subcommand)]
enum AgentsCommand {
    /// List configured agents.
    List,
    /// Create an agent.
    Create {
        name: String,
        /// Guided setup JSON file to apply to the new agent.
        #[arg(long)]
        setup: Option<PathBuf>,
        /// Add the entry through config.patch instead of agents.create.
        #[arg(long, conflicts_with = "setup")]
        config_only: bool,
    },
    /// Rename an agent.
    Rename { agent_id: String, name: String },
    /// Delete an agent and its bindings.
    Delete { agent_id: String },
    /// Merge sandbox/tools overrides into an agent's entry.
    Overrides {
        agent_id: String,
        /// JSON object merged into `sandbox`.
        #[arg(long)]
        sandbox: Option<String>,
        /// JSON object merged into `tools`.
        #[arg(long)]
        tools: Option<String>,
    },
}

#[derive(Subcommand)]
enum HeartbeatCommand {
    /// Show the effective heartbeat.
    Show { agent_id: String },
    /// Write a heartbeat override.
    Set {
        agent_id: String,
        #[arg(long, default_value = "30m")]
        every: String,
        #[arg(long, default_value = "last")]
        target: String,
        #[arg(long)]
        include_reasoning: bool,
        #[arg(long, allow_hyphen_values = true, value_parser = parse_json_number)]
        ack_max_chars: Option<serde_json::Number>,
        /// Active window start, HH:MM.
        #[arg(long, requires = "active_end")]
        active_start: Option<String>,
        /// Active window end, HH:MM.
        #[arg(long, requires = "active_start")]
        active_end: Option<String>,
    },
    /// Remove the agent's heartbeat override.
    Clear { agent_id: String },
    /// Trigger a heartbeat now.
    Wake { agent_id: String },
}

#[derive(Subcommand)]
enum SessionsCommand {
    /// Pick the studio session id and report stale keys.
    Reconcile {
        /// Delete stale studio session keys.
        #[arg(long)]
        prune: bool,
    },
    /// List an agent's studio sessions.
    List { agent_id: String },
}

#[derive(Subcommand)]
enum SetupCommand {
    /// List pending setups.
    List,
    /// Queue a setup for an existing agent.
    Add {
        agent_id: String,
        /// Guided setup JSON file.
        file: PathBuf,
    },
    /// Apply pending setups (all of them when no agent is given).
    Apply { agent_id: Option<String> },
}

#[derive(Clone, Copy, ValueEnum)]
enum CommandModeArg {
    Off,
    Ask,
    Auto,
}

impl From<CommandModeArg> for CommandMode {
    fn from(mode: CommandModeArg) -> Self {
        match mode {
            CommandModeArg::Off => Self::Off,
            CommandModeArg::Ask => Self::Ask,
            CommandModeArg::Auto => Self::Auto,
        }
    }
}

#[derive(Subcommand)]
enum PermissionsCommand {
    /// Show the permissions draft for an agent.
    Show { agent_id: String },
    /// Apply a permissions draft.
    Set {
        agent_id: String,
        #[arg(long, value_enum)]
        mode: CommandModeArg,
        /// Web tools on/off (default: the mode's preset).
        #[arg(long)]
        web: Option<bool>,
        /// File tools on/off (default: the mode's preset).
        #[arg(long)]
        files: Option<bool>,
        /// Session whose exec settings follow the mode (default: the agent's
        /// session).
        #[arg(long)]
        session_key: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "studio_cli=info,studio_core=info,studio_gateway=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = StudioConfig::load(cli.config.as_deref())?;
    if let Some(url) = cli.url {
        config.gateway.url = url;
    }
    if let Some(token) = cli.token {
        config.gateway.token = Some(token);
    }
    let state = StateDir::open(cli.state_dir)?;
    tracing::debug!(state_dir = %state.root().display(), "state directory ready");

    let ctx = connect(&config).await?;
    let result = run(cli.command, &ctx, &config, &state).await;
    ctx.client.disconnect().await;
    result
}

async fn connect(config: &StudioConfig) -> Result<StudioContext<GatewayClient>> {
    let endpoint: GatewayEndpoint = config
        .gateway
        .url
        .parse()
        .with_context(|| format!("invalid gateway url {:?}", config.gateway.url))?;
    let options = ConnectOptions::new(endpoint.clone())
        .with_token(config.gateway.token.clone())
        .with_call_timeout(config.call_timeout());
    let client = GatewayClient::new();
    client
        .connect(options)
        .await
        .with_context(|| format!("failed to connect to gateway at {endpoint}"))?;
    Ok(StudioContext::new(client).with_options(config.options()))
}

async fn run(
    command: Command,
    ctx: &StudioContext<GatewayClient>,
    config: &StudioConfig,
    state: &StateDir,
) -> Result<()> {
    match command {
        Command::Agents(command) => run_agents(command, ctx, config, state).await,
        Command::Heartbeat(command) => run_heartbeat(command, ctx).await,
        Command::Sessions(command) => run_sessions(command, ctx, state).await,
        Command::History { agent_id, limit } => {
            let mut local = LocalState::load(state)?;
            let mut store = AgentStore::from_agents(std::mem::take(&mut local.agents));
            ensure_local_agent(&mut store, &local, &agent_id);
            sync_history(ctx, &mut store, &agent_id, limit).await;
            let agent = store.get(&agent_id).cloned();
            local.agents = store.snapshot();
            local.save()?;
            print_json(&agent)
        }
        Command::Reconcile => {
            let mut local = LocalState::load(state)?;
            let mut store = AgentStore::from_agents(std::mem::take(&mut local.agents));
            let agents = store.snapshot();
            let commands = run_agent_reconcile(
                ctx,
                &agents,
                |id| store.get(id).cloned(),
                &store.runs,
                StudioError::is_disconnect_like,
            )
            .await;
            execute_commands(commands, &mut store, StudioError::is_disconnect_like);
            let refreshed = store.take_refresh_requests();
            for agent_id in &refreshed {
                sync_history(ctx, &mut store, agent_id, None).await;
            }
            local.agents = store.snapshot();
            local.save()?;
            print_json(&json!({ "settled": refreshed }))
        }
        Command::Setup(command) => run_setup(command, ctx, config, state).await,
        Command::Permissions(command) => run_permissions(command, ctx, state).await,
        Command::Watch => watch(ctx).await,
    }
}

async fn run_agents(
    command: AgentsCommand,
    ctx: &StudioContext<GatewayClient>,
    config: &StudioConfig,
    state: &StateDir,
) -> Result<()> {
    match command {
        AgentsCommand::List => print_json(&list_agents(ctx).await?),
        AgentsCommand::Create {
            name,
            config_only: true,
            ..
        } => print_json(&create_agent(ctx, &name).await?),
        AgentsCommand::Create { name, setup, .. } => {
            let setup = setup.as_deref().map(read_setup).transpose()?;
            let mut outcome = create_agent_with_optional_setup(
                ctx,
                &name,
                setup.as_ref().filter(|_| !config.gateway.local),
                config.gateway.local,
            )
            .await?;
            if let Some(setup) = setup {
                if !outcome.awaiting_restart {
                    match apply_guided_agent_setup(ctx, &outcome.agent_id, &setup, true).await {
                        Ok(()) => outcome.setup_applied = true,
                        Err(err) => {
                            tracing::warn!(agent_id = %outcome.agent_id, error = %err, "setup failed, queued for retry");
                            queue_setup(config, state, &outcome.agent_id, setup)?;
                        }
                    }
                } else {
                    queue_setup(config, state, &outcome.agent_id, setup)?;
                }
            }
            print_json(&outcome)
        }
        AgentsCommand::Rename { agent_id, name } => {
            print_json(&rename_agent(ctx, &agent_id, &name).await?)
        }
        AgentsCommand::Delete { agent_id } => print_json(&delete_agent(ctx, &agent_id).await?),
        AgentsCommand::Overrides {
            agent_id,
            sandbox,
            tools,
        } => {
            let overrides = AgentOverrides {
                sandbox: sandbox.as_deref().map(parse_object).transpose()?,
                tools: tools.as_deref().map(parse_object).transpose()?,
            };
            if overrides.is_empty() {
                bail!("nothing to update; pass --sandbox and/or --tools");
            }
            print_json(&update_agent_overrides(ctx, &agent_id, &overrides).await?)
        }
    }
}

async fn run_heartbeat(command: HeartbeatCommand, ctx: &StudioContext<GatewayClient>) -> Result<()> {
    match command {
        HeartbeatCommand::Show { agent_id } => {
            print_json(&list_heartbeats_for_agent(ctx, &agent_id).await?)
        }
        HeartbeatCommand::Set {
            agent_id,
            every,
            target,
            include_reasoning,
            ack_max_chars,
            active_start,
            active_end,
        } => {
            let active_hours = match (active_start, active_end) {
                (Some(start), Some(end)) => Some(HeartbeatActiveHours { start, end }),
                _ => None,
            };
            let update = HeartbeatUpdate {
                override_enabled: true,
                heartbeat: AgentHeartbeat {
                    every,
                    target,
                    include_reasoning,
                    ack_max_chars,
                    active_hours,
                },
            };
            print_json(&update_heartbeat(ctx, &agent_id, &update).await?)
        }
        HeartbeatCommand::Clear { agent_id } => {
            print_json(&remove_heartbeat_override(ctx, &agent_id).await?)
        }
        HeartbeatCommand::Wake { agent_id } => {
            print_json(&trigger_heartbeat_now(ctx, &agent_id).await?)
        }
    }
}

async fn run_sessions(
    command: SessionsCommand,
    ctx: &StudioContext<GatewayClient>,
    state: &StateDir,
) -> Result<()> {
    match command {
        SessionsCommand::Reconcile { prune } => {
            let mut local = LocalState::load(state)?;
            let agent_ids: Vec<String> = list_agents(ctx).await?.into_iter().map(|a| a.id).collect();
            let generated = uuid::Uuid::new_v4().to_string();
            let selection = reconcile_studio_sessions(
                ctx,
                &agent_ids,
                local.studio_session_id.as_deref(),
                &generated,
            )
            .await?;
            if selection.should_persist_session {
                local.studio_session_id = Some(selection.session_id.clone());
                local.save()?;
            }
            let pruned = if prune {
                delete_sessions(ctx, &selection.stale_studio_keys).await?
            } else {
                0
            };
            print_json(&json!({ "selection": selection, "pruned": pruned }))
        }
        SessionsCommand::List { agent_id } => {
            print_json(&list_agent_studio_sessions(ctx, &agent_id).await?)
        }
    }
}

async fn run_setup(
    command: SetupCommand,
    ctx: &StudioContext<GatewayClient>,
    config: &StudioConfig,
    state: &StateDir,
) -> Result<()> {
    let store = state.pending_store();
    let mut pending = load_pending_setups(&store, now_ms(), config.pending_ttl())?;
    match command {
        SetupCommand::List => print_json(&pending),
        SetupCommand::Add { agent_id, file } => {
            let setup = read_setup(&file)?;
            if !upsert_pending_setup(&mut pending, &agent_id, setup) {
                bail!("agent id is required");
            }
            persist_pending_setups(&store, &pending, now_ms())?;
            print_json(&pending.keys().collect::<Vec<_>>())
        }
        SetupCommand::Apply { agent_id } => {
            let targets: Vec<String> = match agent_id {
                Some(id) => vec![id],
                None => pending.keys().cloned().collect(),
            };
            let mut applied = Vec::new();
            let mut failed = Vec::new();
            for agent_id in targets {
                match apply_pending_setup(ctx, &agent_id, &mut pending).await {
                    Ok(true) => applied.push(agent_id),
                    Ok(false) => tracing::info!(agent_id = %agent_id, "no pending setup"),
                    Err(err) => {
                        tracing::warn!(agent_id = %agent_id, error = %err, "pending setup failed");
                        failed.push(agent_id);
                    }
                }
            }
            persist_pending_setups(&store, &pending, now_ms())?;
            print_json(&json!({ "applied": applied, "failed": failed }))
        }
    }
}

async fn run_permissions(
    command: PermissionsCommand,
    ctx: &StudioContext<GatewayClient>,
    state: &StateDir,
) -> Result<()> {
    let mut local = LocalState::load(state)?;
    match command {
        PermissionsCommand::Show { agent_id } => {
            let entry = list_agents(ctx)
                .await?
                .into_iter()
                .find(|entry| entry.id == agent_id.trim());
            let agent = local.agents.iter().find(|a| a.agent_id == agent_id.trim());
            let draft = resolve_agent_permissions_draft(
                agent.and_then(|a| a.session_exec_security),
                agent.and_then(|a| a.session_exec_ask),
                entry.as_ref().and_then(|e| e.tools_object()),
            );
            let role = ExecutionRole::for_command_mode(draft.command_mode);
            print_json(&json!({
                "draft": draft,
                "summary": draft.summary(),
                "custom": draft.is_custom(role),
            }))
        }
        PermissionsCommand::Set {
            agent_id,
            mode,
            web,
            files,
            session_key,
        } => {
            let command_mode = CommandMode::from(mode);
            let preset = ExecutionRole::for_command_mode(command_mode).preset_defaults();
            let draft = AgentPermissionsDraft {
                command_mode,
                web_access: web.unwrap_or(preset.web_access),
                file_tools: files.unwrap_or(preset.file_tools),
            };
            let session_key = session_key
                .unwrap_or_else(|| default_session_key(&local, agent_id.trim()));
            let settings = update_agent_permissions(ctx, &agent_id, &session_key, &draft).await?;
            if let Some(agent) = local.agents.iter_mut().find(|a| a.agent_id == agent_id.trim()) {
                agent.session_exec_security = Some(settings.exec_security);
                agent.session_exec_ask = Some(settings.exec_ask);
                local.save()?;
            }
            print_json(&json!({ "draft": draft, "session": settings }))
        }
    }
}

async fn watch(ctx: &StudioContext<GatewayClient>) -> Result<()> {
    let mut events = ctx.client.subscribe_events();
    let mut status = ctx.client.subscribe_status();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            event = events.recv() => match event {
                Ok(event) => println!("{}", serde_json::to_string(&event)?),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event stream lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
            },
            changed = status.changed() => {
                if changed.is_err() || *status.borrow() == GatewayStatus::Disconnected {
                    bail!("gateway disconnected");
                }
            }
        }
    }
}

/// Run history sync for one agent, fetching again while the transcript
/// keeps moving underneath it.
async fn sync_history(
    ctx: &StudioContext<GatewayClient>,
    store: &mut AgentStore,
    agent_id: &str,
    limit: Option<usize>,
) {
    for _ in 0..MAX_HISTORY_ATTEMPTS {
        let Some(session_key) = store.get(agent_id).map(|a| a.session_key.clone()) else {
            return;
        };
        let in_flight = store.in_flight_history().clone();
        let request_id = uuid::Uuid::new_v4().to_string();
        store.begin_history_request(agent_id, &request_id);
        let request = HistorySyncRequest {
            agent_id,
            request_id: &request_id,
            loaded_at: now_ms(),
            limit,
            in_flight_session_keys: &in_flight,
        };
        let commands = run_history_sync(ctx, request, |id| store.get(id).cloned()).await;
        execute_commands(commands, store, StudioError::is_disconnect_like);
        store.end_history_request(&session_key);

        let refresh = store.take_refresh_requests();
        if !refresh.iter().any(|id| id == agent_id) {
            return;
        }
    }
    tracing::warn!(agent_id, "history kept changing, giving up");
}

fn default_session_key(local: &LocalState, agent_id: &str) -> String {
    local
        .agents
        .iter()
        .find(|a| a.agent_id == agent_id)
        .map(|a| a.session_key.clone())
        .unwrap_or_else(|| match &local.studio_session_id {
            Some(session_id) => build_agent_studio_session_key(agent_id, session_id),
            None => build_agent_main_session_key(agent_id, "main"),
        })
}

fn ensure_local_agent(store: &mut AgentStore, local: &LocalState, agent_id: &str) {
    if store.get(agent_id).is_some() {
        return;
    }
    let mut agent = AgentState::new(agent_id, default_session_key(local, agent_id));
    agent.session_created = true;
    store.upsert(agent);
}

fn queue_setup(config: &StudioConfig, state: &StateDir, agent_id: &str, setup: AgentGuidedSetup) -> Result<()> {
    let store = state.pending_store();
    let mut pending = load_pending_setups(&store, now_ms(), config.pending_ttl())?;
    upsert_pending_setup(&mut pending, agent_id, setup);
    persist_pending_setups(&store, &pending, now_ms())?;
    tracing::info!(agent_id, "guided setup queued");
    Ok(())
}

fn parse_json_number(raw: &str) -> std::result::Result<serde_json::Number, String> {
    serde_json::from_str(raw).map_err(|_| format!("{raw:?} is not a number"))
}

fn read_setup(path: &Path) -> Result<AgentGuidedSetup> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("invalid setup {}", path.display()))
}

fn parse_object(raw: &str) -> Result<serde_json::Map<String, Value>> {
    match serde_json::from_str(raw).context("invalid JSON")? {
        Value::Object(object) => Ok(object),
        _ => bail!("expected a JSON object"),
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
