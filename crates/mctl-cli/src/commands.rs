use crate::picker::FzfPicker;
use crate::session_host::{pane_target, reload_in_place, TmuxMultiplexer};
use crate::sources::{mission_row, MissionSource, RepoSource, TemplateSource};
use crate::wrapper::{self, WrapperConfig, HEARTBEAT_INTERVAL};
use anyhow::{bail, Context as _, Result};
use chrono::{DateTime, Local, Utc};
use clap::{Args, Subcommand};
use mctl_control::supervisor::ServerStatus;
use mctl_control::{ControlHandle, CurrentExeSpawner, Spawner, StartOutcome, Supervisor};
use mctl_core::instance::{Instance, Settings};
use mctl_core::pidfile::StopOutcome;
use mctl_core::resolve::{format_table, resolve, Picker, Resolution, ResolveOptions, ResolverSource};
use mctl_core::{MissionFilter, MissionPatch, MissionView, NewMission};
use std::fs;
use std::sync::Arc;
use tracing::{debug, warn};

pub const PROMPT_FILE: &str = "PROMPT.md";

#[derive(Args, Debug, Default)]
pub struct QueryArgs {
    /// Mission id, search words, or nothing to pick interactively
    pub query: Vec<String>,
}

#[derive(Args, Debug, Default)]
pub struct ListArgs {
    /// Include archived missions
    #[arg(long)]
    pub all: bool,
    /// Only missions spawned by this cron job
    #[arg(long)]
    pub cron: Option<String>,
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug, Default)]
pub struct ShowArgs {
    pub query: Vec<String>,
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug, Default)]
pub struct UpdateArgs {
    pub query: Vec<String>,
    #[arg(long)]
    pub description: Option<String>,
    /// Pin a configuration snapshot id
    #[arg(long)]
    pub pin: Option<String>,
}

#[derive(Args, Debug, Default)]
pub struct NewArgs {
    #[arg(long)]
    pub name: Option<String>,
    /// Repository (`owner/name` or search words); bare flag opens the picker
    #[arg(long, num_args = 0..=1, default_missing_value = "")]
    pub repo: Option<String>,
    /// Prompt template; bare flag opens the picker
    #[arg(long, num_args = 0..=1, default_missing_value = "")]
    pub template: Option<String>,
    #[arg(long)]
    pub description: Option<String>,
    #[arg(long)]
    pub cron: Option<String>,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
pub enum ServerCommand {
    /// Start the control server in the background
    Start,
    Stop,
    Status,
    Restart,
}

pub type SharedSpawner = Arc<dyn Spawner + Send + Sync>;

/// What every command runs against: one instance root, its settings, the
/// picker used when input does not name a single target and the way a
/// control server gets launched.
pub struct Context {
    pub instance: Instance,
    pub settings: Settings,
    picker: Box<dyn Picker>,
    spawner: SharedSpawner,
}

impl Context {
    pub fn load() -> Result<Self> {
        let instance = Instance::from_env().context("failed to locate the mctl home")?;
        let settings = instance.settings();
        let picker = Box::new(FzfPicker::for_session(settings.picker.clone()));
        Ok(Self::new(instance, settings, picker, Arc::new(CurrentExeSpawner)))
    }

    pub fn new(
        instance: Instance,
        settings: Settings,
        picker: Box<dyn Picker>,
        spawner: SharedSpawner,
    ) -> Self {
        Self {
            instance,
            settings,
            picker,
            spawner,
        }
    }

    pub fn supervisor(&self) -> Supervisor<SharedSpawner> {
        Supervisor::with_spawner(
            self.instance.clone(),
            self.settings.stop_policy(),
            self.spawner.clone(),
        )
    }

    pub async fn control(&self) -> ControlHandle {
        ControlHandle::connect(&self.instance, self.settings.stop_policy()).await
    }

    fn pick<S: ResolverSource>(
        &self,
        source: &S,
        input: &str,
        multi: bool,
    ) -> Result<Option<Vec<S::Item>>> {
        let prompt = format!("{}> ", source.noun());
        let options = ResolveOptions {
            prompt: &prompt,
            multi,
        };
        let resolution = resolve(source, self.picker.as_ref(), input, options)?;
        Ok(match resolution {
            Resolution::Selected(items) => Some(items),
            Resolution::Cancelled => {
                println!("Cancelled.");
                None
            }
            Resolution::Empty => {
                println!("Nothing to choose from: no {} available.", source.noun());
                None
            }
        })
    }

    async fn pick_missions(
        &self,
        control: &ControlHandle,
        query: &[String],
        multi: bool,
        offer_archived: bool,
    ) -> Result<Option<Vec<MissionView>>> {
        let missions = control
            .list(&MissionFilter {
                include_archived: true,
                cron_job: None,
            })
            .await
            .context("failed to list missions")?;
        let source = MissionSource::new(missions, offer_archived);
        self.pick(&source, &query.join(" "), multi)
    }
}

pub async fn list(ctx: &Context, args: &ListArgs) -> Result<()> {
    let control = ctx.control().await;
    let filter = MissionFilter {
        include_archived: args.all,
        cron_job: args.cron.clone(),
    };
    let missions = control.list(&filter).await.context("failed to list missions")?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&missions)?);
        return Ok(());
    }
    if missions.is_empty() {
        println!("No missions.");
        return Ok(());
    }
    for line in mission_table(&missions) {
        println!("{line}");
    }
    Ok(())
}

fn mission_table(missions: &[MissionView]) -> Vec<String> {
    let header = ["ID", "STATE", "NAME", "REPO", "CRON", "DESCRIPTION"]
        .iter()
        .map(|column| column.to_string())
        .collect::<Vec<_>>();
    let mut rows = vec![header];
    rows.extend(missions.iter().map(mission_row));
    format_table(rows)
}

pub async fn show(ctx: &Context, args: &ShowArgs) -> Result<()> {
    let control = ctx.control().await;
    let Some(picked) = ctx.pick_missions(&control, &args.query, false, true).await? else {
        return Ok(());
    };
    for view in picked {
        if args.json {
            println!("{}", serde_json::to_string_pretty(&view)?);
        } else {
            for line in describe(&view) {
                println!("{line}");
            }
        }
    }
    Ok(())
}

fn local_time(at: &DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string()
}

fn describe(view: &MissionView) -> Vec<String> {
    let mission = &view.mission;
    let state = match view.pid {
        Some(pid) => format!("{} (pid {pid})", view.state),
        None => view.state.to_string(),
    };
    let mut fields = vec![
        ("id", mission.id.clone()),
        ("state", state),
        ("name", mission.label().to_string()),
    ];
    let optional = [
        ("repo", mission.repo.clone()),
        ("cron", mission.cron_job.clone()),
        ("pinned", mission.config_snapshot.clone()),
        ("pane", mission.pane_id.map(pane_target)),
        ("description", mission.description.clone()),
    ];
    fields.extend(
        optional
            .into_iter()
            .filter_map(|(key, value)| value.map(|value| (key, value))),
    );
    fields.push(("workspace", mission.workspace.display().to_string()));
    fields.push(("created", local_time(&mission.created_at)));
    if let Some(heartbeat) = &mission.last_heartbeat {
        fields.push(("heartbeat", local_time(heartbeat)));
    }
    fields
        .into_iter()
        .map(|(key, value)| format!("{:<12}{value}", format!("{key}:")))
        .collect()
}

pub async fn stop(ctx: &Context, args: &QueryArgs) -> Result<()> {
    let control = ctx.control().await;
    let Some(picked) = ctx.pick_missions(&control, &args.query, true, false).await? else {
        return Ok(());
    };
    let total = picked.len();
    let mut failed = 0;
    for view in picked {
        match control.stop(&view.mission.id).await {
            Ok(report) => println!("{}  {}", view.mission.short_id(), report.outcome.as_str()),
            Err(err) => {
                failed += 1;
                eprintln!("{}  failed: {err}", view.mission.short_id());
            }
        }
    }
    if failed > 0 {
        bail!("{failed} of {total} missions could not be stopped");
    }
    Ok(())
}

pub async fn archive(ctx: &Context, args: &QueryArgs) -> Result<()> {
    let control = ctx.control().await;
    let Some(picked) = ctx.pick_missions(&control, &args.query, true, false).await? else {
        return Ok(());
    };
    let total = picked.len();
    let mut failed = 0;
    for view in picked {
        match control.archive(&view.mission.id).await {
            Ok(_) => println!("{}  archived", view.mission.short_id()),
            Err(err) => {
                failed += 1;
                eprintln!("{}  failed: {err}", view.mission.short_id());
            }
        }
    }
    if failed > 0 {
        bail!("{failed} of {total} missions could not be archived");
    }
    Ok(())
}

fn patch_from(args: &UpdateArgs) -> Result<MissionPatch> {
    let patch = MissionPatch {
        description: args.description.clone(),
        config_snapshot: args.pin.clone(),
    };
    if patch.is_empty() {
        bail!("nothing to update; pass --description or --pin");
    }
    Ok(patch)
}

pub async fn update(ctx: &Context, args: &UpdateArgs) -> Result<()> {
    let patch = patch_from(args)?;
    let control = ctx.control().await;
    let Some(picked) = ctx.pick_missions(&control, &args.query, false, false).await? else {
        return Ok(());
    };
    for view in picked {
        let updated = control
            .update(&view.mission.id, &patch)
            .await
            .with_context(|| format!("failed to update mission {}", view.mission.short_id()))?;
        println!("{}  updated", updated.mission.short_id());
    }
    Ok(())
}

fn resume_command(id: &str) -> Result<Vec<String>> {
    let exe = std::env::current_exe().context("failed to locate the mctl binary")?;
    Ok(vec![
        exe.to_string_lossy().into_owned(),
        "resume".to_string(),
        id.to_string(),
    ])
}

fn wrapper_config(settings: &Settings) -> WrapperConfig {
    WrapperConfig {
        agent_command: settings.agent_command.clone(),
        heartbeat: HEARTBEAT_INTERVAL,
    }
}

/// In place when the mission sits in a tmux pane; otherwise stop and resume
/// here. Returns the exit code to leave with.
pub async fn reload(ctx: &Context, args: &QueryArgs) -> Result<i32> {
    let control = ctx.control().await;
    let Some(picked) = ctx.pick_missions(&control, &args.query, false, false).await? else {
        return Ok(0);
    };
    let Some(view) = picked.into_iter().next() else {
        return Ok(0);
    };
    let mission = view.mission;

    if let Some(pane) = mission.pane_id {
        let resume = resume_command(&mission.id)?;
        let handle = &control;
        let id = mission.id.as_str();
        reload_in_place(&TmuxMultiplexer, &mission, &resume, move || async move {
            handle.stop(id).await.map(|_| ())
        })
        .await?;
        println!("{}  reloaded in pane {}", mission.short_id(), pane_target(pane));
        return Ok(0);
    }

    eprintln!(
        "mctl: mission {} is not in a tmux pane, so its screen position cannot be kept; restarting it here",
        mission.short_id()
    );
    let report = control
        .stop(&mission.id)
        .await
        .with_context(|| format!("failed to stop mission {}", mission.short_id()))?;
    debug!(event = "reload_fallback_stopped", id = %mission.id, outcome = report.outcome.as_str());
    wrapper::run(&ctx.instance, &control, &mission.id, &wrapper_config(&ctx.settings)).await
}

pub async fn resume(ctx: &Context, id: &str) -> Result<i32> {
    ctx.supervisor().ensure_running().await;
    let control = ctx.control().await;
    wrapper::run(&ctx.instance, &control, id, &wrapper_config(&ctx.settings)).await
}

pub async fn new_mission(ctx: &Context, args: &NewArgs) -> Result<()> {
    ctx.supervisor().ensure_running().await;

    let repo = match &args.repo {
        Some(query) => match ctx.pick(&RepoSource::new(ctx.instance.repos_dir()), query, false)? {
            Some(repos) => repos.into_iter().next(),
            None => return Ok(()),
        },
        None => None,
    };
    let template = match &args.template {
        Some(query) => {
            let source = TemplateSource::new(ctx.instance.templates_dir());
            match ctx.pick(&source, query, false)? {
                Some(templates) => templates.into_iter().next(),
                None => return Ok(()),
            }
        }
        None => None,
    };

    let control = ctx.control().await;
    let created = control
        .create(&NewMission {
            name: args.name.clone(),
            repo: repo.map(|repo| repo.slug),
            description: args.description.clone(),
            cron_job: args.cron.clone(),
            config_snapshot: None,
        })
        .await
        .context("failed to create mission")?;
    let workspace = &created.mission.workspace;
    fs::create_dir_all(workspace)
        .with_context(|| format!("failed to create {}", workspace.display()))?;
    if let Some(template) = template {
        let target = workspace.join(PROMPT_FILE);
        fs::copy(&template.path, &target).with_context(|| {
            format!(
                "failed to copy template {} to {}",
                template.path.display(),
                target.display()
            )
        })?;
    }
    if control.is_direct() {
        warn!(event = "mission_created_without_server", id = %created.mission.id);
    }
    println!("{}", created.mission.short_id());
    Ok(())
}

pub async fn server(ctx: &Context, action: &ServerCommand) -> Result<()> {
    let supervisor = ctx.supervisor();
    match action {
        ServerCommand::Start => match supervisor.start().await? {
            StartOutcome::Started(pid) => println!("control server started (pid {pid})"),
            StartOutcome::AlreadyRunning(pid) => {
                println!("control server already running (pid {pid})")
            }
            StartOutcome::Served => {}
        },
        ServerCommand::Stop => match supervisor.stop().await? {
            StopOutcome::NotRunning => println!("control server not running"),
            outcome => println!("control server stopped ({})", outcome.as_str()),
        },
        ServerCommand::Status => match supervisor.status().await {
            ServerStatus::Running(health) => println!(
                "control server running (pid {}, version {})",
                health.pid, health.version
            ),
            ServerStatus::Unresponsive(pid) => println!(
                "control server pid {pid} is alive but not answering; try `mctl server restart`"
            ),
            ServerStatus::NotRunning => println!("control server not running"),
        },
        ServerCommand::Restart => match supervisor.restart().await? {
            StartOutcome::Started(pid) | StartOutcome::AlreadyRunning(pid) => {
                println!("control server restarted (pid {pid})")
            }
            StartOutcome::Served => {}
        },
    }
    Ok(())
}

pub async fn reset(ctx: &Context, yes: bool) -> Result<()> {
    let root = ctx.instance.root().display().to_string();
    if !yes {
        bail!("refusing to delete the registry and missions under {root} without --yes");
    }
    let stopped = ctx
        .supervisor()
        .reset()
        .await
        .with_context(|| format!("failed to reset {root}"))?;
    println!("reset {root} (stopped {stopped} missions)");
    Ok(())
}
