use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::{Instant, timeout_at};
use tracing::{info, warn};

use xrecovery::adapters::{self, Simulator};
use xrecovery::config::AppConfig;
use xrecovery::context::AppContext;
use xrecovery::core::coordinator::{self, ConfirmationPrompt, TransferOutcome, format_size};
use xrecovery::core::progress::{Progress, TransferObserver};
use xrecovery::core::registry::RegistryEvent;
use xrecovery::core::volume::{VolumeHandle, VolumeKind};
use xrecovery::core::{TransferState, installer};
use xrecovery::logging;

#[derive(Parser)]
#[command(name = "xrecovery")]
#[command(about = "Create bootable recovery media from installer images", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    global: GlobalArgs,
}

#[derive(Args, Serialize)]
struct GlobalArgs {
    /// Config file (default: /etc/xrecovery/config.toml)
    #[serde(skip)]
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Use simulated devices instead of real hardware
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    #[arg(long, global = true)]
    simulation: bool,

    #[serde(skip_serializing_if = "std::ops::Not::not")]
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print command output as JSON
    #[serde(skip)]
    #[arg(long, global = true)]
    json: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    mount_base: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// List candidate source and destination volumes
    Volumes,
    /// List installer images found in the configured directories
    Installers,
    /// Print the effective configuration
    Config,
    /// Write an installer onto a destination volume
    Create(CreateArgs),
}

#[derive(Args)]
struct CreateArgs {
    /// Source volume id, or path to an installer image to attach
    #[arg(long)]
    source: String,

    /// Destination volume id
    #[arg(long)]
    destination: String,

    /// Skip the confirmation prompt
    #[arg(long)]
    yes: bool,

    /// Refuse to proceed while other processes hold the destination open
    #[arg(long)]
    exclusive: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load(cli.global.config.as_deref(), Some(&cli.global))?;
    logging::init(logging::LogConfig::from(&config));

    let (arbiter, simulator) = adapters::get_arbiter(&config)?;
    let ctx = AppContext::new(config, arbiter, simulator);

    if let Some(simulator) = &ctx.simulator {
        adapters::seed_simulation(simulator, &ctx.registry, &ctx.config)
            .context("Failed to seed simulated devices")?;
    }

    let json = cli.global.json;
    match cli.command {
        Commands::Volumes => run_volumes(&ctx, json),
        Commands::Installers => run_installers(&ctx, json),
        Commands::Config => run_config(&ctx),
        Commands::Create(args) => run_create(&ctx, args, json).await,
    }
}

#[derive(Serialize)]
struct VolumeRow {
    id: String,
    kind: VolumeKind,
    label: String,
    details: String,
    size: u64,
    filesystem: String,
    devnode: PathBuf,
    mountpoint: Option<PathBuf>,
}

impl From<&VolumeHandle> for VolumeRow {
    fn from(volume: &VolumeHandle) -> Self {
        let info = volume.info();
        Self {
            id: info.id,
            kind: volume.kind(),
            label: info.label,
            details: info.details,
            size: info.size,
            filesystem: info.filesystem,
            devnode: info.devnode,
            mountpoint: info.mountpoint,
        }
    }
}

fn run_volumes(ctx: &AppContext, json: bool) -> Result<()> {
    ctx.registry.scan().context("Failed to scan devices")?;
    let rows: Vec<VolumeRow> = ctx.registry.volumes().iter().map(VolumeRow::from).collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if rows.is_empty() {
        println!("No volumes found.");
        return Ok(());
    }
    println!(
        "{:<16} {:<12} {:<24} {:>10} {:<8} MOUNTPOINT",
        "ID", "KIND", "LABEL", "SIZE", "FS"
    );
    for row in rows {
        println!(
            "{:<16} {:<12} {:<24} {:>10} {:<8} {}",
            row.id,
            format!("{:?}", row.kind),
            row.label,
            format_size(row.size),
            row.filesystem,
            row.mountpoint
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "-".to_string())
        );
    }
    Ok(())
}

fn run_installers(ctx: &AppContext, json: bool) -> Result<()> {
    let images = installer::discover(&ctx.config.installer_dirs);

    if json {
        println!("{}", serde_json::to_string_pretty(&images)?);
        return Ok(());
    }

    if images.is_empty() {
        println!("No installer images found.");
    }
    for image in images {
        println!(
            "{:<32} {:>10}  {}",
            image.name,
            format_size(image.size),
            image.path.display()
        );
    }
    Ok(())
}

fn run_config(ctx: &AppContext) -> Result<()> {
    print!("{}", ctx.config.to_toml()?);
    Ok(())
}

/// Loop device attached for this run, detached again on the way out.
struct AttachedImage {
    image: PathBuf,
    device: Option<PathBuf>,
}

async fn run_create(ctx: &AppContext, args: CreateArgs, json: bool) -> Result<()> {
    let mut events = ctx.registry.subscribe();
    let watcher = ctx.registry.watch();
    ctx.registry.scan().context("Failed to scan devices")?;

    let (source, attached) = match ctx.registry.get(&args.source) {
        Some(volume) => (volume, None),
        None => {
            let image = PathBuf::from(&args.source);
            let attached = attach_image(ctx, &image).await?;
            let volume = wait_for_source(ctx, &image, &mut events).await;
            match volume {
                Ok(volume) => (volume, Some(attached)),
                Err(e) => {
                    release_image(ctx, attached).await;
                    return Err(e);
                }
            }
        }
    };

    let result = create(ctx, &args, source, json).await;

    if let Some(attached) = attached {
        release_image(ctx, attached).await;
    }
    ctx.registry.arbiter().stop();
    watcher.abort();

    result
}

async fn create(ctx: &AppContext, args: &CreateArgs, source: VolumeHandle, json: bool) -> Result<()> {
    if source.kind() != VolumeKind::Source {
        bail!("{} is not an installer source", source.id());
    }
    let destination = ctx
        .registry
        .get(&args.destination)
        .ok_or_else(|| anyhow!("No such volume: {}", args.destination))?;
    if destination.kind() != VolumeKind::Destination {
        bail!("{} is not a usable destination", destination.id());
    }
    if args.exclusive || ctx.config.exclusive_access {
        destination.set_exclusive_access(true);
    }

    let observer: Arc<dyn TransferObserver> = Arc::new(ConsoleObserver { quiet: json });
    let skip_prompt = args.yes;

    let report = coordinator::run_blocking(
        source,
        destination,
        ctx.config.plan(),
        observer,
        move |prompt: &ConfirmationPrompt| skip_prompt || ask(prompt),
        |cancel| {
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted, cancelling transfer");
                    cancel.cancel();
                }
            });
        },
    )
    .await?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "id": report.id.to_string(),
                "state": report.outcome.state(),
                "reason": report.outcome.reason(),
                "started_at": report.started_at,
                "finished_at": report.finished_at,
                "steps": report.steps,
            }))?
        );
    }

    for error in report.outcome.cleanup_errors() {
        eprintln!("warning: cleanup: {}", error);
    }

    match report.outcome {
        TransferOutcome::Succeeded => {
            if !json {
                println!("Done.");
            }
            Ok(())
        }
        TransferOutcome::Cancelled { .. } => bail!("Cancelled"),
        TransferOutcome::Failed { reason, .. } => Err(anyhow!(reason).context("Transfer failed")),
    }
}

async fn attach_image(ctx: &AppContext, image: &Path) -> Result<AttachedImage> {
    let image = image
        .canonicalize()
        .with_context(|| format!("No such volume or image: {}", image.display()))?;
    ctx.registry.register_image(&image);

    if let Some(simulator) = &ctx.simulator {
        simulator.add_image(&simulated_id(&image), &image);
        return Ok(AttachedImage {
            image,
            device: None,
        });
    }

    let path = image.clone();
    let device = tokio::task::spawn_blocking(move || installer::attach(&path))
        .await
        .map_err(|e| anyhow!("attach task panicked: {}", e))??;
    Ok(AttachedImage {
        image,
        device: Some(device),
    })
}

async fn release_image(ctx: &AppContext, attached: AttachedImage) {
    ctx.registry.forget_image(&attached.image);

    if let Some(simulator) = &ctx.simulator {
        remove_simulated(simulator, &attached.image);
        return;
    }

    if let Some(device) = attached.device {
        let result = tokio::task::spawn_blocking(move || installer::detach(&device)).await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Failed to detach installer image"),
            Err(e) => warn!(error = %e, "Detach task panicked"),
        }
    }
}

fn simulated_id(image: &Path) -> String {
    format!(
        "sim-{}",
        image
            .file_stem()
            .map(|s| s.to_string_lossy().to_lowercase().replace(' ', "-"))
            .unwrap_or_else(|| "image".to_string())
    )
}

fn remove_simulated(simulator: &Simulator, image: &Path) {
    simulator.remove_device(&simulated_id(image));
}

/// Wait until the loop device for `image` has been registered as a source.
async fn wait_for_source(
    ctx: &AppContext,
    image: &Path,
    events: &mut broadcast::Receiver<RegistryEvent>,
) -> Result<VolumeHandle> {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(volume) = ctx.registry.source_for_image(image) {
            info!(volume = %volume.id(), "Installer image attached");
            return Ok(volume);
        }
        match timeout_at(deadline, events.recv()).await {
            Ok(Ok(_)) | Ok(Err(broadcast::error::RecvError::Lagged(_))) => {}
            Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => {
                // One last enumeration in case the event was missed.
                ctx.registry.scan()?;
                return ctx
                    .registry
                    .source_for_image(image)
                    .ok_or_else(|| anyhow!("{} did not appear as a source", image.display()));
            }
        }
    }
}

fn ask(prompt: &ConfirmationPrompt) -> bool {
    eprintln!("{}", prompt.header);
    eprintln!("{}", prompt.details);
    eprint!("Type 'yes' to continue: ");
    let _ = io::stderr().flush();

    let mut answer = String::new();
    match io::stdin().lock().read_line(&mut answer) {
        Ok(_) => answer.trim().eq_ignore_ascii_case("yes"),
        Err(_) => false,
    }
}

struct ConsoleObserver {
    quiet: bool,
}

impl TransferObserver for ConsoleObserver {
    fn on_state(&self, state: TransferState) {
        if !self.quiet && state == TransferState::Running {
            eprintln!("Starting transfer...");
        }
    }

    fn on_progress(&self, label: &str, progress: Progress) {
        if self.quiet {
            return;
        }
        match progress {
            Progress::Fraction(f) if f < 1.0 => eprint!("\r{:<40} {:>5}", label, progress),
            _ => eprintln!("\r{:<40} {:>5}", label, progress),
        }
    }

    fn on_result(&self, outcome: &TransferOutcome) {
        if self.quiet {
            return;
        }
        match outcome.reason() {
            Some(reason) => eprintln!("\n{:?}: {}", outcome.state(), reason),
            None => eprintln!("{:?}", outcome.state()),
        }
    }
}
