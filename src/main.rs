use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use idlegrid::activity::platform_probe;
use idlegrid::agent::Agent;
use idlegrid::config::{AgentConfig, DeviceIdentity, ResourceMode};
use idlegrid::shutdown::install_shutdown_handler;
use idlegrid::update::UpdateManager;

#[derive(Parser, Debug)]
#[command(name = "idlegrid")]
#[command(version)]
#[command(about = "Background agent that contributes idle compute to the IdleGrid network")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the agent loop
    Run(RunArgs),

    /// Check for a newer agent release and optionally apply it
    Update(UpdateArgs),
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// How aggressively to claim host resources
    /// (aggressive, balanced, conservative, idle-only)
    #[arg(long, default_value = "balanced")]
    mode: ResourceMode,

    /// Coordinator API base URL (overrides IDLEGRID_API_BASE)
    #[arg(long)]
    api_base: Option<String>,

    /// Root directory for per-job scratch space
    #[arg(long)]
    work_dir: Option<PathBuf>,

    /// Account email, stored on first run
    #[arg(long)]
    email: Option<String>,

    /// Disable automatic self-update
    #[arg(long)]
    no_auto_update: bool,
}

#[derive(Parser, Debug)]
struct UpdateArgs {
    /// Apply the update instead of only reporting it
    #[arg(long)]
    apply: bool,
}

async fn run_agent(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = AgentConfig::default().with_mode(args.mode);

    let api_base = args
        .api_base
        .or_else(|| std::env::var("IDLEGRID_API_BASE").ok());
    if let Some(api_base) = api_base {
        config = config.with_api_base(api_base);
    }
    if let Some(work_dir) = args.work_dir {
        config = config.with_work_root(work_dir);
    }
    if args.no_auto_update {
        config.auto_update = false;
    }

    let mut identity = DeviceIdentity::load()?;
    if identity.email.is_empty() {
        if let Some(email) = args
            .email
            .or_else(|| std::env::var("IDLEGRID_EMAIL").ok())
        {
            identity.email = email;
            identity.save()?;
        } else {
            tracing::warn!("no account email configured; set --email or IDLEGRID_EMAIL");
        }
    }

    tracing::info!(
        version = %config.version,
        api = %config.api_base,
        device_id = %identity.device_id,
        "starting idlegrid agent"
    );

    let agent = Agent::new(config, identity, platform_probe())?;
    let shutdown = install_shutdown_handler();
    agent.run(shutdown).await?;
    Ok(())
}

async fn run_update(args: UpdateArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = AgentConfig::default();
    let manager = UpdateManager::new(&config.version, &config.update_feed_url)?;

    let Some(release) = manager.check_for_update().await? else {
        println!("You're running the latest version ({})", config.version);
        return Ok(());
    };

    println!(
        "New version available: {} (current: {})",
        release.tag, config.version
    );
    if !args.apply {
        println!("Run with --apply to install it");
        return Ok(());
    }

    println!("Applying update...");
    manager.apply_update(&release).await?;
    // Only reached on platforms that defer the swap to a helper process.
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    match args.command {
        Commands::Run(run_args) => run_agent(run_args).await?,
        Commands::Update(update_args) => run_update(update_args).await?,
    }

    Ok(())
}
