//! pinboard - Raspberry Pi GPIO control panel binary.

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use pinboard::pins::HEADER;
use pinboard::{
    acquire_backend, peripheral_switch, start_web_server, ComponentFactory, LocalTime, Panel,
    PanelLayout, PanelSettings, PeripheralMode, PinRegistry, PinSnapshot, WebConfig, DEFAULT_FLASH_PERIOD_MS,
    DEFAULT_LAYOUT_FILE, DEFAULT_POLL_INTERVAL_SECS, DEFAULT_SNAPSHOT_INTERVAL_MS,
    DEFAULT_WEB_PORT,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "pinboard")]
#[command(about = "Raspberry Pi GPIO control panel")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(long_about = "A web control panel for the Raspberry Pi 40-pin GPIO header")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Web server bind address
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Web server port
    #[arg(short, long, default_value_t = DEFAULT_WEB_PORT)]
    port: u16,

    /// Layout file loaded at startup and used by the save/load endpoints
    #[arg(short, long)]
    layout: Option<PathBuf>,

    /// JSON file with extra component type definitions
    #[arg(long)]
    components: Option<PathBuf>,

    /// Use simulated GPIO lines instead of the real header
    #[arg(long)]
    simulate: bool,

    /// Leave output levels as they are on exit instead of driving them LOW
    #[arg(long)]
    keep_pins: bool,

    /// Default component polling interval in seconds
    #[arg(long, default_value_t = DEFAULT_POLL_INTERVAL_SECS, value_parser = clap::value_parser!(u64).range(1..))]
    poll_interval: u64,

    /// Default flash period in milliseconds
    #[arg(long, default_value_t = DEFAULT_FLASH_PERIOD_MS, value_parser = clap::value_parser!(u64).range(10..))]
    flash_period: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the web server (default)
    Serve(ServeArgs),

    /// Print the pin states (after applying --layout) and exit
    Snapshot(SnapshotArgs),

    /// Show the header table and build information
    Info,
}

#[derive(Args)]
struct ServeArgs {
    /// Directory with a custom index.html and assets
    #[arg(long)]
    static_dir: Option<String>,

    /// Disable CORS headers
    #[arg(long)]
    no_cors: bool,

    /// Maximum WebSocket connections
    #[arg(long, default_value_t = 32)]
    max_connections: usize,

    /// WebSocket snapshot interval in milliseconds
    #[arg(long, default_value_t = DEFAULT_SNAPSHOT_INTERVAL_MS)]
    snapshot_interval: u64,
}

impl Default for ServeArgs {
    fn default() -> Self {
        Self {
            static_dir: None,
            no_cors: false,
            max_connections: 32,
            snapshot_interval: DEFAULT_SNAPSHOT_INTERVAL_MS,
        }
    }
}

#[derive(Args)]
struct SnapshotArgs {
    /// Output format: json or pretty
    #[arg(short, long, default_value = "pretty")]
    format: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(&cli)?;

    match &cli.command {
        Some(Commands::Serve(args)) => serve_command(&cli, args).await,
        Some(Commands::Snapshot(args)) => snapshot_command(&cli, args).await,
        Some(Commands::Info) => {
            info_command(&cli);
            Ok(())
        }
        None => serve_command(&cli, &ServeArgs::default()).await,
    }
}

fn init_logging(cli: &Cli) -> anyhow::Result<()> {
    let level = if cli.debug {
        "debug"
    } else if cli.verbose {
        "info"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to install the log subscriber")?;
    Ok(())
}

fn print_banner() {
    println!("pinboard - Raspberry Pi GPIO control panel");
    println!("   Version: {}", env!("CARGO_PKG_VERSION"));
    println!();
}

fn build_panel(cli: &Cli) -> anyhow::Result<Arc<Panel>> {
    let hardware = acquire_backend(cli.simulate).context("failed to acquire GPIO hardware")?;
    let registry = PinRegistry::new(hardware, peripheral_switch(cli.simulate));
    info!("Using {} GPIO backend", registry.backend_name());

    let settings = PanelSettings::new()
        .with_default_flash_period(Duration::from_millis(cli.flash_period))
        .with_poll_interval(Duration::from_secs(cli.poll_interval))
        .with_reset_on_shutdown(!cli.keep_pins);

    let mut factory = ComponentFactory::with_builtins();
    if let Some(path) = &cli.components {
        factory
            .load_definitions(path)
            .with_context(|| format!("failed to load component definitions {}", path.display()))?;
    }
    Ok(Arc::new(Panel::from_parts(
        registry,
        settings,
        factory,
        Arc::new(LocalTime),
    )))
}

/// Load `--layout` into the panel if the file exists.
async fn apply_startup_layout(cli: &Cli, panel: &Panel) -> anyhow::Result<()> {
    let Some(path) = &cli.layout else {
        return Ok(());
    };
    if !path.exists() {
        info!("Layout file {} not found, starting empty", path.display());
        return Ok(());
    }

    let layout = PanelLayout::load(path)
        .await
        .with_context(|| format!("failed to read layout {}", path.display()))?;
    let report = panel.apply_layout(&layout).await;
    if !report.is_clean() {
        warn!("{} layout entries could not be applied", report.errors.len());
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received");
}

async fn serve_command(cli: &Cli, args: &ServeArgs) -> anyhow::Result<()> {
    print_banner();
    info!("Starting pinboard...");

    let panel = build_panel(cli)?;
    if let Err(e) = apply_startup_layout(cli, &panel).await {
        panel.shutdown().await;
        return Err(e);
    }

    let mut web_config = WebConfig::new(&cli.host, cli.port)
        .with_cors(!args.no_cors)
        .with_max_websocket_connections(args.max_connections)
        .with_snapshot_interval_ms(args.snapshot_interval)
        .with_layout_path(cli.layout.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_LAYOUT_FILE)));
    if let Some(static_dir) = &args.static_dir {
        web_config = web_config.with_static_path(Some(static_dir.clone()));
        info!("Using static files from: {}", static_dir);
    }

    info!("Web server configuration:");
    info!("  - Bind address: {}", web_config.bind_address());
    info!("  - CORS enabled: {}", web_config.enable_cors);
    info!("  - Max WebSocket connections: {}", web_config.max_websocket_connections);
    info!("  - Layout file: {}", web_config.layout_path.display());

    let served = start_web_server(web_config, Arc::clone(&panel), shutdown_signal()).await;

    // Lines are released whether the server stopped cleanly or not.
    panel.shutdown().await;
    served.context("web server failed")
}

async fn snapshot_command(cli: &Cli, args: &SnapshotArgs) -> anyhow::Result<()> {
    let panel = build_panel(cli)?;
    let applied = apply_startup_layout(cli, &panel).await;
    let snapshot = panel.sample();
    let components = panel.components().await;
    panel.shutdown().await;
    applied?;

    match args.format.as_str() {
        "json" => {
            let body = serde_json::json!({
                "timestamp": snapshot.timestamp,
                "pins": snapshot.pins,
                "components": components,
            });
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
        "pretty" => print_pretty_snapshot(&snapshot),
        other => anyhow::bail!("Unsupported format: {}. Use 'json' or 'pretty'", other),
    }
    Ok(())
}

fn info_command(cli: &Cli) {
    print_banner();

    println!("Header pins:");
    for pin in HEADER.iter() {
        let alternate = pin
            .alternate
            .map(|m| m.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:>2}  BCM {:>2}  {:<16} {}",
            pin.physical, pin.bcm, pin.label, alternate
        );
    }
    println!();

    println!("Configuration:");
    println!("  Default port: {}", cli.port);
    println!("  Default flash period: {}ms", cli.flash_period);
    println!("  Default polling interval: {}s", cli.poll_interval);
    println!();

    println!("Features compiled:");
    #[cfg(feature = "gpio")]
    println!("  - GPIO support: ✓");
    #[cfg(not(feature = "gpio"))]
    println!("  - GPIO support: ✗ (simulated lines only)");
}

fn print_pretty_snapshot(snapshot: &PinSnapshot) {
    println!(
        "Pin snapshot ({})",
        chrono::DateTime::from_timestamp_millis(snapshot.timestamp)
            .unwrap_or_default()
            .format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!("==========================================");
    for record in snapshot.pins.values() {
        let function = if record.peripheral_mode == PeripheralMode::Gpio {
            format!("{} {}", record.mode, if record.state { "HIGH" } else { "LOW" })
        } else {
            record.peripheral_mode.to_string()
        };
        let owner = record
            .owner
            .as_ref()
            .map(|o| format!(" [{}]", o))
            .unwrap_or_default();
        println!(
            "  {:>2}  {:<16} {}{}",
            record.pin.physical(),
            record.label,
            function,
            owner
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["pinboard", "--simulate"]).unwrap();
        assert_eq!(cli.port, DEFAULT_WEB_PORT);
        assert_eq!(cli.poll_interval, DEFAULT_POLL_INTERVAL_SECS);
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_rejects_zero_intervals() {
        assert!(Cli::try_parse_from(["pinboard", "--poll-interval", "0"]).is_err());
        assert!(Cli::try_parse_from(["pinboard", "--flash-period", "5"]).is_err());

        let cli = Cli::try_parse_from(["pinboard", "--poll-interval", "1", "snapshot"]).unwrap();
        assert_eq!(cli.poll_interval, 1);
        assert!(matches!(cli.command, Some(Commands::Snapshot(_))));
    }
}
