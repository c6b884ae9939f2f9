use anyhow::{Context, Result};
use clap::Parser;
use detstream::config::{CameraConfig, LoggingConfig, ModelConfig};
use detstream::fault::exit_code_for;
use detstream::{Backends, PipelineConfig, PipelineOrchestrator};
use tracing::{error, info, Instrument};
use tracing_appender::non_blocking::WorkerGuard;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "detstream")]
#[command(about = "Multi-camera object detection pipeline with ordered restreaming")]
#[command(version)]
#[command(long_about = "Samples frames from RTSP cameras or video files at a fixed rate, fans \
them out to one detector process per model and restreams annotated frames in capture order. \
Exits with a category-specific code on the first fatal fault so a process supervisor can restart it.")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "detstream.toml", help = "Path to TOML configuration file")]
    config: String,

    /// Enable debug logging (most verbose)
    #[arg(short, long, help = "Enable debug level logging")]
    debug: bool,

    /// Enable verbose logging (info level)
    #[arg(short, long, help = "Enable verbose info level logging")]
    verbose: bool,

    /// Enable quiet mode (errors only)
    #[arg(short, long, help = "Enable quiet mode - only log errors")]
    quiet: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration file and exit without starting the pipeline")]
    validate_config: bool,

    /// Print an example configuration and exit
    #[arg(long, help = "Print an example configuration in TOML format and exit")]
    print_config: bool,

    /// Build the pipeline but do not start it
    #[arg(long, help = "Open sources and build all queues, then exit without starting")]
    dry_run: bool,

    /// Override log format (json, pretty, compact)
    #[arg(long, value_name = "FORMAT", help = "Log output format: json, pretty, or compact")]
    log_format: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_config {
        print_example_config()?;
        return Ok(());
    }

    let config = match PipelineConfig::load_from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration from {}: {}", args.config, e);
            std::process::exit(2);
        }
    };

    let guard = init_logging(&args, &config.logging)?;

    let span = tracing::info_span!("run", run_id = %Uuid::new_v4());
    let exit_code = run_pipeline(args, config).instrument(span).await?;

    // Flush the file writer; process::exit skips destructors
    drop(guard);
    std::process::exit(exit_code);
}

async fn run_pipeline(args: Args, config: PipelineConfig) -> Result<i32> {
    info!("Starting detstream v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {}", args.config);
    info!("Effective configuration: {}", config.redacted_json());

    if args.validate_config {
        return Ok(match config.validate() {
            Ok(()) => {
                info!("Configuration validation successful");
                println!("✓ Configuration is valid");
                0
            }
            Err(e) => {
                error!("Configuration validation failed: {}", e);
                eprintln!("✗ Configuration validation failed: {}", e);
                exit_code_for(e.category())
            }
        });
    }

    let backends = match Backends::ffmpeg(&config) {
        Ok(backends) => backends,
        Err(e) => {
            error!("Failed to prepare backends: {}", e);
            return Ok(exit_code_for(e.category()));
        }
    };

    // Probing sources spawns and waits on child processes
    let built = tokio::task::spawn_blocking(move || PipelineOrchestrator::new(config, backends))
        .await
        .context("pipeline construction panicked")?;
    let mut orchestrator = match built {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            error!("Failed to build pipeline: {}", e);
            return Ok(exit_code_for(e.category()));
        }
    };

    if let Err(e) = orchestrator.initialize().await {
        error!("Failed to initialize pipeline: {}", e);
        return Ok(exit_code_for(e.category()));
    }

    if args.dry_run {
        info!("Dry run mode - pipeline built but not started");
        println!("✓ Dry run completed successfully - all sources opened and queues built");
        return Ok(0);
    }

    if let Err(e) = orchestrator.start().await {
        error!("Failed to start pipeline: {}", e);
        orchestrator.shutdown().await?;
        return Ok(exit_code_for(e.category()));
    }

    let exit_code = match orchestrator.run().await {
        Ok(code) => code,
        Err(e) => {
            error!("Supervisor error: {}", e);
            exit_code_for(e.category())
        }
    };

    info!("detstream exited with code: {}", exit_code);
    Ok(exit_code)
}

fn init_logging(args: &Args, logging: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

    // Determine log level based on flags
    let log_level = if args.debug {
        "debug"
    } else if args.verbose {
        "info"
    } else if args.quiet {
        "error"
    } else {
        "warn"
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("detstream={}", log_level)));

    let console_layer = match args.log_format.as_deref() {
        Some("json") => fmt::layer()
            .json()
            .with_target(true)
            .with_thread_names(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
        Some("compact") => fmt::layer()
            .compact()
            .with_target(false)
            .with_thread_names(true)
            .boxed(),
        Some("pretty") | None => fmt::layer()
            .pretty()
            .with_target(true)
            .with_thread_names(true)
            .with_file(args.debug)
            .with_line_number(args.debug)
            .boxed(),
        Some(format) => {
            eprintln!("Warning: Unknown log format '{}', using default", format);
            fmt::layer()
                .with_target(true)
                .with_thread_names(true)
                .with_file(args.debug)
                .with_line_number(args.debug)
                .boxed()
        }
    };

    let mut layers = vec![console_layer];
    let mut guard = None;

    if let Some(directory) = logging.directory.as_deref() {
        let appender = tracing_appender::rolling::Builder::new()
            .rotation(tracing_appender::rolling::Rotation::DAILY)
            .filename_prefix(&logging.file_prefix)
            .filename_suffix("log")
            .max_log_files(30)
            .build(directory)
            .with_context(|| format!("failed to open log directory {}", directory))?;
        let (writer, worker_guard) = tracing_appender::non_blocking(appender);
        layers.push(
            fmt::layer()
                .with_ansi(false)
                .with_thread_names(true)
                .with_writer(writer)
                .boxed(),
        );
        guard = Some(worker_guard);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(env_filter)
        .init();

    Ok(guard)
}

/// Print an example configuration with one camera and one model
fn print_example_config() -> Result<()> {
    let mut config = PipelineConfig::default();
    config.models.insert(
        "person".to_string(),
        ModelConfig {
            device: Some("0".to_string()),
            weights: Some("weights/person.pt".to_string()),
            command: vec!["python3".to_string(), "detect_server.py".to_string()],
            ..Default::default()
        },
    );
    config.cameras.insert(
        "gate".to_string(),
        CameraConfig {
            host: Some("192.168.1.64".to_string()),
            user: Some("admin".to_string()),
            password: Some("changeme".to_string()),
            port: 554,
            path: "/Streaming/Channels/101".to_string(),
            models: vec!["person".to_string()],
            sink: Some("rtsp://127.0.0.1:8554/gate".to_string()),
            ..Default::default()
        },
    );

    let rendered = toml::to_string_pretty(&config).context("failed to render example config")?;
    println!("# detstream configuration file");
    println!("# Example with one camera restreaming one model");
    println!();
    println!("{}", rendered);
    Ok(())
}
