use std::fs::File;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::{error, info, warn};
use simplelog::{ConfigBuilder, WriteLogger};

use tickbar::core::config::{self, CliOverrides};
use tickbar::core::plugin::InputConstructor;
use tickbar::core::Core;
use tickbar::output::StdioChannel;

const LOG_FILE_ENV: &str = "TICKBAR_LOG_FILE";

#[derive(Parser)]
#[command(name = "tickbar", version, about = "Status line generator for i3bar, swaybar and friends")]
struct Args {
    /// Seconds between status lines
    #[arg(short = 'I', long)]
    interval: Option<u64>,

    /// Output plugin (flat, i3bar)
    #[arg(short, long)]
    output: Option<String>,

    /// Input plugin to load; repeat for several (pulseaudio, upower)
    #[arg(short, long = "input")]
    inputs: Vec<String>,

    /// Config file, instead of ~/.config/tickbar/config.toml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// off, error, warn, info, debug or trace
    #[arg(long)]
    log_level: Option<String>,
}

fn init_logging(level: simplelog::LevelFilter) {
    let log_config = ConfigBuilder::new().set_time_format_rfc3339().build();

    // stdout belongs to the status bar
    let result = match std::env::var_os(LOG_FILE_ENV) {
        Some(path) => match File::create(&path) {
            Ok(file) => WriteLogger::init(level, log_config, file),
            Err(e) => {
                eprintln!("tickbar: cannot open log file {}: {}", path.to_string_lossy(), e);
                WriteLogger::init(level, log_config, std::io::stderr())
            }
        },
        None => WriteLogger::init(level, log_config, std::io::stderr()),
    };
    if let Err(e) = result {
        eprintln!("tickbar: logger already initialised: {e}");
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => warn!("Cannot listen for SIGTERM: {}", e),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Cannot listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    let file_config = config::load_config(args.config.as_deref());
    let cli = CliOverrides {
        interval: args.interval,
        output: args.output,
        inputs: args.inputs,
        log_level: args.log_level,
    };
    let resolved = match &file_config {
        Ok(file_config) => config::resolve(file_config, &cli),
        Err(_) => config::resolve(&Default::default(), &cli),
    };

    init_logging(resolved.log_level);
    // Reported only now that the logger exists
    if let Err(e) = &file_config {
        warn!("Ignoring config file: {}", e);
    }
    info!("tickbar {} starting, output '{}'", env!("CARGO_PKG_VERSION"), resolved.output);

    let Some(output) = tickbar::output::lookup(&resolved.output) else {
        error!("Unknown output plugin '{}'", resolved.output);
        eprintln!("tickbar: unknown output plugin '{}'", resolved.output);
        return ExitCode::FAILURE;
    };

    let mut inputs: Vec<(String, InputConstructor)> = Vec::new();
    for name in &resolved.inputs {
        match tickbar::input::lookup(name) {
            Some(constructor) => inputs.push((name.clone(), constructor)),
            None => warn!("Unknown input plugin '{}', skipping", name),
        }
    }
    if inputs.is_empty() {
        warn!("No input plugins configured, the status line will stay empty");
    }

    let mut core = match Core::initialize(resolved, Box::new(StdioChannel::new()), output, inputs) {
        Ok(core) => core,
        Err(e) => {
            error!("Output plugin failed to initialise: {}", e);
            eprintln!("tickbar: {e}");
            return ExitCode::FAILURE;
        }
    };

    core.run(shutdown_signal()).await;
    info!("tickbar exiting");
    ExitCode::SUCCESS
}
