mod cli;
mod error_fmt;
mod run;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

use crate::cli::{Cli, Commands, FILE_GUARD, JSON_MODE};
use crate::error_fmt::{exit_code_for_error, format_error_json, humanize};

fn main() {
    std::process::exit(real_main());
}

fn real_main() -> i32 {
    let args = Cli::parse();
    let _ = JSON_MODE.set(args.json);
    let _ = color_eyre::install();

    // File logging comes from the config when it loads; console logging must
    // work even when it doesn't.
    let logging = run::load_config(&args.config)
        .map(|c| c.logging)
        .unwrap_or_default();
    init_tracing(&args, &logging);

    // Ctrl-c raises the shared interrupt flag; every control-loop task
    // observes it and the shutdown sequence still runs.
    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let flag = shutdown.clone();
        let result = ctrlc::set_handler(move || {
            flag.store(true, Ordering::Relaxed);
        });
        if let Err(e) = result {
            tracing::warn!(error = %e, "could not install ctrl-c handler");
        }
    }

    let result = match args.cmd {
        Commands::Run {
            targets,
            gap_mm,
            volume_ml,
            sample,
            step_duration_s,
            max_force,
            data_dir,
            auto_tare,
            simulate,
        } => run::run_test(
            &args.config,
            &args.cell,
            run::RunOverrides {
                targets,
                gap_mm,
                volume_ml,
                sample,
                step_duration_s,
                max_force,
                data_dir,
            },
            auto_tare,
            simulate,
            args.json,
            shutdown,
        ),
        Commands::Tare { samples, simulate } => run::tare(&args.cell, samples, simulate),
        Commands::Calibrate { csv } => run::calibrate(&args.cell, &csv),
        Commands::SelfCheck => run::self_check(args.json),
    };

    match result {
        Ok(()) => 0,
        Err(err) => {
            if args.json {
                eprintln!("{}", format_error_json(&err));
            } else {
                eprintln!("{}", humanize(&err));
            }
            exit_code_for_error(&err)
        }
    }
}

fn make_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

fn init_tracing(args: &Cli, logging: &rheo_config::Logging) {
    let level = logging.level.as_deref().unwrap_or(&args.log_level);
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync + 'static>> = Vec::new();

    if args.json {
        layers.push(
            fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_filter(make_filter(level))
                .boxed(),
        );
    } else {
        layers.push(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(make_filter(level))
                .boxed(),
        );
    }

    if let Some(file) = &logging.file {
        let path = std::path::Path::new(file);
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
        let name = path.file_name().map_or_else(
            || std::ffi::OsString::from("rheo.log"),
            std::ffi::OsStr::to_os_string,
        );
        let dir = dir.unwrap_or_else(|| std::path::Path::new("."));
        let appender = match logging.rotation.as_deref() {
            Some("daily") => tracing_appender::rolling::daily(dir, name),
            Some("hourly") => tracing_appender::rolling::hourly(dir, name),
            _ => tracing_appender::rolling::never(dir, name),
        };
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);
        let _ = FILE_GUARD.set(guard);
        layers.push(
            fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(non_blocking)
                .with_filter(make_filter(level))
                .boxed(),
        );
    }

    tracing_subscriber::registry().with(layers).init();
}
