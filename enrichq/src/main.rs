use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use enrichq::cli::{Args, Cli, Commands, ResumeMode};
use enrichq::config::{self, AppConfig};
use enrichq::coordinator::{Coordinator, ShutdownGuard};
use enrichq::credentials::{
    AccountFile, CommandProvisioner, CredentialCache, CredentialPool, DisabledProvisioner, Provisioner,
};
use enrichq::dispatch::DispatchEngine;
use enrichq::identifiers::read_identifier_file;
use enrichq::logger::{ConsoleLogger, RunLogger, VerbosityLevel};
use enrichq::lookup::HttpLookupClient;
use enrichq::rate_limit::SharedRateLimiter;
use enrichq::result_sink::ResultSink;
use enrichq::stats::RunOutcome;
use enrichq::store::WorkQueue;

/// 128 + SIGINT
const EXIT_INTERRUPTED: i32 = 130;
const EXIT_CREDENTIALS_EXHAUSTED: i32 = 3;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let args = Args::from(&cli);

    // Handle init before touching any other configuration
    if args.init || matches!(args.command, Commands::Init { .. }) {
        let force = matches!(args.command, Commands::Init { force: true });
        std::process::exit(init_config(&args.config, force));
    }

    if let Err(e) = args.validate() {
        eprintln!("❌ Invalid arguments: {}", e);
        std::process::exit(1);
    }

    let mut app_config = match AppConfig::load_from_path(&args.config) {
        Ok(cfg) => cfg,
        Err(config::ConfigError::FileNotFound(path)) => match AppConfig::prompt_create_config(&args.config) {
            Ok(Some(created_path)) => {
                println!("✅ Created default configuration file at: {}", created_path.display());
                println!("   Edit this file to point at your lookup API, then run enrichq again.");
                std::process::exit(0);
            }
            Ok(None) => {
                eprintln!("❌ Configuration file not found at: {}", path.display());
                eprintln!("   Run with --init to create a default configuration file.");
                std::process::exit(1);
            }
            Err(e) => {
                eprintln!("❌ Failed to create configuration file: {}", e);
                std::process::exit(1);
            }
        },
        Err(e) => {
            eprintln!("❌ Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = app_config.apply_overrides(&args.overrides()) {
        eprintln!("❌ Configuration error: {}", e);
        std::process::exit(1);
    }

    let verbosity = VerbosityLevel::from_verbose_count(args.verbose);
    init_tracing(verbosity);

    let logger = Arc::new(match &args.log_file {
        Some(log_file_path) => ConsoleLogger::with_log_file(verbosity, log_file_path.clone()),
        None => ConsoleLogger::new(verbosity),
    });

    let result = match &args.command {
        Commands::Stats { json } => print_stats(&app_config, *json).map(|_| 0),
        Commands::Export { output } => export_pending(&app_config, output).map(|_| 0),
        Commands::Run => run(&args, &app_config, logger.clone()).await,
        Commands::Init { .. } => Ok(0),
    };

    logger.finish_progress();
    if logger.is_log_export_enabled() {
        match logger.export_logs() {
            Ok(()) => eprintln!("📝 Exported {} log lines", logger.get_log_count()),
            Err(e) => eprintln!("⚠️  Failed to export logs: {}", e),
        }
    }

    match result {
        Ok(0) => Ok(()),
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("❌ {:#}", e);
            std::process::exit(1);
        }
    }
}

/// `RUST_LOG` wins; otherwise follow the -v count
fn init_tracing(verbosity: VerbosityLevel) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("enrichq={}", verbosity.tracing_directive())));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn init_config(path: &Path, force: bool) -> i32 {
    if path.exists() && !force {
        eprintln!("❌ Configuration file already exists at: {}", path.display());
        eprintln!("   Use `enrichq init --force` to overwrite it.");
        return 1;
    }

    match AppConfig::create_default_config_at(path) {
        Ok(path) => {
            println!("✅ Created default configuration file at: {}", path.display());
            println!("   Edit this file to point at your lookup API, then run enrichq again.");
            0
        }
        Err(e) => {
            eprintln!("❌ Failed to create configuration file: {}", e);
            1
        }
    }
}

fn print_stats(app_config: &AppConfig, json: bool) -> Result<()> {
    let store = WorkQueue::new(&app_config.paths.database);
    let stats = store.stats().context("Failed to read queue statistics")?;
    store.close()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        for (label, count) in stats.as_map() {
            println!("{:>10}: {}", label, count);
        }
    }
    Ok(())
}

fn export_pending(app_config: &AppConfig, output: &Path) -> Result<()> {
    let store = WorkQueue::new(&app_config.paths.database);
    let count = store
        .export_pending(output)
        .with_context(|| format!("Failed to export pending identifiers to {}", output.display()))?;
    store.close()?;
    println!("✅ Exported {} pending identifiers to {}", count, output.display());
    Ok(())
}

/// Prepare the queue from --input according to the resume mode.
///
/// The input is read before the queue is touched, so an unreadable file
/// leaves prior progress in place.
fn import_identifiers(args: &Args, store: &WorkQueue, logger: &dyn RunLogger) -> Result<()> {
    let Some(input) = &args.input else {
        return Ok(());
    };

    let report = read_identifier_file(input)?;
    let pending = if args.resume_mode() == ResumeMode::Fresh {
        let (dropped, pending) = store.replace(&report.identifiers)?;
        if dropped > 0 {
            logger.info(&format!("Fresh run: dropped {} identifiers from the previous queue", dropped));
        }
        pending
    } else {
        store.load(&report.identifiers)?
    };

    logger.info(&format!(
        "Read {} identifiers from {} ({} invalid, {} duplicate lines); {} pending",
        report.identifiers.len(),
        input.display(),
        report.invalid,
        report.duplicates,
        pending
    ));
    Ok(())
}

async fn run(args: &Args, app_config: &AppConfig, console: Arc<ConsoleLogger>) -> Result<i32> {
    let logger: Arc<dyn RunLogger> = console.clone();

    let store = Arc::new(WorkQueue::new(&app_config.paths.database));
    import_identifiers(args, &store, logger.as_ref())?;

    let stats = store.stats()?;
    logger.info(&format!("Queue: {}", stats));

    let api = Arc::new(HttpLookupClient::new(
        app_config.http.lookup_url.clone(),
        app_config.http.probe_url.clone(),
        app_config.http.user_agent.clone(),
        app_config.request_timeout(),
    )?);

    let provisioner: Arc<dyn Provisioner> = if app_config.provisioner.command.trim().is_empty() {
        logger.info("No provisioner command configured; using cached credentials only");
        Arc::new(DisabledProvisioner)
    } else {
        Arc::new(CommandProvisioner::new(
            app_config.provisioner.command.trim(),
            app_config.provisioner.args.clone(),
            Duration::from_secs(app_config.provisioner.timeout_secs),
        ))
    };

    let cancel = CancellationToken::new();

    let pool = Arc::new(CredentialPool::new(
        api.clone(),
        provisioner,
        AccountFile::new(&app_config.paths.accounts),
        Some(CredentialCache::new(&app_config.paths.credential_cache)),
        app_config.pool_config(),
        logger.clone(),
        cancel.clone(),
    ));

    let sink = Arc::new(ResultSink::open(&app_config.paths.result_sink)?);
    let engine = Arc::new(
        DispatchEngine::new(
            store.clone(),
            api,
            Arc::new(app_config.decoder()),
            logger.clone(),
            app_config.dispatch_config(),
        )
        .with_result_sink(sink)
        .with_rate_limiter(SharedRateLimiter::new(app_config.dispatch.requests_per_second)),
    );

    let guard = Arc::new(ShutdownGuard::new(
        store.clone(),
        logger.clone(),
        &app_config.paths.handoff,
        app_config.paths.summary_path(),
    ));

    install_interrupt_handler(cancel.clone(), guard.clone(), console);

    let coordinator = Coordinator::new(
        store,
        pool,
        engine,
        logger,
        guard,
        app_config.coordinator_config(),
        cancel,
    );

    let code = match coordinator.run().await? {
        RunOutcome::Completed | RunOutcome::Stalled => 0,
        RunOutcome::CredentialsExhausted => EXIT_CREDENTIALS_EXHAUSTED,
        RunOutcome::Cancelled => EXIT_INTERRUPTED,
        RunOutcome::Aborted => 1,
    };
    Ok(code)
}

/// First Ctrl-C cancels the run so it can drain and export; a second one
/// exports immediately and exits.
fn install_interrupt_handler(cancel: CancellationToken, guard: Arc<ShutdownGuard>, logger: Arc<ConsoleLogger>) {
    let presses = AtomicUsize::new(0);

    ctrlc::set_handler(move || {
        if presses.fetch_add(1, Ordering::SeqCst) == 0 {
            eprintln!("\n⚠️  Interrupt received. Finishing in-flight lookups and exporting pending work...");
            eprintln!("   Press Ctrl-C again to exit immediately.");
            cancel.cancel();
            return;
        }

        eprintln!("\n⚠️  Second interrupt. Exporting pending work and exiting.");
        if let Err(e) = guard.shutdown() {
            eprintln!("❌ Shutdown incomplete: {:#}", e);
        }
        logger.finish_progress();
        let _ = logger.export_logs();
        std::process::exit(EXIT_INTERRUPTED);
    })
    .unwrap_or_else(|e| {
        eprintln!("⚠️  Warning: Failed to set Ctrl-C handler: {}. Interrupt signals may not be handled gracefully.", e);
    });
}
