//! Console entry point for running nexxT pipelines from the command line.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use nexxt::config::{ConfigFileLoader, Configuration};
use nexxt::services::{ConsoleLogger, PlaybackControl, RecordingControl, ServiceRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "UPPER")]
enum Verbosity {
    Internal,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
    Critical,
}

impl Verbosity {
    fn filter_directive(self) -> &'static str {
        match self {
            Verbosity::Internal => "trace",
            Verbosity::Debug => "debug",
            Verbosity::Info => "info",
            Verbosity::Warn => "warn",
            Verbosity::Error | Verbosity::Fatal | Verbosity::Critical => "error",
        }
    }
}

/// nexxT console mode
#[derive(Parser, Debug)]
#[command(name = "nexxt", version, about)]
struct Args {
    /// Path to the configuration file (.json)
    cfg: Option<PathBuf>,

    /// Application to activate after loading the configuration
    #[arg(long)]
    active: Option<String>,

    /// Log sink; a .db suffix selects a SQLite sink
    #[arg(long)]
    logfile: Option<PathBuf>,

    /// Log verbosity
    #[arg(long, value_enum, default_value_t = Verbosity::Info)]
    verbosity: Verbosity,

    /// Disable the stderr log
    #[arg(long)]
    quiet: bool,

    /// Script code executed after loading (rhai)
    #[arg(long = "execcode")]
    exec_code: Vec<String>,

    /// Script files executed after loading (rhai)
    #[arg(long = "execscript")]
    exec_script: Vec<PathBuf>,

    /// Force thread = "main" for all filters
    #[arg(long = "single-threaded")]
    single_threaded: bool,

    /// Disable the script-module unload heuristic (no-op in this build)
    #[arg(long = "disable-unload-heuristic")]
    disable_unload_heuristic: bool,

    /// Disable the profiling service
    #[arg(long = "no-profiling")]
    no_profiling: bool,

    /// Discard non-selected applications from the loaded configuration
    #[arg(long = "save-memory")]
    save_memory: bool,

    /// GUI vs console mode (only console is available in this build)
    #[arg(long)]
    gui: Option<bool>,
}

/// Log layer writing events into a SQLite database.
struct SqliteLogLayer {
    conn: Mutex<rusqlite::Connection>,
}

impl SqliteLogLayer {
    fn new(path: &Path) -> anyhow::Result<Self> {
        let conn = rusqlite::Connection::open(path)
            .with_context(|| format!("cannot open log database {}", path.display()))?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ts TEXT NOT NULL,
                level TEXT NOT NULL,
                target TEXT NOT NULL,
                message TEXT NOT NULL
            )",
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        }
    }
}

impl<S: tracing::Subscriber> Layer<S> for SqliteLogLayer {
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let meta = event.metadata();
        let _ = self.conn.lock().unwrap().execute(
            "INSERT INTO logs (ts, level, target, message) VALUES (datetime('now'), ?1, ?2, ?3)",
            rusqlite::params![meta.level().as_str(), meta.target(), visitor.message],
        );
    }
}

fn setup_logging(args: &Args) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.verbosity.filter_directive()));
    let stderr_layer = if args.quiet {
        None
    } else {
        Some(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
    };
    let mut guard = None;
    let (file_layer, sqlite_layer) = match &args.logfile {
        Some(path) if path.extension().map(|e| e == "db").unwrap_or(false) => {
            (None, Some(SqliteLogLayer::new(path)?))
        }
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("cannot open logfile {}", path.display()))?;
            let (writer, g) = tracing_appender::non_blocking(file);
            guard = Some(g);
            (
                Some(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer)),
                None,
            )
        }
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .with(sqlite_layer)
        .init();
    Ok(guard)
}

fn setup_console_services() {
    let registry = ServiceRegistry::default();
    registry.add_service("Logging", Arc::new(ConsoleLogger));
    registry.add_service("PlaybackControl", Arc::new(PlaybackControl::new()));
    registry.add_service("RecordingControl", Arc::new(RecordingControl::new()));
}

fn exec_scripts(args: &Args) -> anyhow::Result<()> {
    if args.exec_code.is_empty() && args.exec_script.is_empty() {
        return Ok(());
    }
    let mut engine = rhai::Engine::new();
    engine.register_fn("sleep", |seconds: f64| {
        std::thread::sleep(Duration::from_secs_f64(seconds));
    });
    for code in &args.exec_code {
        tracing::info!("Executing code '{}'", code);
        engine
            .eval::<rhai::Dynamic>(code)
            .map_err(|e| anyhow::anyhow!("script error: {}", e))?;
    }
    for script in &args.exec_script {
        tracing::info!("Executing script '{}'", script.display());
        let code = std::fs::read_to_string(script)
            .with_context(|| format!("cannot read {}", script.display()))?;
        engine
            .eval::<rhai::Dynamic>(&code)
            .map_err(|e| anyhow::anyhow!("script error: {}", e))?;
    }
    Ok(())
}

fn run(args: &Args) -> anyhow::Result<()> {
    if args.gui == Some(true) {
        bail!("GUI services are not available in this build; use --gui false");
    }
    if args.disable_unload_heuristic {
        tracing::debug!("--disable-unload-heuristic has no effect in this build");
    }
    if args.no_profiling {
        tracing::debug!("profiling service disabled");
    }
    nexxt::filters::register_builtin();
    setup_console_services();
    let mut config = Configuration::new();
    config.set_single_threaded(args.single_threaded);
    if let Some(cfg) = &args.cfg {
        let focus = if args.save_memory {
            args.active.as_deref()
        } else {
            None
        };
        ConfigFileLoader::load_with_focus(&mut config, cfg, focus)
            .with_context(|| format!("failed to load {}", cfg.display()))?;
        tracing::info!("loaded configuration {}", cfg.display());
    }
    exec_scripts(args)?;
    if let Some(active) = &args.active {
        config.activate(active)?;
        {
            let app = config
                .active_application()
                .expect("activation just succeeded");
            app.init()?;
            app.open()?;
            app.start()?;
        }
        tracing::info!("application {} is active", active);

        let stop = Arc::new(AtomicBool::new(false));
        let stop2 = Arc::clone(&stop);
        ctrlc::set_handler(move || {
            stop2.store(true, Ordering::SeqCst);
        })
        .context("failed to install signal handler")?;
        while !stop.load(Ordering::SeqCst) {
            match config.active_application() {
                Some(app) => app.process_events(Duration::from_millis(100)),
                None => break,
            }
        }
        tracing::info!("shutting down");
        config.deactivate();
    }
    config.close();
    ServiceRegistry::default().remove_all();
    Ok(())
}

fn main() -> std::process::ExitCode {
    let args = Args::parse();
    let _log_guard = match setup_logging(&args) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("error: {:#}", e);
            return std::process::ExitCode::FAILURE;
        }
    };
    match run(&args) {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            std::process::ExitCode::FAILURE
        }
    }
}
