use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{error, info};

use fluux_bosh::{BoshConfig, BoshError, Delivery, Session, SessionListener};

/// Prints delivered elements to stdout and reports the end of the session.
struct ConsoleListener {
    ended: watch::Sender<Option<bool>>,
}

impl SessionListener for ConsoleListener {
    fn stream_opened(&self, domain: &str) {
        eprintln!("Session open to {}", domain);
    }

    fn deliver(&self, element: &str) -> Delivery {
        println!("{}", element);
        // SASL success requires a fresh stream
        if element.starts_with("<success") {
            Delivery::RestartStream
        } else {
            Delivery::Continue
        }
    }

    fn session_failed(&self, error: &BoshError) {
        eprintln!("Session failed: {}", error);
        if let Some(uri) = error.redirect_uri() {
            eprintln!("  Connection manager redirects to {}", uri);
        }
        let _ = self.ended.send(Some(false));
    }

    fn session_terminated(&self) {
        eprintln!("Session terminated by the connection manager");
        let _ = self.ended.send(Some(true));
    }
}

fn print_help() {
    eprintln!("Fluux BOSH v{} ({})", env!("CARGO_PKG_VERSION"), env!("GIT_HASH"));
    eprintln!();
    eprintln!("Usage: fluux-bosh [OPTIONS] <DOMAIN|URL>");
    eprintln!();
    eprintln!("Each line read from stdin is sent as one XML element; received");
    eprintln!("elements are printed to stdout, one per line.");
    eprintln!();
    eprintln!("Options:");
    eprintln!("      --host=HOST       Connection manager host, host:port or URL");
    eprintln!("      --port=PORT       Connection manager port");
    eprintln!("      --secure          Use https for --host without scheme");
    eprintln!("      --path=PATH       Request path (default: /bosh)");
    eprintln!("      --wait=SECS       Longest time the server may hold a request");
    eprintln!("      --route=ROUTE     proto:host:port for multi-tenant connection managers");
    eprintln!("      --key-sequence    Enable key sequencing");
    eprintln!("      --config=PATH     Load settings from a JSON file (flags override it)");
    eprintln!("  -v, --verbose         Enable verbose logging to stderr (no BOSH traffic)");
    eprintln!("      --verbose=wire    Enable verbose logging including BOSH bodies");
    eprintln!("      --log-file=PATH   Override log file directory (default: platform log dir)");
    eprintln!("      --dangerous-insecure-tls");
    eprintln!("                        Disable TLS certificate verification (INSECURE!)");
    eprintln!("  -h, --help            Show this help message");
    eprintln!();
    eprintln!("Environment variables:");
    eprintln!("  RUST_LOG              Override log filter (e.g. RUST_LOG=debug)");
}

fn flag_value<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    let prefix = format!("--{}=", name);
    args.iter().find_map(|arg| arg.strip_prefix(prefix.as_str()))
}

/// Build the session configuration: config file first, flags on top.
fn build_config(args: &[String]) -> Result<BoshConfig, String> {
    let mut config = match flag_value(args, "config") {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .map_err(|e| format!("could not read config file '{}': {}", path, e))?;
            serde_json::from_str::<BoshConfig>(&text)
                .map_err(|e| format!("invalid config file '{}': {}", path, e))?
        }
        None => BoshConfig::default(),
    };

    if let Some(target) = args.iter().skip(1).find(|arg| !arg.starts_with('-')) {
        if target.contains("://") {
            config.host = Some(target.clone());
        } else {
            config.domain = Some(target.clone());
        }
    }
    if let Some(host) = flag_value(args, "host") {
        config.host = Some(host.to_string());
    }
    if let Some(port) = flag_value(args, "port") {
        config.port = Some(port.parse().map_err(|_| format!("invalid --port '{}'", port))?);
    }
    if let Some(path) = flag_value(args, "path") {
        config.path = path.to_string();
    }
    if let Some(wait) = flag_value(args, "wait") {
        config.wait = wait.parse().map_err(|_| format!("invalid --wait '{}'", wait))?;
    }
    if let Some(route) = flag_value(args, "route") {
        config.route = Some(route.to_string());
    }
    if args.iter().any(|arg| arg == "--secure") {
        config.secure = true;
    }
    if args.iter().any(|arg| arg == "--key-sequence") {
        config.use_key_sequence = true;
    }
    if args.iter().any(|arg| arg == "--dangerous-insecure-tls") {
        config.dangerous_insecure_tls = true;
    }
    Ok(config)
}

/// Initialize tracing:
/// - Always write to a daily-rotating log file (for bug reports)
/// - Optionally add stderr output when --verbose is passed
fn init_tracing(verbose_level: Option<&str>, log_file_path: Option<&str>) {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    // --log-file=<path> overrides the default platform path
    let log_dir = if let Some(path) = log_file_path {
        PathBuf::from(path)
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."))
    } else {
        // Platform log directory:
        //   macOS:   ~/Library/Logs/com.processone.fluux/
        //   Linux:   ~/.local/share/com.processone.fluux/logs/  (or $XDG_DATA_HOME)
        //   Windows: %APPDATA%\com.processone.fluux\logs\
        let base = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
        let dir = base.join("com.processone.fluux").join("logs");

        #[cfg(target_os = "macos")]
        let dir = dirs::home_dir()
            .map(|h| h.join("Library").join("Logs").join("com.processone.fluux"))
            .unwrap_or(dir);

        dir
    };

    if let Err(e) = std::fs::create_dir_all(&log_dir) {
        eprintln!("Warning: could not create log directory '{}': {}", log_dir.display(), e);
    }

    let rust_log = std::env::var("RUST_LOG").is_ok();
    let file_filter = if rust_log {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new("fluux_bosh=info,info")
    };

    // File layer: daily-rotating log file, non-blocking writes
    let file_appender = tracing_appender::rolling::daily(&log_dir, "fluux-bosh.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_filter(file_filter);

    let stderr_layer = if verbose_level.is_some() || log_file_path.is_some() || rust_log {
        let stderr_filter = if rust_log {
            EnvFilter::from_default_env()
        } else if verbose_level == Some("wire") {
            EnvFilter::new("fluux_bosh=debug,info")
        } else {
            EnvFilter::new("fluux_bosh=info,info")
        };
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(stderr_filter),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .init();

    // The background writer must outlive every log call
    std::mem::forget(guard);

    eprintln!("Log file: {}", log_dir.display());
}

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|arg| arg == "--help" || arg == "-h") {
        print_help();
        return ExitCode::SUCCESS;
    }

    // --verbose / -v (no BOSH bodies) or --verbose=wire (with bodies)
    let verbose_level = args.iter().find_map(|arg| {
        if arg == "--verbose" || arg == "-v" {
            Some("default")
        } else {
            arg.strip_prefix("--verbose=")
        }
    });
    init_tracing(verbose_level, flag_value(&args, "log-file"));

    let config = match build_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::from(2);
        }
    };
    if config.dangerous_insecure_tls {
        eprintln!("WARNING: TLS certificate verification is DISABLED (--dangerous-insecure-tls)");
        eprintln!("         This is insecure and should only be used for development/testing.");
    }

    let (ended_tx, mut ended_rx) = watch::channel(None);
    let listener = Arc::new(ConsoleListener { ended: ended_tx });
    let session = match Session::new(config, listener) {
        Ok(session) => session,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = session.connect().await {
        error!(error = %e, "BOSH connect failed");
        eprintln!("Error: {}", e);
        return ExitCode::FAILURE;
    }
    info!(sid = ?session.session_id(), "fluux-bosh console ready");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let clean = loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let element = line.trim();
                    if element.is_empty() {
                        continue;
                    }
                    if let Err(e) = session.send(vec![element.to_string()]) {
                        eprintln!("Error: {}", e);
                    }
                }
                Ok(None) => break true,
                Err(e) => {
                    eprintln!("Error reading stdin: {}", e);
                    break false;
                }
            },
            changed = ended_rx.changed() => {
                if changed.is_err() {
                    break false;
                }
                if let Some(clean) = *ended_rx.borrow() {
                    break clean;
                }
            },
            _ = tokio::signal::ctrl_c() => break true,
        }
    };

    session.close().await;
    if clean {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
