mod calc;
mod db;
mod ipc;
mod marks;

use clap::Parser;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Student management sidecar: one JSON request per stdin line, one JSON
/// response per stdout line.
#[derive(Debug, Parser)]
#[command(name = "studentd", version)]
struct Cli {
    /// Workspace directory to open at startup.
    #[arg(long, env = "STUDENTD_WORKSPACE")]
    workspace: Option<PathBuf>,

    /// Emit logs as JSON lines (stderr).
    #[arg(long)]
    log_json: bool,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // stdout carries the protocol; logs go to stderr.
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let mut state = ipc::AppState::default();
    if let Some(path) = cli.workspace {
        if let Err(e) = ipc::open_workspace(&mut state, path.clone()) {
            error!(path = %path.display(), error = %e, "startup workspace failed to open");
        }
    }
    info!(version = env!("CARGO_PKG_VERSION"), "studentd ready");

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                // Can't reply without id.
                let _ = writeln!(
                    stdout,
                    "{}",
                    serde_json::json!({
                        "ok": false,
                        "error": { "code": "bad_json", "message": e.to_string() }
                    })
                );
                let _ = stdout.flush();
                continue;
            }
        };

        let resp = ipc::handle_request(&mut state, req);
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }
}
