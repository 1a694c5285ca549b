//! Interactive commands read from stdin while the service runs.

use reposter_core::app::RunningApp;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    /// Check all bindings now. An empty line means the same.
    Check,
    Health,
    Quit,
    Unknown(String),
}

pub fn parse_command(line: &str) -> ConsoleCommand {
    match line.trim().to_lowercase().as_str() {
        "" | "check" => ConsoleCommand::Check,
        "health" => ConsoleCommand::Health,
        "quit" | "exit" => ConsoleCommand::Quit,
        other => ConsoleCommand::Unknown(other.to_string()),
    }
}

/// Serves stdin commands against `app`. Returns when `quit` is entered.
///
/// A closed stdin (e.g. running under a service manager) leaves the loop pending
/// forever, so only a signal stops the process then.
pub async fn console_loop(app: &RunningApp) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                info!("[CONSOLE] Stdin closed, interactive commands disabled");
                return std::future::pending().await;
            }
            Err(e) => {
                warn!(error = %e, "[CONSOLE] Could not read stdin, interactive commands disabled");
                return std::future::pending().await;
            }
        };
        match parse_command(&line) {
            ConsoleCommand::Check => {
                if app.trigger_check() {
                    info!("[CONSOLE] Check requested");
                }
            }
            ConsoleCommand::Health => app.request_health_check(),
            ConsoleCommand::Quit => {
                info!("[CONSOLE] Quit requested");
                return;
            }
            ConsoleCommand::Unknown(other) => {
                warn!(command = %other, "[CONSOLE] Unknown command, try: check, health, quit");
            }
        }
    }
}
