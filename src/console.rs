//! Interactive stdin console
//!
//! Single-letter commands, one per line:
//!
//! | Key | Action |
//! |-----|--------|
//! | `s` | start, or resume when paused |
//! | `p` | pause |
//! | `e` | stop |
//! | `h` | run a health check now and print the report |
//! | `d` | print counters, queue depth and per-channel detector state |
//! | `q` | quit |

use std::io::Write;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

use crate::controller::Monitor;
use crate::error::MonitorResult;

/// Parsed console command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleCommand {
    /// `s`
    Start,
    /// `p`
    Pause,
    /// `e`
    Stop,
    /// `h`
    Health,
    /// `d`
    Diagnostics,
    /// `q`
    Quit,
}

impl ConsoleCommand {
    /// Parse one input line; surrounding whitespace and case are ignored
    pub fn parse(line: &str) -> Option<Self> {
        match line.trim().to_ascii_lowercase().as_str() {
            "s" => Some(Self::Start),
            "p" => Some(Self::Pause),
            "e" => Some(Self::Stop),
            "h" => Some(Self::Health),
            "d" => Some(Self::Diagnostics),
            "q" => Some(Self::Quit),
            _ => None,
        }
    }
}

/// Printed at startup and after an unknown command
pub const HELP: &str = "commands: s=start/resume p=pause e=stop h=health d=diagnostics q=quit";

/// Read commands from `input` until `q` or end of input, returning on quit.
///
/// Output goes to stdout; the caller performs the shutdown.
pub async fn run<R>(monitor: &Monitor, input: R) -> MonitorResult<()>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(input).lines();
    print_line(HELP);

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let Some(command) = ConsoleCommand::parse(&line) else {
            print_line(&format!("unknown command '{}'; {HELP}", line.trim()));
            continue;
        };
        if command == ConsoleCommand::Quit {
            break;
        }
        execute(monitor, command).await?;
    }
    Ok(())
}

/// Apply one command and print the outcome
pub async fn execute(monitor: &Monitor, command: ConsoleCommand) -> MonitorResult<()> {
    match command {
        ConsoleCommand::Start => print_line(&format!("state: {:?}", monitor.start())),
        ConsoleCommand::Pause => print_line(&format!("state: {:?}", monitor.pause())),
        ConsoleCommand::Stop => print_line(&format!("state: {:?}", monitor.stop())),
        ConsoleCommand::Health => {
            let report = monitor.run_health_check_now().await?;
            print_json(report.as_ref());
        }
        ConsoleCommand::Diagnostics => print_json(&monitor.diagnostics_report()),
        ConsoleCommand::Quit => {}
    }
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => print_line(&json),
        Err(e) => tracing::error!(error = %e, "Failed to render console output"),
    }
}

fn print_line(text: &str) {
    let mut stdout = std::io::stdout().lock();
    let _ = writeln!(stdout, "{text}");
}
