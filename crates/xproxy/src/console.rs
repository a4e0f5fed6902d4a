//! Operator console: line commands read from stdin while the proxy runs.

use std::io::BufRead;
use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::warn;
use xproxy_engine::PolicyStore;

const HELP: &str = "\
Commands:
  reload-blacklist   Reload the blocklist file (aliases: reload-blocklist, blacklistrl)
  reload-redirects   Reload the redirects file (alias: redirectsrl)
  help               Show this message
  exit, quit         Stop the proxy
";

/// One line of console input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    ReloadBlocklist,
    ReloadRedirects,
    Help,
    Exit,
    Empty,
    Unknown(String),
}

impl ConsoleCommand {
    /// Parse a line; surrounding whitespace and case are ignored.
    pub fn parse(line: &str) -> Self {
        let command = line.trim();
        match command.to_ascii_lowercase().as_str() {
            "" => Self::Empty,
            "reload-blacklist" | "reload-blocklist" | "blacklistrl" => Self::ReloadBlocklist,
            "reload-redirects" | "redirectsrl" => Self::ReloadRedirects,
            "help" => Self::Help,
            "exit" | "quit" => Self::Exit,
            _ => Self::Unknown(command.to_string()),
        }
    }
}

/// Why the console stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleExit {
    /// Operator asked to stop the proxy.
    Exit,
    /// Input closed.
    Eof,
}

/// Lines from stdin, read on a dedicated thread.
///
/// A blocking stdin read cannot be cancelled, so it must not live on the
/// runtime's blocking pool or shutdown would wait for the next line.
pub fn stdin_lines() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });
    rx
}

/// Serve console commands until `exit`/`quit` or end of input.
///
/// Reloads run on the blocking pool; a failed reload leaves the previous
/// policy active and is reported on `output`.
///
/// # Errors
/// Returns an error only if writing to `output` fails.
pub async fn run_console<W>(
    mut lines: mpsc::Receiver<String>,
    mut output: W,
    store: Arc<PolicyStore>,
) -> std::io::Result<ConsoleExit>
where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = lines.recv().await {
        let reply = match ConsoleCommand::parse(&line) {
            ConsoleCommand::Empty => continue,
            ConsoleCommand::Exit => return Ok(ConsoleExit::Exit),
            ConsoleCommand::Help => HELP.to_string(),
            ConsoleCommand::ReloadBlocklist => {
                let store = Arc::clone(&store);
                reload_reply(
                    "Blacklist",
                    tokio::task::spawn_blocking(move || store.reload_blocklist()).await,
                )
            }
            ConsoleCommand::ReloadRedirects => {
                let store = Arc::clone(&store);
                reload_reply(
                    "Redirects",
                    tokio::task::spawn_blocking(move || store.reload_redirects()).await,
                )
            }
            ConsoleCommand::Unknown(command) => {
                format!("Unknown command '{command}'. Type 'help' for available commands.\n")
            }
        };
        output.write_all(reply.as_bytes()).await?;
        output.flush().await?;
    }

    Ok(ConsoleExit::Eof)
}

fn reload_reply(
    what: &str,
    result: Result<xproxy_engine::Result<usize>, tokio::task::JoinError>,
) -> String {
    match result {
        Ok(Ok(entries)) => format!("{what} reloaded ({entries} entries)\n"),
        Ok(Err(e)) => format!("{what} reload failed, previous entries remain active: {e}\n"),
        Err(e) => {
            warn!(error = %e, "Reload task failed");
            format!("{what} reload failed, previous entries remain active\n")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use xproxy_engine::{PolicySource, ProxyError};

    struct ToggleSource {
        broken: AtomicBool,
    }

    impl PolicySource for ToggleSource {
        fn load_blocklist(&self) -> xproxy_engine::Result<Vec<String>> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(ProxyError::PolicyLoad("unexpected end of file".to_string()));
            }
            Ok(vec!["ads.test".to_string(), "tracker.test".to_string()])
        }

        fn load_redirects(&self) -> xproxy_engine::Result<Vec<(String, String)>> {
            Ok(vec![("old.test".to_string(), "new.test".to_string())])
        }
    }

    fn store(broken: bool) -> Arc<PolicyStore> {
        Arc::new(PolicyStore::load(Arc::new(ToggleSource {
            broken: AtomicBool::new(broken),
        })))
    }

    async fn drive(input: &[&str], store: Arc<PolicyStore>) -> (ConsoleExit, String) {
        let (tx, rx) = mpsc::channel(input.len().max(1));
        for line in input {
            tx.send(line.to_string()).await.unwrap();
        }
        drop(tx);
        let mut output = Vec::new();
        let exit = run_console(rx, &mut output, store).await.unwrap();
        (exit, String::from_utf8(output).unwrap())
    }

    // ========================================================================
    // Command Parsing Tests
    // ========================================================================

    #[test]
    fn test_parse_reload_aliases() {
        for line in ["reload-blacklist", "reload-blocklist", "blacklistrl", "  BlacklistRL  "] {
            assert_eq!(ConsoleCommand::parse(line), ConsoleCommand::ReloadBlocklist);
        }
        for line in ["reload-redirects", "redirectsrl", "REDIRECTSRL"] {
            assert_eq!(ConsoleCommand::parse(line), ConsoleCommand::ReloadRedirects);
        }
    }

    #[test]
    fn test_parse_exit_and_help() {
        assert_eq!(ConsoleCommand::parse("exit"), ConsoleCommand::Exit);
        assert_eq!(ConsoleCommand::parse("Quit"), ConsoleCommand::Exit);
        assert_eq!(ConsoleCommand::parse("help"), ConsoleCommand::Help);
    }

    #[test]
    fn test_parse_empty_and_unknown() {
        assert_eq!(ConsoleCommand::parse("   "), ConsoleCommand::Empty);
        assert_eq!(
            ConsoleCommand::parse(" frobnicate "),
            ConsoleCommand::Unknown("frobnicate".to_string())
        );
    }

    // ========================================================================
    // Console Loop Tests
    // ========================================================================

    #[tokio::test]
    async fn test_console_reload_reports_entry_count() {
        let (exit, output) = drive(&["blacklistrl", "redirectsrl"], store(false)).await;
        assert_eq!(exit, ConsoleExit::Eof);
        assert!(output.contains("Blacklist reloaded (2 entries)"));
        assert!(output.contains("Redirects reloaded (1 entries)"));
    }

    #[tokio::test]
    async fn test_console_failed_reload_keeps_running() {
        let store = store(true);
        let (exit, output) = drive(&["reload-blacklist", "help"], Arc::clone(&store)).await;
        assert_eq!(exit, ConsoleExit::Eof);
        assert!(output.contains("Blacklist reload failed"));
        assert!(output.contains("Commands:"));
        assert!(store.blocklist().is_empty());
    }

    #[tokio::test]
    async fn test_console_exit_stops_reading() {
        let (exit, output) = drive(&["", "exit", "blacklistrl"], store(false)).await;
        assert_eq!(exit, ConsoleExit::Exit);
        assert!(output.is_empty());
    }

    #[tokio::test]
    async fn test_console_unknown_command_hint() {
        let (_, output) = drive(&["status"], store(false)).await;
        assert!(output.contains("Unknown command 'status'"));
        assert!(output.contains("help"));
    }
}
