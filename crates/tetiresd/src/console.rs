//! Operator console
//!
//! One command per line on stdin. Replies are plain text lines.

use std::str::FromStr;

use tetires_core::{AppMode, TirePosition};
use tetires_link::{ConnectionHandle, LinkError};
use tetires_session::{SessionError, SessionHandle, Selection};
use thiserror::Error;

const DEFAULT_LOG_LINES: usize = 20;

pub const HELP: &str = "\
Commands:
  connect                 re-run detection (USB > Bluetooth)
  disconnect              close the active link
  detect                  run arbitration without disconnecting
  send <text>             send a raw command line to the device
  status                  connection and session state
  inspect <bus> <check>   start inspecting a bus check
  terminal                back to terminal mode
  select <position>       choose D-KA, D-KI, B-KA or B-KI
  start | stop            start or stop the scan
  confirm                 accept the current result
  ack                     acknowledge an error
  save                    save all results
  log [n]                 show the last n log lines
  clear | restore         clear the log or undo the last clear
  quit                    exit";

#[derive(Debug, Error, PartialEq)]
pub enum ConsoleError {
    #[error("{0}")]
    Parse(String),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Link(#[from] LinkError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Connect,
    Disconnect,
    Detect,
    Send(String),
    Status,
    Inspect { bus_id: i64, check_id: i64 },
    Terminal,
    Select(TirePosition),
    Start,
    Stop,
    Confirm,
    Ack,
    Save,
    Log(usize),
    Clear,
    Restore,
    Help,
    Quit,
}

impl FromStr for ConsoleCommand {
    type Err = ConsoleError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };

        let command = match word.to_ascii_lowercase().as_str() {
            "connect" => ConsoleCommand::Connect,
            "disconnect" => ConsoleCommand::Disconnect,
            "detect" => ConsoleCommand::Detect,
            "send" if !rest.is_empty() => ConsoleCommand::Send(rest.to_string()),
            "send" => return Err(ConsoleError::Parse("usage: send <text>".to_string())),
            "status" => ConsoleCommand::Status,
            "inspect" => {
                let ids: Vec<i64> = rest
                    .split_whitespace()
                    .map(|s| s.parse::<i64>())
                    .collect::<Result<_, _>>()
                    .map_err(|_| ConsoleError::Parse("usage: inspect <bus> <check>".to_string()))?;
                match ids.as_slice() {
                    [bus_id, check_id] => ConsoleCommand::Inspect {
                        bus_id: *bus_id,
                        check_id: *check_id,
                    },
                    _ => {
                        return Err(ConsoleError::Parse(
                            "usage: inspect <bus> <check>".to_string(),
                        ))
                    }
                }
            }
            "terminal" => ConsoleCommand::Terminal,
            "select" => ConsoleCommand::Select(
                rest.parse()
                    .map_err(|e: tetires_core::UnknownPosition| ConsoleError::Parse(e.to_string()))?,
            ),
            "start" => ConsoleCommand::Start,
            "stop" => ConsoleCommand::Stop,
            "confirm" => ConsoleCommand::Confirm,
            "ack" => ConsoleCommand::Ack,
            "save" => ConsoleCommand::Save,
            "log" if rest.is_empty() => ConsoleCommand::Log(DEFAULT_LOG_LINES),
            "log" => ConsoleCommand::Log(
                rest.parse()
                    .map_err(|_| ConsoleError::Parse("usage: log [n]".to_string()))?,
            ),
            "clear" => ConsoleCommand::Clear,
            "restore" => ConsoleCommand::Restore,
            "help" | "?" => ConsoleCommand::Help,
            "quit" | "exit" => ConsoleCommand::Quit,
            other => {
                return Err(ConsoleError::Parse(format!(
                    "unknown command '{}', try 'help'",
                    other
                )))
            }
        };
        Ok(command)
    }
}

/// Result of one command
#[derive(Debug, Default, PartialEq)]
pub struct Reply {
    pub lines: Vec<String>,
    pub quit: bool,
}

impl Reply {
    fn line(text: impl Into<String>) -> Self {
        Self {
            lines: vec![text.into()],
            quit: false,
        }
    }
}

/// Runs console commands against the link and the session
pub struct Console {
    link: ConnectionHandle,
    session: SessionHandle,
}

impl Console {
    pub fn new(link: ConnectionHandle, session: SessionHandle) -> Self {
        Self { link, session }
    }

    pub async fn execute(&self, command: ConsoleCommand) -> Result<Reply, ConsoleError> {
        let log = self.session.log();
        let reply = match command {
            ConsoleCommand::Connect => {
                log.clear();
                log.system("Auto detect & connect (USB > Bluetooth)...");
                self.link.manual_connect().await?;
                Reply::line("Reconnecting...")
            }
            ConsoleCommand::Disconnect => {
                log.system("Disconnecting active device...");
                self.link.disconnect().await?;
                Reply::line("Disconnected")
            }
            ConsoleCommand::Detect => {
                self.link.auto_detect().await?;
                Reply::line("Detecting devices...")
            }
            ConsoleCommand::Send(text) => {
                self.session.send_command(&text).await?;
                Reply::line(format!("SENT: {}", text))
            }
            ConsoleCommand::Status => self.status().await?,
            ConsoleCommand::Inspect { bus_id, check_id } => {
                self.session.enter_inspection(bus_id, check_id).await?;
                self.session_message()
            }
            ConsoleCommand::Terminal => {
                self.session.leave_inspection().await?;
                self.session_message()
            }
            ConsoleCommand::Select(position) => {
                let selection = self.session.select_position(position).await?;
                let mut reply = self.session_message();
                if let Selection::Rescan { previous } = selection {
                    reply.lines.insert(
                        0,
                        format!("Position {} already scanned ({})", position, previous.summary()),
                    );
                }
                reply
            }
            ConsoleCommand::Start => {
                self.session.start_scan().await?;
                self.session_message()
            }
            ConsoleCommand::Stop => {
                self.session.stop_scan().await?;
                self.session_message()
            }
            ConsoleCommand::Confirm => {
                self.session.confirm().await?;
                self.session_message()
            }
            ConsoleCommand::Ack => {
                self.session.acknowledge_error().await?;
                self.session_message()
            }
            ConsoleCommand::Save => {
                self.session.save_all().await?;
                self.session_message()
            }
            ConsoleCommand::Log(n) => Reply {
                lines: log.tail(n),
                quit: false,
            },
            ConsoleCommand::Clear => {
                log.clear();
                Reply::line("Log cleared")
            }
            ConsoleCommand::Restore => Reply::line(if log.restore_last() {
                "Log restored"
            } else {
                "Nothing to restore"
            }),
            ConsoleCommand::Help => Reply {
                lines: HELP.lines().map(str::to_string).collect(),
                quit: false,
            },
            ConsoleCommand::Quit => Reply {
                lines: Vec::new(),
                quit: true,
            },
        };
        Ok(reply)
    }

    fn session_message(&self) -> Reply {
        Reply::line(self.session.snapshot().message)
    }

    async fn status(&self) -> Result<Reply, ConsoleError> {
        let link = self.link.snapshot();
        let diagnostics = self.link.diagnostics().await?;
        let session = self.session.snapshot();

        let mut lines = vec![
            format!("Device:   {} ({})", link.descriptor, link.state),
            format!("Status:   {}", link.status),
            format!(
                "Mode:     {}",
                match session.mode {
                    AppMode::Terminal => "terminal".to_string(),
                    AppMode::Inspection { bus_id, check_id } =>
                        format!("inspection (bus {}, check {})", bus_id, check_id),
                }
            ),
            format!("Scan:     {} ({} buffered)", session.state, session.buffered),
            format!("Message:  {}", session.message),
            format!(
                "Links:    {} reader(s), {} reconnect loop(s), {} reconnect attempt(s)",
                diagnostics.live_readers,
                diagnostics.live_reconnect_loops,
                diagnostics.reconnect_attempts,
            ),
            format!(
                "Framing:  {} overflow(s), {} gap(s)",
                diagnostics.overflows, diagnostics.gaps
            ),
        ];
        if let Some(warning) = &session.warning {
            lines.push(format!("Warning:  {}", warning));
        }
        for result in session.results.values() {
            lines.push(format!(
                "  {}  [{}]{}",
                result.summary(),
                result.grooves_formatted(),
                if session.saved { "  saved" } else { "" }
            ));
        }
        Ok(Reply { lines, quit: false })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(line: &str) -> Result<ConsoleCommand, ConsoleError> {
        line.parse()
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(parse("connect"), Ok(ConsoleCommand::Connect));
        assert_eq!(parse("  START "), Ok(ConsoleCommand::Start));
        assert_eq!(
            parse("send LED ON"),
            Ok(ConsoleCommand::Send("LED ON".to_string()))
        );
        assert_eq!(
            parse("inspect 12 340"),
            Ok(ConsoleCommand::Inspect {
                bus_id: 12,
                check_id: 340
            })
        );
        assert_eq!(
            parse("select b-ki"),
            Ok(ConsoleCommand::Select(TirePosition::RearLeft))
        );
        assert_eq!(parse("log"), Ok(ConsoleCommand::Log(20)));
        assert_eq!(parse("log 5"), Ok(ConsoleCommand::Log(5)));
        assert_eq!(parse("exit"), Ok(ConsoleCommand::Quit));
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(parse("send"), Err(ConsoleError::Parse(_))));
        assert!(matches!(parse("inspect 12"), Err(ConsoleError::Parse(_))));
        assert!(matches!(parse("inspect a b"), Err(ConsoleError::Parse(_))));
        assert!(matches!(parse("select X-YZ"), Err(ConsoleError::Parse(_))));
        assert!(matches!(parse("reboot"), Err(ConsoleError::Parse(_))));
    }
}
