//! Line oriented terminal front end.
//!
//! Reads one command per line from stdin and prints results to stdout.
//! Everything it shows comes from a session snapshot; it never touches the
//! session state directly.

use crate::command::RegisterRequest;
use crate::config::IdentityConfig;
use crate::device::{display_timestamp, Task, UnknownTask};
use crate::mqtt::{SessionManager, SessionSnapshot};
use chrono::{Local, Utc};
use color_eyre::{eyre::eyre, Result};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, warn};

pub const HELP: &str = "\
Commands:
  login [<user id> <base64 key>]   start a session (defaults to the configured identity)
  logout                           end the session and discard its state
  devices                          list registered devices
  add <task> <id> [description]    register a device (led, button, both, shelly, alexa)
  remove <id>                      unregister a device
  toggle                           flip the do-not-disturb status
  status                           current status and connection state
  history                          status changes, newest first
  power <id>                       power reading of a relay
  state <id>                       switch state of a relay
  help                             show this text
  quit                             log out and exit";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConsoleError {
    #[error("Unknown command {0:?}, try 'help'")]
    UnknownCommand(String),

    #[error("Missing argument: {0}")]
    MissingArgument(&'static str),

    #[error(transparent)]
    Task(#[from] UnknownTask),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Login(Option<IdentityConfig>),
    Logout,
    Devices,
    Add {
        task: Task,
        device_id: String,
        description: String,
    },
    Remove(String),
    Toggle,
    Status,
    History,
    Power(String),
    State(String),
    Help,
    Quit,
}

impl ConsoleCommand {
    /// Parses one input line. Blank lines yield `Ok(None)`.
    pub fn parse(line: &str) -> Result<Option<Self>, ConsoleError> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Ok(None);
        };

        let command = match verb.to_lowercase().as_str() {
            "login" => match (words.next(), words.next()) {
                (Some(user_id), Some(key)) => {
                    ConsoleCommand::Login(Some(IdentityConfig::new(user_id, key)))
                }
                (Some(_), None) => return Err(ConsoleError::MissingArgument("base64 key")),
                _ => ConsoleCommand::Login(None),
            },
            "logout" => ConsoleCommand::Logout,
            "devices" | "ls" => ConsoleCommand::Devices,
            "add" => {
                let task = words
                    .next()
                    .ok_or(ConsoleError::MissingArgument("task"))?
                    .to_lowercase()
                    .parse()?;
                let device_id = words
                    .next()
                    .ok_or(ConsoleError::MissingArgument("device id"))?
                    .to_string();
                let description = words.collect::<Vec<_>>().join(" ");
                ConsoleCommand::Add {
                    task,
                    device_id,
                    description,
                }
            }
            "remove" | "rm" => ConsoleCommand::Remove(required(words.next(), "device id")?),
            "toggle" => ConsoleCommand::Toggle,
            "status" => ConsoleCommand::Status,
            "history" => ConsoleCommand::History,
            "power" => ConsoleCommand::Power(required(words.next(), "device id")?),
            "state" => ConsoleCommand::State(required(words.next(), "device id")?),
            "help" | "?" => ConsoleCommand::Help,
            "quit" | "exit" => ConsoleCommand::Quit,
            other => return Err(ConsoleError::UnknownCommand(other.to_string())),
        };
        Ok(Some(command))
    }
}

fn required(word: Option<&str>, name: &'static str) -> Result<String, ConsoleError> {
    word.map(str::to_string)
        .ok_or(ConsoleError::MissingArgument(name))
}

pub fn render_devices(snapshot: &SessionSnapshot) -> String {
    if snapshot.devices.is_empty() {
        return "No devices registered".to_string();
    }

    snapshot
        .devices
        .iter()
        .map(|device| {
            format!(
                "{:<12} {:<15} {:<30} {}",
                device.device_id,
                device.task.label(),
                device.description.user_description,
                device.description.registration_timestamp
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn render_history(snapshot: &SessionSnapshot) -> String {
    if snapshot.history.is_empty() {
        return "No status changes yet".to_string();
    }

    snapshot
        .history
        .iter()
        .map(|event| format!("{}  {}", status_label(event.status), event.timestamp))
        .collect::<Vec<_>>()
        .join("\n")
}

fn status_label(status: bool) -> &'static str {
    if status {
        "Do not disturb"
    } else {
        "Available"
    }
}

pub struct Console {
    manager: SessionManager,
    configured_identity: Option<IdentityConfig>,
}

impl Console {
    pub fn new(manager: SessionManager, configured_identity: Option<IdentityConfig>) -> Self {
        Self {
            manager,
            configured_identity,
        }
    }

    /// Processes lines until `quit` or end of input, then logs out.
    pub async fn run<R: AsyncBufRead + Unpin>(mut self, input: R) -> Result<()> {
        println!("{}", HELP);
        let mut lines = input.lines();

        while let Some(line) = lines.next_line().await? {
            match ConsoleCommand::parse(&line) {
                Ok(None) => {}
                Ok(Some(ConsoleCommand::Quit)) => break,
                Ok(Some(command)) => self.execute(command).await,
                Err(e) => println!("{}", e),
            }
        }

        self.manager.logout().await?;
        Ok(())
    }

    async fn execute(&mut self, command: ConsoleCommand) {
        debug!("Console command: {:?}", command);
        match self.try_execute(command).await {
            Ok(output) => {
                if !output.is_empty() {
                    println!("{}", output);
                }
            }
            Err(e) => {
                warn!("Console command failed: {}", e);
                println!("Error: {}", e);
            }
        }
    }

    async fn try_execute(&mut self, command: ConsoleCommand) -> Result<String> {
        let output = match command {
            ConsoleCommand::Login(identity) => {
                let identity = identity
                    .or_else(|| self.configured_identity.clone())
                    .ok_or_else(|| eyre!("No identity configured"))?;
                let register_self = identity.register_self;
                let session = self.manager.login(&identity, register_self).await?;
                format!("Logged in as {}", session.user_id())
            }
            ConsoleCommand::Logout => {
                self.manager.logout().await?;
                "Logged out".to_string()
            }
            ConsoleCommand::Devices => render_devices(&self.snapshot().await?),
            ConsoleCommand::Add {
                task,
                device_id,
                description,
            } => {
                let request = RegisterRequest::new(task, device_id, description)?;
                self.manager.session()?.register_device(request).await?;
                "Register request sent".to_string()
            }
            ConsoleCommand::Remove(device_id) => {
                self.manager.session()?.unregister_device(&device_id).await?;
                "Unregister request sent".to_string()
            }
            ConsoleCommand::Toggle => {
                self.manager.session()?.toggle_status().await?;
                "Status change requested".to_string()
            }
            ConsoleCommand::Status => {
                let snapshot = self.snapshot().await?;
                format!(
                    "{} ({}) as of {}",
                    status_label(snapshot.status),
                    self.manager.connection_state(),
                    display_timestamp(Local::now())
                )
            }
            ConsoleCommand::History => render_history(&self.snapshot().await?),
            ConsoleCommand::Power(device_id) => {
                let snapshot = self.snapshot().await?;
                format!("{}: {}", device_id, snapshot.power_reading(&device_id, Utc::now()))
            }
            ConsoleCommand::State(device_id) => {
                let snapshot = self.snapshot().await?;
                match snapshot.relay_state(&device_id) {
                    Some(state) => format!("{}: {:?}", device_id, state),
                    None => format!("{}: no state received", device_id),
                }
            }
            ConsoleCommand::Help => HELP.to_string(),
            ConsoleCommand::Quit => String::new(),
        };
        Ok(output)
    }

    async fn snapshot(&self) -> Result<SessionSnapshot> {
        Ok(self.manager.session()?.snapshot().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Device, DeviceDescription, StatusEvent};

    fn snapshot(devices: Vec<Device>, history: Vec<StatusEvent>) -> SessionSnapshot {
        let engine =
            crate::mqtt::SyncEngine::new("7", &crate::mqtt::TopicConfig::default()).unwrap();
        let mut snapshot = engine.snapshot();
        snapshot.devices = devices;
        snapshot.history = history;
        snapshot
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(ConsoleCommand::parse("   "), Ok(None));
        assert_eq!(
            ConsoleCommand::parse("add Shelly 42 kitchen lamp"),
            Ok(Some(ConsoleCommand::Add {
                task: Task::Shelly,
                device_id: "42".to_string(),
                description: "kitchen lamp".to_string(),
            }))
        );
        assert_eq!(
            ConsoleCommand::parse("rm 42"),
            Ok(Some(ConsoleCommand::Remove("42".to_string())))
        );
        assert_eq!(ConsoleCommand::parse("login"), Ok(Some(ConsoleCommand::Login(None))));
        assert_eq!(
            ConsoleCommand::parse("login 7 a2V5"),
            Ok(Some(ConsoleCommand::Login(Some(IdentityConfig::new("7", "a2V5")))))
        );
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            ConsoleCommand::parse("fly"),
            Err(ConsoleError::UnknownCommand("fly".to_string()))
        );
        assert_eq!(
            ConsoleCommand::parse("add"),
            Err(ConsoleError::MissingArgument("task"))
        );
        assert_eq!(
            ConsoleCommand::parse("add toaster 1"),
            Err(ConsoleError::Task(UnknownTask("toaster".to_string())))
        );
        assert_eq!(
            ConsoleCommand::parse("power"),
            Err(ConsoleError::MissingArgument("device id"))
        );
        assert_eq!(
            ConsoleCommand::parse("login 7"),
            Err(ConsoleError::MissingArgument("base64 key"))
        );
    }

    #[test]
    fn test_render_devices_and_history() {
        let empty = snapshot(Vec::new(), Vec::new());
        assert_eq!(render_devices(&empty), "No devices registered");
        assert_eq!(render_history(&empty), "No status changes yet");

        let device = Device {
            device_id: "42".to_string(),
            task: Task::Both,
            description: DeviceDescription::user("desk", "Sunday, Aug 1, 2021, 06:44 PM"),
        };
        let event = StatusEvent {
            status: true,
            timestamp: "Sunday, Aug 1, 2021, 06:45 PM".to_string(),
        };
        let full = snapshot(vec![device], vec![event]);

        let devices = render_devices(&full);
        assert!(devices.contains("42"));
        assert!(devices.contains("Button and LED"));
        assert!(devices.contains("desk"));
        assert_eq!(
            render_history(&full),
            "Do not disturb  Sunday, Aug 1, 2021, 06:45 PM"
        );
    }

    #[tokio::test]
    async fn test_commands_require_login() {
        let mut console = Console::new(
            SessionManager::new(crate::mqtt::MqttConfig::default()),
            None,
        );
        assert!(console.try_execute(ConsoleCommand::Toggle).await.is_err());
        assert!(console.try_execute(ConsoleCommand::Login(None)).await.is_err());
        assert_eq!(
            console.try_execute(ConsoleCommand::Logout).await.unwrap(),
            "Logged out"
        );
    }
}
