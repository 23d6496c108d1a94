//! Interactive commands read from stdin while a stream is running.

use kit_twin_core::types::AssetStatus;

pub const HELP: &str = "\
commands:
  open <url>                          load a stage
  select <id>                         toggle an asset in the selection
  status <id> <nominal|warning|fault> publish an asset status
  reset                               reset the camera
  state                               print the current state
  quit                                tear down and exit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplCommand {
    Open(String),
    Select(String),
    Status(String, AssetStatus),
    Reset,
    State,
    Quit,
    Help,
}

/// Parse one input line. Blank lines yield `Ok(None)`.
pub fn parse(line: &str) -> Result<Option<ReplCommand>, String> {
    let mut words = line.split_whitespace();
    let Some(command) = words.next() else {
        return Ok(None);
    };
    let rest: Vec<&str> = words.collect();

    let cmd = match (command, rest.as_slice()) {
        ("open", [url]) => ReplCommand::Open(url.to_string()),
        ("select", [id]) => ReplCommand::Select(id.to_string()),
        ("status", [id, status]) => ReplCommand::Status(id.to_string(), status.parse()?),
        ("reset", []) => ReplCommand::Reset,
        ("state", []) => ReplCommand::State,
        ("quit" | "exit", []) => ReplCommand::Quit,
        ("help" | "?", []) => ReplCommand::Help,
        ("open" | "select" | "status" | "reset" | "state" | "quit" | "exit" | "help", _) => {
            return Err(format!("wrong arguments for '{command}'"));
        }
        _ => return Err(format!("unknown command '{command}'")),
    };
    Ok(Some(cmd))
}
