use std::path::PathBuf;
use std::str::FromStr;

pub const HELP: &str = "\
commands:
  show          present the widget
  hide          dismiss the widget
  reload        restart the load decision
  online        report the network as reachable
  offline       report the network as unreachable
  fg            app will enter foreground
  bg            app did enter background
  push <file>   deliver a push payload from a JSON file
  tap           tap the message banner
  logout        unsubscribe and forget the current user
  unread        print the unread count
  help          print this list
  quit          stop the demo";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Show,
    Hide,
    Reload,
    Online,
    Offline,
    Foreground,
    Background,
    Push(PathBuf),
    Tap,
    Logout,
    Unread,
    Help,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("unknown command `{0}`, type `help` for the list")]
    Unknown(String),

    #[error("`{0}` needs an argument")]
    MissingArgument(&'static str),
}

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut parts = line.trim().splitn(2, char::is_whitespace);
        let name = parts.next().unwrap_or_default();
        let argument = parts.next().map(str::trim).filter(|arg| !arg.is_empty());

        let command = match name {
            "show" => Self::Show,
            "hide" => Self::Hide,
            "reload" => Self::Reload,
            "online" => Self::Online,
            "offline" => Self::Offline,
            "fg" | "foreground" => Self::Foreground,
            "bg" | "background" => Self::Background,
            "push" => Self::Push(PathBuf::from(
                argument.ok_or(CommandError::MissingArgument("push"))?,
            )),
            "tap" => Self::Tap,
            "logout" => Self::Logout,
            "unread" => Self::Unread,
            "help" | "?" => Self::Help,
            "quit" | "q" | "exit" => Self::Quit,
            other => return Err(CommandError::Unknown(other.to_string())),
        };
        Ok(command)
    }
}
