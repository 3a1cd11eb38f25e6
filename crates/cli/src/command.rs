use std::path::PathBuf;

use snafu::{OptionExt, ResultExt, Snafu};
use tern_protocol::{ProtocolError, SessionId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    List,
    New(Option<String>),
    Open(SessionId),
    Rename(SessionId, String),
    Summary(Option<SessionId>),
    Attach(PathBuf),
    Image(String),
    Model(String),
    Cancel,
    Help,
    Quit,
    Prompt(String),
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CommandError {
    #[snafu(display("unknown command `/{name}`, try /help"))]
    UnknownCommand { stage: &'static str, name: String },
    #[snafu(display("`/{name}` needs {what}"))]
    MissingArgument {
        stage: &'static str,
        name: &'static str,
        what: &'static str,
    },
    #[snafu(display("{source}"))]
    InvalidSessionId {
        stage: &'static str,
        source: ProtocolError,
    },
}

pub const HELP: &str = "\
/list                  list sessions
/new [title]           start a new session
/open <id>             switch to a session
/rename <id> <title>   rename a session
/summary [id]          let the backend title a session
/attach <path>         upload a document for the next message
/image <url>           attach an image url to the next message
/model <name>          change and save the default model
/cancel                stop the reply being streamed
/quit                  exit
anything else is sent as a message";

/// Parses one input line. Blank lines yield `None`.
pub fn parse(line: &str) -> Result<Option<Command>, CommandError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Some(Command::Prompt(line.to_string())));
    };

    let (name, argument) = match rest.split_once(char::is_whitespace) {
        Some((name, argument)) => (name, argument.trim()),
        None => (rest, ""),
    };
    let argument = (!argument.is_empty()).then_some(argument);

    let command = match name {
        "list" | "ls" => Command::List,
        "new" => Command::New(argument.map(str::to_string)),
        "open" => Command::Open(session_id(required(argument, "open", "a session id")?)?),
        "rename" => {
            let argument = required(argument, "rename", "a session id and a title")?;
            let (id, title) = argument
                .split_once(char::is_whitespace)
                .map(|(id, title)| (id, title.trim()))
                .filter(|(_, title)| !title.is_empty())
                .context(MissingArgumentSnafu {
                    stage: "parse-rename",
                    name: "rename",
                    what: "a title",
                })?;
            Command::Rename(session_id(id)?, title.to_string())
        }
        "summary" => Command::Summary(argument.map(session_id).transpose()?),
        "attach" => Command::Attach(PathBuf::from(required(argument, "attach", "a file path")?)),
        "image" => Command::Image(required(argument, "image", "an image url")?.to_string()),
        "model" => Command::Model(required(argument, "model", "a model name")?.to_string()),
        "cancel" | "stop" => Command::Cancel,
        "help" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => {
            return UnknownCommandSnafu {
                stage: "parse-command",
                name: other.to_string(),
            }
            .fail();
        }
    };
    Ok(Some(command))
}

fn required<'a>(
    argument: Option<&'a str>,
    name: &'static str,
    what: &'static str,
) -> Result<&'a str, CommandError> {
    argument.context(MissingArgumentSnafu {
        stage: "parse-argument",
        name,
        what,
    })
}

fn session_id(raw: &str) -> Result<SessionId, CommandError> {
    SessionId::parse(raw).context(InvalidSessionIdSnafu {
        stage: "parse-session-id",
    })
}
