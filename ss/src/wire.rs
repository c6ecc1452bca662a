//! Wire contract shared by both transport bindings
//!
//! A request is a command name plus positional arguments. The socket binding sends it as a
//! JSON array `["SET", "key", value]` inside a length-prefixed frame; the HTTP binding sends
//! `{"command": "SET", "args": ["key", value]}`. Both decode to the same [`Command`] and both
//! answer with the same [`Response`] shape.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ShareError, ShareResult};

/// Largest frame either side will accept (16 MiB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Result carried by an unknown-command response
pub const UNKNOWN_COMMAND: &str = "UNKNOWN_COMMAND";

/// Result carried by a KILL response
pub const SHUTTING_DOWN: &str = "Server is shutting down...";

/// A decoded store command
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Set { key: String, value: Value },
    Get { key: String },
    GetMany { keys: Vec<String> },
    Delete { key: String },
    Has { key: String },
    ListKeys,
    ListData,
    Clear,
    Call {
        method: String,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    },
    /// Remote registration: calls to `name` are queued under `event`
    Register { name: String, event: String },
    Kill,
    /// First frame of a socket connection when a shared secret is configured
    Auth { secret: String },
    Unknown(String),
}

impl Command {
    /// Wire name of the command
    pub fn name(&self) -> &str {
        match self {
            Command::Set { .. } => "SET",
            Command::Get { .. } | Command::GetMany { .. } => "GET",
            Command::Delete { .. } => "DELETE",
            Command::Has { .. } => "HAS",
            Command::ListKeys => "LIST_KEYS",
            Command::ListData => "LIST_DATA",
            Command::Clear => "CLEAR",
            Command::Call { .. } => "CALL",
            Command::Register { .. } => "REGISTER",
            Command::Kill => "KILL",
            Command::Auth { .. } => "AUTH",
            Command::Unknown(name) => name,
        }
    }

    /// Positional arguments, without the command name
    pub fn args(&self) -> Vec<Value> {
        match self {
            Command::Set { key, value } => vec![Value::from(key.as_str()), value.clone()],
            Command::Get { key } | Command::Delete { key } | Command::Has { key } => {
                vec![Value::from(key.as_str())]
            }
            Command::GetMany { keys } => vec![Value::from(keys.clone())],
            Command::Call { method, args, kwargs } => vec![
                Value::from(method.as_str()),
                Value::Array(args.clone()),
                Value::Object(kwargs.clone()),
            ],
            Command::Register { name, event } => vec![Value::from(name.as_str()), Value::from(event.as_str())],
            Command::Auth { secret } => vec![Value::from(secret.as_str())],
            Command::ListKeys | Command::ListData | Command::Clear | Command::Kill | Command::Unknown(_) => vec![],
        }
    }

    /// Encode as a socket frame body: `["NAME", arg...]`
    pub fn to_frame(&self) -> Value {
        let mut items = vec![Value::from(self.name())];
        items.extend(self.args());
        Value::Array(items)
    }

    /// Encode as an HTTP request body
    pub fn to_request(&self) -> CommandRequest {
        CommandRequest {
            command: self.name().to_string(),
            args: Value::Array(self.args()),
        }
    }

    /// Decode a socket frame body
    pub fn from_frame(frame: Value) -> ShareResult<Self> {
        let mut items = match frame {
            Value::Array(items) => items,
            other => return Err(ShareError::Protocol(format!("Expected a command array, got {}", other))),
        };
        if items.is_empty() {
            return Err(ShareError::Protocol("Empty command".to_string()));
        }
        let name = match items.remove(0) {
            Value::String(name) => name,
            other => return Err(ShareError::Protocol(format!("Command name must be a string, got {}", other))),
        };
        Self::parse(&name, items)
    }

    /// Decode an HTTP request body
    pub fn from_request(request: CommandRequest) -> ShareResult<Self> {
        let args = match request.args {
            Value::Array(args) => args,
            Value::Null => vec![],
            single => vec![single],
        };
        Self::parse(&request.command, args)
    }

    /// Build a command from its name and positional arguments
    ///
    /// Unknown names decode to [`Command::Unknown`]; malformed arguments for a known name are a
    /// protocol error.
    pub fn parse(name: &str, args: Vec<Value>) -> ShareResult<Self> {
        let command = match name {
            "SET" => {
                let key = string_arg(&args, 0, name)?;
                let value = args.get(1).cloned().unwrap_or(Value::Null);
                Command::Set { key, value }
            }
            "GET" => match args.as_slice() {
                [] => return Err(ShareError::Protocol("GET requires a key".to_string())),
                [Value::String(key)] => Command::Get { key: key.clone() },
                [Value::Array(keys)] => Command::GetMany {
                    keys: string_list(keys, name)?,
                },
                keys => Command::GetMany {
                    keys: string_list(keys, name)?,
                },
            },
            "DELETE" => Command::Delete {
                key: string_arg(&args, 0, name)?,
            },
            "HAS" => Command::Has {
                key: string_arg(&args, 0, name)?,
            },
            "LIST_KEYS" => Command::ListKeys,
            "LIST_DATA" => Command::ListData,
            "CLEAR" => Command::Clear,
            "CALL" => {
                let method = string_arg(&args, 0, name)?;
                let call_args = match args.get(1) {
                    None | Some(Value::Null) => vec![],
                    Some(Value::Array(items)) => items.clone(),
                    Some(other) => vec![other.clone()],
                };
                let kwargs = match args.get(2) {
                    None | Some(Value::Null) => Map::new(),
                    Some(Value::Object(map)) => map.clone(),
                    Some(other) => return Err(ShareError::Protocol(format!("CALL kwargs must be an object, got {}", other))),
                };
                Command::Call {
                    method,
                    args: call_args,
                    kwargs,
                }
            }
            "REGISTER" => Command::Register {
                name: string_arg(&args, 0, name)?,
                event: string_arg(&args, 1, name)?,
            },
            "KILL" => Command::Kill,
            "AUTH" => Command::Auth {
                secret: string_arg(&args, 0, name)?,
            },
            other => Command::Unknown(other.to_string()),
        };
        Ok(command)
    }
}

fn string_arg(args: &[Value], index: usize, command: &str) -> ShareResult<String> {
    match args.get(index) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Err(ShareError::Protocol(format!(
            "{} argument {} must be a string, got {}",
            command, index, other
        ))),
        None => Err(ShareError::Protocol(format!("{} is missing argument {}", command, index))),
    }
}

fn string_list(values: &[Value], command: &str) -> ShareResult<Vec<String>> {
    values
        .iter()
        .map(|v| match v {
            Value::String(s) => Ok(s.clone()),
            other => Err(ShareError::Protocol(format!("{} keys must be strings, got {}", command, other))),
        })
        .collect()
}

/// HTTP request body
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandRequest {
    pub command: String,
    #[serde(default)]
    pub args: Value,
}

/// Outcome class of a response
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[default]
    Ok,
    UnknownCommand,
    MethodNotFound,
    CallFailed,
    BadRequest,
    Unauthorized,
}

impl Status {
    pub fn is_ok(&self) -> bool {
        matches!(self, Status::Ok)
    }
}

/// Response body, identical in both bindings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Response {
    #[serde(default)]
    pub result: Value,
    #[serde(default, skip_serializing_if = "Status::is_ok")]
    pub status: Status,
}

impl Response {
    pub fn ok(result: impl Into<Value>) -> Self {
        Self {
            result: result.into(),
            status: Status::Ok,
        }
    }

    pub fn unknown_command() -> Self {
        Self {
            result: Value::from(UNKNOWN_COMMAND),
            status: Status::UnknownCommand,
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self {
            result: Value::from(format!("Method {} not found.", method)),
            status: Status::MethodNotFound,
        }
    }

    pub fn call_failed(message: impl Into<String>) -> Self {
        Self {
            result: Value::from(message.into()),
            status: Status::CallFailed,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            result: Value::from(message.into()),
            status: Status::BadRequest,
        }
    }

    pub fn unauthorized() -> Self {
        Self {
            result: Value::from("Unauthorized"),
            status: Status::Unauthorized,
        }
    }
}

/// Write one length-prefixed JSON frame
pub async fn write_frame<W, T>(writer: &mut W, body: &T) -> ShareResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize + ?Sized,
{
    let bytes = serde_json::to_vec(body)?;
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(ShareError::Protocol(format!("Frame too large: {} bytes", bytes.len())));
    }
    writer.write_u32(bytes.len() as u32).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame body
///
/// Returns `None` when the peer closed the connection cleanly between frames.
pub async fn read_frame<R>(reader: &mut R) -> ShareResult<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_SIZE {
        return Err(ShareError::Protocol(format!("Frame too large: {} bytes", len)));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}
