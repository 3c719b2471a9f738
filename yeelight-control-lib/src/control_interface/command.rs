use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{BulbError, Result};

/// Frame terminator used in both directions.
pub const LINE_ENDING: &str = "\r\n";

/// Single-element result the bulb sends when a command had nothing to return.
pub const SUCCESS_MARKER: &str = "ok";

/// Method names used by this crate.
pub mod methods {
    pub const GET_PROP: &str = "get_prop";
    pub const SET_POWER: &str = "set_power";
    pub const TOGGLE: &str = "toggle";
    pub const SET_BRIGHT: &str = "set_bright";
    pub const SET_RGB: &str = "set_rgb";
    pub const START_CF: &str = "start_cf";
    pub const SET_MUSIC: &str = "set_music";
    pub const SET_DEFAULT: &str = "set_default";

    /// Methods allowed while the bulb is known to be off.
    pub const ALLOWED_WHILE_OFF: [&str; 5] = [SET_POWER, TOGGLE, SET_DEFAULT, SET_MUSIC, GET_PROP];

    pub fn allowed_while_off(method: &str) -> bool {
        ALLOWED_WHILE_OFF.contains(&method)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Command {
    pub id: u32,
    pub method: String,
    pub params: Vec<Value>,
}

impl Command {
    pub fn new(id: u32, method: &str, params: Vec<Value>) -> Self {
        Command {
            id,
            method: method.to_string(),
            params,
        }
    }

    /// Serializes the command as one JSON line terminated by CRLF.
    pub fn to_line(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)
            .map_err(|e| BulbError::Parse(format!("failed to encode {}: {}", self.method, e)))?;
        line.push_str(LINE_ENDING);
        Ok(line)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CommandError {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CommandResult {
    pub id: u32,
    #[serde(default)]
    pub result: Option<Vec<Value>>,
    #[serde(default)]
    pub error: Option<CommandError>,
}

impl CommandResult {
    /// Converts the reply into the dispatcher's return value.
    ///
    /// `["ok"]` becomes an empty list; any other payload is returned as is,
    /// with non-string entries rendered as JSON text.
    pub fn into_values(self, method: &str) -> Result<Vec<String>> {
        if let Some(error) = self.error {
            return Err(BulbError::Device {
                method: method.to_string(),
                code: error.code,
                message: error.message,
            });
        }

        let values: Vec<String> = self
            .result
            .unwrap_or_default()
            .into_iter()
            .map(|value| match value {
                Value::String(s) => s,
                other => other.to_string(),
            })
            .collect();

        if values.len() == 1 && values[0] == SUCCESS_MARKER {
            return Ok(Vec::new());
        }
        Ok(values)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Notification {
    pub method: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

/// A classified inbound line.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Result(CommandResult),
    Notification(Notification),
}

impl Incoming {
    /// Classifies one line: an `id` field makes it a result, a `method`
    /// field a notification.
    pub fn parse(line: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(line)
            .map_err(|e| BulbError::Parse(format!("malformed line {:?}: {}", line, e)))?;

        let Some(object) = value.as_object() else {
            return Err(BulbError::Parse(format!("line is not an object: {:?}", line)));
        };

        if object.contains_key("id") {
            let result = serde_json::from_value(value)
                .map_err(|e| BulbError::Parse(format!("malformed result {:?}: {}", line, e)))?;
            Ok(Incoming::Result(result))
        } else if object.contains_key("method") {
            let notification = serde_json::from_value(value).map_err(|e| {
                BulbError::Parse(format!("malformed notification {:?}: {}", line, e))
            })?;
            Ok(Incoming::Notification(notification))
        } else {
            Err(BulbError::Parse(format!("unrecognized line: {:?}", line)))
        }
    }
}
