//! Parser for the interactive alarm commands.
//!
//! ```text
//! Start_Alarm(<id>): <category> <seconds> <message>
//! Change_Alarm(<id>): <seconds> <message>
//! Cancel_Alarm(<id>)
//! View_Alarms
//! ```

use std::str::FromStr;

use thiserror::Error;

use crate::alarm::AlarmId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start {
        id: AlarmId,
        category: String,
        interval: u32,
        message: String,
    },
    Change {
        id: AlarmId,
        interval: u32,
        message: String,
    },
    Cancel(AlarmId),
    View,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("invalid command {0:?}")]
    Unknown(String),
    #[error("expected {0}(<id>)")]
    MissingId(&'static str),
    #[error("invalid alarm id {0:?}")]
    BadId(String),
    #[error("invalid duration {0:?}")]
    BadInterval(String),
    #[error("{0} is missing its {1}")]
    Missing(&'static str, &'static str),
}

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        if line == "View_Alarms" {
            return Ok(Self::View);
        }
        let (name, rest) = line
            .split_once('(')
            .ok_or_else(|| CommandError::Unknown(line.to_string()))?;
        match name {
            "Start_Alarm" => {
                let (id, args) = parse_id("Start_Alarm", rest)?;
                let args = args
                    .strip_prefix(':')
                    .ok_or(CommandError::Missing("Start_Alarm", "category"))?;
                let (category, args) = next_word(args)
                    .ok_or(CommandError::Missing("Start_Alarm", "category"))?;
                let (interval, message) = parse_interval("Start_Alarm", args)?;
                Ok(Self::Start {
                    id,
                    category: category.to_string(),
                    interval,
                    message,
                })
            }
            "Change_Alarm" => {
                let (id, args) = parse_id("Change_Alarm", rest)?;
                let args = args
                    .strip_prefix(':')
                    .ok_or(CommandError::Missing("Change_Alarm", "duration"))?;
                let (interval, message) = parse_interval("Change_Alarm", args)?;
                Ok(Self::Change {
                    id,
                    interval,
                    message,
                })
            }
            "Cancel_Alarm" => {
                let (id, _) = parse_id("Cancel_Alarm", rest)?;
                Ok(Self::Cancel(id))
            }
            _ => Err(CommandError::Unknown(name.to_string())),
        }
    }
}

/// Splits `<id>)<rest>` into the id and whatever follows the parenthesis.
fn parse_id<'a>(
    command: &'static str,
    rest: &'a str,
) -> Result<(AlarmId, &'a str), CommandError> {
    let (id, rest) = rest
        .split_once(')')
        .ok_or(CommandError::MissingId(command))?;
    let id = id
        .trim()
        .parse()
        .map_err(|_| CommandError::BadId(id.to_string()))?;
    Ok((id, rest))
}

fn next_word(text: &str) -> Option<(&str, &str)> {
    let text = text.trim_start();
    if text.is_empty() {
        return None;
    }
    Some(text.split_once(char::is_whitespace).unwrap_or((text, "")))
}

fn parse_interval(command: &'static str, args: &str) -> Result<(u32, String), CommandError> {
    let (interval, message) = next_word(args).ok_or(CommandError::Missing(command, "duration"))?;
    let interval = interval
        .parse()
        .map_err(|_| CommandError::BadInterval(interval.to_string()))?;
    let message = message.trim();
    if message.is_empty() {
        return Err(CommandError::Missing(command, "message"));
    }
    Ok((interval, message.to_string()))
}
