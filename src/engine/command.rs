//! The wire-facing command set.
//!
//! Every entry point (CLI and daemon) funnels through [`dispatch`], so the
//! engine has exactly one behavior per operation. The enum is closed;
//! adding an operation means adding a variant and its match arm.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::eid::Eid;
use crate::records::RecordDraft;
use crate::rules::RuleKind;

use super::core::Engine;
use super::errors::EngineError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
    Capture {
        record: RecordDraft,
    },
    Search {
        query: String,
        #[serde(default)]
        limit: Option<usize>,
        #[serde(default)]
        threshold: Option<f32>,
    },
    Neighbors {
        id: u64,
        #[serde(default)]
        limit: Option<usize>,
    },
    Forget {
        #[serde(default)]
        domain: Option<String>,
        #[serde(default)]
        date_range: Option<String>,
    },
    Export,
    DiffSessions {
        a: String,
        b: String,
    },
    MergeSessions {
        a: String,
        b: String,
    },
    AddRule {
        kind: RuleKind,
        value: String,
    },
    DeleteRule {
        id: Eid,
    },
    ListRules,
    ToggleRule {
        id: Eid,
    },
    Stats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn done() -> Self {
        Self {
            success: true,
            data: None,
            error: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

pub fn dispatch(engine: &Engine, command: Command) -> CommandResponse {
    match run(engine, command) {
        Ok(response) => response,
        Err(err) => CommandResponse::failure(err.to_string()),
    }
}

fn payload<T: Serialize>(value: T) -> Result<CommandResponse, EngineError> {
    let data = serde_json::to_value(value).map_err(anyhow::Error::from)?;
    Ok(CommandResponse::ok(data))
}

fn run(engine: &Engine, command: Command) -> Result<CommandResponse, EngineError> {
    match command {
        Command::Capture { record } => payload(engine.capture(record)?),
        Command::Search {
            query,
            limit,
            threshold,
        } => payload(engine.search(&query, limit, threshold)?),
        Command::Neighbors { id, limit } => payload(engine.neighbors(id, limit)?),
        Command::Forget { domain, date_range } => match (domain, date_range) {
            (Some(domain), None) => {
                payload(json!({ "deleted_count": engine.forget_domain(&domain)? }))
            }
            (None, Some(range)) => {
                payload(json!({ "deleted_count": engine.forget_date_range(&range)? }))
            }
            _ => Ok(CommandResponse::failure(
                "forget requires exactly one of domain or date_range",
            )),
        },
        Command::Export => payload(engine.export()?),
        Command::DiffSessions { a, b } => payload(engine.diff_sessions(&a, &b)?),
        Command::MergeSessions { a, b } => payload(engine.merge_sessions(&a, &b)?),
        Command::AddRule { kind, value } => payload(engine.add_rule(kind, value)?),
        Command::DeleteRule { id } => {
            engine.delete_rule(&id)?;
            Ok(CommandResponse::done())
        }
        Command::ListRules => payload(engine.list_rules()),
        Command::ToggleRule { id } => payload(engine.toggle_rule(&id)?),
        Command::Stats => payload(engine.stats()?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_use_screaming_snake_tags() {
        let command: Command = serde_json::from_str(r#"{"type": "SEARCH", "query": "rust"}"#)
            .unwrap();
        assert!(matches!(
            command,
            Command::Search {
                ref query,
                limit: None,
                threshold: None,
            } if query == "rust"
        ));

        let command: Command =
            serde_json::from_str(r#"{"type": "DIFF_SESSIONS", "a": "s1", "b": "s2"}"#).unwrap();
        assert!(matches!(command, Command::DiffSessions { .. }));

        let raw = serde_json::to_value(Command::ListRules).unwrap();
        assert_eq!(raw, json!({ "type": "LIST_RULES" }));
    }

    #[test]
    fn unknown_command_type_is_rejected() {
        let parsed: Result<Command, _> =
            serde_json::from_str(r#"{"type": "SELF_DESTRUCT"}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn response_omits_empty_fields() {
        let raw = serde_json::to_string(&CommandResponse::done()).unwrap();
        assert_eq!(raw, r#"{"success":true}"#);

        let raw = serde_json::to_string(&CommandResponse::failure("nope")).unwrap();
        assert_eq!(raw, r#"{"success":false,"error":"nope"}"#);
    }
}
