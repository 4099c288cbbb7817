//! Relay wire protocol: one JSON array per websocket text frame.

use nostr_sdk::Event;
use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::filter::Filter;

/// Frames we send to a relay.
#[derive(Debug, Clone)]
pub enum ClientMessage<'a> {
    Req { id: &'a str, filters: &'a [Filter] },
    Close { id: &'a str },
    Event(&'a Event),
}

impl ClientMessage<'_> {
    pub fn to_json(&self) -> Result<String> {
        let value = match self {
            ClientMessage::Req { id, filters } => {
                let mut frame = vec![json!("REQ"), json!(id)];
                for filter in filters.iter() {
                    frame.push(serde_json::to_value(filter)?);
                }
                Value::Array(frame)
            }
            ClientMessage::Close { id } => json!(["CLOSE", id]),
            ClientMessage::Event(event) => json!(["EVENT", serde_json::to_value(event)?]),
        };
        Ok(value.to_string())
    }
}

/// Frames a relay sends to us.
#[derive(Debug, Clone)]
pub enum RelayMessage {
    Event {
        subscription_id: String,
        event: Box<Event>,
    },
    EndOfStoredEvents {
        subscription_id: String,
    },
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },
    Closed {
        subscription_id: String,
        message: String,
    },
    Notice {
        message: String,
    },
    Auth {
        challenge: String,
    },
}

impl RelayMessage {
    pub fn from_json(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        let arr = value
            .as_array()
            .ok_or_else(|| Error::Validation("relay frame is not an array".to_string()))?;
        let str_at = |i: usize| arr.get(i).and_then(Value::as_str).map(str::to_string);
        let missing = |what: &str| Error::Validation(format!("relay frame missing {what}"));

        match arr.first().and_then(Value::as_str) {
            Some("EVENT") => {
                let subscription_id = str_at(1).ok_or_else(|| missing("subscription id"))?;
                let raw = arr.get(2).cloned().ok_or_else(|| missing("event"))?;
                let event: Event = serde_json::from_value(raw)?;
                Ok(RelayMessage::Event {
                    subscription_id,
                    event: Box::new(event),
                })
            }
            Some("EOSE") => Ok(RelayMessage::EndOfStoredEvents {
                subscription_id: str_at(1).ok_or_else(|| missing("subscription id"))?,
            }),
            Some("OK") => Ok(RelayMessage::Ok {
                event_id: str_at(1).ok_or_else(|| missing("event id"))?,
                accepted: arr
                    .get(2)
                    .and_then(Value::as_bool)
                    .ok_or_else(|| missing("status"))?,
                message: str_at(3).unwrap_or_default(),
            }),
            Some("CLOSED") => Ok(RelayMessage::Closed {
                subscription_id: str_at(1).ok_or_else(|| missing("subscription id"))?,
                message: str_at(2).unwrap_or_default(),
            }),
            Some("NOTICE") => Ok(RelayMessage::Notice {
                message: str_at(1).unwrap_or_default(),
            }),
            Some("AUTH") => Ok(RelayMessage::Auth {
                challenge: str_at(1).unwrap_or_default(),
            }),
            Some(other) => Err(Error::Validation(format!("unknown relay frame '{other}'"))),
            None => Err(missing("type")),
        }
    }
}
