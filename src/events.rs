//! Line protocol for feeding host events into a [`crate::SessionGuard`].
//!
//! ```text
//! connect <identity> <address> [label...]
//! recheck <identity> <address> [label...]
//! disconnect <identity>
//! mode <monitor|enforce>
//! reload
//! ```
//!
//! Blank lines and lines starting with `#` are ignored.

use crate::config::EnforcementMode;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventParseError {
    #[error("unknown event '{0}'")]
    UnknownEvent(String),
    #[error("'{event}' is missing <{argument}>")]
    MissingArgument {
        event: &'static str,
        argument: &'static str,
    },
    #[error("'{0}' takes no arguments")]
    UnexpectedArgument(&'static str),
    #[error("{0}")]
    InvalidMode(String),
}

/// A host-side occurrence relevant to VPN checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    Connect {
        identity: String,
        address: String,
        label: String,
    },
    Recheck {
        identity: String,
        address: String,
        label: String,
    },
    Disconnect {
        identity: String,
    },
    Mode(EnforcementMode),
    Reload,
}

impl HostEvent {
    /// Parse one line. `Ok(None)` for blank and comment lines.
    pub fn parse_line(line: &str) -> Result<Option<Self>, EventParseError> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }

        let mut parts = line.split_whitespace();
        let Some(command) = parts.next() else {
            return Ok(None);
        };

        let event = match command.to_ascii_lowercase().as_str() {
            "connect" => {
                let (identity, address, label) = session_args("connect", &mut parts)?;
                HostEvent::Connect {
                    identity,
                    address,
                    label,
                }
            }
            "recheck" => {
                let (identity, address, label) = session_args("recheck", &mut parts)?;
                HostEvent::Recheck {
                    identity,
                    address,
                    label,
                }
            }
            "disconnect" => {
                let identity = required("disconnect", "identity", parts.next())?;
                HostEvent::Disconnect { identity }
            }
            "mode" => {
                let mode = required("mode", "monitor|enforce", parts.next())?;
                HostEvent::Mode(mode.parse().map_err(EventParseError::InvalidMode)?)
            }
            "reload" => {
                if parts.next().is_some() {
                    return Err(EventParseError::UnexpectedArgument("reload"));
                }
                HostEvent::Reload
            }
            other => return Err(EventParseError::UnknownEvent(other.to_string())),
        };

        Ok(Some(event))
    }
}

fn required(
    event: &'static str,
    argument: &'static str,
    value: Option<&str>,
) -> Result<String, EventParseError> {
    value
        .map(str::to_string)
        .ok_or(EventParseError::MissingArgument { event, argument })
}

fn session_args<'a>(
    event: &'static str,
    parts: &mut impl Iterator<Item = &'a str>,
) -> Result<(String, String, String), EventParseError> {
    let identity = required(event, "identity", parts.next())?;
    let address = required(event, "address", parts.next())?;
    let label = parts.collect::<Vec<_>>().join(" ");
    let label = if label.is_empty() {
        identity.clone()
    } else {
        label
    };
    Ok((identity, address, label))
}
