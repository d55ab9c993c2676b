use std::{fmt, str};

use strum_macros::{Display, EnumString};
use thiserror::Error;

/// Port used when the caller does not pass `-p`.
pub const DEFAULT_PORT: u16 = 22;

/// Verbs a caller may request. Only `ssh` is dispatched today; `telnet`
/// and `bastion` are reserved and surface as unimplemented.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Verb {
    Ssh,
    Telnet,
    Bastion,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid payload")]
    InvalidPayload,
    #[error("unknown command {0:?}")]
    CommandNotFound(String),
    #[error("invalid port option")]
    InvalidPort,
    #[error("could not parse destination")]
    InvalidDestination,
}

/// Where the caller wants to go. `user` is left unset when the payload
/// does not name one; the session fills in the caller's login before
/// dialing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Target {
    pub command: Verb,
    pub user: Option<String>,
    pub host: String,
    pub port: u16,
}

impl Target {
    /// Decodes an `exec` payload. Whitespace separated: the verb first,
    /// then any mix of `-p PORT`, `user@host` and bare host tokens. A
    /// later host token overrides an earlier one.
    pub fn parse(payload: &[u8]) -> Result<Self, ParseError> {
        let payload = str::from_utf8(payload).map_err(|_| ParseError::InvalidPayload)?;

        let mut tokens = payload.split_whitespace();

        let verb = tokens.next().ok_or(ParseError::InvalidPayload)?;
        let command = verb
            .parse::<Verb>()
            .map_err(|_| ParseError::CommandNotFound(verb.to_string()))?;

        let mut user = None;
        let mut host: Option<&str> = None;
        let mut port = None;

        while let Some(token) = tokens.next() {
            if token == "-p" {
                let value = tokens.next().ok_or(ParseError::InvalidPort)?;

                // Zero means unset, the default applies below.
                port = match value.parse::<i64>() {
                    Ok(0) => None,
                    Ok(number @ 1..=65535) => Some(number as u16),
                    _ => return Err(ParseError::InvalidPort),
                };

                continue;
            }

            match token.split('@').collect::<Vec<_>>()[..] {
                [destination] => host = Some(destination),
                [login, destination] => {
                    if !login.is_empty() {
                        user = Some(login.to_string());
                    }

                    host = Some(destination);
                }
                _ => return Err(ParseError::InvalidDestination),
            }
        }

        let host = host
            .filter(|destination| !destination.is_empty())
            .ok_or(ParseError::InvalidDestination)?;

        Ok(Self {
            command,
            user,
            host: host.to_string(),
            port: port.unwrap_or(DEFAULT_PORT),
        })
    }

    pub fn addr(&self) -> (String, u16) {
        (self.host.clone(), self.port)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ", self.command)?;

        if let Some(user) = &self.user {
            write!(f, "{user}@")?;
        }

        write!(f, "{} -p {}", self.host, self.port)
    }
}
