pub mod system;

use lazy_static::lazy_static;
use regex::Regex;
use russh_keys::key::KeyPair;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use system::SystemStore;

use crate::config::Config;

/// Longest login the store will accept.
pub const MAX_USERNAME_LEN: usize = 32;

lazy_static! {
    // The rule Debian applies to new account names.
    static ref USERNAME: Regex = Regex::new(r"^[a-z_][a-z0-9_-]*\$?$").expect("static pattern");
}

pub fn valid_username(name: &str) -> bool {
    name.len() <= MAX_USERNAME_LEN && USERNAME.is_match(name)
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid username")]
    InvalidUsername,
    #[error("user {0} already exists")]
    AlreadyExists(String),
    #[error("cannot read key")]
    ReadKey(#[source] std::io::Error),
    #[error("failed to parse private key : {0}")]
    ParseKey(#[source] russh_keys::Error),
    #[error("failed to generate key pair")]
    Keygen,
    #[error("user info for {user} is not valid JSON: {source}")]
    Info {
        user: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("data store type {0:?} is not implemented")]
    UnknownBackend(String),
    #[error(transparent)]
    Key(#[from] russh_keys::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Lookup outcome for a login name. I/O and parse failures are reported
/// through [`Error`] instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum Status {
    Active,
    Inactive,
    /// The user directory does not exist or the login fails the validity
    /// rule.
    Invalid,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct UserInfo {
    pub active: bool,
    pub admin: bool,
}

/// The configured identity backend. A closed set keeps the trust boundary
/// explicit; `system` is the only backend today.
#[derive(Clone, Debug)]
pub enum Store {
    System(SystemStore),
}

impl Store {
    pub fn new(config: &Config) -> Result<Self, Error> {
        match config.data_store_type.as_str() {
            "system" => Ok(Self::System(SystemStore::open(&config.user_keys_dir)?)),
            other => Err(Error::UnknownBackend(other.to_string())),
        }
    }

    pub fn status(&self, username: &str) -> Result<Status, Error> {
        match self {
            Self::System(store) => store.status(username),
        }
    }

    /// Reads and parses the user's egress private key. The key is loaded
    /// fresh on every call and never cached across sessions.
    pub fn egress_signer(&self, username: &str) -> Result<KeyPair, Error> {
        match self {
            Self::System(store) => store.egress_signer(username),
        }
    }

    /// Creates the user and a fresh egress key pair, returning the public
    /// key in OpenSSH format.
    pub fn add_user(&self, username: &str) -> Result<String, Error> {
        match self {
            Self::System(store) => store.add_user(username),
        }
    }

    pub fn delete_user(&self, username: &str) -> Result<(), Error> {
        match self {
            Self::System(store) => store.delete_user(username),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn username_rule() {
        for name in ["alice", "_daemon", "a", "backup$", "db-ro_2", "x2"] {
            assert!(valid_username(name), "{name} should be valid");
        }

        for name in [
            "",
            "Alice",
            "0day",
            "-dash",
            "alice bob",
            "alice$extra",
            "alice@host",
            "root!",
        ] {
            assert!(!valid_username(name), "{name} should be invalid");
        }
    }

    #[test]
    fn username_length_boundary() {
        let max = "a".repeat(MAX_USERNAME_LEN);
        let over = "a".repeat(MAX_USERNAME_LEN + 1);

        assert!(valid_username(&max));
        assert!(!valid_username(&over));
    }

    #[test]
    fn unknown_backend_is_fatal() {
        let config = Config {
            data_store_type: "etcd".to_string(),
            ..Config::default()
        };

        assert!(matches!(
            Store::new(&config),
            Err(Error::UnknownBackend(_))
        ));
    }
}
