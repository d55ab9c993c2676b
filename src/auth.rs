use std::{collections::HashSet, fs, path::Path};

use eyre::{Result, WrapErr};
use russh_keys::{key::PublicKey, parse_public_key_base64, PublicKeyBase64};
use tracing::warn;

/// Inbound public keys allowed to reach authentication, keyed by their
/// wire-format blob.
#[derive(Clone, Debug, Default)]
pub struct AuthorizedKeys {
    keys: HashSet<Vec<u8>>,
}

impl AuthorizedKeys {
    /// Reads an OpenSSH `authorized_keys` file. Lines that do not hold a
    /// parseable public key are skipped with a warning; failing to read
    /// the file at all is fatal.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = fs::read_to_string(path)
            .wrap_err_with(|| format!("failed to read authorized keys from {}", path.display()))?;

        let mut keys = HashSet::new();

        for (number, line) in content.lines().enumerate() {
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            match parse_line(line) {
                Some(key) => {
                    keys.insert(key.public_key_bytes());
                }
                None => warn!(line = number + 1, "skipping malformed authorized key"),
            }
        }

        Ok(Self { keys })
    }

    pub fn contains(&self, key: &PublicKey) -> bool {
        self.keys.contains(&key.public_key_bytes())
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

// A record is `[options] <algorithm> <base64> [comment]`; the key is the
// first token that decodes.
fn parse_line(line: &str) -> Option<PublicKey> {
    line.split_whitespace()
        .find_map(|token| parse_public_key_base64(token).ok())
}
