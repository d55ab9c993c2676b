use std::{
    fs,
    net::IpAddr,
    path::{Path, PathBuf},
};

use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::egress::HostKeyPolicy;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_path_to_error::Error<serde_json::Error>,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Startup configuration. Unknown keys are ignored; fields left empty in
/// the file take the defaults below.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct Config {
    pub permit_password_login: bool,
    pub permit_key_login: bool,
    pub permit_root_login: bool,
    pub authorized_keys_file: PathBuf,
    pub private_key_file: PathBuf,
    pub user_keys_dir: PathBuf,
    pub listen_address: String,
    pub listen_port: u16,
    pub data_store_type: String,
    /// Deadline for dialing a backend, in seconds.
    pub dial_timeout: u64,
    pub host_key_policy: HostKeyPolicy,
    pub log: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            permit_password_login: false,
            permit_key_login: true,
            permit_root_login: false,
            authorized_keys_file: "/etc/open-bastion/authorized_keys".into(),
            private_key_file: "/etc/open-bastion/host_key".into(),
            user_keys_dir: "/var/lib/open-bastion/users".into(),
            listen_address: "0.0.0.0".to_string(),
            listen_port: 22,
            data_store_type: "system".to_string(),
            dial_timeout: 1,
            host_key_policy: HostKeyPolicy::default(),
            log: LogConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct LogConfig {
    /// Destination file; empty means stderr.
    pub path: String,
    pub is_json: bool,
    /// -1 is trace, 0 debug, 1 info, 2 warn, 3 and above error. Values
    /// outside the range are clamped.
    pub level: i8,
    pub report_caller: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            is_json: false,
            level: 1,
            report_caller: false,
        }
    }
}

impl LogConfig {
    pub fn level_filter(&self) -> LevelFilter {
        match self.level.clamp(-1, 5) {
            -1 => LevelFilter::TRACE,
            0 => LevelFilter::DEBUG,
            1 => LevelFilter::INFO,
            2 => LevelFilter::WARN,
            _ => LevelFilter::ERROR,
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();

        let content = fs::read_to_string(path).map_err(|source| Error::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let deserializer = &mut serde_json::Deserializer::from_str(&content);
        let config: Self =
            serde_path_to_error::deserialize(deserializer).map_err(|source| Error::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        let config = config.or_defaults();
        config.validate()?;

        Ok(config)
    }

    /// Empty fields fall back to their defaults, matching how an absent
    /// field behaves.
    fn or_defaults(mut self) -> Self {
        let defaults = Self::default();

        if self.authorized_keys_file.as_os_str().is_empty() {
            self.authorized_keys_file = defaults.authorized_keys_file;
        }

        if self.private_key_file.as_os_str().is_empty() {
            self.private_key_file = defaults.private_key_file;
        }

        if self.user_keys_dir.as_os_str().is_empty() {
            self.user_keys_dir = defaults.user_keys_dir;
        }

        if self.listen_address.is_empty() {
            self.listen_address = defaults.listen_address;
        }

        if self.listen_port == 0 {
            self.listen_port = defaults.listen_port;
        }

        if self.data_store_type.is_empty() {
            self.data_store_type = defaults.data_store_type;
        }

        if self.dial_timeout == 0 {
            self.dial_timeout = defaults.dial_timeout;
        }

        self
    }

    fn validate(&self) -> Result<(), Error> {
        if self.permit_password_login && !self.permit_key_login {
            return Err(Error::Invalid(
                "PermitPasswordLogin requires PermitKeyLogin".to_string(),
            ));
        }

        if self.listen_address.parse::<IpAddr>().is_err() {
            return Err(Error::Invalid(format!(
                "ListenAddress {:?} is not an IP address",
                self.listen_address
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use pretty_assertions::assert_eq;
    use tempfile::NamedTempFile;

    use super::*;

    fn load(content: &str) -> Result<Config, Error> {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();

        Config::load(file.path())
    }

    #[test]
    fn empty_object_takes_defaults() {
        let config = load("{}").unwrap();

        assert_eq!(config.listen_address, "0.0.0.0");
        assert_eq!(config.listen_port, 22);
        assert_eq!(config.data_store_type, "system");
        assert_eq!(config.dial_timeout, 1);
        assert!(config.permit_key_login);
        assert!(!config.permit_password_login);
        assert_eq!(config.log.level, 1);
    }

    #[test]
    fn empty_strings_take_defaults() {
        let config = load(
            r#"{"ListenAddress": "", "DataStoreType": "", "AuthorizedKeysFile": "", "ListenPort": 0}"#,
        )
        .unwrap();

        assert_eq!(config.listen_address, "0.0.0.0");
        assert_eq!(config.listen_port, 22);
        assert_eq!(config.data_store_type, "system");
        assert_eq!(
            config.authorized_keys_file,
            PathBuf::from("/etc/open-bastion/authorized_keys")
        );
    }

    #[test]
    fn full_config_parses() {
        let config = load(
            r#"{
                "PermitKeyLogin": true,
                "AuthorizedKeysFile": "/tmp/ak",
                "PrivateKeyFile": "/tmp/host",
                "UserKeysDir": "/tmp/users",
                "ListenAddress": "127.0.0.1",
                "ListenPort": 2022,
                "DialTimeout": 5,
                "HostKeyPolicy": "reject-unknown",
                "Log": {"Path": "/tmp/log", "IsJson": true, "Level": 0, "ReportCaller": true}
            }"#,
        )
        .unwrap();

        assert_eq!(config.listen_address, "127.0.0.1");
        assert_eq!(config.listen_port, 2022);
        assert_eq!(config.dial_timeout, 5);
        assert_eq!(config.host_key_policy, HostKeyPolicy::RejectUnknown);
        assert!(config.log.is_json);
        assert!(config.log.report_caller);
        assert_eq!(config.log.level_filter(), LevelFilter::DEBUG);
    }

    #[test]
    fn unknown_keys_are_ignored() {
        assert!(load(r#"{"NotARealOption": 1}"#).is_ok());
    }

    #[test]
    fn password_login_requires_key_login() {
        let result = load(r#"{"PermitPasswordLogin": true, "PermitKeyLogin": false}"#);

        assert!(matches!(result, Err(Error::Invalid(_))));
    }

    #[test]
    fn listen_address_must_be_ip() {
        let result = load(r#"{"ListenAddress": "bastion.example.com"}"#);

        assert!(matches!(result, Err(Error::Invalid(_))));
    }

    #[test]
    fn out_of_range_port_is_fatal() {
        assert!(matches!(
            load(r#"{"ListenPort": 70000}"#),
            Err(Error::Parse { .. })
        ));
        assert!(matches!(
            load(r#"{"ListenPort": -1}"#),
            Err(Error::Parse { .. })
        ));
    }

    #[test]
    fn malformed_json_is_fatal() {
        assert!(matches!(load(r#"{"ListenPort"22}"#), Err(Error::Parse { .. })));
    }

    #[test]
    fn missing_file_is_fatal() {
        assert!(matches!(
            Config::load("/nonexistent/open-bastion.json"),
            Err(Error::Read { .. })
        ));
    }

    #[test]
    fn log_levels_clamp() {
        for (level, expected) in [
            (-8, LevelFilter::TRACE),
            (-1, LevelFilter::TRACE),
            (0, LevelFilter::DEBUG),
            (1, LevelFilter::INFO),
            (2, LevelFilter::WARN),
            (3, LevelFilter::ERROR),
            (5, LevelFilter::ERROR),
            (7, LevelFilter::ERROR),
        ] {
            let log = LogConfig {
                level,
                ..LogConfig::default()
            };

            assert_eq!(log.level_filter(), expected, "level {level}");
        }
    }
}
