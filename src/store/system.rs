use std::{fs, os::unix::fs::PermissionsExt, path::PathBuf};

use russh_keys::{decode_secret_key, encode_pkcs8_pem, key::KeyPair, PublicKeyBase64};
use tracing::debug;

use super::{valid_username, Error, Status, UserInfo};

static INFO_FILE: &str = "info.json";
static KEYS_DIR: &str = "egress-keys";

/// Filesystem identity backend. Each user owns a directory under the
/// root holding `info.json` and an `egress-keys/` pair named after the
/// user.
#[derive(Clone, Debug)]
pub struct SystemStore {
    root: PathBuf,
}

impl SystemStore {
    /// Opens the store, creating the root directory when missing.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, Error> {
        let root = root.into();

        if !root.is_dir() {
            fs::create_dir_all(&root)?;
        }

        Ok(Self { root })
    }

    fn user_dir(&self, username: &str) -> PathBuf {
        self.root.join(username)
    }

    fn key_path(&self, username: &str) -> PathBuf {
        self.user_dir(username).join(KEYS_DIR).join(username)
    }

    pub fn status(&self, username: &str) -> Result<Status, Error> {
        if !valid_username(username) {
            return Ok(Status::Invalid);
        }

        let dir = self.user_dir(username);

        if !dir.is_dir() {
            return Ok(Status::Invalid);
        }

        let content = fs::read_to_string(dir.join(INFO_FILE))?;

        let info: UserInfo = serde_json::from_str(&content).map_err(|source| Error::Info {
            user: username.to_string(),
            source,
        })?;

        Ok(if info.active {
            Status::Active
        } else {
            Status::Inactive
        })
    }

    pub fn egress_signer(&self, username: &str) -> Result<KeyPair, Error> {
        if !valid_username(username) {
            return Err(Error::InvalidUsername);
        }

        let content = fs::read_to_string(self.key_path(username)).map_err(Error::ReadKey)?;

        decode_secret_key(&content, None).map_err(Error::ParseKey)
    }

    pub fn add_user(&self, username: &str) -> Result<String, Error> {
        if !valid_username(username) {
            return Err(Error::InvalidUsername);
        }

        if self.status(username)? != Status::Invalid {
            return Err(Error::AlreadyExists(username.to_string()));
        }

        let dir = self.user_dir(username);
        let keys_dir = dir.join(KEYS_DIR);
        fs::create_dir_all(&keys_dir)?;

        let info = UserInfo {
            active: true,
            admin: false,
        };
        let content = serde_json::to_vec(&info).map_err(|source| Error::Info {
            user: username.to_string(),
            source,
        })?;
        fs::write(dir.join(INFO_FILE), content)?;

        let key = KeyPair::generate_ed25519().ok_or(Error::Keygen)?;

        let mut pem = Vec::new();
        encode_pkcs8_pem(&key, &mut pem)?;

        let key_path = keys_dir.join(username);
        fs::write(&key_path, pem)?;
        fs::set_permissions(&key_path, fs::Permissions::from_mode(0o600))?;

        let public = key.clone_public_key()?;
        let public_line = format!("{} {} {username}", public.name(), public.public_key_base64());
        fs::write(key_path.with_extension("pub"), format!("{public_line}\n"))?;

        debug!(user = username, "created");

        Ok(public_line)
    }

    pub fn delete_user(&self, username: &str) -> Result<(), Error> {
        if !valid_username(username) {
            return Err(Error::InvalidUsername);
        }

        let dir = self.user_dir(username);

        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }

        debug!(user = username, "deleted");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;

    fn store() -> (TempDir, SystemStore) {
        let dir = TempDir::new().unwrap();
        let store = SystemStore::open(dir.path()).unwrap();

        (dir, store)
    }

    fn write_info(root: &Path, user: &str, content: &str) {
        let dir = root.join(user);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(INFO_FILE), content).unwrap();
    }

    #[test]
    fn status_truth_table() {
        let (dir, store) = store();

        write_info(dir.path(), "alice", r#"{"active":true}"#);
        write_info(dir.path(), "bob", r#"{"active":false}"#);
        write_info(dir.path(), "diane", r#"{"active"false}"#);

        assert_eq!(store.status("alice").unwrap(), Status::Active);
        assert_eq!(store.status("bob").unwrap(), Status::Inactive);
        assert!(matches!(store.status("diane"), Err(Error::Info { .. })));
        assert_eq!(store.status("nobody").unwrap(), Status::Invalid);
        assert_eq!(store.status("Not A User").unwrap(), Status::Invalid);
    }

    #[test]
    fn status_missing_info_file_is_an_error() {
        let (dir, store) = store();

        fs::create_dir_all(dir.path().join("carol")).unwrap();

        assert!(matches!(store.status("carol"), Err(Error::Io(_))));
    }

    #[test]
    fn add_then_lookup() {
        let (dir, store) = store();

        let public = store.add_user("alice").unwrap();

        assert!(public.starts_with("ssh-ed25519 "));
        assert!(public.ends_with(" alice"));
        assert_eq!(store.status("alice").unwrap(), Status::Active);

        // The generated private key parses back into a signer.
        store.egress_signer("alice").unwrap();

        let key_path = dir.path().join("alice").join(KEYS_DIR).join("alice");
        let mode = fs::metadata(&key_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert!(key_path.with_extension("pub").is_file());
    }

    #[test]
    fn add_existing_user_fails() {
        let (_dir, store) = store();

        store.add_user("alice").unwrap();

        assert!(matches!(
            store.add_user("alice"),
            Err(Error::AlreadyExists(_))
        ));
    }

    #[test]
    fn add_invalid_username_fails() {
        let (_dir, store) = store();

        assert!(matches!(
            store.add_user("Alice!"),
            Err(Error::InvalidUsername)
        ));
    }

    #[test]
    fn delete_removes_everything() {
        let (dir, store) = store();

        store.add_user("alice").unwrap();
        store.delete_user("alice").unwrap();

        assert_eq!(store.status("alice").unwrap(), Status::Invalid);
        assert!(matches!(
            store.egress_signer("alice"),
            Err(Error::ReadKey(_))
        ));
        assert!(!dir.path().join("alice").exists());
    }

    #[test]
    fn delete_missing_user_is_fine() {
        let (_dir, store) = store();

        store.delete_user("ghost").unwrap();
    }

    #[test]
    fn signer_for_invalid_username_fails() {
        let (_dir, store) = store();

        assert!(matches!(
            store.egress_signer("../../etc/passwd"),
            Err(Error::InvalidUsername)
        ));
    }

    #[test]
    fn signer_garbage_key_fails() {
        let (dir, store) = store();

        store.add_user("alice").unwrap();
        fs::write(
            dir.path().join("alice").join(KEYS_DIR).join("alice"),
            "not a key",
        )
        .unwrap();

        assert!(matches!(
            store.egress_signer("alice"),
            Err(Error::ParseKey(_))
        ));
    }

    #[test]
    fn open_creates_the_root() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("users");

        SystemStore::open(&root).unwrap();

        assert!(root.is_dir());
    }
}
