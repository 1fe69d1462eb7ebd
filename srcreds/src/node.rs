use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use base64::Engine;
use log::{info, warn};
use serde::Deserialize;
use url::Url;

use crate::keyring::Keyring;
use crate::{BasicCredentials, Error};

// the two docker config shapes found on nodes: config.json wraps the map in
// an auths key, the older .dockercfg is the bare map
#[derive(Deserialize)]
struct DockerConfigJson {
    auths: BTreeMap<String, DockerConfigEntry>,
}

#[derive(Deserialize)]
pub(crate) struct DockerConfigEntry {
    pub username: Option<String>,
    pub password: Option<String>,
    pub auth: Option<String>,
}

impl DockerConfigEntry {
    // auth is base64("user:pass") and wins over the split fields when both
    // are present
    pub fn credentials(&self) -> Result<(String, String), Error> {
        if let Some(auth) = &self.auth {
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(auth)
                .map_err(|_| Error::BadAuth("auth field is not base64".to_string()))?;
            let decoded = String::from_utf8(decoded)
                .map_err(|_| Error::BadAuth("auth field is not utf-8".to_string()))?;
            let (user, pass) = decoded
                .split_once(':')
                .ok_or_else(|| Error::BadAuth("auth field has no colon".to_string()))?;
            return Ok((user.to_string(), pass.to_string()));
        }
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => Ok((u.clone(), p.clone())),
            _ => Err(Error::BadAuth("entry has neither auth nor username/password".to_string())),
        }
    }
}

pub(crate) fn keyring_from_config_bytes(data: &[u8]) -> Result<Keyring, Error> {
    let entries: BTreeMap<String, DockerConfigEntry> =
        match serde_json::from_slice::<DockerConfigJson>(data) {
            Ok(cfg) => cfg.auths,
            Err(_) => serde_json::from_slice(data)?,
        };
    let mut keyring = Keyring::new();
    for (key, entry) in entries {
        match entry.credentials() {
            Ok((user, pass)) => keyring.insert(&key, user, pass),
            Err(e) => {
                warn!("skipping docker config entry {}: {:?}", key, e);
            }
        }
    }
    Ok(keyring)
}

enum NodeState {
    Unloaded,
    Loaded(Keyring),
    Failed(String),
}

// credentials from a well-known docker config location on the node. loaded
// on first use, a load error caps the keyring to empty and is kept around
// for err()
pub struct NodeCredentialStore {
    path: PathBuf,
    state: Mutex<NodeState>,
}

impl NodeCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(NodeState::Unloaded),
        }
    }

    fn load(&self) -> Result<Keyring, Error> {
        let data = std::fs::read(&self.path)?;
        let keyring = keyring_from_config_bytes(&data)?;
        info!("loaded node credentials from {:?}", self.path);
        Ok(keyring)
    }

    fn with_keyring<T>(&self, f: impl FnOnce(&Keyring) -> T) -> Option<T> {
        let mut state = self.state.lock().unwrap();
        if let NodeState::Unloaded = *state {
            *state = match self.load() {
                Ok(keyring) => NodeState::Loaded(keyring),
                Err(e) => {
                    warn!("failed to load node credentials from {:?}: {:?}", self.path, e);
                    NodeState::Failed(format!("{:?}", e))
                }
            };
        }
        match &*state {
            NodeState::Loaded(keyring) => Some(f(keyring)),
            _ => None,
        }
    }
}

impl BasicCredentials for NodeCredentialStore {
    fn basic(&self, url: &Url) -> Option<(String, String)> {
        self.with_keyring(|k| k.lookup(url)).flatten()
    }

    fn err(&self) -> Option<String> {
        match &*self.state.lock().unwrap() {
            NodeState::Failed(e) => Some(e.clone()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse_registry_url;
    use std::io::Write;

    #[test]
    fn test_config_json_with_auths() {
        let data = br#"{"auths":{"registry.example.com":{"auth":"dXNlcjpwYXNz"}}}"#;
        let keyring = keyring_from_config_bytes(data).unwrap();
        let url = parse_registry_url("registry.example.com").unwrap();
        assert_eq!(
            keyring.lookup(&url),
            Some(("user".to_string(), "pass".to_string()))
        );
    }

    #[test]
    fn test_bare_dockercfg() {
        let data = br#"{"registry.example.com":{"username":"u","password":"p"}}"#;
        let keyring = keyring_from_config_bytes(data).unwrap();
        let url = parse_registry_url("registry.example.com").unwrap();
        assert_eq!(keyring.lookup(&url), Some(("u".to_string(), "p".to_string())));
    }

    #[test]
    fn test_load_error_retained() {
        let store = NodeCredentialStore::new("/does/not/exist/config.json");
        let url = parse_registry_url("registry.example.com").unwrap();
        assert_eq!(store.basic(&url), None);
        assert!(store.err().is_some());
    }

    #[test]
    fn test_load_from_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(br#"{"auths":{"r.example.com":{"auth":"dXNlcjpwYXNz"}}}"#)
            .unwrap();
        let store = NodeCredentialStore::new(f.path());
        let url = parse_registry_url("r.example.com").unwrap();
        assert_eq!(
            store.basic(&url),
            Some(("user".to_string(), "pass".to_string()))
        );
        assert!(store.err().is_none());
    }
}
