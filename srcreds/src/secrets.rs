use std::collections::BTreeMap;
use std::sync::Mutex;

use log::warn;
use url::Url;

use crate::keyring::Keyring;
use crate::node::keyring_from_config_bytes;
use crate::{BasicCredentials, DOCKER_CFG_KEY, DOCKER_CONFIG_JSON_KEY, Error};

pub const SECRET_TYPE_DOCKER_CONFIG_JSON: &str = "kubernetes.io/dockerconfigjson";
pub const SECRET_TYPE_DOCKER_CFG: &str = "kubernetes.io/dockercfg";

// an opaque secret as handed over by the metadata plane: a type marker and
// decoded data items. only the docker auth types contribute to the keyring
#[derive(Debug, Clone)]
pub struct CredentialSecret {
    pub kind: String,
    pub data: BTreeMap<String, Vec<u8>>,
}

enum SecretState {
    Unbuilt(Vec<CredentialSecret>),
    Built(Keyring),
    Failed(String),
}

// keyring built from pull secrets. construction is lazy: the first basic()
// builds it, a persistent build error caps the keyring to empty
pub struct SecretCredentialStore {
    state: Mutex<SecretState>,
}

impl SecretCredentialStore {
    pub fn new(secrets: Vec<CredentialSecret>) -> Self {
        Self {
            state: Mutex::new(SecretState::Unbuilt(secrets)),
        }
    }

    fn build(secrets: &[CredentialSecret]) -> Result<Keyring, Error> {
        let mut keyring = Keyring::new();
        for secret in secrets {
            let data = match secret.kind.as_str() {
                SECRET_TYPE_DOCKER_CONFIG_JSON => secret.data.get(DOCKER_CONFIG_JSON_KEY),
                SECRET_TYPE_DOCKER_CFG => secret.data.get(DOCKER_CFG_KEY),
                _ => None,
            };
            let Some(data) = data else {
                continue;
            };
            let sub = keyring_from_config_bytes(data)?;
            keyring.merge(sub);
        }
        Ok(keyring)
    }

    fn with_keyring<T>(&self, f: impl FnOnce(&Keyring) -> T) -> Option<T> {
        let mut state = self.state.lock().unwrap();
        if let SecretState::Unbuilt(secrets) = &*state {
            *state = match Self::build(secrets) {
                Ok(keyring) => SecretState::Built(keyring),
                Err(e) => {
                    warn!("failed to build keyring from secrets: {:?}", e);
                    SecretState::Failed(format!("{:?}", e))
                }
            };
        }
        match &*state {
            SecretState::Built(keyring) => Some(f(keyring)),
            _ => None,
        }
    }
}

impl BasicCredentials for SecretCredentialStore {
    fn basic(&self, url: &Url) -> Option<(String, String)> {
        self.with_keyring(|k| k.lookup(url)).flatten()
    }

    fn err(&self) -> Option<String> {
        match &*self.state.lock().unwrap() {
            SecretState::Failed(e) => Some(e.clone()),
            _ => None,
        }
    }
}
