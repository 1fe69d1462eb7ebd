pub mod keyring;
pub mod node;
pub mod secrets;

use url::Url;

pub use keyring::Keyring;
pub use node::NodeCredentialStore;
pub use secrets::{CredentialSecret, SecretCredentialStore};

pub const DOCKER_CONFIG_JSON_KEY: &str = ".dockerconfigjson";
pub const DOCKER_CFG_KEY: &str = ".dockercfg";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    Io(#[from] std::io::Error),
    BadJson(#[from] serde_json::Error),
    BadAuth(String),
}

// how wrong is this?
impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

// one subordinate answer source. None means "don't know", load failures are
// retained on the store and surfaced by err(), never thrown at lookup time
pub trait BasicCredentials: Send + Sync {
    fn basic(&self, url: &Url) -> Option<(String, String)>;
    fn err(&self) -> Option<String> {
        None
    }
}

// ordered union, first store that knows the answer wins
pub struct UnionCredentialStore {
    stores: Vec<Box<dyn BasicCredentials>>,
}

impl UnionCredentialStore {
    pub fn new(stores: Vec<Box<dyn BasicCredentials>>) -> Self {
        Self { stores }
    }
}

impl BasicCredentials for UnionCredentialStore {
    fn basic(&self, url: &Url) -> Option<(String, String)> {
        self.stores.iter().find_map(|s| s.basic(url))
    }

    fn err(&self) -> Option<String> {
        self.stores.iter().find_map(|s| s.err())
    }
}

// registries are commonly referenced without a scheme, default to https so
// the port rules below come out right
pub fn parse_registry_url(s: &str) -> Option<Url> {
    if s.contains("://") {
        Url::parse(s).ok()
    } else {
        Url::parse(&format!("https://{}", s)).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    struct FixedStore(BTreeMap<String, (String, String)>);

    impl BasicCredentials for FixedStore {
        fn basic(&self, url: &Url) -> Option<(String, String)> {
            self.0.get(url.host_str()?).cloned()
        }
    }

    #[test]
    fn test_union_falls_through_to_second_store() {
        let empty = FixedStore(BTreeMap::new());
        let second = FixedStore(BTreeMap::from([(
            "registry1".to_string(),
            ("user".to_string(), "pass".to_string()),
        )]));
        let union = UnionCredentialStore::new(vec![Box::new(empty), Box::new(second)]);
        let url = parse_registry_url("registry1").unwrap();
        assert_eq!(
            union.basic(&url),
            Some(("user".to_string(), "pass".to_string()))
        );
    }

    #[test]
    fn test_union_first_wins() {
        let first = FixedStore(BTreeMap::from([(
            "registry1".to_string(),
            ("a".to_string(), "1".to_string()),
        )]));
        let second = FixedStore(BTreeMap::from([(
            "registry1".to_string(),
            ("b".to_string(), "2".to_string()),
        )]));
        let union = UnionCredentialStore::new(vec![Box::new(first), Box::new(second)]);
        let url = parse_registry_url("registry1").unwrap();
        assert_eq!(union.basic(&url), Some(("a".to_string(), "1".to_string())));
    }
}
