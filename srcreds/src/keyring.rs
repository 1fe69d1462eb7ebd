use std::collections::BTreeMap;

use url::Url;

use crate::BasicCredentials;

// lookup key for a registry url: host[:port] plus any path, with the docker
// api version path segment dropped. https urls already come to us with the
// default port stripped, http urls get an explicit :80 so that the two
// schemes never collide on the same key
pub fn lookup_key(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    let mut key = match url.scheme() {
        "http" => format!("{}:{}", host, url.port_or_known_default().unwrap_or(80)),
        _ => match url.port() {
            Some(p) => format!("{}:{}", host, p),
            None => host.to_string(),
        },
    };
    key.push_str(url.path());
    Some(normalize_key(&key))
}

// strip scheme, the /v1 /v2 api path and trailing slashes. docker config
// files carry keys in every one of these shapes
pub fn normalize_key(s: &str) -> String {
    let s = s
        .strip_prefix("https://")
        .or_else(|| s.strip_prefix("http://"))
        .unwrap_or(s);
    let s = s.trim_end_matches('/');
    let (host, path) = match s.split_once('/') {
        Some((h, p)) => (h, p),
        None => (s, ""),
    };
    let path = path
        .strip_prefix("v1/")
        .or_else(|| path.strip_prefix("v2/"))
        .unwrap_or(match path {
            "v1" | "v2" => "",
            p => p,
        });
    if path.is_empty() {
        host.to_string()
    } else {
        format!("{}/{}", host, path)
    }
}

// the legacy docker.io remaps. these must stay bit-exact or existing pull
// secrets stop working
fn candidate_keys(url: &Url) -> Vec<String> {
    let Some(first) = lookup_key(url) else {
        return Vec::new();
    };
    let mut keys = vec![first];
    // bounded: every rule strictly shrinks or rewrites toward docker.io
    loop {
        let last = keys.last().unwrap().clone();
        let next = if last == "auth.docker.io/token" {
            Some(normalize_key("index.docker.io/v1"))
        } else if last == "index.docker.io" {
            Some("docker.io".to_string())
        } else if let Some(host) = last
            .strip_suffix(":443")
            .filter(|_| url.scheme() != "http")
        {
            Some(host.to_string())
        } else if let Some(host) = last.strip_suffix(":80").filter(|_| url.scheme() == "http") {
            Some(host.to_string())
        } else {
            None
        };
        match next {
            Some(k) if !keys.contains(&k) => keys.push(k),
            _ => break,
        }
    }
    keys
}

#[derive(Default)]
pub struct Keyring {
    entries: BTreeMap<String, (String, String)>,
}

impl Keyring {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: &str, user: String, pass: String) {
        self.entries.insert(normalize_key(key), (user, pass));
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    // later entries win, matching how docker merges config files
    pub fn merge(&mut self, other: Keyring) {
        self.entries.extend(other.entries);
    }

    pub fn lookup(&self, url: &Url) -> Option<(String, String)> {
        candidate_keys(url)
            .iter()
            .find_map(|k| self.entries.get(k).cloned())
    }
}

impl BasicCredentials for Keyring {
    fn basic(&self, url: &Url) -> Option<(String, String)> {
        self.lookup(url)
    }
}
