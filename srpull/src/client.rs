use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};
use log::{error, trace, warn};
use moka::{Expiry, future::Cache};
use oci_spec::{
    distribution::Reference,
    image::{Descriptor, Digest},
};
use reqwest::{Method, Response, StatusCode, header, header::HeaderValue};
use serde::Deserialize;
use tokio::sync::RwLock;

use srdriver::{BlobStream, OCTET_STREAM};
use sroci::digest::verify_payload;
use sroci::manifest::{
    DOCKER_MANIFEST_LIST_V2, DOCKER_MANIFEST_V1, DOCKER_MANIFEST_V1_SIGNED, DOCKER_MANIFEST_V2,
    OCI_IMAGE_INDEX_V1, OCI_IMAGE_MANIFEST_V1,
};

const DOCKER_CONTENT_DIGEST_HEADER: &str = "docker-content-digest";

// every member of the family, we serve whatever the remote has
const ACCEPTED_MANIFESTS: &str = concat!(
    "application/vnd.oci.image.manifest.v1+json, ",
    "application/vnd.oci.image.index.v1+json, ",
    "application/vnd.docker.distribution.manifest.v2+json, ",
    "application/vnd.docker.distribution.manifest.list.v2+json, ",
    "application/vnd.docker.distribution.manifest.v1+prettyjws, ",
    "application/vnd.docker.distribution.manifest.v1+json"
);

// if they don't send ratelimit-reset, default to 1 minute (guessing)
const DEFAULT_RATELIMIT_RESET: u64 = 60;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    Reqwest(#[from] reqwest::Error),
    DigestMismatch,
    SizeMismatch,
    BadDigest,
    BadDockerContentDigest,
    BadContentType(String),
    TooManyRequests,
    Unauthorized,
    StatusNotOk(StatusCode),
    Unknown,
}

// how wrong is this?
impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

// key is registry/repository, scope is always pull-only here
#[derive(PartialEq, Eq, Hash, Debug)]
struct TokenCacheKey(String);

impl From<&Reference> for TokenCacheKey {
    fn from(reference: &Reference) -> Self {
        Self(format!(
            "{}/{}",
            reference.resolve_registry(),
            reference.repository()
        ))
    }
}

#[derive(Clone)]
struct Token {
    token: String,
    expires_in: Duration,
}

#[derive(Default)]
struct ExpireToken;

impl Expiry<TokenCacheKey, Token> for ExpireToken {
    fn expire_after_create(
        &self,
        _key: &TokenCacheKey,
        value: &Token,
        _current_time: Instant,
    ) -> Option<Duration> {
        trace!("{_key:?} expires in {:?}", value.expires_in);
        Some(value.expires_in)
    }
}

type UtcInstant = DateTime<Utc>;
type RatelimitMap = BTreeMap<String, UtcInstant>;

// process-wide remote side: connection pools, the bearer token cache and the
// per-registry ratelimit backoff window. per-repository state (credentials,
// insecure transport) lives on RemoteRepository
#[derive(Clone)]
pub struct RemoteClient {
    client: reqwest::Client,
    insecure_client: reqwest::Client,
    token_cache: Cache<TokenCacheKey, Token>,
    ratelimit: Arc<RwLock<RatelimitMap>>,
}

impl RemoteClient {
    pub fn new() -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(2))
            .https_only(true)
            .build()?;

        // plain http and broken certs allowed, used only for repositories the
        // stream's import policy marks insecure
        let insecure_client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(2))
            .danger_accept_invalid_certs(true)
            .build()?;

        let token_cache = Cache::builder()
            .max_capacity(10_000_000)
            .weigher(|k: &TokenCacheKey, v: &Token| {
                (k.0.len() + v.token.len()).try_into().unwrap_or(u32::MAX)
            })
            .expire_after(ExpireToken)
            .build();

        Ok(RemoteClient {
            client,
            insecure_client,
            token_cache,
            ratelimit: Arc::new(RwLock::new(BTreeMap::new())),
        })
    }

    // a handle for one remote repository with its resolved credentials
    pub fn repository(
        &self,
        reference: Reference,
        credentials: Option<(String, String)>,
        insecure: bool,
    ) -> RemoteRepository {
        RemoteRepository {
            client: self.clone(),
            reference,
            credentials,
            insecure,
        }
    }

    async fn check_ratelimit(&self, registry: &str) -> Result<(), ClientError> {
        let mut remove = false;
        if let Some(ratelimit_end) = self.ratelimit.read().await.get(registry) {
            if Utc::now() < *ratelimit_end {
                warn!("{} still in ratelimit reset period", registry);
                return Err(ClientError::TooManyRequests);
            } else {
                remove = true;
            }
        }
        if remove {
            self.ratelimit.write().await.remove(registry);
        }
        Ok(())
    }

    async fn handle_ratelimit(&self, registry: &str, res: &Response) -> Result<(), ClientError> {
        if res.status() != StatusCode::TOO_MANY_REQUESTS {
            return Ok(());
        }
        let end = match get_ratelimit_reset_header(res.headers()) {
            Some(reset) => {
                let now = Utc::now();
                // docker and github both send the timestamp when it resets,
                // but a duration shows up in the wild too
                match i64::try_from(reset)
                    .ok()
                    .and_then(|x| DateTime::<Utc>::from_timestamp(x, 0))
                {
                    Some(time) if time > now => time,
                    _ => now + Duration::from_secs(reset.min(24 * 3600)),
                }
            }
            None => Utc::now() + Duration::from_secs(DEFAULT_RATELIMIT_RESET),
        };
        warn!("hit ratelimit on registry={} res.url={}", registry, res.url());
        self.ratelimit
            .write()
            .await
            .insert(registry.to_string(), end);
        Err(ClientError::TooManyRequests)
    }
}

pub struct RemoteRepository {
    client: RemoteClient,
    reference: Reference,
    credentials: Option<(String, String)>,
    insecure: bool,
}

impl RemoteRepository {
    pub fn registry(&self) -> &str {
        self.reference.resolve_registry()
    }

    pub fn reference(&self) -> &Reference {
        &self.reference
    }

    fn http(&self) -> &reqwest::Client {
        if self.insecure {
            &self.client.insecure_client
        } else {
            &self.client.client
        }
    }

    fn blob_url(&self, scheme: &str, digest: &Digest) -> String {
        format!(
            "{}://{}/v2/{}/blobs/{}",
            scheme,
            self.reference.resolve_registry(),
            self.reference.repository(),
            digest
        )
    }

    fn manifest_url(&self, scheme: &str, reference: &str) -> String {
        format!(
            "{}://{}/v2/{}/manifests/{}",
            scheme,
            self.reference.resolve_registry(),
            self.reference.repository(),
            reference
        )
    }

    pub async fn stat_blob(&self, digest: &Digest) -> Result<Option<Descriptor>, ClientError> {
        let response = self
            .request(Method::HEAD, |scheme| self.blob_url(scheme, digest), None)
            .await?;
        match response.status() {
            StatusCode::OK => {
                let size = response
                    .headers()
                    .get(header::CONTENT_LENGTH)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(0);
                let media_type = response
                    .headers()
                    .get(header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or(OCTET_STREAM);
                Ok(Some(Descriptor::new(
                    media_type.into(),
                    size,
                    digest.clone(),
                )))
            }
            StatusCode::NOT_FOUND => Ok(None),
            _ => Err(status_not_ok(response).await),
        }
    }

    // streaming read for serving a client. some upstreams answer 200 or 203
    // where we might expect 206, there is no seeking here, just chunks until
    // the body ends
    pub async fn open_blob(
        &self,
        digest: &Digest,
    ) -> Result<Option<(u64, BlobStream)>, ClientError> {
        let response = self
            .request(Method::GET, |scheme| self.blob_url(scheme, digest), None)
            .await?;
        match response.status() {
            StatusCode::OK | StatusCode::NON_AUTHORITATIVE_INFORMATION => {
                let len = response.content_length().unwrap_or(0);
                let stream = response
                    .bytes_stream()
                    .map_err(std::io::Error::other)
                    .boxed();
                Ok(Some((len, stream)))
            }
            StatusCode::NOT_FOUND => Ok(None),
            _ => Err(status_not_ok(response).await),
        }
    }

    // buffered read with digest and size verification, for mirroring into
    // local storage
    pub async fn get_blob(&self, descriptor: &Descriptor) -> Result<Option<Bytes>, ClientError> {
        let response = self
            .request(
                Method::GET,
                |scheme| self.blob_url(scheme, descriptor.digest()),
                None,
            )
            .await?;
        match response.status() {
            StatusCode::OK => {
                let data = response.bytes().await?;
                if descriptor.size() != 0 && descriptor.size() != data.len() as u64 {
                    return Err(ClientError::SizeMismatch);
                }
                verify_payload(descriptor.digest(), &data)
                    .map_err(|_| ClientError::DigestMismatch)?;
                Ok(Some(data))
            }
            StatusCode::NOT_FOUND => Ok(None),
            _ => Err(status_not_ok(response).await),
        }
    }

    // fetch by tag or digest, returns (content type, digest, payload). the
    // digest comes from the request when pulling by digest, else from the
    // docker-content-digest header, else from hashing the payload, and is
    // always verified against the bytes
    pub async fn get_manifest(
        &self,
        reference: &str,
    ) -> Result<Option<(String, Digest, Bytes)>, ClientError> {
        let by_digest: Option<Digest> = reference.parse().ok();
        let response = self
            .request(
                Method::GET,
                |scheme| self.manifest_url(scheme, reference),
                Some(ACCEPTED_MANIFESTS),
            )
            .await?;
        match response.status() {
            StatusCode::OK => {
                let digest = match by_digest {
                    Some(d) => Some(d),
                    None => get_docker_content_digest(&response)?,
                };
                let content_type = response
                    .headers()
                    .get(header::CONTENT_TYPE)
                    .map(|x| x.to_str().unwrap_or("").to_string())
                    .unwrap_or_else(String::new);
                let data = response.bytes().await?;
                let digest = match digest {
                    Some(d) => {
                        // signed schema 1 digests address the stripped
                        // payload so they cannot be checked byte for byte
                        if content_type != DOCKER_MANIFEST_V1_SIGNED {
                            verify_payload(&d, &data).map_err(|_| ClientError::DigestMismatch)?;
                        }
                        d
                    }
                    None => sroci::digest::payload_digest(&data),
                };
                if !matches!(
                    content_type.as_str(),
                    OCI_IMAGE_MANIFEST_V1
                        | OCI_IMAGE_INDEX_V1
                        | DOCKER_MANIFEST_V2
                        | DOCKER_MANIFEST_LIST_V2
                        | DOCKER_MANIFEST_V1
                        | DOCKER_MANIFEST_V1_SIGNED
                ) {
                    return Err(ClientError::BadContentType(content_type));
                }
                Ok(Some((content_type, digest, data)))
            }
            StatusCode::NOT_FOUND => Ok(None),
            _ => Err(status_not_ok(response).await),
        }
    }

    // send with the cached token if any, and on 401 negotiate one from the
    // WWW-Authenticate challenge and retry once. concurrent requests can race
    // on a stale token, they will each fail and re-fetch, which is fine
    async fn request(
        &self,
        method: Method,
        url: impl Fn(&str) -> String,
        accept: Option<&str>,
    ) -> Result<Response, ClientError> {
        let registry = self.reference.resolve_registry().to_string();
        self.client.check_ratelimit(&registry).await?;

        let send_once = |scheme: &str, token: Option<String>| {
            let mut req = self.http().request(method.clone(), url(scheme));
            if let Some(accept) = accept {
                req = req.header(header::ACCEPT, accept);
            }
            if let Some(token) = token {
                req = req.bearer_auth(token);
            }
            req.send()
        };

        let scheme = "https";
        let token = self
            .client
            .token_cache
            .get(&TokenCacheKey::from(&self.reference))
            .await
            .map(|t| t.token);
        let res = match send_once(scheme, token.clone()).await {
            Ok(res) => res,
            // registries marked insecure may only speak plain http, and a
            // https attempt against one fails in transport-specific ways, so
            // any send error falls back
            Err(e) if self.insecure => {
                trace!("https to insecure registry {} failed ({:?}), retrying http", registry, e);
                send_once("http", token).await?
            }
            Err(e) => return Err(e.into()),
        };

        self.client.handle_ratelimit(&registry, &res).await?;

        if res.status() != StatusCode::UNAUTHORIZED {
            return Ok(res);
        }

        let scheme = if res.url().scheme() == "http" { "http" } else { "https" };
        let challenge = res
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .and_then(parse_www_authenticate)
            .ok_or_else(|| {
                error!(
                    "401 from {} but no usable www-authenticate header {:?}",
                    registry,
                    res.headers().get(header::WWW_AUTHENTICATE)
                );
                ClientError::Unauthorized
            })?;

        let res = match challenge {
            Challenge::Bearer { realm, service } => {
                let token = self.fetch_token(&realm, &service).await?;
                self.client
                    .token_cache
                    .insert((&self.reference).into(), token.clone())
                    .await;
                let mut req = self.http().request(method.clone(), url(scheme));
                if let Some(accept) = accept {
                    req = req.header(header::ACCEPT, accept);
                }
                req.bearer_auth(token.token).send().await?
            }
            Challenge::Basic => {
                let Some((user, pass)) = &self.credentials else {
                    return Err(ClientError::Unauthorized);
                };
                let mut req = self.http().request(method.clone(), url(scheme));
                if let Some(accept) = accept {
                    req = req.header(header::ACCEPT, accept);
                }
                req.basic_auth(user, Some(pass)).send().await?
            }
        };

        self.client.handle_ratelimit(&registry, &res).await?;
        Ok(res)
    }

    async fn fetch_token(&self, realm: &str, service: &str) -> Result<Token, ClientError> {
        #[derive(Deserialize)]
        struct JsonToken {
            token: Option<String>,
            access_token: Option<String>,
            expires_in: Option<u64>,
        }

        let scope = format!("repository:{}:pull", self.reference.repository());
        let mut req = self
            .http()
            .request(Method::GET, realm)
            .query(&[("scope", scope), ("service", service.to_string())]);
        if let Some((user, pass)) = &self.credentials {
            req = req.basic_auth(user, Some(pass));
        }
        let token = req.send().await?.json::<JsonToken>().await?;

        // the auth spec gives 60 seconds as the default lifetime
        let expires_in = Duration::from_secs(token.expires_in.unwrap_or(60));
        let token = token
            .token
            .or(token.access_token)
            .ok_or(ClientError::Unauthorized)?;
        Ok(Token { token, expires_in })
    }
}

async fn status_not_ok(res: Response) -> ClientError {
    let status = res.status();
    if status == StatusCode::TOO_MANY_REQUESTS {
        return ClientError::TooManyRequests;
    }
    if log::log_enabled!(log::Level::Trace) {
        match res.text().await {
            Ok(body) => trace!("status={}, body={}", status, body),
            Err(e) => trace!("unhandled error getting body, status={status}, error={e:?}"),
        }
    }
    ClientError::StatusNotOk(status)
}

fn get_docker_content_digest(response: &Response) -> Result<Option<Digest>, ClientError> {
    response
        .headers()
        .get(DOCKER_CONTENT_DIGEST_HEADER)
        .map(|header_value| -> Result<Digest, ClientError> {
            header_value
                .to_str()
                .map_err(|_| ClientError::BadDockerContentDigest)?
                .parse()
                .map_err(|_| ClientError::BadDockerContentDigest)
        })
        .transpose()
}

enum Challenge {
    Bearer { realm: String, service: String },
    Basic,
}

fn parse_www_authenticate(input: &HeaderValue) -> Option<Challenge> {
    let input = input.to_str().ok()?;
    if input.trim_start().starts_with("Basic") {
        return Some(Challenge::Basic);
    }
    let fields = parse_bearer_fields(input)?;
    let mut realm = None;
    let mut service = None;
    for (k, v) in fields {
        match k {
            "realm" => realm = Some(v.to_string()),
            "service" => service = Some(v.to_string()),
            _ => {}
        }
    }
    Some(Challenge::Bearer {
        realm: realm?,
        service: service?,
    })
}

fn parse_bearer_fields(input: &str) -> Option<Vec<(&str, &str)>> {
    use nom::{
        IResult, Parser,
        bytes::{complete::tag, take_until1},
        character::complete::{alpha1, char},
        multi::{many0, many1, separated_list0},
        sequence::{delimited, preceded, separated_pair, terminated},
    };
    fn parser(input: &str) -> IResult<&str, Vec<(&str, &str)>> {
        preceded(
            terminated(tag("Bearer"), many1(tag(" "))),
            separated_list0(
                terminated(tag(","), many0(tag(" "))),
                separated_pair(
                    alpha1,
                    tag("="),
                    delimited(char('"'), take_until1("\""), char('"')),
                ),
            ),
        )
        .parse(input)
    }
    let (_, fields) = parser(input).ok()?;
    Some(fields)
}

fn get_ratelimit_reset_header(map: &header::HeaderMap) -> Option<u64> {
    let value = map
        .get("ratelimit-reset")
        .or_else(|| map.get("x-ratelimit-reset"))?;
    value.to_str().ok()?.parse().ok()
}
