use std::sync::Arc;

use axum::Json;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use log::{info, warn};
use oci_spec::image::Digest;
use once_cell::sync::Lazy;
use serde::Deserialize;
use serde_json::json;

use crate::auth::{AccessRecord, AuthError, extract_token};
use crate::errors::{Code, DistError};
use crate::limiter::Admission;
use crate::metrics;
use crate::repository::{App, Repository};
use crate::signatures::SignatureItem;
use srcache::BlobDescriptorService as _;
use srdriver::{DriverError, LinkKind};
use sroci::digest::parse_digest;

pub const API_VERSION_HEADER: &str = "Docker-Distribution-API-Version";
pub const API_VERSION_VALUE: &str = "registry/2.0";
pub const SIGNATURES_HEADER: &str = "X-Registry-Supports-Signatures";
pub const DOCKER_CONTENT_DIGEST: &str = "Docker-Content-Digest";
pub const DOCKER_UPLOAD_UUID: &str = "Docker-Upload-UUID";

type AppState = Arc<App>;

#[derive(Deserialize)]
pub struct UploadQuery {
    pub mount: Option<String>,
    pub from: Option<String>,
    pub digest: Option<String>,
}

#[derive(Deserialize)]
pub struct TagsQuery {
    pub n: Option<usize>,
    pub last: Option<String>,
}

#[derive(Deserialize)]
pub struct AdminQuery {
    pub forwarded: Option<String>,
}

async fn admit_read(app: &App) -> Result<Admission, DistError> {
    app.read_limiter.admit("read").await.map_err(|_| {
        app.sink.limiter_rejected();
        DistError::new(Code::TooManyRequests, "server is busy, retry later")
    })
}

async fn admit_write(app: &App) -> Result<Admission, DistError> {
    app.write_limiter.admit("write").await.map_err(|_| {
        app.sink.limiter_rejected();
        DistError::new(Code::TooManyRequests, "server is busy, retry later")
    })
}

fn token(headers: &HeaderMap) -> Option<&str> {
    extract_token(
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok()),
    )
}

async fn authorize(
    app: &App,
    headers: &HeaderMap,
    records: &[AccessRecord],
) -> Result<(), DistError> {
    match app.authorizer.authorize(token(headers), records).await {
        Ok(()) => Ok(()),
        Err(AuthError::Unauthorized) => Err(DistError::new(
            Code::Unauthorized,
            "authentication required",
        )),
        Err(AuthError::Forbidden) => Err(DistError::denied()),
        Err(AuthError::Upstream(m)) => Err(DistError::internal(m)),
    }
}

fn digest_param(s: &str) -> Result<Digest, DistError> {
    if s.is_empty() {
        return Err(DistError::blob_unknown());
    }
    parse_digest(s)
        .map_err(|_| DistError::new(Code::DigestInvalid, format!("invalid digest {}", s)))
}

// GET /v2/
pub async fn api_base() -> impl IntoResponse {
    Json(json!({}))
}

// HEAD /v2/{ns}/{name}/blobs/{digest}
pub async fn head_blob(
    State(app): State<AppState>,
    Path((namespace, name, digest)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Result<Response, DistError> {
    let _adm = admit_read(&app).await?;
    app.sink.request("blob.head");
    authorize(
        &app,
        &headers,
        &[AccessRecord::repository(&namespace, &name, "get")],
    )
    .await?;
    let digest = digest_param(&digest)?;
    let repo = Repository::new(app.clone(), &namespace, &name, true).await?;
    let descriptor = repo
        .observed("blobs.stat", repo.blobs().stat(&digest))
        .await?;
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE.as_str(), descriptor.media_type().to_string()),
            (header::CONTENT_LENGTH.as_str(), descriptor.size().to_string()),
            (DOCKER_CONTENT_DIGEST, digest.to_string()),
        ],
    )
        .into_response())
}

// GET /v2/{ns}/{name}/blobs/{digest}
pub async fn get_blob(
    State(app): State<AppState>,
    Path((namespace, name, digest)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Result<Response, DistError> {
    let _adm = admit_read(&app).await?;
    app.sink.request("blob.get");
    authorize(
        &app,
        &headers,
        &[AccessRecord::repository(&namespace, &name, "get")],
    )
    .await?;
    let digest = digest_param(&digest)?;
    let repo = Repository::new(app.clone(), &namespace, &name, true).await?;
    let (descriptor, stream) = repo
        .observed("blobs.serve", repo.blobs().serve(&digest))
        .await?;
    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, srdriver::OCTET_STREAM)
        .header(DOCKER_CONTENT_DIGEST, digest.to_string());
    if descriptor.size() > 0 {
        response = response.header(header::CONTENT_LENGTH, descriptor.size());
    }
    response
        .body(Body::from_stream(stream))
        .map_err(|e| DistError::internal(format!("building response: {}", e)))
}

// POST /v2/{ns}/{name}/blobs/uploads/
pub async fn start_upload(
    State(app): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
    Query(query): Query<UploadQuery>,
    headers: HeaderMap,
) -> Result<Response, DistError> {
    let _adm = admit_write(&app).await?;
    app.sink.request("upload.start");
    authorize(
        &app,
        &headers,
        &[AccessRecord::repository(&namespace, &name, "update")],
    )
    .await?;

    if let (Some(mount), Some(from)) = (&query.mount, &query.from) {
        if let Some(response) =
            try_cross_mount(&app, &headers, &namespace, &name, mount, from).await?
        {
            return Ok(response);
        }
        // a failed mount silently becomes a regular upload initiation
    }

    let id = app.uploads.create_upload().await?;
    Ok((
        StatusCode::ACCEPTED,
        [
            (
                header::LOCATION.as_str(),
                format!("/v2/{}/{}/blobs/uploads/{}", namespace, name, id),
            ),
            (DOCKER_UPLOAD_UUID, id),
            ("Range", "0-0".to_string()),
        ],
    )
        .into_response())
}

// cross-mount wants an extra pull grant on the source repository. any auth
// problem there is deferred, never surfaced: the client just gets a regular
// upload session instead of a 401/403 on the destination push
async fn try_cross_mount(
    app: &AppState,
    headers: &HeaderMap,
    namespace: &str,
    name: &str,
    mount: &str,
    from: &str,
) -> Result<Option<Response>, DistError> {
    let digest = digest_param(mount)?;
    let Some((from_ns, from_name)) = from.split_once('/') else {
        return Ok(None);
    };
    let src_record = AccessRecord::repository(from_ns, from_name, "get");
    if let Err(e) = app.authorizer.authorize(token(headers), &[src_record]).await {
        info!(
            "cross-mount of {} from {} deferred auth error, demoting to upload: {:?}",
            digest, from, e
        );
        return Ok(None);
    }

    let src_repo = format!("{}/{}", from_ns, from_name);
    let visible = app.cache.contains_repository(&digest, &src_repo)
        || app
            .links
            .linked(&src_repo, LinkKind::Layer, &digest)
            .await
            .unwrap_or(false);
    if !visible {
        return Ok(None);
    }
    let descriptor = match app.descriptors.stat(&digest).await {
        Ok(descriptor) => descriptor,
        Err(DriverError::NotFound) => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let dst_repo = format!("{}/{}", namespace, name);
    app.links.link(&dst_repo, LinkKind::Layer, &digest).await?;
    app.cache.add(&digest, Some(&descriptor), Some(&dst_repo));
    info!("cross-mounted {} from {} into {}", digest, src_repo, dst_repo);
    Ok(Some(
        (
            StatusCode::CREATED,
            [
                (
                    header::LOCATION.as_str(),
                    format!("/v2/{}/blobs/{}", dst_repo, digest),
                ),
                (DOCKER_CONTENT_DIGEST, digest.to_string()),
            ],
        )
            .into_response(),
    ))
}

// PATCH /v2/{ns}/{name}/blobs/uploads/{uuid}
pub async fn patch_upload(
    State(app): State<AppState>,
    Path((namespace, name, uuid)): Path<(String, String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, DistError> {
    let _adm = admit_write(&app).await?;
    app.sink.request("upload.patch");
    authorize(
        &app,
        &headers,
        &[AccessRecord::repository(&namespace, &name, "update")],
    )
    .await?;
    let size = match app.uploads.append_upload(&uuid, body).await {
        Ok(size) => size,
        Err(DriverError::NotFound) => {
            return Err(DistError::new(Code::BlobUnknown, "upload unknown"));
        }
        Err(e) => return Err(e.into()),
    };
    Ok((
        StatusCode::ACCEPTED,
        [
            (
                header::LOCATION.as_str(),
                format!("/v2/{}/{}/blobs/uploads/{}", namespace, name, uuid),
            ),
            (DOCKER_UPLOAD_UUID, uuid),
            ("Range", format!("0-{}", size.saturating_sub(1))),
        ],
    )
        .into_response())
}

// PUT /v2/{ns}/{name}/blobs/uploads/{uuid}?digest=...
pub async fn put_upload(
    State(app): State<AppState>,
    Path((namespace, name, uuid)): Path<(String, String, String)>,
    Query(query): Query<UploadQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, DistError> {
    let _adm = admit_write(&app).await?;
    app.sink.request("upload.put");
    authorize(
        &app,
        &headers,
        &[AccessRecord::repository(&namespace, &name, "update")],
    )
    .await?;
    let digest = digest_param(query.digest.as_deref().unwrap_or_default())?;
    if !body.is_empty() {
        match app.uploads.append_upload(&uuid, body).await {
            Ok(_) => {}
            Err(DriverError::NotFound) => {
                return Err(DistError::new(Code::BlobUnknown, "upload unknown"));
            }
            Err(e) => return Err(e.into()),
        }
    }
    let descriptor = match app.uploads.commit_upload(&uuid, &digest).await {
        Ok(descriptor) => descriptor,
        Err(DriverError::NotFound) => {
            return Err(DistError::new(Code::BlobUnknown, "upload unknown"));
        }
        Err(DriverError::Digest(_)) => {
            return Err(DistError::new(
                Code::DigestInvalid,
                "uploaded content does not match digest",
            ));
        }
        Err(e) => return Err(e.into()),
    };
    let repo = format!("{}/{}", namespace, name);
    app.links.link(&repo, LinkKind::Layer, &digest).await?;
    app.cache.add(&digest, Some(&descriptor), Some(&repo));
    Ok((
        StatusCode::CREATED,
        [
            (
                header::LOCATION.as_str(),
                format!("/v2/{}/blobs/{}", repo, digest),
            ),
            (DOCKER_CONTENT_DIGEST, digest.to_string()),
        ],
    )
        .into_response())
}

// tag references resolve through the stream, digests go straight down
async fn resolve_reference(repo: &Repository, reference: &str) -> Result<Digest, DistError> {
    if reference.contains(':') {
        return digest_param(reference);
    }
    match repo.tags().get(reference).await {
        Ok(digest) => digest_param(&digest),
        Err(e) if e.code == Code::TagUnknown => Err(DistError::manifest_unknown()),
        Err(e) => Err(e),
    }
}

// GET/HEAD /v2/{ns}/{name}/manifests/{reference}
pub async fn get_manifest(
    State(app): State<AppState>,
    Path((namespace, name, reference)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Result<Response, DistError> {
    manifest_response(app, namespace, name, reference, headers, true).await
}

pub async fn head_manifest(
    State(app): State<AppState>,
    Path((namespace, name, reference)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Result<Response, DistError> {
    manifest_response(app, namespace, name, reference, headers, false).await
}

async fn manifest_response(
    app: AppState,
    namespace: String,
    name: String,
    reference: String,
    headers: HeaderMap,
    with_body: bool,
) -> Result<Response, DistError> {
    let _adm = admit_read(&app).await?;
    app.sink.request("manifest.get");
    authorize(
        &app,
        &headers,
        &[AccessRecord::repository(&namespace, &name, "get")],
    )
    .await?;
    let repo = Repository::new(app.clone(), &namespace, &name, true).await?;
    let digest = resolve_reference(&repo, &reference).await?;
    let (media_type, payload) = repo
        .observed("manifests.get", repo.manifests().get(&digest))
        .await?;
    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, media_type)
        .header(header::CONTENT_LENGTH, payload.len())
        .header(DOCKER_CONTENT_DIGEST, digest.to_string());
    if !with_body {
        return response
            .body(Body::empty())
            .map_err(|e| DistError::internal(format!("building response: {}", e)));
    }
    response
        .body(Body::from(payload))
        .map_err(|e| DistError::internal(format!("building response: {}", e)))
}

// PUT /v2/{ns}/{name}/manifests/{reference}
pub async fn put_manifest(
    State(app): State<AppState>,
    Path((namespace, name, reference)): Path<(String, String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, DistError> {
    let _adm = admit_write(&app).await?;
    app.sink.request("manifest.put");
    authorize(
        &app,
        &headers,
        &[AccessRecord::repository(&namespace, &name, "update")],
    )
    .await?;
    let media_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());
    // dependencies of a freshly pushed manifest may not be local yet, allow
    // the descriptor checks to consult remote registries
    let repo = Repository::new(app.clone(), &namespace, &name, true).await?;
    let (tag, expected) = if reference.contains(':') {
        (None, Some(digest_param(&reference)?))
    } else {
        (Some(reference.as_str()), None)
    };
    let digest = repo
        .observed(
            "manifests.put",
            repo.manifests().put(media_type, body, tag),
        )
        .await?;
    if let Some(expected) = expected {
        if expected != digest {
            return Err(DistError::new(
                Code::DigestInvalid,
                format!("payload digest {} does not match {}", digest, expected),
            ));
        }
    }
    Ok((
        StatusCode::CREATED,
        [
            (
                header::LOCATION.as_str(),
                format!("/v2/{}/{}/manifests/{}", namespace, name, digest),
            ),
            (DOCKER_CONTENT_DIGEST, digest.to_string()),
        ],
    )
        .into_response())
}

// DELETE /v2/{ns}/{name}/manifests/{digest}
pub async fn delete_manifest(
    State(app): State<AppState>,
    Path((namespace, name, digest)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Result<Response, DistError> {
    let _adm = admit_write(&app).await?;
    app.sink.request("manifest.delete");
    authorize(
        &app,
        &headers,
        &[AccessRecord::repository(&namespace, &name, "delete")],
    )
    .await?;
    let digest = digest_param(&digest)?;
    let repo = Repository::new(app.clone(), &namespace, &name, false).await?;
    repo.observed("manifests.delete", repo.manifests().delete(&digest))
        .await?;
    Ok(StatusCode::ACCEPTED.into_response())
}

// GET /v2/{ns}/{name}/tags/list
pub async fn tags_list(
    State(app): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
    Query(query): Query<TagsQuery>,
    headers: HeaderMap,
) -> Result<Response, DistError> {
    let _adm = admit_read(&app).await?;
    app.sink.request("tags.list");
    authorize(
        &app,
        &headers,
        &[AccessRecord::repository(&namespace, &name, "get")],
    )
    .await?;
    let repo = Repository::new(app.clone(), &namespace, &name, false).await?;
    let all = repo.observed("tags.all", repo.tags().all()).await?;
    let mut tags: Vec<String> = all.into_keys().collect();
    if let Some(last) = &query.last {
        tags.retain(|t| t > last);
    }
    if let Some(n) = query.n {
        tags.truncate(n);
    }
    Ok(Json(json!({
        "name": format!("{}/{}", namespace, name),
        "tags": tags,
    }))
    .into_response())
}

// DELETE /admin/blobs/{digest}
pub async fn admin_delete_blob(
    State(app): State<AppState>,
    Path(digest): Path<String>,
    Query(query): Query<AdminQuery>,
    headers: HeaderMap,
) -> Result<Response, DistError> {
    let _adm = admit_write(&app).await?;
    app.sink.request("admin.delete_blob");
    authorize(&app, &headers, &[AccessRecord::admin("prune")]).await?;
    let digest = digest_param(&digest)?;
    let freed = match app.blobs.delete(&digest).await {
        Ok(freed) => freed,
        Err(DriverError::NotFound) => return Err(DistError::blob_unknown()),
        Err(e) => return Err(e.into()),
    };
    app.cache.remove(&digest);

    // marked-forwarded requests never re-propagate
    let forwarded = query.forwarded.as_deref() == Some("1");
    if !forwarded && !app.config.server.sibling_service.is_empty() {
        let auth = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        tokio::spawn(propagate_delete(app.clone(), digest.to_string(), auth));
    }
    Ok((StatusCode::ACCEPTED, Json(json!({ "freedBytes": freed }))).into_response())
}

static PROPAGATE_CLIENT: Lazy<reqwest::Client> = Lazy::new(|| {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(10))
        .build()
        .unwrap()
});

// fire the same delete at every sibling replica, best effort. siblings are
// found through the well-known service name, self is skipped by pod address
async fn propagate_delete(app: Arc<App>, digest: String, auth: Option<String>) {
    let service = app.config.server.sibling_service.clone();
    let addrs = match tokio::net::lookup_host(service.as_str()).await {
        Ok(addrs) => addrs,
        Err(e) => {
            warn!("resolving siblings via {} failed: {:?}", service, e);
            return;
        }
    };
    for addr in addrs {
        if !app.config.server.pod_addr.is_empty()
            && addr.ip().to_string() == app.config.server.pod_addr
        {
            continue;
        }
        let url = format!("http://{}/admin/blobs/{}?forwarded=1", addr, digest);
        let mut req = PROPAGATE_CLIENT.delete(&url);
        if let Some(auth) = &auth {
            req = req.header(header::AUTHORIZATION, auth);
        }
        match req.send().await {
            Ok(res) => info!("propagated delete of {} to {}: {}", digest, addr, res.status()),
            Err(e) => warn!("propagating delete of {} to {} failed: {:?}", digest, addr, e),
        }
    }
}

// GET /extensions/v2/metrics
pub async fn get_metrics(
    State(app): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, DistError> {
    if !app.config.metrics.enabled {
        return Err(DistError::new(Code::NameUnknown, "metrics are disabled"));
    }
    let secret = &app.config.metrics.secret;
    let authorized = if secret.is_empty() {
        authorize(&app, &headers, &[AccessRecord::metrics()]).await.is_ok()
    } else {
        token(&headers) == Some(secret.as_str())
    };
    if !authorized {
        return Err(DistError::denied());
    }
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE.as_str(), "text/plain; version=0.0.4")],
        metrics::gather_text(),
    )
        .into_response())
}

// GET /extensions/v2/{ns}/{name}/signatures/{digest}
pub async fn get_signatures(
    State(app): State<AppState>,
    Path((namespace, name, digest)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Result<Response, DistError> {
    let _adm = admit_read(&app).await?;
    app.sink.request("signatures.get");
    authorize(
        &app,
        &headers,
        &[AccessRecord::repository(&namespace, &name, "get")],
    )
    .await?;
    let digest = digest_param(&digest)?;
    let repo = Repository::new(app.clone(), &namespace, &name, false).await?;
    let envelope = repo
        .observed("signatures.get", repo.signatures().get(&digest))
        .await?;
    Ok(Json(envelope).into_response())
}

// PUT /extensions/v2/{ns}/{name}/signatures/{digest}
pub async fn put_signature(
    State(app): State<AppState>,
    Path((namespace, name, digest)): Path<(String, String, String)>,
    headers: HeaderMap,
    Json(item): Json<SignatureItem>,
) -> Result<Response, DistError> {
    let _adm = admit_write(&app).await?;
    app.sink.request("signatures.put");
    authorize(
        &app,
        &headers,
        &[AccessRecord::repository(&namespace, &name, "update")],
    )
    .await?;
    let digest = digest_param(&digest)?;
    let repo = Repository::new(app.clone(), &namespace, &name, false).await?;
    repo.observed("signatures.put", repo.signatures().put(&digest, item))
        .await?;
    Ok(StatusCode::CREATED.into_response())
}
