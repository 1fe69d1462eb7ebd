use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::extract::Path;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use bytes::Bytes;
use serde_json::json;

use srdriver::{BlobStore, LinkKind, LinkStore, MemoryDriver};
use srmeta::{
    FakeMetadataClient, Image, ImageLayer, ImageStream, ImageStreamSpec, ImageStreamStatus,
    ImportPolicy, MetadataClient as _, NamedTagEventList, ObjectMeta, TagEvent, TagReference,
};
use sroci::digest::payload_digest;
use srserver::auth::{AccessRecord, AuthError, Authorizer, PermissiveAuthorizer};
use srserver::metrics::NullSink;
use srserver::{App, Config, router};

struct TestRig {
    base: String,
    app: Arc<App>,
    driver: Arc<MemoryDriver>,
    meta: Arc<FakeMetadataClient>,
    client: reqwest::Client,
}

async fn rig_with(config_json: &str, authorizer: Arc<dyn Authorizer>) -> TestRig {
    let config = Config::from_json(config_json).unwrap();
    let driver = Arc::new(MemoryDriver::new());
    let meta = Arc::new(FakeMetadataClient::new());
    let app = App::new(
        config,
        driver.clone(),
        meta.clone(),
        authorizer,
        Arc::new(NullSink),
    )
    .unwrap();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let service = router(app.clone());
    tokio::spawn(async move {
        axum::serve(listener, service).await.unwrap();
    });
    TestRig {
        base: format!("http://{}", addr),
        app,
        driver,
        meta,
        client: reqwest::Client::new(),
    }
}

async fn rig(config_json: &str) -> TestRig {
    rig_with(config_json, Arc::new(PermissiveAuthorizer)).await
}

impl TestRig {
    // seed a blob into local storage with a repo link, as a finished upload
    // would have left it
    async fn seed_blob(&self, repo: &str, data: &[u8]) -> oci_spec::image::Digest {
        let desc = self.driver.put(Bytes::copy_from_slice(data)).await.unwrap();
        self.driver
            .link(repo, LinkKind::Layer, desc.digest())
            .await
            .unwrap();
        desc.digest().clone()
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }
}

fn oci_manifest(config: &[u8], layer: &[u8]) -> (String, String) {
    let manifest = json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.manifest.v1+json",
        "config": {
            "mediaType": "application/vnd.oci.image.config.v1+json",
            "size": config.len(),
            "digest": payload_digest(config).to_string(),
        },
        "layers": [{
            "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
            "size": layer.len(),
            "digest": payload_digest(layer).to_string(),
        }],
    })
    .to_string();
    (
        manifest,
        "application/vnd.oci.image.manifest.v1+json".to_string(),
    )
}

#[tokio::test]
async fn test_api_base_and_version_headers() {
    let rig = rig("{}").await;
    let res = rig.client.get(rig.url("/v2/")).send().await.unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(
        res.headers().get("Docker-Distribution-API-Version").unwrap(),
        "registry/2.0"
    );
    assert_eq!(
        res.headers().get("X-Registry-Supports-Signatures").unwrap(),
        "1"
    );
}

#[tokio::test]
async fn test_blob_upload_and_pull() {
    let rig = rig("{}").await;
    let data = b"some layer bytes";
    let digest = payload_digest(data);

    // initiate
    let res = rig
        .client
        .post(rig.url("/v2/ns/app/blobs/uploads/"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 202);
    let location = res.headers()[header::LOCATION].to_str().unwrap().to_string();

    // chunk then commit
    let res = rig
        .client
        .patch(rig.url(&location))
        .body(&data[..8])
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 202);
    let res = rig
        .client
        .put(format!("{}?digest={}", rig.url(&location), digest))
        .body(&data[8..])
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 201);
    assert_eq!(
        res.headers()["Docker-Content-Digest"].to_str().unwrap(),
        digest.to_string()
    );

    // head then get through the same repository
    let res = rig
        .client
        .head(rig.url(&format!("/v2/ns/app/blobs/{}", digest)))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(
        res.headers()[header::CONTENT_LENGTH].to_str().unwrap(),
        data.len().to_string()
    );

    let res = rig
        .client
        .get(rig.url(&format!("/v2/ns/app/blobs/{}", digest)))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(res.bytes().await.unwrap().as_ref(), data);
}

#[tokio::test]
async fn test_blob_not_visible_through_other_repository() {
    let rig = rig("{}").await;
    let digest = rig.seed_blob("ns/app", b"tenant data").await;
    // the other stream exists but never referenced the blob
    rig.meta.put_stream(ImageStream {
        metadata: ObjectMeta {
            namespace: "other".into(),
            name: "thing".into(),
            ..Default::default()
        },
        ..Default::default()
    });
    let res = rig
        .client
        .head(rig.url(&format!("/v2/other/thing/blobs/{}", digest)))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 404);
}

#[tokio::test]
async fn test_schema2_rejected_when_not_accepted() {
    let rig = rig("{}").await;
    let config = br#"{"architecture":"amd64","os":"linux"}"#;
    let layer = b"layer!";
    rig.seed_blob("ns/app", config).await;
    rig.seed_blob("ns/app", layer).await;
    let manifest = json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
        "config": {
            "mediaType": "application/vnd.docker.container.image.v1+json",
            "size": config.len(),
            "digest": payload_digest(config).to_string(),
        },
        "layers": [{
            "mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip",
            "size": layer.len(),
            "digest": payload_digest(layer).to_string(),
        }],
    })
    .to_string();

    let res = rig
        .client
        .put(rig.url("/v2/ns/app/manifests/latest"))
        .header(
            header::CONTENT_TYPE,
            "application/vnd.docker.distribution.manifest.v2+json",
        )
        .body(manifest)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 400);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["errors"][0]["code"], "MANIFEST_INVALID");
    assert_eq!(body["errors"][0]["detail"], "schema 2 not allowed");
}

#[tokio::test]
async fn test_push_auto_provisions_stream() {
    let rig = rig("{}").await;
    let config = br#"{"architecture":"amd64"}"#;
    let layer = b"bytes of the only layer";
    rig.seed_blob("ns/app", config).await;
    rig.seed_blob("ns/app", layer).await;
    let (manifest, media_type) = oci_manifest(config, layer);
    let manifest_digest = payload_digest(manifest.as_bytes());

    assert!(rig.meta.stream("ns", "app").is_none());

    let res = rig
        .client
        .put(rig.url("/v2/ns/app/manifests/latest"))
        .header(header::CONTENT_TYPE, &media_type)
        .body(manifest.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 201);

    // the stream now exists and latest points at the manifest digest
    let stream = rig.meta.stream("ns", "app").unwrap();
    assert_eq!(
        stream.latest_tag_event("latest").unwrap().image,
        manifest_digest.to_string()
    );
}

#[tokio::test]
async fn test_manifest_roundtrip_is_byte_identical() {
    let rig = rig("{}").await;
    let config = br#"{"architecture":"arm64"}"#;
    let layer = b"roundtrip layer";
    rig.seed_blob("ns/app", config).await;
    rig.seed_blob("ns/app", layer).await;
    let (manifest, media_type) = oci_manifest(config, layer);
    let manifest_digest = payload_digest(manifest.as_bytes());

    let res = rig
        .client
        .put(rig.url("/v2/ns/app/manifests/latest"))
        .header(header::CONTENT_TYPE, &media_type)
        .body(manifest.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 201);

    let res = rig
        .client
        .get(rig.url(&format!("/v2/ns/app/manifests/{}", manifest_digest)))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(
        res.headers()[header::CONTENT_TYPE].to_str().unwrap(),
        media_type
    );
    assert_eq!(res.bytes().await.unwrap().as_ref(), manifest.as_bytes());

    // and by tag
    let res = rig
        .client
        .get(rig.url("/v2/ns/app/manifests/latest"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(res.bytes().await.unwrap().as_ref(), manifest.as_bytes());
}

#[tokio::test]
async fn test_tags_list() {
    let rig = rig("{}").await;
    let config = br#"{"architecture":"amd64"}"#;
    let layer = b"tag list layer";
    rig.seed_blob("ns/app", config).await;
    rig.seed_blob("ns/app", layer).await;
    let (manifest, media_type) = oci_manifest(config, layer);

    for tag in ["latest", "v1", "v2"] {
        let res = rig
            .client
            .put(rig.url(&format!("/v2/ns/app/manifests/{}", tag)))
            .header(header::CONTENT_TYPE, &media_type)
            .body(manifest.clone())
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), 201);
    }

    let res = rig
        .client
        .get(rig.url("/v2/ns/app/tags/list"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["name"], "ns/app");
    let tags: Vec<String> = body["tags"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t.as_str().unwrap().to_string())
        .collect();
    assert_eq!(tags, vec!["latest", "v1", "v2"]);

    // pagination
    let res = rig
        .client
        .get(rig.url("/v2/ns/app/tags/list?n=1&last=latest"))
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["tags"], json!(["v1"]));
}

// an upstream registry holding one blob, counting how often it is asked
async fn spawn_remote(blob: Bytes) -> (String, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let digest = payload_digest(&blob).to_string();
    let hits_clone = hits.clone();
    let app = Router::new().route(
        "/v2/{ns}/{name}/blobs/{digest}",
        get(move |Path((_, _, wanted)): Path<(String, String, String)>| {
            let blob = blob.clone();
            let digest = digest.clone();
            let hits = hits_clone.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                if wanted == digest {
                    (
                        StatusCode::OK,
                        [
                            (header::CONTENT_TYPE.as_str(), "application/octet-stream".to_string()),
                            (header::CONTENT_LENGTH.as_str(), blob.len().to_string()),
                        ],
                        blob,
                    )
                        .into_response()
                } else {
                    StatusCode::NOT_FOUND.into_response()
                }
            }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr.to_string(), hits)
}

#[tokio::test]
async fn test_pullthrough_blob_with_mirror() {
    let blob = Bytes::from(vec![7u8; 1024]);
    let blob_digest = payload_digest(&blob);
    let (remote_addr, hits) = spawn_remote(blob.clone()).await;

    let rig = rig(r#"{"pullthrough":{"mirror":true}}"#).await;

    // the stream's v2 tag points at an image on the remote, marked insecure
    // because the test upstream only speaks http
    rig.meta.put_image(Image {
        metadata: ObjectMeta {
            name: "sha256:aaa".into(),
            ..Default::default()
        },
        docker_image_reference: format!("{}/ns/is@sha256:aaa", remote_addr),
        docker_image_layers: vec![ImageLayer {
            name: blob_digest.to_string(),
            size: blob.len() as u64,
            media_type: "application/octet-stream".into(),
        }],
        ..Default::default()
    });
    rig.meta.put_stream(ImageStream {
        metadata: ObjectMeta {
            namespace: "ns".into(),
            name: "is".into(),
            ..Default::default()
        },
        spec: ImageStreamSpec {
            tags: vec![TagReference {
                name: "v2".into(),
                from: None,
                import_policy: ImportPolicy { insecure: true },
            }],
        },
        status: ImageStreamStatus {
            tags: vec![NamedTagEventList {
                tag: "v2".into(),
                items: vec![TagEvent {
                    image: "sha256:aaa".into(),
                    docker_image_reference: format!("{}/ns/is@sha256:aaa", remote_addr),
                    ..Default::default()
                }],
            }],
            ..Default::default()
        },
    });

    let res = rig
        .client
        .get(rig.url(&format!("/v2/ns/is/blobs/{}", blob_digest)))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(
        res.headers()[header::CONTENT_TYPE].to_str().unwrap(),
        "application/octet-stream"
    );
    let body = res.bytes().await.unwrap();
    assert_eq!(body.len(), 1024);
    assert_eq!(body, blob);

    // the mirror task lands the blob locally
    let mut mirrored = false;
    for _ in 0..50 {
        if rig.driver.get(&blob_digest).await.is_ok() {
            mirrored = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(mirrored, "blob was not mirrored into local storage");

    // subsequent reads are served locally, the remote is left alone
    let before = hits.load(Ordering::SeqCst);
    let res = rig
        .client
        .get(rig.url(&format!("/v2/ns/is/blobs/{}", blob_digest)))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(res.bytes().await.unwrap(), blob);
    assert_eq!(hits.load(Ordering::SeqCst), before);
}

struct DenyNamespace(&'static str);

#[async_trait]
impl Authorizer for DenyNamespace {
    async fn authorize(
        &self,
        _token: Option<&str>,
        records: &[AccessRecord],
    ) -> Result<(), AuthError> {
        if records.iter().any(|r| r.namespace == self.0) {
            Err(AuthError::Forbidden)
        } else {
            Ok(())
        }
    }
}

#[tokio::test]
async fn test_cross_mount() {
    let rig = rig("{}").await;
    let digest = rig.seed_blob("src/repo", b"mount me").await;

    let res = rig
        .client
        .post(rig.url(&format!(
            "/v2/dst/repo/blobs/uploads/?mount={}&from=src/repo",
            digest
        )))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 201);
    assert_eq!(
        res.headers()["Docker-Content-Digest"].to_str().unwrap(),
        digest.to_string()
    );
    assert!(
        rig.driver
            .linked("dst/repo", LinkKind::Layer, &digest)
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn test_cross_mount_demoted_on_missing_src_auth() {
    let rig = rig_with("{}", Arc::new(DenyNamespace("src"))).await;
    let digest = rig.seed_blob("src/repo", b"cannot pull this").await;

    let res = rig
        .client
        .post(rig.url(&format!(
            "/v2/dst/repo/blobs/uploads/?mount={}&from=src/repo",
            digest
        )))
        .send()
        .await
        .unwrap();
    // silently demoted to a plain upload, never a 401/403
    assert_eq!(res.status(), 202);
    assert!(res.headers().get("Docker-Upload-UUID").is_some());
    assert!(
        !rig.driver
            .linked("dst/repo", LinkKind::Layer, &digest)
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn test_admin_delete_blob() {
    let rig = rig("{}").await;
    let digest = rig.seed_blob("ns/app", b"prunable").await;

    let res = rig
        .client
        .delete(rig.url(&format!("/admin/blobs/{}", digest)))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 202);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["freedBytes"], 8);
    assert!(rig.driver.get(&digest).await.is_err());

    // a second delete of the same digest is a 404
    let res = rig
        .client
        .delete(rig.url(&format!("/admin/blobs/{}", digest)))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 404);
}

#[tokio::test]
async fn test_manifest_delete_guard() {
    let rig = rig("{}").await;
    let config = br#"{"architecture":"amd64"}"#;
    let layer = b"guarded layer";
    rig.seed_blob("ns/app", config).await;
    rig.seed_blob("ns/app", layer).await;
    let (manifest, media_type) = oci_manifest(config, layer);
    let manifest_digest = payload_digest(manifest.as_bytes());

    let res = rig
        .client
        .put(rig.url("/v2/ns/app/manifests/latest"))
        .header(header::CONTENT_TYPE, &media_type)
        .body(manifest.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 201);

    // still referenced by the stream
    let res = rig
        .client
        .delete(rig.url(&format!("/v2/ns/app/manifests/{}", manifest_digest)))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 405);

    // untag, then deletion of the local link succeeds
    rig.meta
        .delete_image_stream_tag("ns", "app:latest")
        .await
        .unwrap();
    let res = rig
        .client
        .delete(rig.url(&format!("/v2/ns/app/manifests/{}", manifest_digest)))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 202);
}

#[tokio::test]
async fn test_concurrent_puts_both_succeed() {
    let rig = rig("{}").await;
    let config = br#"{"architecture":"amd64"}"#;
    let layer = b"concurrent layer";
    rig.seed_blob("ns/app", config).await;
    rig.seed_blob("ns/app", layer).await;
    let (manifest, media_type) = oci_manifest(config, layer);
    let manifest_digest = payload_digest(manifest.as_bytes());

    // untagged puts by digest: the image record registration is the guarded
    // migration, concurrent writers must not trample each other
    let put = |body: String| {
        let client = rig.client.clone();
        let url = rig.url(&format!("/v2/ns/app/manifests/{}", manifest_digest));
        let media_type = media_type.clone();
        async move {
            client
                .put(url)
                .header(header::CONTENT_TYPE, media_type)
                .body(body)
                .send()
                .await
                .unwrap()
                .status()
        }
    };
    let (a, b) = tokio::join!(put(manifest.clone()), put(manifest.clone()));
    assert_eq!(a, 201);
    assert_eq!(b, 201);
    assert!(rig.meta.get_image(&manifest_digest.to_string()).await.is_ok());
}

#[tokio::test]
async fn test_tag_service_lookup_and_untag() {
    let rig = rig("{}").await;
    let config = br#"{"architecture":"amd64"}"#;
    let layer = b"taggable layer";
    rig.seed_blob("ns/app", config).await;
    rig.seed_blob("ns/app", layer).await;
    let (manifest, media_type) = oci_manifest(config, layer);
    let manifest_digest = payload_digest(manifest.as_bytes());

    let res = rig
        .client
        .put(rig.url("/v2/ns/app/manifests/latest"))
        .header(header::CONTENT_TYPE, &media_type)
        .body(manifest.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 201);

    let repo = srserver::Repository::new(rig.app.clone(), "ns", "app", false)
        .await
        .unwrap();
    // the stream records the pushed manifest
    assert!(repo.manifests().exists(&manifest_digest).await.unwrap());
    assert!(
        !repo
            .manifests()
            .exists(&payload_digest(b"unrelated"))
            .await
            .unwrap()
    );
    // point a second tag at the same image, then look it up by digest
    repo.tags().tag("stable", &manifest_digest).await.unwrap();
    let mut tags = repo.tags().lookup(&manifest_digest).await.unwrap();
    tags.sort();
    assert_eq!(tags, vec!["latest", "stable"]);

    repo.tags().untag("latest").await.unwrap();
    let tags = repo.tags().lookup(&manifest_digest).await.unwrap();
    assert_eq!(tags, vec!["stable"]);
    assert!(repo.tags().get("latest").await.is_err());
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let rig = rig(r#"{"metrics":{"enabled":true,"secret":"s3cret"}}"#).await;
    let res = rig
        .client
        .get(rig.url("/extensions/v2/metrics"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 403);

    let res = rig
        .client
        .get(rig.url("/extensions/v2/metrics"))
        .header(header::AUTHORIZATION, "Bearer s3cret")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
}

#[tokio::test]
async fn test_signatures_roundtrip() {
    let rig = rig("{}").await;
    let config = br#"{"architecture":"amd64"}"#;
    let layer = b"signed layer";
    rig.seed_blob("ns/app", config).await;
    rig.seed_blob("ns/app", layer).await;
    let (manifest, media_type) = oci_manifest(config, layer);
    let manifest_digest = payload_digest(manifest.as_bytes());

    let res = rig
        .client
        .put(rig.url("/v2/ns/app/manifests/latest"))
        .header(header::CONTENT_TYPE, &media_type)
        .body(manifest.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 201);

    use base64::Engine as _;
    let content = base64::engine::general_purpose::STANDARD.encode(b"sig-bytes");
    let res = rig
        .client
        .put(rig.url(&format!(
            "/extensions/v2/ns/app/signatures/{}",
            manifest_digest
        )))
        .json(&json!({"name": "sig-1", "type": "atomic", "content": content}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 201);

    let res = rig
        .client
        .get(rig.url(&format!(
            "/extensions/v2/ns/app/signatures/{}",
            manifest_digest
        )))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["signatures"][0]["name"], "sig-1");
    assert_eq!(body["signatures"][0]["content"], content);
}
