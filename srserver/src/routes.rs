use std::sync::Arc;

use axum::Router;
use axum::extract::{Request, State};
use axum::http::HeaderValue;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{delete, get, patch, post, put};

use crate::handlers;
use crate::repository::App;

pub fn router(app: Arc<App>) -> Router {
    Router::new()
        .route("/v2/", get(handlers::api_base))
        .route(
            "/v2/{namespace}/{name}/blobs/{digest}",
            get(handlers::get_blob).head(handlers::head_blob),
        )
        .route(
            "/v2/{namespace}/{name}/blobs/uploads/",
            post(handlers::start_upload),
        )
        .route(
            "/v2/{namespace}/{name}/blobs/uploads/{uuid}",
            patch(handlers::patch_upload).put(handlers::put_upload),
        )
        .route(
            "/v2/{namespace}/{name}/manifests/{reference}",
            get(handlers::get_manifest)
                .head(handlers::head_manifest)
                .put(handlers::put_manifest)
                .delete(handlers::delete_manifest),
        )
        .route("/v2/{namespace}/{name}/tags/list", get(handlers::tags_list))
        .route("/admin/blobs/{digest}", delete(handlers::admin_delete_blob))
        .route("/extensions/v2/metrics", get(handlers::get_metrics))
        .route(
            "/extensions/v2/{namespace}/{name}/signatures/{digest}",
            get(handlers::get_signatures).put(handlers::put_signature),
        )
        .layer(middleware::from_fn_with_state(app.clone(), version_headers))
        .with_state(app)
}

// every response advertises the api version and that this registry stores
// signatures. 401s additionally carry the challenge for token auth
async fn version_headers(State(app): State<Arc<App>>, request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        handlers::API_VERSION_HEADER,
        HeaderValue::from_static(handlers::API_VERSION_VALUE),
    );
    headers.insert(
        handlers::SIGNATURES_HEADER,
        HeaderValue::from_static("1"),
    );
    if response.status() == axum::http::StatusCode::UNAUTHORIZED
        && !app.config.auth.realm.is_empty()
    {
        let challenge = if app.config.auth.token_realm.is_empty() {
            format!("Basic realm=\"{}\"", app.config.auth.realm)
        } else {
            format!(
                "Bearer realm=\"{}\",service=\"{}\"",
                app.config.auth.token_realm, app.config.auth.realm
            )
        };
        if let Ok(value) = HeaderValue::from_str(&challenge) {
            response
                .headers_mut()
                .insert(axum::http::header::WWW_AUTHENTICATE, value);
        }
    }
    response
}
