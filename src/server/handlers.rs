use std::io;
use std::str::FromStr;
use std::sync::Arc;

use axum::body::StreamBody;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument};

use super::errors::ApiError;
use super::range::{parse_range, Unsatisfiable};
use super::AppState;
use crate::constants::{API_VERSION, API_VERSION_HEADER, BLOB_STREAM_CHUNK_SIZE, CONTENT_DIGEST_HEADER};
use crate::digest::Digest;
use crate::error::RegistryError;
use crate::image::ManifestFormat;
use crate::store::{Blob, BlobStore};

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub n: Option<usize>,
    pub last: Option<String>,
}

impl PageQuery {
    /// Entries after `last`, at most `n`, plus whether more remain.
    fn apply(&self, sorted: Vec<String>) -> (Vec<String>, bool) {
        let after: Vec<String> = match &self.last {
            Some(last) => sorted.into_iter().filter(|s| s > last).collect(),
            None => sorted,
        };
        match self.n {
            Some(n) if after.len() > n => (after.into_iter().take(n).collect(), true),
            _ => (after, false),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Route {
    Tags { name: String },
    Manifest { name: String, reference: String },
    Blob { name: String, digest: String },
}

fn parse_route(path: &str) -> Option<Route> {
    let path = path.strip_prefix('/').unwrap_or(path);

    if let Some(name) = path.strip_suffix("/tags/list") {
        if !name.is_empty() {
            return Some(Route::Tags { name: name.to_string() });
        }
    }

    if let Some((name, digest)) = path.rsplit_once("/blobs/") {
        if !name.is_empty() && !digest.is_empty() && !digest.contains('/') {
            return Some(Route::Blob {
                name: name.to_string(),
                digest: digest.to_string(),
            });
        }
    }

    if let Some((name, reference)) = path.rsplit_once("/manifests/") {
        if !name.is_empty() && !reference.is_empty() && !reference.contains('/') {
            return Some(Route::Manifest {
                name: name.to_string(),
                reference: reference.to_string(),
            });
        }
    }

    None
}

/// Repository names: `/`-separated components of letters, digits and
/// `._+-`, each starting with a letter or digit. Package names may carry
/// uppercase letters and `+`, so both are allowed here.
fn valid_name(name: &str) -> bool {
    name.split('/').all(|component| {
        component.starts_with(|c: char| c.is_ascii_alphanumeric())
            && component
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '+'))
    })
}

fn insert_header(headers: &mut HeaderMap, name: header::HeaderName, value: &str) -> Result<(), ApiError> {
    let value = HeaderValue::from_str(value)
        .map_err(|e| ApiError::internal(format!("invalid header value for {}: {}", name, e)))?;
    headers.insert(name, value);
    Ok(())
}

fn content_headers(digest: &Digest, content_type: &str, length: u64) -> Result<HeaderMap, ApiError> {
    let mut headers = HeaderMap::new();
    insert_header(&mut headers, header::CONTENT_TYPE, content_type)?;
    insert_header(&mut headers, header::CONTENT_LENGTH, &length.to_string())?;
    let digest_header = header::HeaderName::from_bytes(CONTENT_DIGEST_HEADER.as_bytes())
        .map_err(|e| ApiError::internal(format!("invalid header name {}: {}", CONTENT_DIGEST_HEADER, e)))?;
    insert_header(&mut headers, digest_header, &digest.to_string())?;
    insert_header(&mut headers, header::ETAG, &format!("\"{}\"", digest))?;
    Ok(headers)
}

/// `GET /v2/`
pub async fn api_version_check() -> impl IntoResponse {
    (StatusCode::OK, [(API_VERSION_HEADER, API_VERSION)])
}

/// `GET /v2/_catalog`
pub async fn catalog(
    State(state): State<Arc<AppState>>,
    Query(page): Query<PageQuery>,
) -> Result<Response, ApiError> {
    let inspector = state.coordinator.inspector().clone();
    let images = blocking(move || inspector.list_images()).await?;
    let (repositories, more) = page.apply(images);

    let mut headers = HeaderMap::new();
    if more {
        if let (Some(n), Some(last)) = (page.n, repositories.last()) {
            let link = format!("</v2/_catalog?last={}&n={}>; rel=\"next\"", last, n);
            insert_header(&mut headers, header::LINK, &link)?;
        }
    }
    Ok((headers, Json(json!({ "repositories": repositories }))).into_response())
}

/// Everything below `/v2/<name>/`. Names may contain `/`, so routing is
/// done here on the suffix rather than by the router.
#[instrument(skip(state, page, headers))]
pub async fn dispatch(
    method: Method,
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    Query(page): Query<PageQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    // read-only: uploads, pushes and deletes are refused before routing
    if method != Method::GET && method != Method::HEAD {
        return Err(ApiError::unsupported(method.as_str()));
    }
    let route = parse_route(&path).ok_or_else(|| ApiError::not_found(&format!("/v2/{}", path)))?;
    debug!(%method, path = %path, "Registry request");

    match route {
        Route::Tags { name } => {
            ensure_name(&name)?;
            list_tags(state, name, page).await
        }
        Route::Manifest { name, reference } => {
            ensure_name(&name)?;
            get_manifest(method, state, name, reference, &headers).await
        }
        Route::Blob { name, digest } => {
            ensure_name(&name)?;
            get_blob(method, state, name, digest, &headers).await
        }
    }
}

fn ensure_name(name: &str) -> Result<(), ApiError> {
    if valid_name(name) {
        Ok(())
    } else {
        Err(ApiError::name_invalid(name))
    }
}

async fn list_tags(state: Arc<AppState>, name: String, page: PageQuery) -> Result<Response, ApiError> {
    let inspector = state.coordinator.inspector().clone();
    let image = name.clone();
    let tags = blocking(move || inspector.list_tags(&image)).await?;
    let (tags, _) = page.apply(tags);
    Ok(Json(json!({ "name": name, "tags": tags })).into_response())
}

async fn get_manifest(
    method: Method,
    state: Arc<AppState>,
    name: String,
    reference: String,
    request_headers: &HeaderMap,
) -> Result<Response, ApiError> {
    let unknown = || ApiError::manifest_unknown(&name, &reference);

    let descriptor = if reference.contains(':') {
        let digest = Digest::from_str(&reference).map_err(RegistryError::from)?;
        let built = state.coordinator.find_by_digest(&name, &digest).await?.ok_or_else(unknown)?;
        built.manifest_by_digest(&digest).cloned().ok_or_else(unknown)?
    } else {
        let built = state.coordinator.resolve(&name, &reference).await?;
        let accepted = request_headers
            .get_all(header::ACCEPT)
            .iter()
            .filter_map(|v| v.to_str().ok());
        let format = ManifestFormat::negotiate(accepted);
        built.manifest(format).cloned().ok_or_else(unknown)?
    };

    let store = state.coordinator.store().clone();
    let blob = read_blob(store, descriptor.digest.clone()).await.map_err(|e| match e {
        // evicted or corrupted after the build was checked
        RegistryError::BlobUnknown(_) | RegistryError::DigestMismatch { .. } => unknown(),
        other => other.into(),
    })?;

    let headers = content_headers(&descriptor.digest, &descriptor.media_type, blob.bytes.len() as u64)?;
    if method == Method::HEAD {
        return Ok((StatusCode::OK, headers).into_response());
    }
    Ok((StatusCode::OK, headers, blob.bytes).into_response())
}

/// Blobs are served only under a repository whose image contains them.
async fn get_blob(
    method: Method,
    state: Arc<AppState>,
    name: String,
    digest: String,
    request_headers: &HeaderMap,
) -> Result<Response, ApiError> {
    let digest = Digest::from_str(&digest).map_err(RegistryError::from)?;
    if state.coordinator.find_by_digest(&name, &digest).await?.is_none() {
        return Err(ApiError::blob_unknown(&digest.to_string()));
    }
    let store = state.coordinator.store().clone();

    if method == Method::HEAD {
        let info = store
            .stat(&digest)
            .ok_or_else(|| ApiError::blob_unknown(&digest.to_string()))?;
        let mut headers = content_headers(&digest, "application/octet-stream", info.size)?;
        insert_header(&mut headers, header::ACCEPT_RANGES, "bytes")?;
        return Ok((StatusCode::OK, headers).into_response());
    }

    let blob = read_blob(store, digest.clone()).await?;
    let total = blob.bytes.len() as u64;
    let range_header = request_headers.get(header::RANGE).and_then(|v| v.to_str().ok());

    let (status, body, range) = match parse_range(range_header, total) {
        Ok(None) => (StatusCode::OK, blob.bytes, None),
        Ok(Some(range)) => {
            let body = blob.bytes.slice(range.start as usize..=range.end as usize);
            (StatusCode::PARTIAL_CONTENT, body, Some(range))
        }
        Err(Unsatisfiable) => {
            let mut headers = HeaderMap::new();
            insert_header(&mut headers, header::CONTENT_RANGE, &format!("bytes */{}", total))?;
            let body = json!({
                "errors": [{
                    "code": "RANGE_INVALID",
                    "message": "invalid content range",
                    "detail": { "range": range_header, "size": total },
                }]
            });
            return Ok((StatusCode::RANGE_NOT_SATISFIABLE, headers, Json(body)).into_response());
        }
    };

    let mut headers = content_headers(&digest, "application/octet-stream", body.len() as u64)?;
    insert_header(&mut headers, header::ACCEPT_RANGES, "bytes")?;
    if let Some(range) = range {
        insert_header(&mut headers, header::CONTENT_RANGE, &range.content_range(total))?;
    }
    Ok((status, headers, StreamBody::new(chunked(body))).into_response())
}

/// Split `body` into stream chunks without copying.
fn chunked(body: Bytes) -> impl futures::Stream<Item = Result<Bytes, io::Error>> {
    let len = body.len();
    let chunks = (0..len)
        .step_by(BLOB_STREAM_CHUNK_SIZE)
        .map(move |offset| Ok(body.slice(offset..len.min(offset + BLOB_STREAM_CHUNK_SIZE))));
    futures::stream::iter(chunks)
}

/// Verified read on the blocking pool; re-hashing a layer is CPU work.
async fn read_blob(store: Arc<BlobStore>, digest: Digest) -> Result<Blob, RegistryError> {
    tokio::task::spawn_blocking(move || store.get(&digest))
        .await
        .map_err(|e| RegistryError::Internal(format!("blob read task failed: {}", e)))?
}

async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> crate::error::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::internal(format!("background task failed: {}", e)))?
        .map_err(ApiError::from)
}
