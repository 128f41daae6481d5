//! HTTP clients: inference service, vectorization service and REST gallery store.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use presence_core::{
    Descriptor, EmbeddingExtractor, ExtractionError, GalleryEntry, GalleryStore, Identity,
    ImageLocator, StoreError, VectorRef, VectorizationService, VectorizeError,
};
use presence_hw::Frame;
use reqwest::{multipart, Client, Method, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

fn client(timeout: Duration) -> Result<Client, reqwest::Error> {
    Client::builder()
        .timeout(timeout)
        .user_agent(concat!("presenced/", env!("CARGO_PKG_VERSION")))
        .build()
}

fn trim_base(base: &str) -> String {
    base.trim_end_matches('/').to_string()
}

/// Embedding extractor backed by an HTTP inference service.
pub struct RemoteExtractor {
    client: Client,
    base_url: String,
    dimension: usize,
    loaded: AtomicBool,
}

#[derive(Deserialize)]
struct HealthResponse {
    #[serde(default)]
    dimension: Option<usize>,
}

#[derive(Deserialize)]
struct ExtractResponse {
    descriptors: Vec<Vec<f32>>,
}

impl RemoteExtractor {
    pub fn new(base_url: &str, dimension: usize) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: client(Duration::from_secs(30))?,
            base_url: trim_base(base_url),
            dimension,
            loaded: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl EmbeddingExtractor for RemoteExtractor {
    async fn load(&self) -> Result<(), ExtractionError> {
        if self.is_loaded() {
            return Ok(());
        }
        let down = |e: reqwest::Error| ExtractionError::ModelUnavailable(e.to_string());
        let response = self
            .client
            .get(format!("{}/health", self.base_url))
            .send()
            .await
            .map_err(down)?;
        let status = response.status();
        let body = response.bytes().await.map_err(down)?;
        check_health(status, &body, self.dimension)?;

        self.loaded.store(true, Ordering::SeqCst);
        tracing::info!(url = %self.base_url, dimension = self.dimension, "inference service ready");
        Ok(())
    }

    fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    async fn extract(&self, frame: &Frame) -> Result<Descriptor, ExtractionError> {
        if !self.is_loaded() {
            return Err(ExtractionError::ModelNotLoaded);
        }

        let png = frame
            .to_png()
            .map_err(|e| ExtractionError::Upstream(e.to_string()))?;
        let part = multipart::Part::bytes(png)
            .file_name("frame.png")
            .mime_str("image/png")
            .map_err(|e| ExtractionError::Upstream(e.to_string()))?;
        let form = multipart::Form::new().part("image", part);

        let response = self
            .client
            .post(format!("{}/extract", self.base_url))
            .multipart(form)
            .send()
            .await
            .map_err(|e| ExtractionError::Upstream(e.to_string()))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| ExtractionError::Upstream(e.to_string()))?;
        descriptor_from_reply(status, &body, self.dimension)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Accept a `/health` reply. A body without a dimension (or not JSON) is fine.
fn check_health(status: StatusCode, body: &[u8], expected: usize) -> Result<(), ExtractionError> {
    if !status.is_success() {
        return Err(ExtractionError::ModelUnavailable(format!(
            "health check answered {status}"
        )));
    }
    let dimension = serde_json::from_slice::<HealthResponse>(body)
        .ok()
        .and_then(|h| h.dimension);
    match dimension {
        Some(dimension) if dimension != expected => Err(ExtractionError::ModelUnavailable(
            format!("service produces {dimension}-d descriptors, configured for {expected}"),
        )),
        _ => Ok(()),
    }
}

/// Map an `/extract` reply onto exactly one descriptor or a face outcome.
fn descriptor_from_reply(
    status: StatusCode,
    body: &[u8],
    dimension: usize,
) -> Result<Descriptor, ExtractionError> {
    if !status.is_success() {
        return Err(ExtractionError::Upstream(format!(
            "{status}: {}",
            String::from_utf8_lossy(body)
        )));
    }
    let reply: ExtractResponse =
        serde_json::from_slice(body).map_err(|e| ExtractionError::Upstream(e.to_string()))?;

    let mut descriptors = reply.descriptors.into_iter();
    let values = match (descriptors.next(), descriptors.next()) {
        (None, _) => return Err(ExtractionError::NoFaceDetected),
        (Some(_), Some(_)) => return Err(ExtractionError::MultipleFacesDetected),
        (Some(values), None) => values,
    };
    if values.len() != dimension {
        return Err(ExtractionError::Upstream(format!(
            "expected {dimension}-d descriptor, got {}",
            values.len()
        )));
    }
    Descriptor::new(values).map_err(|e| ExtractionError::Upstream(e.to_string()))
}

/// Vectorization service client (`POST {base}/register`).
pub struct RemoteVectorizer {
    client: Client,
    base_url: String,
}

#[derive(Serialize)]
struct RegisterRequest<'a> {
    employee_id: &'a str,
    face_image_url: &'a str,
}

#[derive(Deserialize)]
struct RegisterResponse {
    vector_id: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

impl RemoteVectorizer {
    pub fn new(base_url: &str) -> Result<Self, reqwest::Error> {
        // Server-side vectorization downloads the image first, so allow more time.
        Ok(Self {
            client: client(Duration::from_secs(120))?,
            base_url: trim_base(base_url),
        })
    }
}

#[async_trait]
impl VectorizationService for RemoteVectorizer {
    async fn vectorize(
        &self,
        identity: &Identity,
        locator: &ImageLocator,
    ) -> Result<VectorRef, VectorizeError> {
        let response = self
            .client
            .post(format!("{}/register", self.base_url))
            .json(&RegisterRequest {
                employee_id: identity.as_str(),
                face_image_url: locator.as_str(),
            })
            .send()
            .await
            .map_err(|e| VectorizeError::Upstream(e.to_string()))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| VectorizeError::Upstream(e.to_string()))?;
        register_outcome(status, &body)
    }
}

fn register_outcome(status: StatusCode, body: &[u8]) -> Result<VectorRef, VectorizeError> {
    let reason = || {
        serde_json::from_slice::<ErrorBody>(body)
            .map(|b| b.error)
            .unwrap_or_else(|_| String::from_utf8_lossy(body).into_owned())
    };

    match status {
        StatusCode::CREATED | StatusCode::OK => serde_json::from_slice::<RegisterResponse>(body)
            .map(|r| VectorRef(r.vector_id))
            .map_err(|e| VectorizeError::Upstream(format!("malformed reply: {e}"))),
        StatusCode::CONFLICT => Err(VectorizeError::AlreadyEnrolled),
        StatusCode::BAD_REQUEST => Err(VectorizeError::Rejected(reason())),
        other => Err(VectorizeError::Upstream(format!("{other}: {}", reason()))),
    }
}

/// Gallery kept in a JSON document store (`{base}/{collection}.json`).
///
/// Records are `{employeeId, vector, timestamp}` keyed by a server-assigned id.
pub struct RestGalleryStore {
    client: Client,
    base_url: String,
    collection: String,
    auth: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct VectorRecord {
    #[serde(rename = "employeeId")]
    employee_id: String,
    vector: Vec<f32>,
    #[serde(default)]
    timestamp: Option<String>,
}

#[derive(Deserialize)]
struct PushResponse {
    name: String,
}

impl RestGalleryStore {
    pub fn new(
        base_url: &str,
        collection: &str,
        auth: Option<String>,
    ) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: client(Duration::from_secs(15))?,
            base_url: trim_base(base_url),
            collection: collection.trim_matches('/').to_string(),
            auth,
        })
    }

    fn url(&self, key: Option<&str>) -> String {
        match key {
            Some(key) => format!("{}/{}/{}.json", self.base_url, self.collection, key),
            None => format!("{}/{}.json", self.base_url, self.collection),
        }
    }

    /// Request builder for the collection or one record; the token goes in as an encoded query.
    fn request(&self, method: Method, key: Option<&str>) -> RequestBuilder {
        let request = self.client.request(method, self.url(key));
        match &self.auth {
            Some(auth) => request.query(&[("auth", auth.as_str())]),
            None => request,
        }
    }

    async fn fetch(&self) -> Result<Vec<GalleryEntry>, StoreError> {
        let response = self
            .request(Method::GET, None)
            .send()
            .await
            .map_err(unavailable)?;
        let status = response.status();
        let body = response.bytes().await.map_err(unavailable)?;
        collection_entries(status, &body)
    }
}

fn unavailable(e: reqwest::Error) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

fn collection_entries(status: StatusCode, body: &[u8]) -> Result<Vec<GalleryEntry>, StoreError> {
    if !status.is_success() {
        return Err(StoreError::Backend(format!("load answered {status}")));
    }
    // An empty collection comes back as JSON null.
    let records: Option<BTreeMap<String, serde_json::Value>> =
        serde_json::from_slice(body).map_err(|e| StoreError::Backend(e.to_string()))?;

    let mut entries = Vec::new();
    for (key, value) in records.unwrap_or_default() {
        match record_to_entry(&key, value) {
            Ok(entry) => entries.push(entry),
            // Foreign records in a shared collection are not ours to fail on.
            Err(reason) => tracing::warn!(key = %key, %reason, "skipping unreadable gallery record"),
        }
    }
    Ok(entries)
}

/// Server-assigned key from a push reply (`{"name": "-Nx..."}`).
fn pushed_key(status: StatusCode, body: &[u8]) -> Result<String, StoreError> {
    if !status.is_success() {
        return Err(StoreError::Backend(format!("append answered {status}")));
    }
    serde_json::from_slice::<PushResponse>(body)
        .map(|p| p.name)
        .map_err(|e| StoreError::Backend(format!("malformed push reply: {e}")))
}

/// Outcome of deleting one record. A 404 means it was already gone.
fn deleted(status: StatusCode, key: &str) -> Result<bool, StoreError> {
    match status {
        StatusCode::NOT_FOUND => Ok(false),
        s if s.is_success() => Ok(true),
        other => Err(StoreError::Backend(format!(
            "delete of {key} answered {other}"
        ))),
    }
}

fn record_to_entry(key: &str, value: serde_json::Value) -> Result<GalleryEntry, String> {
    let record: VectorRecord = serde_json::from_value(value).map_err(|e| e.to_string())?;
    let identity = Identity::new(&record.employee_id).map_err(|e| e.to_string())?;
    let descriptor = Descriptor::new(record.vector).map_err(|e| e.to_string())?;
    let enrolled_at = record
        .timestamp
        .as_deref()
        .and_then(parse_timestamp)
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
    Ok(GalleryEntry {
        id: key.to_string(),
        identity,
        descriptor,
        enrolled_at,
    })
}

/// RFC 3339, or a naive ISO-8601 timestamp taken as UTC.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|t| t.and_utc())
        })
}

#[async_trait]
impl GalleryStore for RestGalleryStore {
    async fn load_all(&self) -> Result<Vec<GalleryEntry>, StoreError> {
        self.fetch().await
    }

    async fn load_for(&self, identity: &Identity) -> Result<Vec<GalleryEntry>, StoreError> {
        let mut entries = self.fetch().await?;
        entries.retain(|e| &e.identity == identity);
        Ok(entries)
    }

    async fn append(&self, entry: GalleryEntry) -> Result<GalleryEntry, StoreError> {
        let record = VectorRecord {
            employee_id: entry.identity.as_str().to_string(),
            vector: entry.descriptor.as_slice().to_vec(),
            timestamp: Some(entry.enrolled_at.to_rfc3339()),
        };
        let response = self
            .request(Method::POST, None)
            .json(&record)
            .send()
            .await
            .map_err(unavailable)?;
        let status = response.status();
        let body = response.bytes().await.map_err(unavailable)?;
        let key = pushed_key(status, &body)?;

        tracing::debug!(key = %key, identity = %entry.identity, "gallery record pushed");
        Ok(GalleryEntry { id: key, ..entry })
    }

    async fn delete_identity(&self, identity: &Identity) -> Result<usize, StoreError> {
        let mut removed = 0;
        for entry in self.load_for(identity).await? {
            if self.delete_entry(&entry.id).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn delete_entry(&self, id: &str) -> Result<bool, StoreError> {
        let response = self
            .request(Method::DELETE, Some(id))
            .send()
            .await
            .map_err(unavailable)?;
        deleted(response.status(), id)
    }
}
