//! Book Library Client
//!
//! REST access to the backend that stores books and generates their casts.

use crate::{
    error::LibraryError,
    models::{Book, BookListResponse, CastResponse},
};
use async_trait::async_trait;
use reqwest::{StatusCode, Url, multipart};
use secrecy::{ExposeSecret, SecretString};
use std::path::Path;
use tracing::{debug, info, instrument, warn};

/// Uploads must be strictly smaller than this.
pub const MAX_UPLOAD_BYTES: u64 = 5 * 1024 * 1024;

pub const ACCESS_TOKEN_HEADER: &str = "X-Access-Token";

/// Credential attached to every backend request.
#[derive(Clone)]
pub struct AccessToken(SecretString);

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(SecretString::from(token.into()))
    }

    /// Treats blank input as "no token".
    pub fn from_optional(token: Option<String>) -> Option<Self> {
        token
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .map(Self::new)
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AccessToken([REDACTED])")
    }
}

/// Defines the contract for the book backend.
#[async_trait]
pub trait LibraryClient: Send + Sync {
    /// Lists the ids of every known book.
    async fn list_books(&self) -> Result<Vec<String>, LibraryError>;

    /// Fetches a book's cast of characters.
    async fn fetch_cast(&self, book_id: &str) -> Result<Book, LibraryError>;

    /// Uploads a book text and returns the generated cast.
    ///
    /// Files of [`MAX_UPLOAD_BYTES`] or more are rejected before any request is made.
    async fn upload(&self, path: &Path) -> Result<Book, LibraryError>;
}

/// `LibraryClient` over HTTP.
pub struct HttpLibraryClient {
    client: reqwest::Client,
    base_url: Url,
    token: Option<AccessToken>,
}

impl HttpLibraryClient {
    pub fn new(base_url: &str, token: Option<AccessToken>) -> Result<Self, LibraryError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| LibraryError::Backend(format!("invalid backend URL '{base_url}': {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(LibraryError::Backend(format!(
                "backend URL '{base_url}' cannot have paths"
            )));
        }
        if token.is_none() {
            warn!("No access token configured; backend requests may be rejected.");
        }
        Ok(Self {
            client: reqwest::Client::new(),
            base_url,
            token,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn request(&self, method: reqwest::Method, url: Url) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.token {
            Some(token) => builder.header(ACCESS_TOKEN_HEADER, token.0.expose_secret()),
            None => builder,
        }
    }

    async fn get_cast(&self, url: Url) -> Result<Option<CastResponse>, LibraryError> {
        let response = self.request(reqwest::Method::GET, url.clone()).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check_status(&url, response)?;
        Ok(Some(response.json::<CastResponse>().await?))
    }
}

fn check_status(url: &Url, response: reqwest::Response) -> Result<reqwest::Response, LibraryError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(LibraryError::Backend(format!(
            "request to {} returned {}",
            url.path(),
            status
        )))
    }
}

#[async_trait]
impl LibraryClient for HttpLibraryClient {
    #[instrument(skip(self))]
    async fn list_books(&self) -> Result<Vec<String>, LibraryError> {
        let url = self.endpoint(&["books"]);
        let response = self.request(reqwest::Method::GET, url.clone()).send().await?;
        let response = check_status(&url, response)?;
        let ids = response.json::<BookListResponse>().await?.into_ids();
        debug!(count = ids.len(), "Listed books.");
        Ok(ids)
    }

    #[instrument(skip(self))]
    async fn fetch_cast(&self, book_id: &str) -> Result<Book, LibraryError> {
        let primary = self.endpoint(&["books", book_id, "characters"]);
        let cast = match self.get_cast(primary).await? {
            Some(cast) => cast,
            None => {
                debug!("Cast endpoint returned 404, trying the single-book endpoint.");
                let fallback = self.endpoint(&["book", book_id]);
                self.get_cast(fallback)
                    .await?
                    .ok_or_else(|| LibraryError::Backend(format!("Book '{book_id}' not found")))?
            }
        };
        let book = Book::from_response(book_id, cast);
        info!(title = %book.title, characters = book.characters.len(), "Fetched cast.");
        Ok(book)
    }

    #[instrument(skip(self, path), fields(path = %path.display()))]
    async fn upload(&self, path: &Path) -> Result<Book, LibraryError> {
        let size = tokio::fs::metadata(path).await?.len();
        if size >= MAX_UPLOAD_BYTES {
            warn!(size, "Refusing oversized upload.");
            return Err(LibraryError::OversizedUpload {
                size,
                limit: MAX_UPLOAD_BYTES,
            });
        }

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("book.txt")
            .to_string();
        let bytes = tokio::fs::read(path).await?;
        let part = multipart::Part::bytes(bytes)
            .file_name(file_name.clone())
            .mime_str("text/plain")?;
        let form = multipart::Form::new().part("file", part);

        let url = self.endpoint(&["upload"]);
        let response = self
            .request(reqwest::Method::POST, url.clone())
            .multipart(form)
            .send()
            .await?;
        let response = check_status(&url, response)?;
        let cast = response.json::<CastResponse>().await?;
        let book = Book::from_response(&file_name, cast);
        info!(book_id = %book.book_id, title = %book.title, "Uploaded book.");
        Ok(book)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        Json, Router,
        extract::{Multipart, Path as AxumPath, State},
        http::{HeaderMap, StatusCode as AxumStatus},
        routing::{get, post},
    };
    use serde_json::{Value, json};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Seen {
        tokens: Arc<Mutex<Vec<Option<String>>>>,
        uploads: Arc<Mutex<Vec<String>>>,
    }

    impl Seen {
        fn record(&self, headers: &HeaderMap) {
            let token = headers
                .get(ACCESS_TOKEN_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            self.tokens.lock().unwrap().push(token);
        }
    }

    fn cast(title: &str) -> Value {
        json!({
            "book_title": title,
            "characters": [{
                "name": "Captain Ahab",
                "description": "Monomaniacal captain of the Pequod",
                "assigned_voice_id": "goT3UYdM9bhm0n2lmKQx",
                "system_prompt": "You are Captain Ahab."
            }]
        })
    }

    async fn list(State(seen): State<Seen>, headers: HeaderMap) -> Json<Value> {
        seen.record(&headers);
        Json(json!(["moby_dick_1735158899.txt", "emma.txt"]))
    }

    async fn characters(
        State(seen): State<Seen>,
        headers: HeaderMap,
        AxumPath(id): AxumPath<String>,
    ) -> Result<Json<Value>, AxumStatus> {
        seen.record(&headers);
        match id.as_str() {
            "legacy" => Err(AxumStatus::NOT_FOUND),
            "broken" => Err(AxumStatus::INTERNAL_SERVER_ERROR),
            _ => Ok(Json(cast("Moby Dick"))),
        }
    }

    async fn single_book(AxumPath(id): AxumPath<String>) -> Result<Json<Value>, AxumStatus> {
        if id == "legacy" {
            Ok(Json(cast("Legacy Book")))
        } else {
            Err(AxumStatus::NOT_FOUND)
        }
    }

    async fn upload(State(seen): State<Seen>, mut multipart: Multipart) -> Json<Value> {
        let mut name = String::new();
        while let Some(field) = multipart.next_field().await.unwrap() {
            if field.name() == Some("file") {
                name = field.file_name().unwrap_or_default().to_string();
                let _ = field.bytes().await.unwrap();
            }
        }
        seen.uploads.lock().unwrap().push(name.clone());
        let mut body = cast("");
        body["book_id"] = json!(name);
        Json(body)
    }

    async fn stub_backend() -> (String, Seen) {
        let seen = Seen::default();
        let app = Router::new()
            .route("/books", get(list))
            .route("/books/{id}/characters", get(characters))
            .route("/book/{id}", get(single_book))
            .route("/upload", post(upload))
            .with_state(seen.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), seen)
    }

    #[tokio::test]
    async fn test_list_books_sends_token() {
        let (url, seen) = stub_backend().await;
        let client = HttpLibraryClient::new(&url, Some(AccessToken::new("secret"))).unwrap();

        let ids = client.list_books().await.unwrap();

        assert_eq!(ids, vec!["moby_dick_1735158899.txt", "emma.txt"]);
        assert_eq!(
            seen.tokens.lock().unwrap().as_slice(),
            &[Some("secret".to_string())]
        );
    }

    #[tokio::test]
    async fn test_missing_token_is_tolerated() {
        let (url, seen) = stub_backend().await;
        let client = HttpLibraryClient::new(&url, None).unwrap();

        let book = client.fetch_cast("moby_dick").await.unwrap();

        assert_eq!(book.title, "Moby Dick");
        assert_eq!(book.characters[0].name, "Captain Ahab");
        assert_eq!(seen.tokens.lock().unwrap().as_slice(), &[None::<String>]);
    }

    #[tokio::test]
    async fn test_fetch_cast_falls_back_to_single_book_endpoint() {
        let (url, _) = stub_backend().await;
        let client = HttpLibraryClient::new(&url, None).unwrap();

        let book = client.fetch_cast("legacy").await.unwrap();
        assert_eq!(book.title, "Legacy Book");
        assert_eq!(book.book_id, "legacy");
    }

    #[tokio::test]
    async fn test_server_error_is_backend_error() {
        let (url, _) = stub_backend().await;
        let client = HttpLibraryClient::new(&url, None).unwrap();

        let err = client.fetch_cast("broken").await.unwrap_err();
        match err {
            LibraryError::Backend(msg) => assert!(msg.contains("500")),
            other => panic!("Expected Backend error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_backend_error() {
        let client = HttpLibraryClient::new("http://127.0.0.1:1", None).unwrap();
        let err = client.list_books().await.unwrap_err();
        assert!(matches!(err, LibraryError::Backend(_)));
    }

    #[tokio::test]
    async fn test_upload_returns_cast() {
        let (url, seen) = stub_backend().await;
        let client = HttpLibraryClient::new(&url, None).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("moby-dick.txt");
        std::fs::write(&path, "Call me Ishmael.").unwrap();

        let book = client.upload(&path).await.unwrap();

        assert_eq!(book.book_id, "moby-dick.txt");
        assert_eq!(book.title, "Moby Dick");
        assert_eq!(seen.uploads.lock().unwrap().as_slice(), &["moby-dick.txt"]);
    }

    #[tokio::test]
    async fn test_oversized_upload_makes_no_request() {
        let (url, seen) = stub_backend().await;
        let client = HttpLibraryClient::new(&url, None).unwrap();
        let file = tempfile::NamedTempFile::new().unwrap();
        file.as_file().set_len(MAX_UPLOAD_BYTES).unwrap();

        let err = client.upload(file.path()).await.unwrap_err();

        match err {
            LibraryError::OversizedUpload { size, limit } => {
                assert_eq!(size, MAX_UPLOAD_BYTES);
                assert_eq!(limit, MAX_UPLOAD_BYTES);
            }
            other => panic!("Expected OversizedUpload, got {other:?}"),
        }
        assert!(seen.uploads.lock().unwrap().is_empty());
        assert!(seen.tokens.lock().unwrap().is_empty());
    }

    #[test]
    fn test_access_token_is_redacted() {
        let token = AccessToken::new("hunter2");
        assert!(!format!("{token:?}").contains("hunter2"));
        assert!(AccessToken::from_optional(Some("  ".into())).is_none());
        assert!(AccessToken::from_optional(Some("abc".into())).is_some());
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(HttpLibraryClient::new("not a url", None).is_err());
    }
}
