//! Backend for IPFS Kubo nodes, speaking the `/api/v0/add` RPC endpoint.
//!
//! ```text
//! POST {url}/api/v0/add?cid-version=1&pin=true[&wrap-with-directory=true]
//!   multipart: one "file" part per item (plus "application/x-directory" parts for parents)
//!
//! response (newline-delimited JSON, one object per added entry):
//!   {"Name":"folder1/hello.txt","Hash":"bafy...","Size":"26"}
//!   {"Name":"","Hash":"bafy-root...","Size":"180"}      <- wrapping directory
//! ```

use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::multipart::{Form, Part};
use serde::Deserialize;

use super::{Added, Backend, BackendEndpoint, BackendError, BackendFactory};
use crate::content::ContentItem;

const DIRECTORY_MEDIA_TYPE: &str = "application/x-directory";

/// One line of an `add` response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AddEntry {
    #[serde(default)]
    name: String,
    hash: Option<String>,
}

/// HTTP client handle for one Kubo node.
pub struct KuboBackend {
    name: String,
    add_url: String,
    cid_version: u8,
    tree_uploads: bool,
    /// `None` once the handle has been closed
    client: RwLock<Option<reqwest::Client>>,
}

impl KuboBackend {
    pub fn new(endpoint: &BackendEndpoint) -> Result<Self, BackendError> {
        let mut headers = HeaderMap::new();
        if let Some(credential) = &endpoint.credential {
            let name = HeaderName::from_bytes(credential.header.as_bytes())
                .map_err(|e| BackendError::Unavailable(format!("invalid credential header name: {e}")))?;
            let mut value = HeaderValue::from_str(&credential.value)
                .map_err(|e| BackendError::Unavailable(format!("invalid credential header value: {e}")))?;
            value.set_sensitive(true);
            headers.insert(name, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(endpoint.timeout)
            .build()
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        Ok(Self {
            name: endpoint.name.clone(),
            add_url: format!("{}/api/v0/add", endpoint.url.as_str().trim_end_matches('/')),
            cid_version: endpoint.cid_version,
            tree_uploads: endpoint.tree_uploads,
            client: RwLock::new(Some(client)),
        })
    }

    fn client(&self) -> Result<reqwest::Client, BackendError> {
        self.client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| BackendError::Unavailable(format!("client for {} has been closed", self.name)))
    }

    async fn post_add(&self, form: Form, wrap: bool) -> Result<Vec<AddEntry>, BackendError> {
        let mut query = vec![("cid-version", self.cid_version.to_string()), ("pin", "true".to_string())];
        if wrap {
            query.push(("wrap-with-directory", "true".to_string()));
        }

        let client = self.client()?;
        let response = client.post(&self.add_url).query(&query).multipart(form).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::debug!(backend = %self.name, status = status.as_u16(), "Kubo add rejected");
            return Err(BackendError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.text().await?;
        parse_entries(&body)
    }
}

fn parse_entries(body: &str) -> Result<Vec<AddEntry>, BackendError> {
    body.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str::<AddEntry>(line).map_err(|e| BackendError::InvalidResponse(e.to_string())))
        .collect()
}

fn file_part(item: &ContentItem, file_name: &str) -> Result<Part, BackendError> {
    Part::stream_with_length(reqwest::Body::from(item.payload.clone()), item.payload.len() as u64)
        .file_name(encode_name(file_name))
        .mime_str(&item.media_type)
        .map_err(|e| BackendError::Transport(format!("invalid media type {:?}: {e}", item.media_type)))
}

fn directory_part(path: &str) -> Result<Part, BackendError> {
    Part::bytes(Vec::new())
        .file_name(encode_name(path))
        .mime_str(DIRECTORY_MEDIA_TYPE)
        .map_err(|e| BackendError::Transport(e.to_string()))
}

/// Kubo unescapes part filenames as query components.
fn encode_name(name: &str) -> String {
    url::form_urlencoded::byte_serialize(name.as_bytes()).collect()
}

#[async_trait]
impl Backend for KuboBackend {
    async fn add(&self, item: &ContentItem) -> Result<Added, BackendError> {
        let form = Form::new().percent_encode_noop().part("file", file_part(item, item.file_name())?);
        let entries = self.post_add(form, false).await?;

        let cid = entries
            .iter()
            .rev()
            .find_map(|e| e.hash.clone())
            .ok_or_else(|| BackendError::InvalidResponse("add response carried no hash".to_string()))?;

        Ok(Added::new(cid))
    }

    async fn add_tree(&self, items: &[ContentItem]) -> Result<Added, BackendError> {
        if !self.tree_uploads {
            return Err(BackendError::TreeUnsupported);
        }

        // Parent directories must precede their children, and each directory's entries must be
        // contiguous in the multipart stream.
        let mut ordered: Vec<&ContentItem> = items.iter().collect();
        ordered.sort_by(|a, b| a.file_name().split('/').cmp(b.file_name().split('/')));

        let mut form = Form::new().percent_encode_noop();
        let mut directories = HashSet::new();
        for item in ordered {
            let path = item.file_name();
            for (idx, _) in path.match_indices('/') {
                let dir = &path[..idx];
                if directories.insert(dir.to_string()) {
                    form = form.part("file", directory_part(dir)?);
                }
            }
            form = form.part("file", file_part(item, path)?);
        }

        let entries = self.post_add(form, true).await?;
        let root = entries
            .iter()
            .find(|e| e.name.is_empty())
            .and_then(|e| e.hash.clone())
            .ok_or(BackendError::TreeUnsupported)?;

        tracing::debug!(backend = %self.name, root = %root, entries = entries.len(), "Kubo tree added");
        Ok(Added::new(root.clone()).with_root(root))
    }

    async fn close(&self) {
        // Dropping the client tears down its connection pool once in-flight requests finish
        if self.client.write().unwrap_or_else(PoisonError::into_inner).take().is_some() {
            tracing::debug!(backend = %self.name, "Closing Kubo client");
        }
    }
}

/// Creates [`KuboBackend`] handles.
#[derive(Debug, Default, Clone)]
pub struct KuboFactory;

impl BackendFactory for KuboFactory {
    fn connect(&self, endpoint: &BackendEndpoint) -> Result<Arc<dyn Backend>, BackendError> {
        Ok(Arc::new(KuboBackend::new(endpoint)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::Credential;
    use crate::content::{ContentInput, FileInput, TreeEntry};
    use wiremock::matchers::{body_string_contains, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn endpoint_for(server: &MockServer) -> BackendEndpoint {
        BackendEndpoint::new("kubo-test", server.uri().parse().unwrap())
    }

    fn text_item(text: &str) -> ContentItem {
        ContentInput::Text(text.to_string()).normalize().unwrap().remove(0)
    }

    fn tree_items() -> Vec<ContentItem> {
        ContentInput::Tree(vec![
            TreeEntry::new("folder1/hello.txt", "Hello from file 1!"),
            TreeEntry::new("test.txt", "Hello from the root"),
        ])
        .normalize()
        .unwrap()
    }

    #[tokio::test]
    async fn test_add_single_item() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v0/add"))
            .and(query_param("cid-version", "1"))
            .and(query_param("pin", "true"))
            .and(body_string_contains("Hello, IPFS!"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"Name":"file","Hash":"bafy-text","Size":"20"}"#))
            .expect(1)
            .mount(&mock_server)
            .await;

        let backend = KuboBackend::new(&endpoint_for(&mock_server)).unwrap();
        let added = backend.add(&text_item("Hello, IPFS!")).await.unwrap();

        assert_eq!(added, Added::new("bafy-text"));
    }

    #[tokio::test]
    async fn test_add_uses_file_name() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v0/add"))
            .and(body_string_contains("filename=\"notes.txt\""))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"Name":"notes.txt","Hash":"bafy-notes","Size":"4"}"#))
            .expect(1)
            .mount(&mock_server)
            .await;

        let item = ContentInput::File(FileInput::new("notes.txt", "abcd")).normalize().unwrap().remove(0);
        let backend = KuboBackend::new(&endpoint_for(&mock_server)).unwrap();

        assert_eq!(backend.add(&item).await.unwrap().cid, "bafy-notes");
    }

    #[tokio::test]
    async fn test_add_tree_returns_wrapping_directory() {
        let mock_server = MockServer::start().await;
        let body = concat!(
            "{\"Name\":\"folder1/hello.txt\",\"Hash\":\"bafy-hello\",\"Size\":\"26\"}\n",
            "{\"Name\":\"test.txt\",\"Hash\":\"bafy-test\",\"Size\":\"27\"}\n",
            "{\"Name\":\"folder1\",\"Hash\":\"bafy-folder1\",\"Size\":\"80\"}\n",
            "{\"Name\":\"\",\"Hash\":\"bafy-root\",\"Size\":\"180\"}\n",
        );
        Mock::given(method("POST"))
            .and(path("/api/v0/add"))
            .and(query_param("wrap-with-directory", "true"))
            .and(body_string_contains("application/x-directory"))
            .and(body_string_contains("folder1%2Fhello.txt"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .expect(1)
            .mount(&mock_server)
            .await;

        let backend = KuboBackend::new(&endpoint_for(&mock_server)).unwrap();
        let added = backend.add_tree(&tree_items()).await.unwrap();

        assert_eq!(added.cid, "bafy-root");
        assert_eq!(added.root.as_deref(), Some("bafy-root"));
    }

    #[tokio::test]
    async fn test_add_tree_groups_entries_by_directory() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v0/add"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"Name":"","Hash":"bafy-root","Size":"90"}"#))
            .expect(1)
            .mount(&mock_server)
            .await;

        let items = ContentInput::Tree(vec![
            TreeEntry::new("a/x.txt", "x"),
            TreeEntry::new("b/y.txt", "y"),
            TreeEntry::new("a/z.txt", "z"),
        ])
        .normalize()
        .unwrap();

        let backend = KuboBackend::new(&endpoint_for(&mock_server)).unwrap();
        backend.add_tree(&items).await.unwrap();

        let requests = mock_server.received_requests().await.unwrap();
        let body = String::from_utf8_lossy(&requests[0].body);
        let position = |needle: &str| body.find(needle).unwrap_or_else(|| panic!("{needle} missing from body"));

        assert!(position("filename=\"a\"") < position("a%2Fx.txt"));
        assert!(position("a%2Fx.txt") < position("a%2Fz.txt"));
        assert!(position("a%2Fz.txt") < position("filename=\"b\""));
        assert!(position("filename=\"b\"") < position("b%2Fy.txt"));
    }

    #[tokio::test]
    async fn test_add_tree_without_root_is_unsupported() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v0/add"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"Name":"test.txt","Hash":"bafy-test","Size":"27"}"#))
            .mount(&mock_server)
            .await;

        let backend = KuboBackend::new(&endpoint_for(&mock_server)).unwrap();
        let result = backend.add_tree(&tree_items()).await;

        assert_eq!(result, Err(BackendError::TreeUnsupported));
    }

    #[tokio::test]
    async fn test_tree_uploads_disabled_skips_request() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&mock_server)
            .await;

        let backend = KuboBackend::new(&endpoint_for(&mock_server).with_tree_uploads(false)).unwrap();
        let result = backend.add_tree(&tree_items()).await;

        assert_eq!(result, Err(BackendError::TreeUnsupported));
    }

    #[tokio::test]
    async fn test_http_error_is_rejection() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("blockstore full"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let backend = KuboBackend::new(&endpoint_for(&mock_server)).unwrap();
        let result = backend.add(&text_item("hi")).await;

        assert_eq!(
            result,
            Err(BackendError::Rejected {
                status: 500,
                body: "blockstore full".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_connection_refused() {
        // Point to a port that's not listening
        let endpoint = BackendEndpoint::new("down", "http://127.0.0.1:1".parse().unwrap());
        let backend = KuboBackend::new(&endpoint).unwrap();

        let result = backend.add(&text_item("hi")).await;
        assert!(matches!(result, Err(BackendError::ConnectionRefused(_))), "got {result:?}");
    }

    #[tokio::test]
    async fn test_malformed_response() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&mock_server)
            .await;

        let backend = KuboBackend::new(&endpoint_for(&mock_server)).unwrap();
        let result = backend.add(&text_item("hi")).await;

        assert!(matches!(result, Err(BackendError::InvalidResponse(_))));
    }

    #[tokio::test]
    async fn test_credential_header_is_sent() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("X-API-Key", "secret-key"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"Name":"file","Hash":"bafy-auth","Size":"2"}"#))
            .expect(1)
            .mount(&mock_server)
            .await;

        let endpoint = endpoint_for(&mock_server).with_credential(Credential::api_key("secret-key"));
        let backend = KuboBackend::new(&endpoint).unwrap();

        assert_eq!(backend.add(&text_item("hi")).await.unwrap().cid, "bafy-auth");
    }

    #[tokio::test]
    async fn test_closed_backend_is_unavailable() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"Name":"file","Hash":"bafy","Size":"2"}"#))
            .expect(0)
            .mount(&mock_server)
            .await;

        let backend = KuboBackend::new(&endpoint_for(&mock_server)).unwrap();
        backend.close().await;
        backend.close().await;

        let result = backend.add(&text_item("hi")).await;
        assert!(matches!(result, Err(BackendError::Unavailable(_))), "got {result:?}");
        let result = backend.add_tree(&tree_items()).await;
        assert!(matches!(result, Err(BackendError::Unavailable(_))), "got {result:?}");
    }

    #[test]
    fn test_invalid_credential_is_unavailable() {
        let endpoint = BackendEndpoint::new("bad", "http://127.0.0.1:5001".parse().unwrap()).with_credential(Credential {
            header: "bad header".to_string(),
            value: "x".to_string(),
        });

        assert!(matches!(KuboFactory.connect(&endpoint), Err(BackendError::Unavailable(_))));
    }
}
