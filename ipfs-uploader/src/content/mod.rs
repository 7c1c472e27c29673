//! Content normalization.
//!
//! Every way of submitting content (a file, several files, text, JSON, or a directory tree of
//! path/content pairs) is a variant of [`ContentInput`]. [`ContentInput::normalize`] is the single
//! place these shapes are translated into the [`ContentItem`] sequence the
//! [`FanOut`](crate::fanout::FanOut) orchestrator consumes, so adding a new input shape never touches
//! the orchestrator.

mod path;

pub use path::ContentPath;

use std::collections::HashSet;

use bytes::Bytes;
use mime_guess::mime::Mime;

use crate::errors::UploadError;

pub const TEXT_MEDIA_TYPE: &str = "text/plain";
pub const JSON_MEDIA_TYPE: &str = "application/json";

/// One unit of content to add to every backend.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentItem {
    /// Present only for directory-tree uploads
    pub path: Option<ContentPath>,
    /// Display name for blob uploads (used as the multipart filename)
    pub name: Option<String>,
    pub payload: Bytes,
    pub media_type: String,
}

impl ContentItem {
    /// Name to present to a backend: the tree path, the blob name, or a generic fallback.
    pub fn file_name(&self) -> &str {
        match (&self.path, &self.name) {
            (Some(path), _) => path.as_str(),
            (None, Some(name)) => name,
            (None, None) => "file",
        }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// A named file with its bytes.
#[derive(Debug, Clone)]
pub struct FileInput {
    pub name: String,
    pub bytes: Bytes,
    /// Guessed from the file name when absent
    pub media_type: Option<String>,
}

impl FileInput {
    pub fn new(name: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            bytes: bytes.into(),
            media_type: None,
        }
    }

    pub fn with_media_type(mut self, media_type: impl Into<String>) -> Self {
        self.media_type = Some(media_type.into());
        self
    }
}

/// One entry of a directory tree submission.
#[derive(Debug, Clone)]
pub struct TreeEntry {
    pub path: String,
    pub bytes: Bytes,
    pub media_type: Option<String>,
}

impl TreeEntry {
    pub fn new(path: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            path: path.into(),
            bytes: bytes.into(),
            media_type: None,
        }
    }

    pub fn with_media_type(mut self, media_type: impl Into<String>) -> Self {
        self.media_type = Some(media_type.into());
        self
    }
}

/// The shapes content can be submitted in.
#[derive(Debug, Clone)]
pub enum ContentInput {
    File(FileInput),
    Files(Vec<FileInput>),
    Text(String),
    Json(serde_json::Value),
    Tree(Vec<TreeEntry>),
}

impl ContentInput {
    /// Translate the input into an ordered sequence of content items.
    ///
    /// Caller ordering is preserved. Tree paths are validated and normalized; any invalid or
    /// duplicate path fails the whole submission.
    pub fn normalize(self) -> Result<Vec<ContentItem>, UploadError> {
        match self {
            ContentInput::File(file) => Ok(vec![blob_item(file)?]),
            ContentInput::Files(files) => {
                if files.is_empty() {
                    return Err(UploadError::EmptySubmission);
                }
                files.into_iter().map(blob_item).collect()
            }
            ContentInput::Text(text) => Ok(vec![ContentItem {
                path: None,
                name: None,
                payload: Bytes::from(text),
                media_type: TEXT_MEDIA_TYPE.to_string(),
            }]),
            ContentInput::Json(value) => {
                let payload = serde_json::to_vec(&value).map_err(|e| UploadError::InvalidContent { message: e.to_string() })?;
                Ok(vec![ContentItem {
                    path: None,
                    name: None,
                    payload: Bytes::from(payload),
                    media_type: JSON_MEDIA_TYPE.to_string(),
                }])
            }
            ContentInput::Tree(entries) => tree_items(entries),
        }
    }
}

fn blob_item(file: FileInput) -> Result<ContentItem, UploadError> {
    let media_type = resolve_media_type(file.media_type, &file.name)?;
    Ok(ContentItem {
        path: None,
        name: Some(file.name),
        payload: file.bytes,
        media_type,
    })
}

fn tree_items(entries: Vec<TreeEntry>) -> Result<Vec<ContentItem>, UploadError> {
    if entries.is_empty() {
        return Err(UploadError::EmptySubmission);
    }

    let mut seen = HashSet::with_capacity(entries.len());
    let mut items = Vec::with_capacity(entries.len());

    for entry in entries {
        let path = ContentPath::parse(&entry.path)?;
        if !seen.insert(path.clone()) {
            return Err(UploadError::DuplicateContentPath { path: path.to_string() });
        }

        let media_type = resolve_media_type(entry.media_type, path.as_str())?;
        items.push(ContentItem {
            path: Some(path),
            name: None,
            payload: entry.bytes,
            media_type,
        });
    }

    Ok(items)
}

/// A declared media type must parse; an absent one is guessed from `name`.
fn resolve_media_type(declared: Option<String>, name: &str) -> Result<String, UploadError> {
    match declared {
        Some(media_type) => match media_type.parse::<Mime>() {
            Ok(_) => Ok(media_type),
            Err(e) => Err(UploadError::InvalidContent {
                message: format!("{name}: invalid media type {media_type:?}: {e}"),
            }),
        },
        None => Ok(guess_media_type(name)),
    }
}

fn guess_media_type(name: &str) -> String {
    mime_guess::from_path(name).first_or_octet_stream().essence_str().to_string()
}
