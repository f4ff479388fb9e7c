use crate::error::{RestError, Result};
use reqwest::blocking::multipart::{Form, Part};
use std::io::{self, Cursor, Read};

/// File payload for a multipart upload (media, images, voice).
///
/// The content is read into memory once so the same bytes can be sent again
/// if the first attempt is rejected for an expired credential.
#[derive(Debug, Clone)]
pub struct MediaUpload {
    field_name: String,
    file_name: String,
    mime_type: Option<String>,
    data: Vec<u8>,
}

impl MediaUpload {
    /// Read the whole file content from `reader`
    ///
    /// # Arguments
    /// * `field_name` - Multipart form field, e.g. `media`
    /// * `file_name` - File name reported to the provider
    /// * `reader` - File content
    pub fn from_reader<R: Read>(field_name: &str, file_name: &str, mut reader: R) -> Result<Self> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        Ok(Self::from_bytes(field_name, file_name, data))
    }

    /// Wrap content already in memory
    pub fn from_bytes(field_name: &str, file_name: &str, data: Vec<u8>) -> Self {
        MediaUpload {
            field_name: field_name.to_string(),
            file_name: file_name.to_string(),
            mime_type: None,
            data,
        }
    }

    /// Set the MIME type of the file part
    pub fn with_mime_type(mut self, mime_type: &str) -> Self {
        self.mime_type = Some(mime_type.to_string());
        self
    }

    /// Form field name
    pub fn field_name(&self) -> &str {
        &self.field_name
    }

    /// File name
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Content length in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check whether the file is empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Build a fresh multipart form for one attempt
    pub(crate) fn form(&self) -> Result<Form> {
        let mut part = Part::bytes(self.data.clone()).file_name(self.file_name.clone());
        if let Some(ref mime_type) = self.mime_type {
            part = part
                .mime_str(mime_type)
                .map_err(|e| RestError::RequestBuild(format!("invalid MIME type {}: {}", mime_type, e)))?;
        }
        Ok(Form::new().part(self.field_name.clone(), part))
    }
}

enum DownloadBody {
    Streaming(reqwest::blocking::Response),
    Buffered(Cursor<Vec<u8>>),
}

/// Binary response body (QR code images, media files).
///
/// Reads straight from the connection unless the body had to be inspected
/// as a JSON envelope first.
pub struct Download {
    content_type: Option<String>,
    body: DownloadBody,
}

impl Download {
    pub(crate) fn streaming(content_type: Option<String>, response: reqwest::blocking::Response) -> Self {
        Download {
            content_type,
            body: DownloadBody::Streaming(response),
        }
    }

    pub(crate) fn buffered(content_type: Option<String>, data: Vec<u8>) -> Self {
        Download {
            content_type,
            body: DownloadBody::Buffered(Cursor::new(data)),
        }
    }

    /// `Content-Type` reported by the provider
    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// Read the remaining body into memory
    pub fn into_bytes(mut self) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        self.read_to_end(&mut data)?;
        Ok(data)
    }
}

impl Read for Download {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.body {
            DownloadBody::Streaming(ref mut response) => response.read(buf),
            DownloadBody::Buffered(ref mut cursor) => cursor.read(buf),
        }
    }
}

impl std::fmt::Debug for Download {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mode = match self.body {
            DownloadBody::Streaming(_) => "streaming",
            DownloadBody::Buffered(_) => "buffered",
        };
        f.debug_struct("Download")
            .field("content_type", &self.content_type)
            .field("body", &mode)
            .finish()
    }
}

/// Check whether a `Content-Type` denotes an envelope rather than binary content
pub(crate) fn is_envelope_type(content_type: Option<&str>) -> bool {
    match content_type {
        Some(ct) => {
            let ct = ct.to_ascii_lowercase();
            ct.starts_with("application/json") || ct.starts_with("text/plain")
        }
        None => false,
    }
}
