//! Per-request bundle handed to route handlers.

use crate::error::Result;
use crate::http::multipart::{self, MultipartConfig};
use crate::http::request::Request;
use crate::http::upload::{FileMap, UploadedFile};
use crate::router::ParamVec;
use std::fs;
use tracing::warn;

/// Everything a handler needs for one request: the parsed request, the
/// path parameters bound by the router, and any files extracted from a
/// `multipart/form-data` body.
///
/// Contexts are movable but not clonable; the files map owns temp files
/// whose lifetime is tied to this value.
#[derive(Debug)]
pub struct HttpContext {
    request: Request,
    params: ParamVec,
    files: FileMap,
}

fn starts_with_ignore_case(value: &str, prefix: &str) -> bool {
    value.len() >= prefix.len() && value[..prefix.len()].eq_ignore_ascii_case(prefix)
}

impl HttpContext {
    /// Build the context, running multipart parsing when the request
    /// carries a boundary. A body spilled to disk takes precedence over
    /// the in-memory buffer; the spill file is removed afterwards whether
    /// parsing succeeded or not.
    pub fn create(request: Request, params: ParamVec, cfg: &MultipartConfig) -> Result<Self> {
        let mut files = FileMap::new();

        let boundary = request
            .headers()
            .get("content-type")
            .and_then(multipart::extract_boundary);

        if let Some(boundary) = boundary.filter(|b| !b.is_empty()) {
            if let Some(spill) = request.spill_path() {
                let parsed = multipart::parse_file(spill, &boundary, cfg);
                if let Err(err) = fs::remove_file(spill) {
                    warn!(
                        path = %spill.display(),
                        error = %err,
                        "Failed to delete spill file"
                    );
                }
                files = parsed?;
            } else if request
                .headers()
                .get("content-type")
                .map(|ct| starts_with_ignore_case(ct, "multipart/form-data"))
                .unwrap_or(false)
            {
                files = multipart::parse(request.body(), &boundary, cfg)?;
            }
        }

        Ok(Self {
            request,
            params,
            files,
        })
    }

    /// Assemble a context without multipart parsing. Useful for tests and
    /// for dispatching synthetic requests.
    pub fn from_parts(request: Request, params: ParamVec, files: FileMap) -> Self {
        Self {
            request,
            params,
            files,
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Path parameter bound by the router, if any. When the same name was
    /// bound at several depths the innermost binding wins.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .rfind(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn params(&self) -> &ParamVec {
        &self.params
    }

    /// Uploaded file for a multipart field name, mutable so handlers can
    /// take the data out.
    pub fn file(&mut self, field_name: &str) -> Option<&mut UploadedFile> {
        self.files.get_mut(field_name)
    }

    pub fn files(&self) -> &FileMap {
        &self.files
    }
}
