//! Static file serving from an application's public/ directory
//!
//! A matching file under `root/public` short-circuits the worker pool
//! entirely; requests that match nothing defer to the rack branch of the
//! pipeline. GET and HEAD only (enforced by the caller), no directory
//! listings, no range requests - this is a dev tool, not a CDN.

use std::path::{Component, Path, PathBuf};

use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Bytes;
use hyper::{Method, Response, StatusCode};
use tracing::debug;

/// Memoised static handler rooted at one application's public directory.
pub struct StaticDir {
    public: PathBuf,
}

impl StaticDir {
    pub fn new(root: &Path) -> Self {
        Self {
            public: root.join("public"),
        }
    }

    /// Serve `path` if a matching file exists; `None` defers to the next
    /// handler.
    pub async fn serve(
        &self,
        method: &Method,
        path: &str,
    ) -> Option<Response<BoxBody<Bytes, hyper::Error>>> {
        let file = self.candidate(path)?;

        let meta = match tokio::fs::metadata(&file).await {
            Ok(meta) if meta.is_file() => meta,
            _ => return None,
        };

        let content_type = content_type_for(&file);
        let builder = Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", content_type)
            .header("Content-Length", meta.len());

        let response = if method == Method::HEAD {
            builder.body(Empty::<Bytes>::new().map_err(|e| match e {}).boxed())
        } else {
            let contents = match tokio::fs::read(&file).await {
                Ok(contents) => contents,
                // The file vanished between stat and read; let the app have it.
                Err(_) => return None,
            };
            builder.body(Full::new(Bytes::from(contents)).map_err(|e| match e {}).boxed())
        };

        debug!(file = %file.display(), %content_type, "Serving static file");
        response.ok()
    }

    /// Map a request path to a file under public/, rejecting traversal.
    fn candidate(&self, path: &str) -> Option<PathBuf> {
        let mut relative = path.trim_start_matches('/').to_string();
        if relative.is_empty() || relative.ends_with('/') {
            relative.push_str("index.html");
        }

        let relative = Path::new(&relative);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return None;
        }

        Some(self.public.join(relative))
    }
}

/// Content type by file extension; octet-stream for anything unknown.
fn content_type_for(path: &Path) -> &'static str {
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    match extension {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" => "application/javascript",
        "json" => "application/json",
        "txt" => "text/plain",
        "xml" => "application/xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "pdf" => "application/pdf",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        _ => "application/octet-stream",
    }
}
