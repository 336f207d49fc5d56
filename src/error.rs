//! HTML error pages served by the proxy itself
//!
//! Two pages have a fixed wire contract: the 503 "domain not configured"
//! page and the 500 "application boot failure" page. Both are HTML with a
//! `X-Pow-Handler` header identifying the handler that produced them, which
//! front-end tooling keys on.

use std::path::Path;

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};

/// Header naming the internal handler that produced an error page
pub const HANDLER_HEADER: &str = "X-Pow-Handler";

const HTML_CONTENT_TYPE: &str = "text/html; charset=utf8";

/// Escape text for embedding in an HTML page.
pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

fn html_response(
    status: StatusCode,
    handler: &'static str,
    body: String,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .header("Content-Type", HTML_CONTENT_TYPE)
        .header(HANDLER_HEADER, handler)
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

/// 503 page for a host that resolves to no application root.
///
/// The body suggests the symlink the user can create under the apps
/// directory to set the domain up.
pub fn nonexistent_domain(
    host: &str,
    domain: &str,
    apps_root: &Path,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let suffix = format!(".{}", domain);
    let prefix = host.strip_suffix(suffix.as_str()).unwrap_or(host);
    let link_path = format!("{}/{}", apps_root.display(), prefix);

    let body = format!(
        "<!DOCTYPE html>\n\
         <html>\n\
         <head><title>Application Not Found</title></head>\n\
         <body>\n\
           <h1>This domain isn&rsquo;t set up yet</h1>\n\
           <p>No application is configured for <code>{host}</code>.</p>\n\
           <p>Symlink your application to serve it from this domain:</p>\n\
           <pre>ln -s /path/to/myapp {link}</pre>\n\
         </body>\n\
         </html>\n",
        host = escape_html(host),
        link = escape_html(&link_path),
    );

    html_response(StatusCode::SERVICE_UNAVAILABLE, "NonexistentDomain", body)
}

/// 500 page for an application that failed to boot.
///
/// `detail` is the captured diagnostic output (an environment script's
/// stdout/stderr, for instance) and is rendered preformatted.
pub fn application_exception(
    root: &Path,
    message: &str,
    detail: &str,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = format!(
        "<!DOCTYPE html>\n\
         <html>\n\
         <head><title>Rackway: Error Starting Application</title></head>\n\
         <body>\n\
           <h1>Application could not be started</h1>\n\
           <p>The application at <code>{root}</code> raised an error during boot.</p>\n\
           <h2>{message}</h2>\n\
           <pre>{detail}</pre>\n\
         </body>\n\
         </html>\n",
        root = escape_html(&root.display().to_string()),
        message = escape_html(message),
        detail = escape_html(detail),
    );

    html_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        "ApplicationException",
        body,
    )
}

/// Plain 404 for requests that match a root but neither a static file nor a
/// rack application.
pub fn not_found(host: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = format!(
        "<!DOCTYPE html>\n\
         <html>\n\
         <head><title>Not Found</title></head>\n\
         <body><h1>Not Found</h1><p>Nothing is mounted at <code>{}</code> for this path.</p></body>\n\
         </html>\n",
        escape_html(host),
    );
    html_response(StatusCode::NOT_FOUND, "NotFound", body)
}
