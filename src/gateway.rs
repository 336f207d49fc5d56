//! The request pipeline
//!
//! Every request runs through an ordered chain of handlers: log it, resolve
//! the Host header to an application root, try the static fast path, locate
//! or construct the rack application, hand the request to its worker pool.
//! Errors raised by any handler jump to the error slot at the tail of the
//! chain, which renders the boot-failure page. The chain is a typed list;
//! the error slot is its own variant rather than a handler with a different
//! arity.

use std::path::PathBuf;
use std::sync::Arc;

use http_body_util::combinators::BoxBody;
use hyper::body::{Body, Bytes};
use hyper::header::HOST;
use hyper::{Method, Request, Response};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::app::{Application, HandleError};
use crate::config::Config;
use crate::error;
use crate::pause::{pause, BodyError, PausedBody, ResumeHandle};
use crate::resolver::ResolverError;
use crate::router::{host_name, HostRouter};

/// Normal handlers, in chain order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handler {
    LogRequest,
    FindApplicationRoot,
    ServeStatic,
    FindRackApplication,
    HandleApplicationRequest,
}

/// A chain slot: a normal handler, or the error renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Normal(Handler),
    Error,
}

/// The pipeline. Normal handlers run in order while no error is pending;
/// the error slot renders a pending error.
pub const CHAIN: [Slot; 6] = [
    Slot::Normal(Handler::LogRequest),
    Slot::Normal(Handler::FindApplicationRoot),
    Slot::Normal(Handler::ServeStatic),
    Slot::Normal(Handler::FindRackApplication),
    Slot::Normal(Handler::HandleApplicationRequest),
    Slot::Error,
];

/// Annotation attached to each request as it moves through the chain.
pub struct RequestContext {
    /// Normalized host (port stripped, lowercased).
    pub host: Option<String>,
    /// Application root the host resolved to.
    pub root: Option<PathBuf>,
    /// The rack application, when the root has a config.ru.
    pub application: Option<Arc<Application>>,
    /// Releases the request-body pause taken at pipeline entry.
    pub resume: ResumeHandle,
}

/// Errors a handler can raise into the error slot.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Resolver(#[from] ResolverError),

    #[error(transparent)]
    Handle(#[from] HandleError),
}

enum Flow {
    Next(Request<PausedBody>),
    Respond(Response<BoxBody<Bytes, hyper::Error>>),
}

/// Dispatches requests through the handler chain.
pub struct Gateway {
    config: Arc<Config>,
    router: Arc<HostRouter>,
}

impl Gateway {
    pub fn new(config: Arc<Config>, router: Arc<HostRouter>) -> Arc<Self> {
        Arc::new(Self { config, router })
    }

    /// Run one request through the chain. Always produces a response, and
    /// always releases the request pause before the response is returned.
    pub async fn dispatch<B>(&self, req: Request<B>) -> Response<BoxBody<Bytes, hyper::Error>>
    where
        B: Body<Data = Bytes> + Send + Unpin + 'static,
        B::Error: Into<BodyError>,
    {
        let (req, resume) = pause(req);
        let mut ctx = RequestContext {
            host: None,
            root: None,
            application: None,
            resume,
        };

        let mut req = Some(req);
        let mut pending: Option<GatewayError> = None;

        for slot in CHAIN {
            match slot {
                Slot::Normal(handler) => {
                    if pending.is_some() {
                        continue;
                    }
                    let Some(current) = req.take() else { break };
                    match self.run(handler, current, &mut ctx).await {
                        Ok(Flow::Next(passed)) => req = Some(passed),
                        Ok(Flow::Respond(response)) => {
                            ctx.resume.resume();
                            return response;
                        }
                        Err(e) => pending = Some(e),
                    }
                }
                Slot::Error => {
                    if let Some(e) = &pending {
                        ctx.resume.resume();
                        return self.render_error(e, &ctx);
                    }
                }
            }
        }

        // Root resolved but neither a static file nor a rack app matched.
        ctx.resume.resume();
        error::not_found(ctx.host.as_deref().unwrap_or(""))
    }

    async fn run(
        &self,
        handler: Handler,
        req: Request<PausedBody>,
        ctx: &mut RequestContext,
    ) -> Result<Flow, GatewayError> {
        match handler {
            Handler::LogRequest => self.log_request(req, ctx),
            Handler::FindApplicationRoot => self.find_application_root(req, ctx).await,
            Handler::ServeStatic => self.serve_static(req, ctx).await,
            Handler::FindRackApplication => self.find_rack_application(req, ctx).await,
            Handler::HandleApplicationRequest => self.handle_application_request(req, ctx).await,
        }
    }

    fn log_request(
        &self,
        req: Request<PausedBody>,
        _ctx: &mut RequestContext,
    ) -> Result<Flow, GatewayError> {
        let request_id = Uuid::new_v4();
        info!(
            request_id = %request_id,
            method = %req.method(),
            uri = %req.uri(),
            host = req.headers().get(HOST).and_then(|h| h.to_str().ok()).unwrap_or("-"),
            "Request"
        );
        Ok(Flow::Next(req))
    }

    async fn find_application_root(
        &self,
        req: Request<PausedBody>,
        ctx: &mut RequestContext,
    ) -> Result<Flow, GatewayError> {
        let raw_host = req
            .headers()
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .unwrap_or("");
        let host = host_name(raw_host);
        ctx.host = Some(host.clone());

        match self.router.route_for_host(&host).await? {
            Some(root) => {
                debug!(host, root = %root.display(), "Host resolved");
                ctx.root = Some(root);
                Ok(Flow::Next(req))
            }
            None => Ok(Flow::Respond(error::nonexistent_domain(
                &host,
                &self.config.apps.domain,
                &self.config.apps.root_path(),
            ))),
        }
    }

    async fn serve_static(
        &self,
        req: Request<PausedBody>,
        ctx: &mut RequestContext,
    ) -> Result<Flow, GatewayError> {
        if req.method() != Method::GET && req.method() != Method::HEAD {
            return Ok(Flow::Next(req));
        }
        let Some(root) = &ctx.root else {
            return Ok(Flow::Next(req));
        };

        let statics = self.router.static_for_root(root);
        match statics.serve(req.method(), req.uri().path()).await {
            Some(response) => Ok(Flow::Respond(response)),
            None => {
                // Deferring to the rack branch; unblock the body now.
                ctx.resume.resume();
                Ok(Flow::Next(req))
            }
        }
    }

    async fn find_rack_application(
        &self,
        req: Request<PausedBody>,
        ctx: &mut RequestContext,
    ) -> Result<Flow, GatewayError> {
        if let Some(root) = &ctx.root {
            ctx.application = self.router.application_for_root(root).await;
        }
        Ok(Flow::Next(req))
    }

    async fn handle_application_request(
        &self,
        req: Request<PausedBody>,
        ctx: &mut RequestContext,
    ) -> Result<Flow, GatewayError> {
        match &ctx.application {
            Some(app) => {
                let response = app.handle(req, &ctx.resume).await?;
                Ok(Flow::Respond(response))
            }
            None => Ok(Flow::Next(req)),
        }
    }

    fn render_error(
        &self,
        err: &GatewayError,
        ctx: &RequestContext,
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        let root = ctx.root.clone().unwrap_or_default();
        error!(
            root = %root.display(),
            host = ctx.host.as_deref().unwrap_or("-"),
            error = %err,
            "Request failed"
        );
        match err {
            GatewayError::Handle(HandleError::Boot(boot)) => {
                error::application_exception(&root, &boot.to_string(), &boot.detail())
            }
            GatewayError::Handle(HandleError::Pool(pool)) => {
                error::application_exception(&root, &pool.to_string(), "")
            }
            GatewayError::Resolver(resolver) => {
                error::application_exception(&root, &resolver.to_string(), "")
            }
        }
    }
}
