//! Session management middleware for tower applications.
//!
//! This module provides [`SessionLayer`], which runs every request through
//! the session lifecycle: `open`, `read`, the wrapped service, then `write`
//! or `destroy`, and `close`.

use http::{Request, Response, StatusCode};
use tower::{Layer, Service};
use tower_cookies::{Cookie, Cookies};

use crate::handler::{SaveHandler, SessionBackend, SessionHandler};
use crate::options::Options;
use crate::store::handlersocket::HandlerSocket;
use crate::store::{self, IndexedStore};
use crate::{CookieOptions, Id, Inner};
use cookie::time::Duration;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

/// Runs gc on roughly `numerator` out of every `denominator` requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GcProbability {
    pub numerator: u32,
    pub denominator: u32,
}

impl Default for GcProbability {
    fn default() -> Self {
        Self {
            numerator: 1,
            denominator: 100,
        }
    }
}

impl GcProbability {
    fn roll(&self) -> bool {
        self.numerator > 0
            && self.denominator > 0
            && rand::random_range(0..self.denominator) < self.numerator
    }
}

/// A Tower Middleware to use `Session`.
#[derive(Debug)]
pub struct SessionService<S, C: IndexedStore = HandlerSocket> {
    inner: S,
    backend: Arc<SessionBackend<C>>,
    cookie_options: Arc<CookieOptions>,
    gc_probability: GcProbability,
}

impl<S: Clone, C: IndexedStore> Clone for SessionService<S, C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            backend: self.backend.clone(),
            cookie_options: self.cookie_options.clone(),
            gc_probability: self.gc_probability,
        }
    }
}

impl<ReqBody, ResBody, S, C> Service<Request<ReqBody>> for SessionService<S, C>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send,
    ReqBody: Send + 'static,
    ResBody: Default + Send + 'static,
    C: IndexedStore,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    #[inline]
    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<ReqBody>) -> Self::Future {
        // The clone is not guaranteed to be ready; swap it for the one that
        // was polled.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        let backend = self.backend.clone();
        let cookie_options = self.cookie_options.clone();
        let gc_probability = self.gc_probability;

        Box::pin(async move {
            let Some(cookies) = req.extensions().get::<Cookies>().cloned() else {
                tracing::error!("cookies not found in the request extensions, is CookieManagerLayer applied?");
                return Ok(internal_error());
            };

            let handler = SaveHandler::new(backend);
            let session = match load(&handler, &cookies, &cookie_options, gc_probability).await {
                Ok(session) => Arc::new(session),
                Err(err) => {
                    tracing::error!(err = %err, "failed to load session");
                    return Ok(internal_error());
                }
            };

            req.extensions_mut().insert(session.clone());
            let res = inner.call(req).await?;

            if let Err(err) = save(&handler, &session, &cookies, &cookie_options).await {
                tracing::error!(err = %err, "failed to save session");
                return Ok(internal_error());
            }

            Ok(res)
        })
    }
}

fn internal_error<B: Default>() -> Response<B> {
    let mut res = Response::new(B::default());
    *res.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    res
}

async fn load<C: IndexedStore>(
    handler: &SaveHandler<C>,
    cookies: &Cookies,
    cookie_options: &CookieOptions,
    gc_probability: GcProbability,
) -> Result<Inner, store::Error> {
    handler.open("", cookie_options.name).await?;

    if gc_probability.roll() {
        if let Err(err) = handler.gc(cookie_options.lifetime_secs()).await {
            tracing::warn!(err = %err, "probabilistic gc failed");
        }
    }

    let id = cookies.get(cookie_options.name).and_then(|cookie| {
        cookie
            .value()
            .parse::<Id>()
            .map_err(|err| {
                tracing::warn!(
                    err = %err,
                    "possibly suspicious activity: malformed session id"
                )
            })
            .ok()
    });

    let Some(id) = id else {
        return Ok(Inner::default());
    };

    let payload = handler.read(&id.to_string()).await?;
    if handler.last_seen().is_none() {
        // Unknown ids are never adopted.
        return Ok(Inner::default());
    }

    Ok(Inner::new(Some(id), payload))
}

async fn save<C: IndexedStore>(
    handler: &SaveHandler<C>,
    session: &Inner,
    cookies: &Cookies,
    cookie_options: &CookieOptions,
) -> Result<(), store::Error> {
    let replaced = session.replaced.lock().take();
    if let Some(old_id) = replaced {
        handler.destroy(&old_id.to_string()).await?;
    }

    let id = *session.id.read();
    if session.is_deleted() {
        if let Some(id) = id {
            handler.destroy(&id.to_string()).await?;
        }
        cookies.remove(removal_cookie(cookie_options));
    } else if session.is_changed() || session.existing {
        if let Some(id) = id {
            let payload = session.payload.read().clone();
            handler.write(&id.to_string(), &payload).await?;
            cookies.add(build_cookie(&id, cookie_options));
        }
    }

    handler.close().await?;
    Ok(())
}

fn build_cookie(id: &Id, cookie_options: &CookieOptions) -> Cookie<'static> {
    let cookie_builder = Cookie::build((cookie_options.name, id.to_string()))
        .secure(cookie_options.secure)
        .http_only(cookie_options.http_only)
        .same_site(cookie_options.same_site)
        .max_age(Duration::seconds(cookie_options.max_age));

    let cookie_builder = if let Some(domain) = cookie_options.domain {
        cookie_builder.domain(domain)
    } else {
        cookie_builder
    };

    let cookie_builder = if let Some(path) = cookie_options.path {
        cookie_builder.path(path)
    } else {
        cookie_builder
    };

    cookie_builder.build()
}

fn removal_cookie(cookie_options: &CookieOptions) -> Cookie<'static> {
    let mut cookie = Cookie::from(cookie_options.name);
    if let Some(domain) = cookie_options.domain {
        cookie.set_domain(domain);
    }
    if let Some(path) = cookie_options.path {
        cookie.set_path(path);
    }
    cookie
}

/// Layer to apply [`SessionService`] middleware.
///
/// # Example
///
/// ```rust,no_run
/// use axum::{Router, routing::get};
/// use hsess::{CookieOptions, Options, ServerOptions, SessionLayer};
/// use tower_cookies::CookieManagerLayer;
///
/// # async fn run() -> Result<(), hsess::store::Error> {
/// let options = Options::build()
///     .cookie(CookieOptions::build().name("sid").max_age(30 * 60))
///     .server(ServerOptions::build().host("db.internal"));
///
/// let app: Router<()> = Router::new()
///     .route("/", get(|| async { "hello" }))
///     .layer(SessionLayer::start(options).await?)
///     .layer(CookieManagerLayer::new());
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct SessionLayer<C: IndexedStore = HandlerSocket> {
    backend: Arc<SessionBackend<C>>,
    cookie_options: CookieOptions,
    gc_probability: GcProbability,
}

impl<C: IndexedStore> Clone for SessionLayer<C> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            cookie_options: self.cookie_options,
            gc_probability: self.gc_probability,
        }
    }
}

impl SessionLayer<HandlerSocket> {
    /// Validates `options`, connects to the HandlerSocket endpoint and opens
    /// the session table. Every failure here is fatal.
    #[tracing::instrument(name = "starting session layer", skip(options))]
    pub async fn start(options: Options) -> Result<Self, store::Error> {
        options.validate()?;
        let backend = SessionBackend::connect(&options.server).await?;
        Ok(Self::new(Arc::new(backend)).with_cookie_options(options.cookie))
    }
}

impl<C: IndexedStore> SessionLayer<C> {
    /// Create a new session manager layer.
    pub fn new(backend: Arc<SessionBackend<C>>) -> Self {
        Self {
            backend,
            cookie_options: CookieOptions::default(),
            gc_probability: GcProbability::default(),
        }
    }

    pub fn backend(&self) -> &Arc<SessionBackend<C>> {
        &self.backend
    }

    /// Set the cookie options for the session manager.
    pub fn with_cookie_options(mut self, options: CookieOptions) -> Self {
        self.cookie_options = options;
        self
    }

    /// Sets how often a request also runs gc. A zero numerator disables it.
    pub fn with_gc_probability(mut self, numerator: u32, denominator: u32) -> Self {
        self.gc_probability = GcProbability {
            numerator,
            denominator,
        };
        self
    }
}

impl<S, C: IndexedStore> Layer<S> for SessionLayer<C> {
    type Service = SessionService<S, C>;

    fn layer(&self, inner: S) -> Self::Service {
        SessionService {
            inner,
            backend: self.backend.clone(),
            cookie_options: Arc::new(self.cookie_options),
            gc_probability: self.gc_probability,
        }
    }
}
