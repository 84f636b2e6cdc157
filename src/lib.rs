//! # hsess: HandlerSocket session storage
//!
//! `hsess` keeps web sessions in a MySQL table reached through the
//! HandlerSocket plugin instead of SQL. Each session is one row of
//! `(id, modified, data)`; reads and writes are primary-key lookups and
//! expired sessions are removed with a range delete on `modified`.
//!
//! The crate is layered:
//!
//! - [`store`]: the [`IndexedStore`](store::IndexedStore) capability, the
//!   HandlerSocket TCP client and an in-memory store.
//! - [`SessionBackend`] and [`SaveHandler`]: the session lifecycle
//!   (`open`, `close`, `read`, `write`, `destroy`, `gc`) on top of a store.
//! - [`SessionLayer`] and [`Session`]: tower middleware that drives the
//!   lifecycle for every request, and the handle handlers use.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use axum::{Router, routing::get};
//! use hsess::{CookieOptions, Options, ServerOptions, Session, SessionLayer};
//! use tower_cookies::CookieManagerLayer;
//!
//! #[tokio::main]
//! async fn main() {
//!     let options = Options::build()
//!         .cookie(CookieOptions::build().name("sid").max_age(3600))
//!         .server(ServerOptions::build().host("127.0.0.1").port(9999));
//!
//!     // Connects and opens the session table; fails if either is missing.
//!     let session_layer = SessionLayer::start(options).await.unwrap();
//!
//!     let app = Router::new()
//!         .route("/", get(handler))
//!         .layer(session_layer)
//!         .layer(CookieManagerLayer::new()); // CookieManagerLayer must be after
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await.unwrap();
//!     axum::serve(listener, app).await.unwrap();
//! }
//!
//! async fn handler(session: Session) -> String {
//!     let count = session.get::<u32>().unwrap().unwrap_or(0) + 1;
//!     session.set(&count).unwrap();
//!     format!("You've visited this page {count} times")
//! }
//! ```
//!
//! # Driving the lifecycle directly
//!
//! ```rust,no_run
//! use hsess::{SaveHandler, ServerOptions, SessionBackend, SessionHandler};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), hsess::store::Error> {
//! let backend = Arc::new(SessionBackend::connect(&ServerOptions::default()).await?);
//! let handler = SaveHandler::new(backend);
//!
//! handler.open("", "hsess").await?;
//! let payload = handler.read("abc123").await?;
//! handler.write("abc123", b"user_id=5").await?;
//! handler.close().await?;
//!
//! // Maintenance: removes up to 1000 sessions idle for more than an hour.
//! let removed = handler.gc(3600).await?;
//! # let _ = (payload, removed);
//! # Ok(())
//! # }
//! ```
//!
//! ## Table layout
//!
//! ```sql
//! CREATE TABLE php_session (
//!     id       VARCHAR(64) NOT NULL PRIMARY KEY,
//!     modified DATETIME    NOT NULL,
//!     data     BLOB,
//!     KEY modified (modified)
//! );
//! ```
//!
//! ## Serialization
//!
//! Typed session values are serialised with one of:
//!
//! - [`bincode`](https://crates.io/crates/bincode) (default)
//! - [`rmp-serde`](https://crates.io/crates/rmp-serde) (MessagePack)
//!
//! ```toml
//! [dependencies]
//! hsess = { version = "0.1.0", default-features = false, features = ["axum", "messagepack"] }
//! ```
//!
//! # Important Notes
//!
//! ## Middleware Ordering
//! The `SessionLayer` must be applied **before** the `CookieManagerLayer`.
//!
//! ## Garbage collection
//! Each request runs `gc` with a probability of 1/100 by default
//! ([`SessionLayer::with_gc_probability`]). For busy sites prefer a
//! [`GcSweeper`] and set the probability to zero.

pub use cookie;

#[cfg(feature = "axum")]
mod extract;

pub mod bindings;

pub mod handler;
pub use handler::{GcSweeper, LastSeen, SaveHandler, SessionBackend, SessionHandler};

mod options;
pub use options::*;

pub mod record;

mod service;
pub use service::*;

mod session;
pub use session::*;

pub mod store;

pub use tower_cookies;
