#![allow(dead_code)]

use hsess::record::Clock;
use hsess::store::memory::MemoryStore;
use hsess::{CookieOptions, SaveHandler, ServerOptions, SessionBackend};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const DB: &str = "session";
pub const TABLE: &str = "php_session";

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct TestUser {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct TestSession {
    pub user: TestUser,
    pub preferences: TestPreferences,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct TestPreferences {
    pub theme: String,
    pub language: String,
}

pub fn create_test_session() -> TestSession {
    TestSession {
        user: TestUser {
            id: 1,
            name: "Test User".to_string(),
        },
        preferences: TestPreferences {
            theme: "dark".to_string(),
            language: "en".to_string(),
        },
    }
}

pub fn build_cookie_options() -> CookieOptions {
    CookieOptions::build()
        .name("test_sess")
        .http_only(true)
        .same_site(cookie::SameSite::Lax)
        .secure(true)
        .max_age(15)
        .path("/")
}

/// A backend over a fresh in-memory session table, stamping UTC.
pub async fn memory_backend() -> (MemoryStore, Arc<SessionBackend<MemoryStore>>) {
    let store = MemoryStore::new().with_session_table(DB, TABLE);
    let backend = SessionBackend::new(Arc::new(store.clone()), &ServerOptions::default())
        .await
        .unwrap()
        .with_clock(Clock::utc());
    (store, Arc::new(backend))
}

pub async fn memory_handler() -> (MemoryStore, SaveHandler<MemoryStore>) {
    let (store, backend) = memory_backend().await;
    (store, SaveHandler::new(backend))
}
