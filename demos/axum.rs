use axum::routing::get;
use axum::{Json, Router};
use hsess::{CookieOptions, GcSweeper, Options, ServerOptions, Session, SessionLayer};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use tower_cookies::CookieManagerLayer;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct User {
    id: i64,
    name: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
enum Theme {
    Light,
    #[default]
    Dark,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct AppSession {
    user: Option<User>,
    ip: Option<IpAddr>,
    theme: Option<Theme>,
}

fn routes() -> Router {
    Router::new()
        .route(
            "/insert",
            get(|session: Session| async move {
                let app_session = AppSession {
                    user: Some(User {
                        id: 34895634,
                        name: String::from("John Doe"),
                    }),
                    ip: Some(IpAddr::from(Ipv4Addr::new(192, 168, 0, 1))),
                    theme: Some(Theme::Dark),
                };

                session
                    .set(&app_session)
                    .map_err(|e| e.to_string())
                    .unwrap();
            }),
        )
        .route(
            "/theme",
            get(|session: Session| async move {
                let mut app_session: AppSession = session.get().unwrap().unwrap_or_default();
                app_session.theme = Some(Theme::Light);
                session.set(&app_session).unwrap();
            }),
        )
        .route(
            "/get",
            get(|session: Session| async move {
                let app_session: Option<AppSession> =
                    session.get().map_err(|e| e.to_string()).unwrap();
                Json(app_session.unwrap_or_default())
            }),
        )
        .route(
            "/regenerate",
            get(|session: Session| async move { session.regenerate().to_string() }),
        )
        .route(
            "/delete",
            get(|session: Session| async move {
                session.delete();
            }),
        )
}

#[tokio::main]
async fn main() {
    let options = Options::build()
        .cookie(
            CookieOptions::build()
                .name("test_sess")
                .http_only(true)
                .same_site(cookie::SameSite::Lax)
                .secure(true)
                .max_age(60 * 60)
                .path("/"),
        )
        .server(ServerOptions::build().host("127.0.0.1").port(9999));

    let session_layer = SessionLayer::start(options)
        .await
        .unwrap()
        .with_gc_probability(0, 1);

    GcSweeper::new(session_layer.backend().clone())
        .interval(Duration::from_secs(60))
        .max_lifetime(60 * 60)
        .spawn();

    let app = routes()
        .layer(session_layer)
        .layer(CookieManagerLayer::new());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:3000")
        .await
        .unwrap();
    axum::serve(listener, app).await.unwrap();
}
