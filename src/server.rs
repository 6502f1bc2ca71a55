mod auth;
mod responses;
mod routes;

use anyhow::{anyhow, Context, Result};
use axum::http::Method;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, TraceLayer};
use tracing::{info, Level};

use crate::state::State;

pub struct Server {
    socket: TcpListener,
    app: Router,
}

impl Server {
    pub async fn new(state: State) -> Result<Self> {
        let bind_addr = &state.cfg.bind_addr;
        let socket = TcpListener::bind(bind_addr)
            .await
            .with_context(|| anyhow!("could not bind to `{bind_addr}`"))?;
        info!("Listening on `{bind_addr}`");

        Ok(Self {
            socket,
            app: router(state),
        })
    }

    pub async fn serve(self, cancel: CancellationToken) -> Result<()> {
        axum::serve(self.socket, self.app)
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await
            .context("the HTTP server encountered a failure")
    }
}

pub fn router(state: State) -> Router {
    use axum::routing::{delete, get};

    let api = Router::new()
        .route("/readiness", get(routes::readiness))
        .route("/err", get(routes::err))
        .route("/users", get(routes::get_user).post(routes::create_user))
        .route("/feeds", get(routes::get_feeds).post(routes::create_feed))
        .route("/feeds/:feed_id", delete(routes::delete_feed))
        .route(
            "/feed_follows",
            get(routes::get_feed_follows).post(routes::create_feed_follow),
        )
        .route(
            "/feed_follows/:feed_follow_id",
            delete(routes::delete_feed_follow),
        )
        .route("/posts", get(routes::get_posts));

    Router::new()
        .nest("/v1", api)
        .layer(
            ServiceBuilder::new()
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                        .on_request(DefaultOnRequest::new().level(Level::INFO)),
                )
                .layer(
                    CorsLayer::new()
                        .allow_origin(Any)
                        .allow_methods([
                            Method::GET,
                            Method::POST,
                            Method::PUT,
                            Method::DELETE,
                            Method::OPTIONS,
                        ])
                        .allow_headers(Any),
                ),
        )
        .with_state(state)
}
