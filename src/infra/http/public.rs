use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    extract::State,
    http::{
        HeaderValue, Request, StatusCode,
        header::{CACHE_CONTROL, CONTENT_TYPE},
    },
    middleware,
    response::{IntoResponse, Response},
    routing::get,
};
use tower_http::cors::CorsLayer;

use crate::{application::error::AppError, cache::ContentCache};

use super::middleware::{log_responses, set_request_context};

#[derive(Clone)]
pub struct HttpState {
    pub cache: Arc<ContentCache>,
}

pub fn build_router(state: HttpState, cors: CorsLayer) -> Router {
    Router::new()
        .route("/text", get(text))
        .route("/Text", get(text))
        .route("/image", get(image))
        .route("/Image", get(image))
        .route("/_health", get(health))
        .fallback(not_found)
        .with_state(state)
        .layer(cors)
        .layer(middleware::from_fn(log_responses))
        .layer(middleware::from_fn(set_request_context))
}

async fn text(State(state): State<HttpState>) -> Response {
    plain_text(state.cache.view_text())
}

async fn image(State(state): State<HttpState>) -> Response {
    plain_text(state.cache.view_image())
}

async fn health() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn not_found(request: Request<Body>) -> Response {
    AppError::not_found(format!("no route for {}", request.uri().path())).into_response()
}

fn plain_text(body: String) -> Response {
    let mut response = body.into_response();
    let headers = response.headers_mut();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}
