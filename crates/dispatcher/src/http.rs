//! Plain HTTP handling on the worker port.
//!
//! Requests that are not WebSocket upgrades walk a chain of [`HttpHandler`]s
//! in registration order. The first handler returning [`HttpOutcome::Handled`]
//! ends the walk; when every handler passes, the server answers 404.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::Request,
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
};

pub enum HttpOutcome {
    Handled(Response),
    /// Hands the untouched request to the next handler.
    NotHandled(Request),
}

#[async_trait]
pub trait HttpHandler: Send + Sync {
    async fn handle(&self, request: Request) -> HttpOutcome;
}

/// Adapts an async closure into an [`HttpHandler`].
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> HttpHandler for FnHandler<F>
where
    F: Fn(Request) -> Fut + Send + Sync,
    Fut: Future<Output = HttpOutcome> + Send,
{
    async fn handle(&self, request: Request) -> HttpOutcome {
        (self.0)(request).await
    }
}

/// Answers a single method and exact path; passes everything else along.
pub struct RouteHandler<F> {
    method: Method,
    path: String,
    handler: F,
}

impl<F> RouteHandler<F> {
    pub fn new(method: Method, path: impl Into<String>, handler: F) -> Self {
        Self {
            method,
            path: path.into(),
            handler,
        }
    }

    pub fn get(path: impl Into<String>, handler: F) -> Self {
        Self::new(Method::GET, path, handler)
    }
}

#[async_trait]
impl<F, Fut> HttpHandler for RouteHandler<F>
where
    F: Fn(Request) -> Fut + Send + Sync,
    Fut: Future<Output = Response> + Send,
{
    async fn handle(&self, request: Request) -> HttpOutcome {
        if request.method() == self.method && request.uri().path() == self.path {
            HttpOutcome::Handled((self.handler)(request).await)
        } else {
            HttpOutcome::NotHandled(request)
        }
    }
}

pub(crate) async fn run_chain(handlers: &[Arc<dyn HttpHandler>], mut request: Request) -> Response {
    for handler in handlers {
        match handler.handle(request).await {
            HttpOutcome::Handled(response) => return response,
            HttpOutcome::NotHandled(passed) => request = passed,
        }
    }
    (StatusCode::NOT_FOUND, "Not Found").into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn request(method: Method, path: &str) -> Request {
        Request::builder()
            .method(method)
            .uri(path)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_empty_chain_is_404() {
        let response = run_chain(&[], request(Method::GET, "/anything")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_first_handler_wins_and_stops_chain() {
        let later_calls = Arc::new(AtomicUsize::new(0));
        let counter = later_calls.clone();

        let handlers: Vec<Arc<dyn HttpHandler>> = vec![
            Arc::new(RouteHandler::get("/health", |_req: Request| async {
                "ok".into_response()
            })),
            Arc::new(RouteHandler::get("/health", |_req: Request| async {
                "second".into_response()
            })),
            Arc::new(FnHandler(move |req: Request| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move { HttpOutcome::NotHandled(req) }
            })),
        ];

        let response = run_chain(&handlers, request(Method::GET, "/health")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "ok");
        assert_eq!(later_calls.load(Ordering::SeqCst), 0);

        let response = run_chain(&handlers, request(Method::GET, "/missing")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(later_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_route_handler_matches_method() {
        let handlers: Vec<Arc<dyn HttpHandler>> = vec![Arc::new(RouteHandler::get(
            "/workers",
            |_req: Request| async { "[]".into_response() },
        ))];

        let response = run_chain(&handlers, request(Method::POST, "/workers")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
