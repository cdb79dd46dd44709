//! The application extension point.

use async_trait::async_trait;
use std::sync::Arc;

use crate::http::request::Request;
use crate::http::response::Response;

/// Serves one request.
///
/// Returns `true` when the response was fully produced. `false` is a
/// handling failure: the server answers `500 Internal Server Error` if no
/// head went out yet, and closes the connection either way.
///
/// A response left unfinished by a handler returning `true` is ended by the
/// server.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, request: &Request, response: &mut Response) -> bool;
}

#[async_trait]
impl<H: Handler + ?Sized> Handler for Arc<H> {
    async fn handle(&self, request: &Request, response: &mut Response) -> bool {
        (**self).handle(request, response).await
    }
}

#[async_trait]
impl<H: Handler + ?Sized> Handler for Box<H> {
    async fn handle(&self, request: &Request, response: &mut Response) -> bool {
        (**self).handle(request, response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    struct Greeting;

    #[async_trait]
    impl Handler for Greeting {
        async fn handle(&self, _request: &Request, response: &mut Response) -> bool {
            response.expand_utf8("hi").await
        }
    }

    #[tokio::test]
    async fn shared_handlers_delegate() {
        let shared: Arc<dyn Handler> = Arc::new(Greeting);
        let boxed: Box<dyn Handler> = Box::new(Arc::clone(&shared));

        let request = Request::new(Url::parse("http://localhost/").unwrap());
        let mut response = Response::new(&request);
        assert!(boxed.handle(&request, &mut response).await);

        let out = request.connection().output_stream().steal_as_bytes().await;
        assert!(out.ends_with(b"hi"));
    }
}
