//! Axum middleware that answers matched requests with a redirect.
//!
//! Wrap any router with
//! `axum::middleware::from_fn_with_state(state, redirect_middleware)`.
//! Unmatched requests, and requests that fail to resolve, go to the next
//! handler unchanged.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use redirects_core::Redirect;

use crate::resolver::{DimensionProvider, RequestResolver};

/// State shared by every invocation of [`redirect_middleware`].
#[derive(Clone)]
pub struct RedirectLayer {
    pub resolver: Arc<RequestResolver>,
    pub dimensions: Arc<dyn DimensionProvider>,
}

impl RedirectLayer {
    pub fn new(resolver: Arc<RequestResolver>, dimensions: Arc<dyn DimensionProvider>) -> Self {
        Self {
            resolver,
            dimensions,
        }
    }
}

pub async fn redirect_middleware(
    State(layer): State<RedirectLayer>,
    request: Request,
    next: Next,
) -> Response {
    let dimension = layer.dimensions.dimension(request.headers());
    let uri = request.uri();
    let response = layer
        .resolver
        .resolve(request.method(), uri.path(), uri.query(), &dimension)
        .and_then(|redirect| redirect_response(&redirect));

    match response {
        Some(response) => response,
        None => next.run(request).await,
    }
}

/// 3xx codes carry a `Location` header; 404 and 410 answer with the bare
/// status. Returns `None` if the location is not a valid header value.
fn redirect_response(redirect: &Redirect) -> Option<Response> {
    let status = StatusCode::from_u16(redirect.code.as_u16()).ok()?;
    if !status.is_redirection() {
        return Some(status.into_response());
    }

    match HeaderValue::from_str(&redirect.location) {
        Ok(location) => Some((status, [(header::LOCATION, location)]).into_response()),
        Err(e) => {
            tracing::warn!(location = %redirect.location, error = %e, "redirect location is not a valid header");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redirects_core::RedirectCode;

    #[test]
    fn test_redirect_response_sets_location() {
        let response = redirect_response(&Redirect {
            location: "/new?a=1".into(),
            code: RedirectCode::Temporary,
        })
        .unwrap();
        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(response.headers()[header::LOCATION], "/new?a=1");
    }

    #[test]
    fn test_gone_has_no_location() {
        let response = redirect_response(&Redirect {
            location: "/irrelevant".into(),
            code: RedirectCode::Gone,
        })
        .unwrap();
        assert_eq!(response.status(), StatusCode::GONE);
        assert!(response.headers().get(header::LOCATION).is_none());
    }

    #[test]
    fn test_invalid_location_falls_through() {
        let response = redirect_response(&Redirect {
            location: "/bad\nheader".into(),
            code: RedirectCode::Found,
        });
        assert!(response.is_none());
    }
}
