// SPDX-License-Identifier: MIT

//! Middleware hooks around request handlers.
//!
//! Provides the CORS middleware: every response gets a permissive
//! `Access-Control-Allow-Origin`, and preflight `OPTIONS` requests are
//! answered directly with 204.

use crate::http::{Request, Response};
use log::trace;

/// Middlewares can answer a request before it reaches a handler and
/// decorate every response on the way out.
pub trait Middleware: Send + Sync + 'static {
    /// Returning `Some` skips the handler and the remaining `before` hooks.
    fn before(&self, _request: &Request<'_>) -> Option<Response> {
        None
    }

    fn after(&self, _request: &Request<'_>, response: Response) -> Response {
        response
    }
}

pub const CORS_ALLOWED_METHODS: &str = "GET, POST, OPTIONS";
pub const CORS_ALLOWED_HEADERS: &str = "Content-Type";
/// Seconds browsers may cache a preflight answer
const CORS_MAX_AGE: &str = "86400";

#[derive(Debug, Clone, Default)]
pub struct CorsMiddleware;

impl CorsMiddleware {
    pub fn new() -> Self {
        Self
    }
}

impl Middleware for CorsMiddleware {
    fn before(&self, request: &Request<'_>) -> Option<Response> {
        if request.method != "OPTIONS" {
            return None;
        }
        trace!("Answering CORS preflight for {}", request.path);

        // Echo requested headers so multipart uploads from browsers pass
        let allowed_headers = request
            .header("access-control-request-headers")
            .filter(|value| is_header_name_list(value))
            .unwrap_or(CORS_ALLOWED_HEADERS)
            .to_string();

        Some(
            Response::new(204)
                .with_header("Access-Control-Allow-Methods", CORS_ALLOWED_METHODS)
                .with_header("Access-Control-Allow-Headers", &allowed_headers)
                .with_header("Access-Control-Max-Age", CORS_MAX_AGE),
        )
    }

    fn after(&self, _request: &Request<'_>, response: Response) -> Response {
        response.with_header("Access-Control-Allow-Origin", "*")
    }
}

/// A comma separated list of header names (RFC 9110 tokens), safe to copy
/// into a response header.
fn is_header_name_list(value: &str) -> bool {
    value.split(',').all(|name| {
        let name = name.trim_matches([' ', '\t']);
        !name.is_empty()
            && name
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b))
    })
}
