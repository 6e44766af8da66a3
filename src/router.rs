//! Small router for registering and matching request handlers.
//!
//! Routes match on method plus exact path; the query string is never part of
//! the match. A path that is registered for another method yields 405, an
//! unknown path yields 404. Handlers return `None` when nothing may be sent
//! back (the client already went away).

use crate::http::{Request, Response};
use crate::middleware::Middleware;
use log::{debug, trace};

/// Type alias for a request handler closure.
pub type Handler = Box<dyn Fn(&mut Request<'_>) -> Option<Response> + Send + Sync + 'static>;

struct RouteEntry {
    method: String,
    path: String,
    handler: Handler,
}

#[derive(Default)]
pub struct Router {
    routes: Vec<RouteEntry>,
    middleware: Vec<Box<dyn Middleware>>, // executed in registration order
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an exact path match for the given HTTP method.
    pub fn register_exact<M, P>(&mut self, method: M, path: P, handler: Handler)
    where
        M: Into<String>,
        P: Into<String>,
    {
        self.routes.push(RouteEntry {
            method: method.into().to_uppercase(),
            path: path.into(),
            handler,
        });
    }

    pub fn add_middleware(&mut self, mw: Box<dyn Middleware>) {
        self.middleware.push(mw);
    }

    /// Resolve and run the handler for `request`, wrapped by the middleware
    /// chain. `None` means no response may be written.
    pub fn route(&self, request: &mut Request<'_>) -> Option<Response> {
        debug!("Routing request: {} {}", request.method, request.path);

        let short_circuit = self.middleware.iter().find_map(|mw| mw.before(request));
        let response = match short_circuit {
            Some(response) => {
                trace!("Middleware answered {} {}", request.method, request.path);
                Some(response)
            }
            None => self.dispatch(request),
        }?;

        Some(
            self.middleware
                .iter()
                .fold(response, |response, mw| mw.after(request, response)),
        )
    }

    fn dispatch(&self, request: &mut Request<'_>) -> Option<Response> {
        let mut allowed: Vec<&str> = Vec::new();

        for entry in &self.routes {
            if entry.path != request.path {
                continue;
            }
            if entry.method == request.method {
                debug!("Route matched: {} {}", entry.method, entry.path);
                return (entry.handler)(request);
            }
            allowed.push(&entry.method);
        }

        if allowed.is_empty() {
            debug!("No route matched for: {} {}", request.method, request.path);
            Some(Response::error(404, "Not found"))
        } else {
            debug!(
                "Method {} not allowed for {} (allowed: {allowed:?})",
                request.method, request.path
            );
            Some(
                Response::error(405, "Method not allowed")
                    .with_header("Allow", &allowed.join(", ")),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_request(method: &str, path: &str) -> Request<'static> {
        Request::from_parts(method, path, &[], Vec::new())
    }

    fn ok_handler(tag: &'static str) -> Handler {
        Box::new(move |_| Some(Response::new(200).with_body(tag.to_string())))
    }

    struct Stamp;

    impl Middleware for Stamp {
        fn after(&self, _request: &Request<'_>, response: Response) -> Response {
            response.with_header("X-Stamp", "1")
        }
    }

    struct Gate;

    impl Middleware for Gate {
        fn before(&self, request: &Request<'_>) -> Option<Response> {
            (request.path == "/blocked").then(|| Response::new(204))
        }
    }

    #[test]
    fn test_exact_route_matching() {
        let mut router = Router::new();
        router.register_exact("GET", "/", ok_handler("root"));
        router.register_exact("post", "/api/upload", ok_handler("upload"));

        let resp = router.route(&mut dummy_request("GET", "/")).unwrap();
        assert_eq!(resp.status_code, 200);
        assert_eq!(resp.body_text(), "root");

        let resp = router
            .route(&mut dummy_request("POST", "/api/upload"))
            .unwrap();
        assert_eq!(resp.body_text(), "upload");
    }

    #[test]
    fn test_unknown_path_is_404() {
        let router = Router::new();
        let resp = router.route(&mut dummy_request("GET", "/missing")).unwrap();
        assert_eq!(resp.status_code, 404);
        assert_eq!(resp.body_text(), r#"{"error":"Not found"}"#);
    }

    #[test]
    fn test_method_is_respected() {
        let mut router = Router::new();
        router.register_exact("POST", "/api/upload", ok_handler("upload"));

        let resp = router
            .route(&mut dummy_request("GET", "/api/upload"))
            .unwrap();
        assert_eq!(resp.status_code, 405);
        assert_eq!(resp.header("allow"), Some("POST"));
    }

    #[test]
    fn test_handler_may_suppress_response() {
        let mut router = Router::new();
        router.register_exact("POST", "/api/upload", Box::new(|_| None));
        router.add_middleware(Box::new(Stamp));
        assert!(router
            .route(&mut dummy_request("POST", "/api/upload"))
            .is_none());
    }

    #[test]
    fn test_middleware_hooks() {
        let mut router = Router::new();
        router.register_exact("GET", "/", ok_handler("root"));
        router.add_middleware(Box::new(Gate));
        router.add_middleware(Box::new(Stamp));

        let resp = router.route(&mut dummy_request("GET", "/blocked")).unwrap();
        assert_eq!(resp.status_code, 204);
        assert_eq!(resp.header("X-Stamp"), Some("1"));

        let resp = router.route(&mut dummy_request("GET", "/")).unwrap();
        assert_eq!(resp.status_code, 200);
        assert_eq!(resp.header("X-Stamp"), Some("1"));
    }
}
