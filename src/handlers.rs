//! Route registration for the service endpoints.

use crate::http::{Request, Response};
use crate::router::Router;
use crate::upload::UploadHandler;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

pub const INFO_PATH: &str = "/";
pub const UPLOAD_PATH: &str = "/api/upload";

#[derive(Serialize)]
struct Endpoints {
    upload: &'static str,
    files: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ServiceInfo<'a> {
    status: &'static str,
    message: &'static str,
    endpoints: Endpoints,
    upload_directory: &'a str,
}

/// Register `GET /` and `POST /api/upload`.
pub fn register_routes(router: &mut Router, upload_handler: Arc<UploadHandler>) {
    let info_dir = upload_handler.upload_dir().to_path_buf();
    router.register_exact(
        "GET",
        INFO_PATH,
        Box::new(move |_req: &mut Request<'_>| Some(service_info_response(&info_dir))),
    );

    router.register_exact(
        "POST",
        UPLOAD_PATH,
        Box::new(move |req: &mut Request<'_>| upload_handler.handle(req).into_response()),
    );
}

/// Static description of the service. The advertised endpoint names are
/// informational only.
fn service_info_response(upload_dir: &Path) -> Response {
    let upload_directory = upload_dir.to_string_lossy();
    Response::json(
        200,
        &ServiceInfo {
            status: "success",
            message: "ZIP upload service is running",
            endpoints: Endpoints {
                upload: "/upload",
                files: "/files",
            },
            upload_directory: &upload_directory,
        },
    )
}
