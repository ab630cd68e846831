use std::path::Path;

use axum::body::Body as AxumBody;
use eyre::{Result, WrapErr};
use http_body_util::BodyExt;
use hyper::{Request, Response};
use tower::ServiceExt;
use tower_http::services::ServeFile;

use crate::ports::file_system::{FileSystem, FileSystemError};

/// Serves a bind module's root file with tower-http's ServeFile
#[derive(Debug, Default, Clone)]
pub struct FileSystemAdapter;

impl FileSystemAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl FileSystem for FileSystemAdapter {
    async fn serve_file(
        &self,
        path: &str,
        req: Request<AxumBody>,
    ) -> Result<Response<AxumBody>, FileSystemError> {
        if path.is_empty() {
            return Err(FileSystemError::InvalidPath("empty root path".to_string()));
        }
        if !tokio::fs::metadata(Path::new(path))
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
        {
            return Err(FileSystemError::InvalidPath(format!(
                "{path} is not a readable file"
            )));
        }

        let response = ServeFile::new(path)
            .oneshot(req)
            .await
            .wrap_err("ServeFile failed to serve root file")
            .map_err(|e| {
                FileSystemError::IoError(std::io::Error::other(format!("ServeFile error: {e}")))
            })?;

        let (parts, body) = response.into_parts();
        let body = AxumBody::new(body.map_err(|e| {
            tracing::error!("Error reading root file body: {}", e);
            axum::Error::new(e)
        }));

        Ok(Response::from_parts(parts, body))
    }
}
