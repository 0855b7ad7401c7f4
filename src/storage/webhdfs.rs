//! WebHDFS client for the warehouse's replicated block store.
//!
//! Talks to the namenode's HTTP gateway (`/webhdfs/v1`). File creation is the
//! two-step protocol: the namenode answers `CREATE` with a redirect to a
//! datanode, and the data is sent to that location.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{redirect, Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tracing::debug;

use super::{normalize, StorageClient, StorageError};

/// WebHDFS-backed storage
pub struct WebHdfsStorage {
    /// Namenode HTTP address, e.g. `http://namenode:9870`
    namenode_url: String,
    /// Value for the `user.name` query parameter
    user: String,
    client: Client,
}

/// `{"boolean": true}` responses from RENAME, DELETE and MKDIRS
#[derive(Debug, Deserialize)]
struct BooleanResponse {
    boolean: bool,
}

/// `GETFILESTATUS` response; only the entry type is of interest
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct FileStatusResponse {
    file_status: FileStatus,
}

#[derive(Debug, Deserialize)]
struct FileStatus {
    #[serde(rename = "type")]
    kind: FileKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
enum FileKind {
    File,
    Directory,
    Symlink,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RemoteExceptionBody {
    remote_exception: RemoteException,
}

#[derive(Debug, Deserialize)]
struct RemoteException {
    exception: String,
    message: String,
}

impl WebHdfsStorage {
    /// Create a client for the given namenode
    pub fn new(
        namenode_url: impl Into<String>,
        user: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self, StorageError> {
        // Redirects are followed by hand so the CREATE body is only sent to the datanode
        let client = Client::builder()
            .redirect(redirect::Policy::none())
            .timeout(request_timeout)
            .build()
            .map_err(|e| StorageError::Unreachable(e.to_string()))?;

        Ok(Self {
            namenode_url: namenode_url.into().trim_end_matches('/').to_string(),
            user: user.into(),
            client,
        })
    }

    /// Build the REST URL for a storage path
    pub fn url_for(&self, path: &str) -> Result<String, StorageError> {
        Ok(format!("{}/webhdfs/v1{}", self.namenode_url, normalize(path)?))
    }

    fn request(
        &self,
        method: Method,
        path: &str,
        op: &str,
        extra: &[(&str, &str)],
    ) -> Result<RequestBuilder, StorageError> {
        debug!(%method, path, op, "WebHDFS request");
        let mut query: Vec<(&str, &str)> = vec![("op", op), ("user.name", self.user.as_str())];
        query.extend_from_slice(extra);
        Ok(self
            .client
            .request(method, self.url_for(path)?)
            .query(&query))
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, StorageError> {
        request.send().await.map_err(map_transport_error)
    }

    /// Follow a single namenode -> datanode redirect
    async fn follow(
        &self,
        response: Response,
        method: Method,
        body: Option<Bytes>,
    ) -> Result<Response, StorageError> {
        if !response.status().is_redirection() {
            return Ok(response);
        }

        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| StorageError::Unreachable("redirect without Location".to_string()))?
            .to_string();

        let mut request = self.client.request(method, location);
        if let Some(body) = body {
            request = request.body(body);
        }
        self.send(request).await
    }

    async fn boolean_op(
        &self,
        method: Method,
        path: &str,
        op: &str,
        extra: &[(&str, &str)],
    ) -> Result<bool, StorageError> {
        let response = self.send(self.request(method, path, op, extra)?).await?;
        let response = check(response, path).await?;
        let parsed: BooleanResponse = response
            .json()
            .await
            .map_err(|e| StorageError::Unreachable(e.to_string()))?;
        Ok(parsed.boolean)
    }

    /// Entry type at `path`, or `None` if nothing is there
    async fn file_kind(&self, path: &str) -> Result<Option<FileKind>, StorageError> {
        let response = self
            .send(self.request(Method::GET, path, "GETFILESTATUS", &[])?)
            .await?;
        match check(response, path).await {
            Ok(response) => {
                let parsed: FileStatusResponse = response
                    .json()
                    .await
                    .map_err(|e| StorageError::Unreachable(e.to_string()))?;
                Ok(Some(parsed.file_status.kind))
            }
            Err(StorageError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn map_transport_error(err: reqwest::Error) -> StorageError {
    StorageError::Unreachable(err.to_string())
}

/// Turn a non-success response into a typed error
async fn check(response: Response, path: &str) -> Result<Response, StorageError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let text = response.text().await.unwrap_or_default();
    let reason = serde_json::from_str::<RemoteExceptionBody>(&text)
        .map(|b| format!("{}: {}", b.remote_exception.exception, b.remote_exception.message))
        .unwrap_or(text);

    Err(match status {
        StatusCode::NOT_FOUND => StorageError::NotFound(path.to_string()),
        s if s.is_server_error() => StorageError::Unreachable(format!("{}: {}", s, reason)),
        _ => StorageError::WriteFailed {
            path: path.to_string(),
            reason: format!("{}: {}", status, reason),
        },
    })
}

#[async_trait]
impl StorageClient for WebHdfsStorage {
    fn name(&self) -> &str {
        "webhdfs"
    }

    async fn write(&self, path: &str, data: Bytes) -> Result<u64, StorageError> {
        let len = data.len() as u64;
        let response = self
            .send(self.request(Method::PUT, path, "CREATE", &[("overwrite", "true")])?)
            .await?;
        let response = self.follow(response, Method::PUT, Some(data)).await?;
        check(response, path).await?;
        Ok(len)
    }

    async fn read(&self, path: &str) -> Result<Bytes, StorageError> {
        let response = self
            .send(self.request(Method::GET, path, "OPEN", &[])?)
            .await?;
        let response = self.follow(response, Method::GET, None).await?;
        let response = check(response, path).await?;
        response.bytes().await.map_err(map_transport_error)
    }

    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        Ok(self.file_kind(path).await?.is_some())
    }

    async fn atomic_replace(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let destination = normalize(to)?;
        let rejected = |reason: &str| StorageError::RenameRejected {
            from: from.to_string(),
            to: to.to_string(),
            reason: reason.to_string(),
        };

        match self.file_kind(to).await? {
            Some(FileKind::Directory) => return Err(rejected("destination directory exists")),
            Some(_) => {
                // Plain RENAME refuses an existing destination; rename2 replaces it in one step
                let response = self
                    .send(self.request(
                        Method::PUT,
                        from,
                        "RENAME",
                        &[
                            ("destination", destination.as_str()),
                            ("renameoptions", "OVERWRITE"),
                        ],
                    )?)
                    .await?;
                check(response, from).await.map_err(|e| match e {
                    StorageError::WriteFailed { reason, .. } => rejected(&reason),
                    other => other,
                })?;
                return Ok(());
            }
            None => {}
        }

        let renamed = self
            .boolean_op(
                Method::PUT,
                from,
                "RENAME",
                &[("destination", destination.as_str())],
            )
            .await?;

        if renamed {
            Ok(())
        } else {
            Err(rejected("namenode refused rename"))
        }
    }

    async fn delete(&self, path: &str) -> Result<bool, StorageError> {
        self.boolean_op(Method::DELETE, path, "DELETE", &[("recursive", "true")])
            .await
    }

    async fn create_dir(&self, path: &str) -> Result<(), StorageError> {
        if self.boolean_op(Method::PUT, path, "MKDIRS", &[]).await? {
            Ok(())
        } else {
            Err(StorageError::WriteFailed {
                path: path.to_string(),
                reason: "namenode refused mkdirs".to_string(),
            })
        }
    }
}
