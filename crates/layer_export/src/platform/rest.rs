//! REST client for the remote platform (Earth Engine style v1 API).

use super::{AssetProbe, Platform, PlatformError, TaskHandle, TaskState, TaskStatus};
use crate::asset::AssetId;
use crate::expr::CollectionExpr;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

pub const DEFAULT_API_BASE: &str = "https://earthengine.googleapis.com/v1";

const USER_AGENT: &str = concat!("layer_export/", env!("CARGO_PKG_VERSION"));

/// Platform client over HTTPS.
#[derive(Clone)]
pub struct RestPlatform {
    client: reqwest::Client,
    base: String,
    project: String,
    access_token: Option<String>,
}

impl RestPlatform {
    /// Creates a client for `project` (e.g. `projects/ee-ronnyale`).
    pub fn new(
        api_base: &str,
        project: &str,
        access_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, PlatformError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| PlatformError::Transport(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base: api_base.trim_end_matches('/').to_owned(),
            project: project.trim_end_matches('/').to_owned(),
            access_token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base, path.trim_start_matches('/'))
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.access_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder, url: &str) -> Result<reqwest::Response, PlatformError> {
        builder
            .send()
            .await
            .map_err(|e| PlatformError::Transport(format!("Request to {} failed: {}", url, e)))
    }

    async fn json_or_status(response: reqwest::Response, url: &str) -> Result<Value, PlatformError> {
        let status = response.status();
        if !status.is_success() {
            return Err(status_error(response, url).await);
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| PlatformError::InvalidResponse(format!("{}: {}", url, e)))
    }
}

async fn status_error(response: reqwest::Response, url: &str) -> PlatformError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    PlatformError::Status {
        status,
        url: url.to_owned(),
        body,
    }
}

#[derive(Debug, Deserialize)]
struct Operation {
    name: String,
    #[serde(default)]
    metadata: OperationMetadata,
    #[serde(default)]
    done: bool,
    error: Option<OperationError>,
}

#[derive(Debug, Default, Deserialize)]
struct OperationMetadata {
    state: Option<String>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OperationError {
    message: Option<String>,
}

impl Operation {
    fn status(self, fallback_description: &str) -> TaskStatus {
        let failed = self.error.is_some();
        let mut state = match self.metadata.state.as_deref() {
            Some(s) => TaskState::from_remote(s),
            None if self.done && failed => TaskState::Failed,
            None if self.done => TaskState::Completed,
            None => TaskState::Pending,
        };
        if self.done && failed && !state.is_terminal() {
            state = TaskState::Failed;
        }

        TaskStatus {
            state,
            description: self
                .metadata
                .description
                .unwrap_or_else(|| fallback_description.to_owned()),
            error: self
                .error
                .map(|e| e.message.unwrap_or_else(|| "unknown error".to_owned())),
        }
    }
}

fn parse<T: for<'de> Deserialize<'de>>(value: Value, url: &str) -> Result<T, PlatformError> {
    serde_json::from_value(value).map_err(|e| PlatformError::InvalidResponse(format!("{}: {}", url, e)))
}

impl Platform for RestPlatform {
    async fn probe_asset(&self, id: &AssetId) -> Result<AssetProbe, PlatformError> {
        let url = self.url(id.as_str());
        let response = self.send(self.request(Method::GET, &url), &url).await?;
        match response.status() {
            s if s.is_success() => Ok(AssetProbe::Exists),
            StatusCode::NOT_FOUND => Ok(AssetProbe::Missing),
            _ => Err(status_error(response, &url).await),
        }
    }

    async fn export_table(
        &self,
        collection: &CollectionExpr,
        description: &str,
        destination: &AssetId,
    ) -> Result<TaskHandle, PlatformError> {
        let url = self.url(&format!("{}/table:export", self.project));
        let body = json!({
            "expression": collection.to_graph(),
            "description": description,
            "assetExportOptions": {
                "earthEngineDestination": { "name": destination.as_str() }
            },
        });
        let response = self
            .send(self.request(Method::POST, &url).json(&body), &url)
            .await?;
        let operation: Operation = parse(Self::json_or_status(response, &url).await?, &url)?;

        tracing::debug!(operation = %operation.name, description, "Export task started");
        Ok(TaskHandle {
            id: operation.name,
            description: description.to_owned(),
        })
    }

    async fn task_status(&self, task: &TaskHandle) -> Result<TaskStatus, PlatformError> {
        let url = self.url(&task.id);
        let response = self.send(self.request(Method::GET, &url), &url).await?;
        let operation: Operation = parse(Self::json_or_status(response, &url).await?, &url)?;
        Ok(operation.status(&task.description))
    }

    async fn collection_size(&self, collection: &CollectionExpr) -> Result<u64, PlatformError> {
        let url = self.url(&format!("{}/value:compute", self.project));
        let body = json!({ "expression": collection.size_graph() });
        let response = self
            .send(self.request(Method::POST, &url).json(&body), &url)
            .await?;
        let value = Self::json_or_status(response, &url).await?;
        value["result"]
            .as_u64()
            .ok_or_else(|| PlatformError::InvalidResponse(format!("{}: no integer result", url)))
    }

    async fn delete_asset(&self, id: &AssetId) -> Result<(), PlatformError> {
        let url = self.url(id.as_str());
        let response = self.send(self.request(Method::DELETE, &url), &url).await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(status_error(response, &url).await)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn operation(json: &str) -> Operation {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn running_operation() {
        let status = operation(
            r#"{"name":"projects/p/operations/A","metadata":{"state":"RUNNING","description":"Roads Batch 1"}}"#,
        )
        .status("fallback");
        assert_eq!(status.state, TaskState::Running);
        assert_eq!(status.description, "Roads Batch 1");
        assert_eq!(status.error, None);
    }

    #[test]
    fn done_with_error_is_failed() {
        let status = operation(
            r#"{"name":"projects/p/operations/A","done":true,"error":{"code":3,"message":"Geometry has no coordinates"}}"#,
        )
        .status("Merged Roads");
        assert_eq!(status.state, TaskState::Failed);
        assert_eq!(status.description, "Merged Roads");
        assert_eq!(status.error.as_deref(), Some("Geometry has no coordinates"));
    }

    #[test]
    fn done_without_state_is_completed() {
        let status = operation(r#"{"name":"projects/p/operations/A","done":true}"#).status("x");
        assert_eq!(status.state, TaskState::Completed);
    }

    #[test]
    fn urls_join_cleanly() {
        let platform = RestPlatform::new(
            "https://example.test/v1/",
            "projects/p/",
            None,
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(
            platform.url("projects/p/assets/roads_batch_1"),
            "https://example.test/v1/projects/p/assets/roads_batch_1"
        );
        assert_eq!(
            platform.url(&format!("{}/table:export", platform.project)),
            "https://example.test/v1/projects/p/table:export"
        );
    }
}
