//! Stateless HTTP calls against the project API.
//!
//! Used for binary files, structural mutations, and for documents when no
//! live socket is available.

use crate::config::DaemonConfig;
use async_trait::async_trait;
use olsync_core::transport::{self, ProjectApi, TransportError, Uploaded, with_timeout};
use olsync_core::{EntityKind, FlatEntity, ProjectSnapshot};
use reqwest::header::{COOKIE, HeaderMap, HeaderValue};
use reqwest::multipart::{Form, Part};
use reqwest::{Method, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Upper bound for whole-file transfers, which may be large.
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Deserialize)]
struct EntitiesResponse {
    entities: Vec<FlatEntity>,
}

#[derive(Deserialize)]
struct TreeResponse {
    project: ProjectSnapshot,
}

#[derive(Deserialize)]
struct CreatedEntity {
    #[serde(rename = "_id")]
    id: String,
}

#[derive(Deserialize)]
struct UploadResponse {
    #[serde(default)]
    success: bool,
    entity_id: Option<String>,
    entity_type: Option<String>,
    error: Option<String>,
}

pub struct HttpApi {
    config: Arc<DaemonConfig>,
    client: reqwest::Client,
}

impl HttpApi {
    pub fn new(config: Arc<DaemonConfig>) -> Result<Self, TransportError> {
        let mut headers = HeaderMap::new();
        let cookie = HeaderValue::from_str(&config.cookie)
            .map_err(|e| TransportError::Other(format!("invalid cookie: {}", e)))?;
        headers.insert(COOKIE, cookie);
        if let Some(token) = &config.csrf_token {
            let token = HeaderValue::from_str(token)
                .map_err(|e| TransportError::Other(format!("invalid CSRF token: {}", e)))?;
            headers.insert("X-Csrf-Token", token);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(TRANSFER_TIMEOUT)
            .build()
            .map_err(|e| TransportError::Other(e.to_string()))?;
        Ok(Self { config, client })
    }

    fn request(&self, method: Method, path: &str) -> transport::Result<RequestBuilder> {
        let url = self
            .config
            .endpoint(&format!("project/{}/{}", self.config.project_id, path))
            .map_err(|e| TransportError::Other(e.to_string()))?;
        Ok(self.client.request(method, url))
    }

    /// Send a small JSON request, bounded by the request timeout.
    async fn send(&self, what: &str, request: RequestBuilder) -> transport::Result<Response> {
        with_timeout(self.config.sync.request_timeout, what, send_checked(request)).await
    }
}

async fn send_checked(request: RequestBuilder) -> transport::Result<Response> {
    let response = request.send().await.map_err(request_error)?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(TransportError::Http {
        status: status.as_u16(),
        message,
    })
}

fn request_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::RequestTimeout(e.url().map(|u| u.to_string()).unwrap_or_default())
    } else {
        TransportError::Other(e.to_string())
    }
}

fn parse_kind(kind: Option<&str>) -> EntityKind {
    match kind {
        Some("doc") => EntityKind::Doc,
        Some("folder") => EntityKind::Folder,
        _ => EntityKind::File,
    }
}

#[async_trait]
impl ProjectApi for HttpApi {
    async fn project_snapshot(&self) -> transport::Result<ProjectSnapshot> {
        let request = self.request(Method::GET, "tree")?;
        let response = self.send("project tree", request).await?;
        let body: TreeResponse = response.json().await.map_err(request_error)?;
        debug!("Fetched project tree of {}", body.project.name);
        Ok(body.project)
    }

    async fn list_entities(&self) -> transport::Result<Vec<FlatEntity>> {
        let request = self.request(Method::GET, "entities")?;
        let response = self.send("list entities", request).await?;
        let body: EntitiesResponse = response.json().await.map_err(request_error)?;
        debug!("Listed {} entities", body.entities.len());
        Ok(body.entities)
    }

    async fn doc_content(&self, doc_id: &str) -> transport::Result<Vec<u8>> {
        let request = self.request(Method::GET, &format!("doc/{}/download", doc_id))?;
        let response = send_checked(request).await?;
        let bytes = response.bytes().await.map_err(request_error)?;
        Ok(bytes.to_vec())
    }

    async fn file_content(&self, file_id: &str) -> transport::Result<Vec<u8>> {
        let request = self.request(Method::GET, &format!("file/{}", file_id))?;
        let response = send_checked(request).await?;
        let bytes = response.bytes().await.map_err(request_error)?;
        Ok(bytes.to_vec())
    }

    async fn upload(&self, folder_id: &str, name: &str, content: Vec<u8>) -> transport::Result<Uploaded> {
        let request = self
            .request(Method::POST, "upload")?
            .query(&[("folder_id", folder_id)]);
        let size = content.len();
        let part = Part::bytes(content).file_name(name.to_string());
        let form = Form::new()
            .text("name", name.to_string())
            .text("type", "application/octet-stream")
            .part("qqfile", part);

        let response = send_checked(request.multipart(form)).await?;
        let body: UploadResponse = response.json().await.map_err(request_error)?;
        let id = match (body.success, body.entity_id) {
            (true, Some(id)) => id,
            (_, _) => {
                return Err(TransportError::Remote(
                    body.error.unwrap_or_else(|| format!("upload of {} failed", name)),
                ));
            }
        };
        debug!("Uploaded {} ({} bytes) as {}", name, size, id);
        Ok(Uploaded {
            id,
            kind: parse_kind(body.entity_type.as_deref()),
        })
    }

    async fn create_doc(&self, parent_id: &str, name: &str) -> transport::Result<String> {
        let request = self
            .request(Method::POST, "doc")?
            .json(&json!({ "parent_folder_id": parent_id, "name": name }));
        let response = self.send("create doc", request).await?;
        let created: CreatedEntity = response.json().await.map_err(request_error)?;
        Ok(created.id)
    }

    async fn create_folder(&self, parent_id: &str, name: &str) -> transport::Result<String> {
        let request = self
            .request(Method::POST, "folder")?
            .json(&json!({ "parent_folder_id": parent_id, "name": name }));
        let response = self.send("create folder", request).await?;
        let created: CreatedEntity = response.json().await.map_err(request_error)?;
        Ok(created.id)
    }

    async fn delete_entity(&self, kind: EntityKind, id: &str) -> transport::Result<()> {
        let request = self.request(Method::DELETE, &format!("{}/{}", kind, id))?;
        self.send("delete entity", request).await?;
        Ok(())
    }

    async fn rename_entity(&self, kind: EntityKind, id: &str, new_name: &str) -> transport::Result<()> {
        let request = self
            .request(Method::POST, &format!("{}/{}/rename", kind, id))?
            .json(&json!({ "name": new_name }));
        self.send("rename entity", request).await?;
        Ok(())
    }

    async fn move_entity(&self, kind: EntityKind, id: &str, folder_id: &str) -> transport::Result<()> {
        let request = self
            .request(Method::POST, &format!("{}/{}/move", kind, id))?
            .json(&json!({ "folder_id": folder_id }));
        self.send("move entity", request).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_response_kinds() {
        let body: UploadResponse = serde_json::from_str(
            r#"{"success":true,"entity_id":"abc","entity_type":"doc"}"#,
        )
        .unwrap();
        assert!(body.success);
        assert_eq!(parse_kind(body.entity_type.as_deref()), EntityKind::Doc);
        assert_eq!(parse_kind(None), EntityKind::File);
    }

    #[test]
    fn test_entities_response_shape() {
        let body: EntitiesResponse = serde_json::from_str(
            r#"{"project_id":"p1","entities":[{"path":"/main.tex","type":"doc"},{"path":"/img/a.png","type":"file"}]}"#,
        )
        .unwrap();
        assert_eq!(body.entities.len(), 2);
        assert_eq!(body.entities[0].entity_kind(), EntityKind::Doc);
    }

    #[test]
    fn test_tree_response_keeps_server_identities() {
        let body: TreeResponse = serde_json::from_str(
            r#"{"project":{"_id":"p1","name":"Thesis","rootFolder":[{"_id":"f0","name":"rootFolder",
                "docs":[{"_id":"d1","name":"main.tex"}],
                "fileRefs":[],
                "folders":[{"_id":"f1","name":"figures","docs":[],"fileRefs":[{"_id":"r1","name":"plot.png"}],"folders":[]}]}]}}"#,
        )
        .unwrap();
        let index = olsync_core::EntityIndex::build(&body.project);
        assert_eq!(index.lookup_local("main.tex").unwrap().id, "d1");
        assert_eq!(index.lookup_local("figures/plot.png").unwrap().id, "r1");
        assert_eq!(index.lookup_local("figures").unwrap().parent.as_deref(), Some("f0"));
    }

    #[test]
    fn test_rejects_invalid_cookie() {
        let config = DaemonConfig::new(
            "https://x.org",
            "p1".into(),
            "bad\ncookie".into(),
            None,
            ".",
        )
        .unwrap();
        assert!(HttpApi::new(Arc::new(config)).is_err());
    }
}
