//! [`SqlAdmin`] backed by the Cloud SQL Admin REST API.

use std::path::PathBuf;

use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use snafu::ResultExt;
use url::Url;

use super::{AccessTokenSnafu, InstanceRequest, RemoteError, SqlAdmin, TransportSnafu};

pub const DEFAULT_ENDPOINT: &str = "https://sqladmin.googleapis.com/v1beta4/";
pub const DEFAULT_DATABASE_VERSION: &str = "MYSQL_5_7";
pub const DEFAULT_TIER: &str = "db-n1-standard-1";

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CloudSqlConfig {
    pub endpoint: Url,

    /// File containing an OAuth2 bearer token. It is re-read on every request so that an
    /// external process can refresh it.
    pub access_token_file: PathBuf,
    pub database_version: String,
    pub tier: String,
}

pub struct CloudSqlAdmin {
    http: reqwest::Client,
    config: CloudSqlConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DatabaseInstance {
    #[serde(default)]
    ip_addresses: Vec<IpMapping>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IpMapping {
    ip_address: String,
}

impl CloudSqlAdmin {
    pub fn new(config: CloudSqlConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.config.endpoint.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn access_token(&self) -> Result<String, RemoteError> {
        let token = tokio::fs::read_to_string(&self.config.access_token_file)
            .await
            .context(AccessTokenSnafu {
                path: self.config.access_token_file.display().to_string(),
            })?;
        Ok(token.trim().to_owned())
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Response, RemoteError> {
        let token = self.access_token().await?;
        let response = request
            .bearer_auth(token)
            .send()
            .await
            .context(TransportSnafu)?;
        check_status(response).await
    }
}

async fn check_status(response: Response) -> Result<Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let message = response.text().await.unwrap_or_default();
    Err(classify(status, message))
}

fn classify(status: StatusCode, message: String) -> RemoteError {
    match status {
        StatusCode::NOT_MODIFIED => RemoteError::NotModified,
        StatusCode::NOT_FOUND => RemoteError::NotFound,
        StatusCode::CONFLICT => RemoteError::Conflict { message },
        StatusCode::TOO_MANY_REQUESTS => RemoteError::Unavailable {
            status: status.as_u16(),
            message,
        },
        status if status.is_client_error() => RemoteError::Rejected {
            status: status.as_u16(),
            message,
        },
        status => RemoteError::Unavailable {
            status: status.as_u16(),
            message,
        },
    }
}

#[async_trait]
impl SqlAdmin for CloudSqlAdmin {
    async fn insert_instance(
        &self,
        project_id: &str,
        request: &InstanceRequest,
    ) -> Result<(), RemoteError> {
        let body = json!({
            "name": request.name,
            "project": project_id,
            "databaseVersion": self.config.database_version,
            "rootPassword": request.root_password,
            "settings": { "tier": self.config.tier },
        });
        let url = self.url(&["projects", project_id, "instances"]);
        self.send(self.http.post(url).json(&body)).await?;
        Ok(())
    }

    async fn delete_instance(&self, project_id: &str, instance: &str) -> Result<(), RemoteError> {
        let url = self.url(&["projects", project_id, "instances", instance]);
        self.send(self.http.delete(url)).await?;
        Ok(())
    }

    async fn instance_address(
        &self,
        project_id: &str,
        instance: &str,
    ) -> Result<Option<String>, RemoteError> {
        let url = self.url(&["projects", project_id, "instances", instance]);
        let instance: DatabaseInstance = self
            .send(self.http.get(url))
            .await?
            .json()
            .await
            .context(TransportSnafu)?;
        Ok(instance
            .ip_addresses
            .into_iter()
            .next()
            .map(|mapping| mapping.ip_address))
    }

    async fn insert_user(
        &self,
        project_id: &str,
        instance: &str,
        username: &str,
        password: &str,
    ) -> Result<(), RemoteError> {
        let body = json!({
            "instance": instance,
            "name": username,
            "password": password,
            "project": project_id,
        });
        let url = self.url(&["projects", project_id, "instances", instance, "users"]);
        self.send(self.http.post(url).json(&body)).await?;
        Ok(())
    }
}
