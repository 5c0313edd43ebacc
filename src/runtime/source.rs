/// Scheduler access
///
/// The engine only needs two things from the scheduler: the raw export of one
/// workflow and the list of datasources. Both sit behind [`RuntimeSource`] so the
/// orchestrator can be driven by an in-process double in tests.

use crate::error::{Result, SyncError};
use crate::runtime::types::DatasourceInfo;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

#[async_trait]
pub trait RuntimeSource: Send + Sync {
    /// Raw export of one workflow, `RuntimeWorkflowNotFound` when the scheduler has none
    async fn fetch_definition(&self, project_code: i64, workflow_code: i64) -> Result<Value>;

    async fn list_datasources(&self) -> Result<Vec<DatasourceInfo>>;
}

/// Scheduler reply envelope: `{ code, msg, data }`
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DatasourcePage {
    #[serde(default)]
    total_list: Vec<DatasourceInfo>,
}

/// HTTP client for the scheduler's REST API
pub struct SchedulerClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl SchedulerClient {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    async fn get(&self, path: &str) -> Result<(reqwest::StatusCode, Option<Envelope>)> {
        let url = format!("{}{}", self.base_url, path);
        tracing::debug!("🌍 Scheduler request: GET {}", url);

        let mut request = self.client.get(&url);
        if let Some(token) = &self.token {
            request = request.header("token", token.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|e| SyncError::Scheduler(format!("GET {} failed: {}", url, e)))?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok((status, None));
        }
        if !status.is_success() {
            return Err(SyncError::Scheduler(format!("GET {} answered {}", url, status)));
        }

        let envelope = response
            .json::<Envelope>()
            .await
            .map_err(|e| SyncError::Scheduler(format!("GET {} returned malformed body: {}", url, e)))?;
        Ok((status, Some(envelope)))
    }
}

#[async_trait]
impl RuntimeSource for SchedulerClient {
    async fn fetch_definition(&self, project_code: i64, workflow_code: i64) -> Result<Value> {
        let path = format!("/projects/{}/workflow-definition/{}/export", project_code, workflow_code);
        let not_found = || SyncError::RuntimeWorkflowNotFound {
            project_code,
            workflow_code,
        };

        match self.get(&path).await? {
            (_, None) => Err(not_found()),
            (_, Some(envelope)) if envelope.data.is_null() => {
                if envelope.code != 0 {
                    tracing::warn!(
                        "Scheduler export of workflow {} failed with code {}: {}",
                        workflow_code,
                        envelope.code,
                        envelope.msg.as_deref().unwrap_or("")
                    );
                }
                Err(not_found())
            }
            (_, Some(envelope)) => Ok(envelope.data),
        }
    }

    async fn list_datasources(&self) -> Result<Vec<DatasourceInfo>> {
        let envelope = match self.get("/datasources").await? {
            (_, Some(envelope)) => envelope,
            (status, None) => return Err(SyncError::Scheduler(format!("datasource listing answered {}", status))),
        };
        if envelope.code != 0 {
            return Err(SyncError::Scheduler(format!(
                "datasource listing failed with code {}: {}",
                envelope.code,
                envelope.msg.unwrap_or_default()
            )));
        }

        let data = envelope.data;
        let datasources = if data.is_array() {
            serde_json::from_value::<Vec<DatasourceInfo>>(data)
        } else {
            serde_json::from_value::<DatasourcePage>(data).map(|page| page.total_list)
        };
        datasources.map_err(|e| SyncError::Scheduler(format!("malformed datasource list: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_datasource_page_shape() {
        let page: DatasourcePage = serde_json::from_value(json!({
            "totalList": [{ "id": 5, "name": "warehouse", "type": "MYSQL" }],
            "total": 1
        }))
        .unwrap();

        assert_eq!(page.total_list[0].kind, "MYSQL");
    }

    #[test]
    fn test_envelope_defaults() {
        let envelope: Envelope = serde_json::from_value(json!({ "code": 50003, "msg": "not exist" })).unwrap();

        assert!(envelope.data.is_null());
        assert_eq!(envelope.code, 50003);
    }

    #[test]
    fn test_base_url_is_trimmed() {
        let client = SchedulerClient::new("http://scheduler:12345/api/", None);
        assert_eq!(client.base_url, "http://scheduler:12345/api");
    }
}
