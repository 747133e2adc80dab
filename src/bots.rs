//! Bot records and the third-party deployment platform adapter.
//!
//! The platform owns the process lifecycle; this side only stores what the
//! user asked for and passes lifecycle commands through.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BotStatus {
    Deploying,
    Running,
    Stopped,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bot {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub github_repo: String,
    pub status: BotStatus,
    pub deployment_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvVar {
    pub key: String,
    pub value: String,
}

/// File-backed bot registry, one JSON document under the data root.
pub struct BotStore {
    path: PathBuf,
    lock: RwLock<()>,
}

impl BotStore {
    pub fn new(data_dir: &str) -> AppResult<Self> {
        let path = Path::new(data_dir).join("bots.json");
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        Ok(Self { path, lock: RwLock::new(()) })
    }

    fn read_rows(&self) -> AppResult<Vec<Bot>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let bytes = std::fs::read(&self.path)?;
        serde_json::from_slice(&bytes)
            .map_err(|e| AppError::io("store_corrupt", format!("bots file unreadable: {}", e)))
    }

    fn write_rows(&self, rows: &[Bot]) -> AppResult<()> {
        let tmp = self.path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(rows)
            .map_err(|e| AppError::internal("serialize_failed", e.to_string()))?;
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn insert(&self, bot: Bot) -> AppResult<()> {
        let _g = self.lock.write();
        let mut rows = self.read_rows()?;
        rows.push(bot);
        self.write_rows(&rows)
    }

    pub fn get(&self, id: &str) -> AppResult<Option<Bot>> {
        let _g = self.lock.read();
        Ok(self.read_rows()?.into_iter().find(|b| b.id == id))
    }

    pub fn list_for_owner(&self, owner_id: &str) -> AppResult<Vec<Bot>> {
        let _g = self.lock.read();
        Ok(self.read_rows()?.into_iter().filter(|b| b.owner_id == owner_id).collect())
    }

    pub fn list_all(&self) -> AppResult<Vec<Bot>> {
        let _g = self.lock.read();
        self.read_rows()
    }

    pub fn set_status(&self, id: &str, status: BotStatus) -> AppResult<Bot> {
        let _g = self.lock.write();
        let mut rows = self.read_rows()?;
        let bot = rows
            .iter_mut()
            .find(|b| b.id == id)
            .ok_or_else(|| AppError::not_found("bot_not_found", "no bot for id"))?;
        bot.status = status;
        let out = bot.clone();
        self.write_rows(&rows)?;
        Ok(out)
    }

    pub fn remove(&self, id: &str) -> AppResult<()> {
        let _g = self.lock.write();
        let mut rows = self.read_rows()?;
        let before = rows.len();
        rows.retain(|b| b.id != id);
        if rows.len() == before {
            return Err(AppError::not_found("bot_not_found", "no bot for id"));
        }
        self.write_rows(&rows)
    }
}

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("deployment API request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("deployment API rejected the request: {0}")]
    Rejected(String),
}

impl From<DeployError> for AppError {
    fn from(e: DeployError) -> Self {
        match e {
            DeployError::Transport(inner) => AppError::io("deploy_unreachable", inner.to_string()),
            DeployError::Rejected(msg) => AppError::internal("deploy_rejected", msg),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeployRequest {
    pub name: String,
    pub repo_url: String,
    pub build_cmd: String,
    pub start_cmd: String,
    pub env_vars: Vec<EnvVar>,
}

/// Thin client over the deployment API: create an app from a repository and
/// drive its lifecycle by deployment id.
#[derive(Clone)]
pub struct DeployClient {
    base: String,
    api_key: String,
    client: reqwest::Client,
}

impl DeployClient {
    pub fn new(base: &str, api_key: &str) -> Self {
        Self {
            base: base.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub async fn deploy(&self, req: &DeployRequest) -> Result<String, DeployError> {
        let url = format!("{}/v1/apps", self.base);
        let resp = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(req)
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(DeployError::Rejected(format!("HTTP {}: {}", status, body)));
        }
        let v: serde_json::Value = resp.json().await?;
        let id = v
            .get("deployment_id")
            .or_else(|| v.get("id"))
            .and_then(|x| x.as_str())
            .ok_or_else(|| DeployError::Rejected("response carried no deployment id".to_string()))?;
        info!(target: "deploy", "deploy.created name={} deployment_id={}", req.name, id);
        Ok(id.to_string())
    }

    async fn lifecycle(&self, deployment_id: &str, action: &str) -> Result<(), DeployError> {
        let url = format!("{}/v1/apps/{}/{}", self.base, deployment_id, action);
        let resp = self.client.post(url).bearer_auth(&self.api_key).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(DeployError::Rejected(format!("HTTP {}: {}", status, body)));
        }
        info!(target: "deploy", "deploy.{} deployment_id={}", action, deployment_id);
        Ok(())
    }

    pub async fn start(&self, deployment_id: &str) -> Result<(), DeployError> {
        self.lifecycle(deployment_id, "start").await
    }

    pub async fn stop(&self, deployment_id: &str) -> Result<(), DeployError> {
        self.lifecycle(deployment_id, "stop").await
    }

    pub async fn restart(&self, deployment_id: &str) -> Result<(), DeployError> {
        self.lifecycle(deployment_id, "restart").await
    }

    pub async fn delete(&self, deployment_id: &str) -> Result<(), DeployError> {
        let url = format!("{}/v1/apps/{}", self.base, deployment_id);
        let resp = self.client.delete(url).bearer_auth(&self.api_key).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(DeployError::Rejected(format!("HTTP {}: {}", status, body)));
        }
        info!(target: "deploy", "deploy.delete deployment_id={}", deployment_id);
        Ok(())
    }
}
