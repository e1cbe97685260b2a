use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::config::WarehouseConfig;

#[derive(Error, Debug)]
pub enum WarehouseError {
    #[error("WAREHOUSE_PROJECT is required when the warehouse is enabled")]
    MissingProject,
    #[error("warehouse request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("warehouse returned {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("load job {job_id} failed: {reason}")]
    JobFailed { job_id: String, reason: String },
}

#[async_trait]
pub trait Warehouse {
    /// Appends the rows of a stored columnar object to the destination table.
    /// Appending the same object twice loads it once.
    async fn append(&self, object_uri: &str) -> Result<(), WarehouseError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobStatus {
    state: String,
    error_result: Option<ErrorProto>,
}

#[derive(Debug, Deserialize)]
struct ErrorProto {
    reason: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Job {
    status: JobStatus,
}

/// Appends Parquet objects to a BigQuery table through REST load jobs.
pub struct BigQueryWarehouse {
    client: Client,
    endpoint: String,
    project: String,
    dataset: String,
    table: String,
    access_token: Option<String>,
    poll_interval: Duration,
}

impl BigQueryWarehouse {
    pub fn new(config: &WarehouseConfig) -> Result<Self, WarehouseError> {
        let project = config
            .warehouse_project
            .clone()
            .ok_or(WarehouseError::MissingProject)?;
        let client = Client::builder()
            .user_agent(concat!("stackex-consumer/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            endpoint: config.warehouse_endpoint.trim_end_matches('/').to_owned(),
            project,
            dataset: config.warehouse_dataset.clone(),
            table: config.warehouse_table.clone(),
            access_token: config.warehouse_access_token.clone(),
            poll_interval: config.warehouse_poll_interval.0,
        })
    }

    fn jobs_url(&self) -> String {
        format!(
            "{}/bigquery/v2/projects/{}/jobs",
            self.endpoint, self.project
        )
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.access_token {
            Some(token) => request.header(header::AUTHORIZATION, format!("Bearer {token}")),
            None => request,
        }
    }

    async fn insert_job(&self, job_id: &str, object_uri: &str) -> Result<Option<Job>, WarehouseError> {
        let body = json!({
            "jobReference": {"projectId": self.project, "jobId": job_id},
            "configuration": {
                "load": {
                    "sourceUris": [object_uri],
                    "sourceFormat": "PARQUET",
                    "writeDisposition": "WRITE_APPEND",
                    "schemaUpdateOptions": ["ALLOW_FIELD_ADDITION"],
                    "destinationTable": {
                        "projectId": self.project,
                        "datasetId": self.dataset,
                        "tableId": self.table,
                    },
                }
            }
        });

        let response = self
            .authorize(self.client.post(self.jobs_url()))
            .json(&body)
            .send()
            .await?;

        match response.status() {
            StatusCode::CONFLICT => {
                info!("load job {} already exists", job_id);
                Ok(None)
            }
            status if status.is_success() => Ok(Some(response.json().await?)),
            status => Err(WarehouseError::Status {
                status,
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }

    async fn get_job(&self, job_id: &str) -> Result<Job, WarehouseError> {
        let response = self
            .authorize(self.client.get(format!("{}/{}", self.jobs_url(), job_id)))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(WarehouseError::Status {
                status,
                body: response.text().await.unwrap_or_default(),
            });
        }
        Ok(response.json().await?)
    }
}

/// Same object, same job id: the warehouse refuses the second insert.
pub fn load_job_id(object_uri: &str) -> String {
    format!(
        "stackex_{}",
        Uuid::new_v5(&Uuid::NAMESPACE_URL, object_uri.as_bytes()).simple()
    )
}

#[async_trait]
impl Warehouse for BigQueryWarehouse {
    #[instrument(skip(self))]
    async fn append(&self, object_uri: &str) -> Result<(), WarehouseError> {
        let job_id = load_job_id(object_uri);

        let mut job = match self.insert_job(&job_id, object_uri).await? {
            Some(job) => job,
            None => self.get_job(&job_id).await?,
        };

        // The caller bounds the whole append with its own timeout
        while job.status.state != "DONE" {
            debug!("load job {} is {}", job_id, job.status.state);
            tokio::time::sleep(self.poll_interval).await;
            job = self.get_job(&job_id).await?;
        }

        if let Some(error) = job.status.error_result {
            return Err(WarehouseError::JobFailed {
                job_id,
                reason: error
                    .message
                    .or(error.reason)
                    .unwrap_or_else(|| "unknown error".to_owned()),
            });
        }

        info!("loaded {} into {}.{}", object_uri, self.dataset, self.table);
        Ok(())
    }
}
