use reqwest::{header, Client};
use serde_json::Value;
use thiserror::Error;
use tracing::{info, instrument};

use crate::config::StackExchangeConfig;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("failed to build http client: {0}")]
    Client(reqwest::Error),
    #[error("request to the Stack Exchange API failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Stack Exchange API response has no items array")]
    MissingItems,
}

/// Thin client for the Stack Exchange questions endpoint.
pub struct StackExchangeClient {
    client: Client,
    config: StackExchangeConfig,
}

impl StackExchangeClient {
    pub fn new(config: StackExchangeConfig) -> Result<Self, FetchError> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            header::HeaderValue::from_static("application/json"),
        );
        let client = Client::builder()
            .default_headers(headers)
            .user_agent("stackex-producer")
            .gzip(true)
            .timeout(config.stackex_request_timeout.0)
            .build()
            .map_err(FetchError::Client)?;

        Ok(Self { client, config })
    }

    /// Returns the raw `items` of one page of questions, untouched.
    #[instrument(skip_all, fields(site = %self.config.stackex_site, tagged = %self.config.stackex_tagged))]
    pub async fn fetch_questions(&self) -> Result<Vec<Value>, FetchError> {
        let pagesize = self.config.stackex_pagesize.to_string();
        let params = [
            ("site", self.config.stackex_site.as_str()),
            ("pagesize", pagesize.as_str()),
            ("order", self.config.stackex_order.as_str()),
            ("sort", self.config.stackex_sort.as_str()),
            ("tagged", self.config.stackex_tagged.as_str()),
            ("key", self.config.stack_exchange_api_key.as_str()),
        ];

        let mut body: Value = self
            .client
            .get(&self.config.stackex_api_url)
            .query(&params)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        match body.get_mut("items").map(Value::take) {
            Some(Value::Array(items)) => {
                info!("fetched {} questions", items.len());
                Ok(items)
            }
            _ => Err(FetchError::MissingItems),
        }
    }
}
