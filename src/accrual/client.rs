//! reqwest-backed accrual client.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, StatusCode};
use url::Url;

use super::{AccrualClient, AccrualError, AccrualResponse, AccrualResult};
use crate::ratelimit::RateLimiter;

/// Talks to `GET {base}/api/orders/{number}`.
pub struct HttpAccrualClient {
    http: reqwest::Client,
    base_url: Url,
    limiter: Arc<dyn RateLimiter>,
}

impl HttpAccrualClient {
    pub fn new(
        base_url: Url,
        limiter: Arc<dyn RateLimiter>,
        request_timeout: Duration,
    ) -> Result<Self, AccrualError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self::with_http_client(http, base_url, limiter))
    }

    pub fn with_http_client(
        http: reqwest::Client,
        base_url: Url,
        limiter: Arc<dyn RateLimiter>,
    ) -> Self {
        Self {
            http,
            base_url,
            limiter,
        }
    }

    fn order_url(&self, order_id: &str) -> Result<Url, AccrualError> {
        let path = format!("api/orders/{}", urlencoding::encode(order_id));
        self.base_url
            .join(&path)
            .map_err(|e| AccrualError::Transport(format!("bad accrual url: {}", e)))
    }
}

#[async_trait]
impl AccrualClient for HttpAccrualClient {
    async fn query(&self, order_id: &str) -> AccrualResult {
        let url = self.order_url(order_id)?;

        self.limiter.acquire().await;

        let response = self.http.get(url).send().await?;
        let status = response.status();

        if status != StatusCode::OK {
            let retry_after = response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok());
            return Err(AccrualError::from_status(status, retry_after));
        }

        let body: AccrualResponse = response
            .json()
            .await
            .map_err(|e| AccrualError::MalformedBody(e.to_string()))?;

        tracing::debug!(
            order_id = %order_id,
            accrual_status = %body.status,
            accrual = ?body.accrual,
            "Accrual query result"
        );

        body.into_status()
    }
}
