use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;

use crate::backend::{DispatchApi, HistoryPage, HistoryQuery, SyncRequest};
use crate::error::AppError;
use crate::models::snapshot::ServerDriverState;

const MAX_ERROR_BODY: usize = 200;

#[derive(Debug, Clone)]
pub struct HttpDispatchApi {
    base_url: String,
    token: String,
    client: reqwest::Client,
}

impl HttpDispatchApi {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self, AppError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(AppError::Internal("api base url cannot be empty".to_string()));
        }

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|err| AppError::Internal(format!("failed to build http client: {err}")))?;

        Ok(Self {
            base_url,
            token: token.into(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

async fn decode<T: DeserializeOwned>(response: Response, what: &str) -> Result<T, AppError> {
    let status = response.status();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(AppError::Unauthorized(format!("{what} rejected with HTTP {}", status.as_u16())));
    }
    if status == StatusCode::NOT_FOUND {
        return Err(AppError::NotFound(format!("{what} returned HTTP 404")));
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let body: String = body.chars().take(MAX_ERROR_BODY).collect();
        return Err(AppError::Transport(format!(
            "{what} failed with HTTP {}: {body}",
            status.as_u16()
        )));
    }

    response
        .json::<T>()
        .await
        .map_err(|err| AppError::Transport(format!("failed to parse {what} response: {err}")))
}

fn send_error(what: &str, err: reqwest::Error) -> AppError {
    if err.is_timeout() {
        AppError::Timeout(format!("{what} request timed out"))
    } else {
        AppError::Transport(format!("{what} request failed: {err}"))
    }
}

#[async_trait]
impl DispatchApi for HttpDispatchApi {
    async fn push_state(&self, request: &SyncRequest) -> Result<ServerDriverState, AppError> {
        let response = self
            .client
            .post(self.url(&format!("/drivers/{}/sync", request.driver_id)))
            .bearer_auth(&self.token)
            .json(request)
            .send()
            .await
            .map_err(|err| send_error("state sync", err))?;
        decode(response, "state sync").await
    }

    async fn fetch_driver_status(&self, driver_id: &str) -> Result<ServerDriverState, AppError> {
        let response = self
            .client
            .get(self.url(&format!("/drivers/{driver_id}/status")))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|err| send_error("driver status", err))?;
        decode(response, "driver status").await
    }

    async fn fetch_ride_history(
        &self,
        driver_id: &str,
        query: &HistoryQuery,
    ) -> Result<HistoryPage, AppError> {
        let mut params = vec![
            ("page", query.page.max(1).to_string()),
            ("limit", query.limit.clamp(1, 100).to_string()),
        ];
        if let Some(status) = query.status {
            params.push(("status", status.as_str().to_string()));
        }

        let response = self
            .client
            .get(self.url(&format!("/drivers/{driver_id}/rides")))
            .bearer_auth(&self.token)
            .query(&params)
            .send()
            .await
            .map_err(|err| send_error("ride history", err))?;
        decode(response, "ride history").await
    }
}

#[cfg(test)]
mod tests {
    use super::HttpDispatchApi;

    #[test]
    fn trailing_slash_is_trimmed() {
        let api = HttpDispatchApi::new("https://dispatch.example.com/api/", "t").unwrap();
        assert_eq!(api.base_url(), "https://dispatch.example.com/api");
        assert_eq!(api.url("/drivers/d1/status"), "https://dispatch.example.com/api/drivers/d1/status");
    }

    #[test]
    fn empty_base_url_is_rejected() {
        assert!(HttpDispatchApi::new("  /", "t").is_err());
    }
}
