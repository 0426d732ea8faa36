//! Generic JSON webhook provider.
//!
//! Posts the notification to `{endpoint}/send` and probes `{endpoint}/health`.
//! Any 2xx answer is a delivery; everything else is a provider error.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use herald_common::config::ProviderEndpoint;
use herald_common::error::{AppError, AppResult};
use herald_common::types::{Channel, Notification, NotificationStatus, SendResponse};

use super::Provider;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Wire body sent to the vendor.
#[derive(Debug, Serialize)]
struct SendRequest<'a> {
    notification_id: Uuid,
    biz_id: i64,
    channel: Channel,
    receivers: &'a [String],
    template_id: i64,
    template_version_id: i64,
    params: &'a std::collections::HashMap<String, String>,
}

impl<'a> From<&'a Notification> for SendRequest<'a> {
    fn from(n: &'a Notification) -> Self {
        Self {
            notification_id: n.id,
            biz_id: n.biz_id,
            channel: n.channel,
            receivers: &n.receivers,
            template_id: n.template.id,
            template_version_id: n.template.version_id,
            params: &n.template.params,
        }
    }
}

pub struct HttpProvider {
    name: String,
    endpoint: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpProvider {
    pub fn new(config: &ProviderEndpoint) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| AppError::Config(format!("provider {}: {e}", config.name)))?;
        Ok(Self {
            name: config.name.clone(),
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.endpoint, path)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }
}

#[async_trait]
impl Provider for HttpProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, notification: &Notification) -> AppResult<SendResponse> {
        let request = self
            .client
            .post(self.url("send"))
            .json(&SendRequest::from(notification));
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| AppError::provider(&self.name, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::provider(
                &self.name,
                format!("unexpected status {status}"),
            ));
        }

        Ok(SendResponse {
            notification_id: notification.id,
            status: NotificationStatus::Succeeded,
            retry_count: notification.retry_count,
        })
    }

    async fn check_health(&self) -> AppResult<()> {
        let response = self
            .authorize(self.client.get(self.url("health")))
            .send()
            .await
            .map_err(|e| AppError::provider(&self.name, e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(AppError::provider(
                &self.name,
                format!("health check returned {}", response.status()),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::make_notification;

    #[test]
    fn test_request_body_shape() {
        let n = make_notification(42, "welcome-1");
        let body = serde_json::to_value(SendRequest::from(&n)).unwrap();
        assert_eq!(body["biz_id"], 42);
        assert_eq!(body["channel"], "sms");
        assert_eq!(body["template_id"], 100);
        assert_eq!(body["params"]["code"], "4321");
        assert_eq!(body["receivers"][0], "+15550100");
    }

    #[test]
    fn test_endpoint_trailing_slash_trimmed() {
        let provider = HttpProvider::new(&ProviderEndpoint {
            name: "sms-a".to_string(),
            channel: Channel::Sms,
            endpoint: "http://sms-a:8080/".to_string(),
            api_key: None,
        })
        .unwrap();
        assert_eq!(provider.url("send"), "http://sms-a:8080/send");
        assert_eq!(provider.name(), "sms-a");
    }
}
