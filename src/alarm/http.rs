//! HTTP(S) alarm target. Any 2xx response is a successful delivery.

use async_trait::async_trait;

use super::{AlarmPayload, AlarmTarget};
use crate::error::AlarmDeliveryError;

/// Posts the alarm payload as JSON to one URL
#[derive(Debug, Clone)]
pub struct HttpTarget {
    name: String,
    url: String,
    client: reqwest::Client,
}

impl HttpTarget {
    /// Target posting JSON to `url`
    pub fn new(name: &str, url: &str) -> Self {
        Self {
            name: name.to_string(),
            url: url.to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Endpoint URL
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl AlarmTarget for HttpTarget {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, payload: &AlarmPayload<'_>) -> Result<(), AlarmDeliveryError> {
        // The dispatcher bounds each attempt, so no client-side timeout here
        let response = self
            .client
            .post(&self.url)
            .json(payload)
            .send()
            .await
            .map_err(|e| AlarmDeliveryError::Transport {
                target: self.name.clone(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(AlarmDeliveryError::Rejected {
                target: self.name.clone(),
                status: status.as_u16(),
            })
        }
    }
}
