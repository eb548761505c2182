//! Pairing API: screen id, lounge token and pairing code registration

use crate::error::{Error, Result};
use crate::models::ScreensResponse;
use crate::transport::{HttpExecutor, RequestDescriptor};
use tracing::{debug, info};
use url::Url;

const GENERATE_SCREEN_ID_PATH: &str = "/api/lounge/pairing/generate_screen_id";
const TOKEN_BATCH_PATH: &str = "/api/lounge/pairing/get_lounge_token_batch";
const REGISTER_PAIRING_CODE_PATH: &str = "/api/lounge/pairing/register_pairing_code";

/// Client for the pairing endpoints
#[derive(Debug, Clone)]
pub struct PairingClient {
    executor: HttpExecutor,
    base_url: Url,
}

impl PairingClient {
    pub fn new(executor: HttpExecutor, base_url: Url) -> Self {
        Self { executor, base_url }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Ask the service for a new screen id
    pub async fn generate_screen_id(&self) -> Result<String> {
        let url = self.base_url.join(GENERATE_SCREEN_ID_PATH)?;
        let reply = self.executor.execute(&RequestDescriptor::get(url)).await?;

        if !reply.status.is_success() {
            return Err(Error::unexpected_status(reply.status.as_u16(), reply.text()));
        }

        let screen_id = reply.text().trim().to_string();
        if screen_id.is_empty() {
            return Err(Error::EmptyScreenId);
        }
        debug!(%screen_id, "Generated screen id");
        Ok(screen_id)
    }

    /// Fetch a lounge token for `screen_id`
    pub async fn get_lounge_token(&self, screen_id: &str) -> Result<String> {
        let url = self.base_url.join(TOKEN_BATCH_PATH)?;
        let form = vec![("screen_ids".to_string(), screen_id.to_string())];
        let reply = self.executor.execute(&RequestDescriptor::post(url, form)).await?;

        if !reply.status.is_success() {
            return Err(Error::unexpected_status(reply.status.as_u16(), reply.text()));
        }

        let response: ScreensResponse = serde_json::from_slice(&reply.body)?;
        let token = response
            .screens
            .into_iter()
            .find(|screen| screen.screen_id == screen_id)
            .and_then(|screen| screen.lounge_token)
            .filter(|token| !token.is_empty())
            .ok_or(Error::TokenMissing)?;

        debug!(%screen_id, "Lounge token acquired");
        Ok(token)
    }

    /// Bind `pairing_code` to `screen_id` so the remote can join
    pub async fn register_pairing_code(&self, pairing_code: &str, screen_id: &str) -> Result<()> {
        let url = self.base_url.join(REGISTER_PAIRING_CODE_PATH)?;
        let form = vec![
            ("access_type".to_string(), "permanent".to_string()),
            ("pairing_code".to_string(), pairing_code.to_string()),
            ("screen_id".to_string(), screen_id.to_string()),
        ];
        let reply = self.executor.execute(&RequestDescriptor::post(url, form)).await?;

        if !reply.status.is_success() {
            return Err(Error::RegistrationRejected {
                status: reply.status.as_u16(),
            });
        }

        info!(%screen_id, "Pairing code registered");
        Ok(())
    }
}
