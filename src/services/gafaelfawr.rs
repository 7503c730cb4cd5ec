//! Client for the Gafaelfawr identity service.

use reqwest::StatusCode;
use url::Url;

use crate::config::GafaelfawrConfig;
use crate::errors::ControllerError;
use crate::models::gafaelfawr::{GafaelfawrTokenInfo, GafaelfawrUser, GafaelfawrUserInfo};

/// Thin client for the two Gafaelfawr routes the controller needs.
#[derive(Clone)]
pub struct GafaelfawrClient {
    http: reqwest::Client,
    base_url: Url,
}

impl GafaelfawrClient {
    pub fn new(http: reqwest::Client, config: &GafaelfawrConfig) -> Self {
        GafaelfawrClient {
            http,
            base_url: config.base_url.clone(),
        }
    }

    /// Get metadata for the user owning a token.
    ///
    /// A 401 or 403 from Gafaelfawr means the token is not valid; anything
    /// else unexpected is an upstream failure.
    pub async fn get_user_info(&self, token: &str) -> Result<GafaelfawrUserInfo, ControllerError> {
        let response = self.get("/auth/api/v1/user-info", token).await?;
        match response.status() {
            StatusCode::OK => response
                .json()
                .await
                .map_err(|e| ControllerError::Gafaelfawr { message: e.to_string() }),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ControllerError::InvalidToken),
            status => Err(ControllerError::Gafaelfawr {
                message: format!("status {} from user-info", status.as_u16()),
            }),
        }
    }

    /// Get metadata for the user owning a token, bundled with the token for
    /// internal plumbing.
    pub async fn get_user(&self, token: &str) -> Result<GafaelfawrUser, ControllerError> {
        let info = self.get_user_info(token).await?;
        Ok(GafaelfawrUser {
            info,
            token: token.to_string(),
        })
    }

    /// Get metadata for a token itself.
    pub async fn get_token_info(&self, token: &str) -> Result<GafaelfawrTokenInfo, ControllerError> {
        let response = self.get("/auth/api/v1/token-info", token).await?;
        match response.status() {
            StatusCode::OK => response
                .json()
                .await
                .map_err(|e| ControllerError::Gafaelfawr { message: e.to_string() }),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ControllerError::InvalidToken),
            status => Err(ControllerError::Gafaelfawr {
                message: format!("status {} from token-info", status.as_u16()),
            }),
        }
    }

    async fn get(&self, route: &str, token: &str) -> Result<reqwest::Response, ControllerError> {
        let url = self
            .base_url
            .join(route)
            .map_err(|e| ControllerError::Gafaelfawr { message: e.to_string() })?;
        self.http
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| ControllerError::Gafaelfawr { message: e.to_string() })
    }
}
