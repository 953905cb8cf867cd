//! Request authentication.
//!
//! Token acquisition happens elsewhere; this module only injects headers.
//! Three schemes are supported:
//!
//! - `basic`: `Authorization: Basic base64(user:pass)`
//! - `bearer`: `Authorization: Bearer <token>` with a static token
//! - `custom`: an async [`HeaderProvider`] invoked before every request,
//!   whose headers are merged into the request

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use http::HeaderMap;
use reqwest::RequestBuilder;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Produces request headers on demand, e.g. from a token refresher.
#[async_trait]
pub trait HeaderProvider: Send + Sync {
    async fn headers(&self) -> Result<HeaderMap>;
}

/// Authentication scheme applied to every outgoing request.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AuthConfig {
    #[default]
    None,
    Basic {
        username: String,
        password: String,
    },
    Bearer {
        token: String,
    },
    /// Programmatic only; cannot be loaded from a config file
    #[serde(skip)]
    Custom(Arc<dyn HeaderProvider>),
}

impl AuthConfig {
    pub fn custom(provider: impl HeaderProvider + 'static) -> Self {
        AuthConfig::Custom(Arc::new(provider))
    }

    /// Apply the scheme to a request.
    pub async fn apply(&self, request: RequestBuilder) -> Result<RequestBuilder> {
        Ok(match self {
            AuthConfig::None => request,
            AuthConfig::Basic { username, password } => {
                request.basic_auth(username, Some(password))
            }
            AuthConfig::Bearer { token } => request.bearer_auth(token),
            AuthConfig::Custom(provider) => request.headers(provider.headers().await?),
        })
    }
}

impl fmt::Debug for AuthConfig {
    // Credentials stay out of logs
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthConfig::None => f.write_str("None"),
            AuthConfig::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"***")
                .finish(),
            AuthConfig::Bearer { .. } => f.debug_struct("Bearer").field("token", &"***").finish(),
            AuthConfig::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}
