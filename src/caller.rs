use crate::AppState;
use axum::{extract::FromRequestParts, http::request::Parts};
use std::{convert::Infallible, sync::Arc};

/// Identity of whoever sent the request, as asserted by the upstream auth
/// layer through the configured header. `None` means anonymous.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Caller(pub Option<String>);

impl Caller {
    pub fn username(&self) -> Option<&str> {
        self.0.as_deref()
    }
}

impl FromRequestParts<Arc<AppState>> for Caller {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<AppState>) -> Result<Self, Self::Rejection> {
        let username = parts
            .headers
            .get(state.config.caller_header.as_str())
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_owned);
        Ok(Caller(username))
    }
}
