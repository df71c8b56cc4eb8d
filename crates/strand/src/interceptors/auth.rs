//! Credential injection and checking.

use futures::future::BoxFuture;
use strand_core::Status;

use crate::interceptor::{Interceptor, InterceptorContext};

/// Conventional credential-carrying metadata key.
pub const AUTHORIZATION_KEY: &str = "authorization";

enum Mode {
    /// Put a configured credential into the configured key.
    Inject { credential: String },
    /// Reject calls whose configured key does not hold the expected value.
    Require { expected: String },
}

/// The auth interceptor.
///
/// In inject mode (client side) it writes a credential into a metadata key
/// on request and is passive on response. In require mode (server-facing
/// chains, tests) a missing or wrong credential fails the call with
/// `unauthenticated` before any transport work.
pub struct AuthInterceptor {
    key: String,
    mode: Mode,
}

impl AuthInterceptor {
    /// Inject `credential` under the `authorization` key.
    pub fn new(credential: impl Into<String>) -> Self {
        Self::inject(AUTHORIZATION_KEY, credential)
    }

    /// Inject a bearer token: `authorization: Bearer <token>`.
    pub fn bearer(token: impl AsRef<str>) -> Self {
        Self::inject(AUTHORIZATION_KEY, format!("Bearer {}", token.as_ref()))
    }

    /// Inject `credential` under an arbitrary key.
    pub fn inject(key: impl Into<String>, credential: impl Into<String>) -> Self {
        AuthInterceptor {
            key: key.into(),
            mode: Mode::Inject {
                credential: credential.into(),
            },
        }
    }

    /// Require `expected` under `key`; anything else is `unauthenticated`.
    pub fn require(key: impl Into<String>, expected: impl Into<String>) -> Self {
        AuthInterceptor {
            key: key.into(),
            mode: Mode::Require {
                expected: expected.into(),
            },
        }
    }
}

impl Interceptor for AuthInterceptor {
    fn on_request<'a>(
        &'a self,
        cx: &'a mut InterceptorContext,
    ) -> BoxFuture<'a, Result<(), Status>> {
        Box::pin(async move {
            match &self.mode {
                Mode::Inject { credential } => cx
                    .metadata
                    .insert_ascii(&self.key, credential.clone())
                    .map_err(|e| Status::internal(format!("cannot inject credential: {}", e))),
                Mode::Require { expected } => match cx.metadata.get(&self.key) {
                    Some(value) if value == expected => Ok(()),
                    Some(_) => Err(Status::unauthenticated("credential rejected")),
                    None => Err(Status::unauthenticated("credential missing")),
                },
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_core::{Code, Metadata};

    fn ctx() -> InterceptorContext {
        InterceptorContext::new("/s/m", Metadata::new(), 0)
    }

    #[tokio::test]
    async fn injects_bearer_token() {
        let auth = AuthInterceptor::bearer("tok-123");
        let mut cx = ctx();
        auth.on_request(&mut cx).await.unwrap();
        assert_eq!(cx.metadata.get("authorization"), Some("Bearer tok-123"));
    }

    #[tokio::test]
    async fn injects_into_custom_key() {
        let auth = AuthInterceptor::inject("x-api-key", "k1");
        let mut cx = ctx();
        auth.on_request(&mut cx).await.unwrap();
        assert_eq!(cx.metadata.get("x-api-key"), Some("k1"));
    }

    #[tokio::test]
    async fn require_accepts_matching_credential() {
        let auth = AuthInterceptor::require("x-api-key", "k1");
        let mut cx = ctx();
        cx.metadata.insert_ascii("x-api-key", "k1").unwrap();
        assert!(auth.on_request(&mut cx).await.is_ok());
    }

    #[tokio::test]
    async fn require_rejects_missing_or_wrong() {
        let auth = AuthInterceptor::require("x-api-key", "k1");

        let mut cx = ctx();
        let err = auth.on_request(&mut cx).await.unwrap_err();
        assert_eq!(err.code(), Code::Unauthenticated);

        let mut cx = ctx();
        cx.metadata.insert_ascii("x-api-key", "other").unwrap();
        let err = auth.on_request(&mut cx).await.unwrap_err();
        assert_eq!(err.code(), Code::Unauthenticated);
    }

    #[tokio::test]
    async fn response_hook_is_passive() {
        let auth = AuthInterceptor::new("cred");
        let mut cx = ctx();
        assert!(auth.on_response(&mut cx).await.is_ok());
        assert!(cx.metadata.is_empty());
    }
}
