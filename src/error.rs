//! Error taxonomy for the Router
//!
//! Every error a caller can observe from the Router core is one of the
//! variants below (spec §6.1). Recoverable-vs-surfaced classification lives
//! in [`crate::retry::classify`], not here — this module only defines shape.

use std::collections::HashMap;
use thiserror::Error;

/// Extra context every error carries, independent of its variant.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub deployment_id: Option<String>,
    pub request_id: Option<String>,
    pub num_retries_attempted: u32,
    pub llm_provider_response_headers: Option<HashMap<String, String>>,
}

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("authentication failed: {message}")]
    Authentication {
        message: String,
        status_code: Option<u16>,
        context: ErrorContext,
    },

    #[error("permission denied: {message}")]
    PermissionDenied {
        message: String,
        context: ErrorContext,
    },

    #[error("bad request: {message}")]
    BadRequest {
        message: String,
        context: ErrorContext,
    },

    #[error("context window exceeded: {message}")]
    ContextWindowExceeded {
        message: String,
        context: ErrorContext,
    },

    #[error("not found: {message}")]
    NotFound {
        message: String,
        context: ErrorContext,
    },

    #[error("rate limit exceeded: {message}")]
    RateLimit {
        message: String,
        retry_after_s: Option<u64>,
        context: ErrorContext,
    },

    #[error("connection error: {message}")]
    ApiConnection {
        message: String,
        context: ErrorContext,
    },

    #[error("timeout: {message}")]
    Timeout {
        message: String,
        context: ErrorContext,
    },

    #[error("provider API error ({status_code:?}): {message}")]
    Api {
        message: String,
        status_code: Option<u16>,
        context: ErrorContext,
    },

    #[error("no healthy deployments available for model group '{model_group}': {reasons:?}")]
    NoDeploymentsAvailable {
        model_group: String,
        reasons: HashMap<String, String>,
    },

    #[error("internal router error: {0}")]
    Internal(String),
}

impl RouterError {
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            RouterError::Authentication { context, .. }
            | RouterError::PermissionDenied { context, .. }
            | RouterError::BadRequest { context, .. }
            | RouterError::ContextWindowExceeded { context, .. }
            | RouterError::NotFound { context, .. }
            | RouterError::RateLimit { context, .. }
            | RouterError::ApiConnection { context, .. }
            | RouterError::Timeout { context, .. }
            | RouterError::Api { context, .. } => Some(context),
            RouterError::NoDeploymentsAvailable { .. } | RouterError::Internal(_) => None,
        }
    }

    pub fn with_context(mut self, f: impl FnOnce(&mut ErrorContext)) -> Self {
        match &mut self {
            RouterError::Authentication { context, .. }
            | RouterError::PermissionDenied { context, .. }
            | RouterError::BadRequest { context, .. }
            | RouterError::ContextWindowExceeded { context, .. }
            | RouterError::NotFound { context, .. }
            | RouterError::RateLimit { context, .. }
            | RouterError::ApiConnection { context, .. }
            | RouterError::Timeout { context, .. }
            | RouterError::Api { context, .. } => f(context),
            RouterError::NoDeploymentsAvailable { .. } | RouterError::Internal(_) => {}
        }
        self
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            RouterError::Authentication { status_code, .. } => *status_code,
            RouterError::Api { status_code, .. } => *status_code,
            _ => None,
        }
    }
}

pub type RouterResult<T> = Result<T, RouterError>;

/// How a failure should affect a deployment's health state (spec §4.3). The
/// error taxonomy is fixed here; the actual state machine lives in
/// [`crate::health::HealthTracker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CooldownClass {
    /// Deployment-identity problem (bad credentials, model doesn't exist,
    /// prompt will never fit): cooldown for the long duration immediately,
    /// bypassing the rolling failure window entirely.
    Immediate,
    /// Transient (network blip, overload, rate limit): only counts against
    /// the rolling failure window; cooldown kicks in once `allowed_fails`
    /// is reached within the window.
    Transient,
    /// Caller's fault, or not a deployment-specific problem at all — does
    /// not affect health.
    None,
}

impl RouterError {
    pub fn cooldown_class(&self) -> CooldownClass {
        match self {
            RouterError::Authentication { .. }
            | RouterError::NotFound { .. }
            | RouterError::ContextWindowExceeded { .. } => CooldownClass::Immediate,
            RouterError::ApiConnection { .. }
            | RouterError::Timeout { .. }
            | RouterError::RateLimit { .. }
            | RouterError::Api { .. } => CooldownClass::Transient,
            RouterError::PermissionDenied { .. }
            | RouterError::BadRequest { .. }
            | RouterError::NoDeploymentsAvailable { .. }
            | RouterError::Internal(_) => CooldownClass::None,
        }
    }
}
