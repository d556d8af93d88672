use std::error::Error as StdError;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::{
    cache::{IdentityError, StoreError},
    config::LoadError,
    infra::error::InfraError,
};

#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub source: &'static str,
    pub status: StatusCode,
    pub messages: Vec<String>,
}

impl ErrorReport {
    pub fn from_error(source: &'static str, status: StatusCode, error: &dyn StdError) -> Self {
        let mut messages = Vec::new();
        messages.push(error.to_string());
        let mut current = error.source();
        while let Some(inner) = current {
            messages.push(inner.to_string());
            current = inner.source();
        }
        Self {
            source,
            status,
            messages,
        }
    }

    pub fn from_message(
        source: &'static str,
        status: StatusCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            source,
            status,
            messages: vec![message.into()],
        }
    }

    pub fn attach(self, response: &mut Response) {
        response.extensions_mut().insert(self);
    }
}

#[derive(Debug)]
pub struct HttpError {
    status: StatusCode,
    public_message: &'static str,
    report: ErrorReport,
}

impl HttpError {
    pub fn new(
        source: &'static str,
        status: StatusCode,
        public_message: &'static str,
        detail: impl Into<String>,
    ) -> Self {
        let report = ErrorReport::from_message(source, status, detail);
        Self {
            status,
            public_message,
            report,
        }
    }

    pub fn from_error(
        source: &'static str,
        status: StatusCode,
        public_message: &'static str,
        error: &dyn StdError,
    ) -> Self {
        let report = ErrorReport::from_error(source, status, error);
        Self {
            status,
            public_message,
            report,
        }
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let mut response = (self.status, self.public_message).into_response();
        self.report.attach(&mut response);
        response
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Config(#[from] LoadError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }

    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Store(StoreError::Timeout) | AppError::Identity(IdentityError::Timeout) => {
                StatusCode::GATEWAY_TIMEOUT
            }
            AppError::Store(StoreError::Backend(_))
            | AppError::Identity(IdentityError::Write(_))
            | AppError::Infra(InfraError::Database { .. }) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Identity(IdentityError::Detached) => StatusCode::CONFLICT,
            AppError::Infra(_) | AppError::Config(_) | AppError::Unexpected(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn presentation_message(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "Request could not be processed",
            AppError::Store(StoreError::Timeout) | AppError::Identity(IdentityError::Timeout) => {
                "Backing store timed out"
            }
            AppError::Store(StoreError::Backend(_))
            | AppError::Identity(IdentityError::Write(_))
            | AppError::Infra(InfraError::Database { .. }) => "Service temporarily unavailable",
            AppError::Identity(IdentityError::Detached) => "No configuration store is attached",
            AppError::Infra(InfraError::Configuration { .. }) | AppError::Config(_) => {
                "Service misconfigured"
            }
            AppError::Infra(InfraError::Telemetry(_)) => "Logging subsystem could not start",
            AppError::Infra(InfraError::Io(_)) => "I/O failure during request",
            AppError::Infra(InfraError::Upstream { .. }) | AppError::Unexpected(_) => {
                "Unexpected error occurred"
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = self.presentation_message();
        let report = ErrorReport::from_error("application::error::AppError", status, &self);
        let mut response = (status, message).into_response();
        report.attach(&mut response);
        response
    }
}
