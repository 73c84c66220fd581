use std::sync::Arc;

use thiserror::Error;

use crate::{
    config::ConfigError,
    directory::DirectoryError,
    driver::DriverError,
    protocol::{ControlCode, ControlError, FrameError},
};

/// Everything a transport operation can end with.
///
/// The type is cloneable so one outcome can be handed to several waiters;
/// errors from other layers are shared behind an [`Arc`].
#[derive(Debug, Error, Clone)]
pub enum TransportError {
    #[error("message body is empty")]
    EmptyMessage,
    #[error("target id {0} is outside 1..=2147483647")]
    InvalidTarget(i32),
    #[error("return token carries no route")]
    MissingRoute,
    #[error("no driver registered for scheme '{0}'")]
    UnknownScheme(String),
    #[error("service {0} is already registered")]
    DuplicateService(i32),
    #[error("a service is already registered as '{0}'")]
    DuplicateName(String),
    #[error("no service registered as {0}")]
    UnknownService(String),
    #[error("failed to connect to {url}: {reason}")]
    ConnectFailed { url: String, reason: String },
    #[error("connect to {0} timed out")]
    ConnectTimeout(String),
    #[error("connection closed")]
    NotConnected,
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("timed out waiting for a reply")]
    Timeout,
    #[error("target '{0}' could not be resolved")]
    TargetUnresolved(String),
    #[error("peer could not route the message")]
    RouteFailed,
    #[error("route timed out at peer")]
    RouteTimeout,
    #[error("route table is full")]
    RouteOverflow,
    #[error("message TTL expired")]
    TtlExpired,
    #[error("directory error: {0}")]
    Directory(Arc<DirectoryError>),
    #[error("driver error: {0}")]
    Driver(Arc<DriverError>),
    #[error("frame error: {0}")]
    Frame(Arc<FrameError>),
    #[error("control frame error: {0}")]
    Control(Arc<ControlError>),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("transport is shut down")]
    Shutdown,
}

impl TransportError {
    /// Stable numeric code of the outcome, distinct per variant.
    pub fn code(&self) -> i32 {
        match self {
            Self::SendFailed(_) => 1,
            Self::Timeout => 2,
            Self::TargetUnresolved(_) => 3,
            Self::RouteFailed => 4,
            Self::RouteTimeout => 5,
            Self::RouteOverflow => 6,
            Self::TtlExpired => 7,
            Self::NotConnected => 8,
            Self::ConnectFailed { .. } => 9,
            Self::ConnectTimeout(_) => 10,
            Self::EmptyMessage => 11,
            Self::InvalidTarget(_) => 12,
            Self::MissingRoute => 13,
            Self::UnknownScheme(_) => 14,
            Self::DuplicateService(_) => 15,
            Self::UnknownService(_) => 16,
            Self::Directory(_) => 17,
            Self::Driver(_) => 18,
            Self::Frame(_) => 19,
            Self::Control(_) => 20,
            Self::Config(_) => 21,
            Self::Shutdown => 22,
            Self::DuplicateName(_) => 23,
        }
    }

    /// Maps a route failure frame sent back by a peer onto its error.
    pub fn from_route_failure(code: ControlCode, target: &str) -> Option<Self> {
        let err = match code {
            ControlCode::RouteTimeout => Self::RouteTimeout,
            ControlCode::RouteOverflow => Self::RouteOverflow,
            ControlCode::TtlExpired => Self::TtlExpired,
            ControlCode::RouteFailed => Self::RouteFailed,
            ControlCode::UnresolvedTarget => Self::TargetUnresolved(target.to_string()),
            _ => return None,
        };
        Some(err)
    }
}

impl From<DirectoryError> for TransportError {
    fn from(value: DirectoryError) -> Self {
        Self::Directory(Arc::new(value))
    }
}

impl From<DriverError> for TransportError {
    fn from(value: DriverError) -> Self {
        Self::Driver(Arc::new(value))
    }
}

impl From<FrameError> for TransportError {
    fn from(value: FrameError) -> Self {
        Self::Frame(Arc::new(value))
    }
}

impl From<ControlError> for TransportError {
    fn from(value: ControlError) -> Self {
        Self::Control(Arc::new(value))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn wait_outcomes_have_distinct_codes() {
        let outcomes = [
            TransportError::SendFailed("x".into()),
            TransportError::Timeout,
            TransportError::TargetUnresolved("x".into()),
            TransportError::RouteFailed,
            TransportError::RouteTimeout,
            TransportError::RouteOverflow,
            TransportError::TtlExpired,
        ];
        let codes: HashSet<i32> = outcomes.iter().map(TransportError::code).collect();
        assert_eq!(codes.len(), outcomes.len());
    }

    #[test]
    fn route_failure_codes() {
        assert!(matches!(
            TransportError::from_route_failure(ControlCode::TtlExpired, "a"),
            Some(TransportError::TtlExpired)
        ));
        assert!(matches!(
            TransportError::from_route_failure(ControlCode::UnresolvedTarget, "a"),
            Some(TransportError::TargetUnresolved(name)) if name == "a"
        ));
        assert!(TransportError::from_route_failure(ControlCode::Chirp, "a").is_none());
    }
}
