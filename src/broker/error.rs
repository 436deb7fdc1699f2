//! Errors surfaced by the public broker API

use std::fmt;

use crate::hooks::HookError;

#[derive(Debug)]
pub enum BrokerError {
    /// Listener bind or accept failure
    Io(std::io::Error),
    InvalidTopicFilter(&'static str),
    InvalidTopicName(&'static str),
    /// Refused by the authorization hooks
    NotAuthorized,
    Hook(HookError),
    /// The inline session was released by shutdown
    Closed,
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerError::Io(e) => write!(f, "IO error: {}", e),
            BrokerError::InvalidTopicFilter(why) => write!(f, "invalid topic filter: {}", why),
            BrokerError::InvalidTopicName(why) => write!(f, "invalid topic name: {}", why),
            BrokerError::NotAuthorized => write!(f, "not authorized"),
            BrokerError::Hook(e) => write!(f, "{}", e),
            BrokerError::Closed => write!(f, "broker is shut down"),
        }
    }
}

impl std::error::Error for BrokerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BrokerError::Io(e) => Some(e),
            BrokerError::Hook(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for BrokerError {
    fn from(e: std::io::Error) -> Self {
        BrokerError::Io(e)
    }
}

impl From<HookError> for BrokerError {
    fn from(e: HookError) -> Self {
        BrokerError::Hook(e)
    }
}
