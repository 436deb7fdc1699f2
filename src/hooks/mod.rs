//! Hooks
//!
//! Extension points for authentication, authorization and connection
//! events. The broker consults the hooks for every CONNECT and for every
//! subscribe and publish attempt, network or inline. A denial is an
//! ordinary negative answer; `Err` is reserved for a provider that could
//! not decide.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::protocol::QoS;

#[cfg(test)]
mod tests;

#[derive(Debug)]
pub enum HookError {
    /// Provider failed to reach a decision
    Internal(String),
}

impl fmt::Display for HookError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookError::Internal(msg) => write!(f, "hook error: {}", msg),
        }
    }
}

impl std::error::Error for HookError {}

pub type HookResult<T> = Result<T, HookError>;

/// Identity of the client an action is attempted for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub client_id: Arc<str>,
    pub username: Option<Arc<str>>,
}

impl ClientInfo {
    pub fn new(client_id: impl Into<Arc<str>>, username: Option<&str>) -> Self {
        Self {
            client_id: client_id.into(),
            username: username.map(Arc::from),
        }
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }
}

/// Action checked by [`Hooks::on_authorize`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access<'a> {
    Subscribe { filter: &'a str, qos: QoS },
    Publish { topic: &'a str, qos: QoS, retain: bool },
}

/// Broker hooks.
///
/// Every method has a default that allows everything, so implementors only
/// override what they care about.
#[async_trait]
pub trait Hooks: Send + Sync {
    /// Called for each CONNECT.
    ///
    /// * `Ok(true)` - accept
    /// * `Ok(false)` - refuse with CONNACK NotAuthorized / bad credentials
    async fn on_authenticate(
        &self,
        _client: &ClientInfo,
        _password: Option<&[u8]>,
    ) -> HookResult<bool> {
        Ok(true)
    }

    /// Called before a subscription is registered or a message is published
    async fn on_authorize(&self, _client: &ClientInfo, _access: Access<'_>) -> HookResult<bool> {
        Ok(true)
    }

    /// Called after CONNACK has been queued for an accepted client
    async fn on_client_connected(&self, _client: &ClientInfo) {}

    /// `graceful` is true when the client sent a normal DISCONNECT
    async fn on_client_disconnected(&self, _client: &ClientInfo, _graceful: bool) {}
}

/// Allows everything
#[derive(Debug, Default)]
pub struct DefaultHooks;

#[async_trait]
impl Hooks for DefaultHooks {}

#[async_trait]
impl<T: Hooks + ?Sized> Hooks for Arc<T> {
    async fn on_authenticate(
        &self,
        client: &ClientInfo,
        password: Option<&[u8]>,
    ) -> HookResult<bool> {
        (**self).on_authenticate(client, password).await
    }

    async fn on_authorize(&self, client: &ClientInfo, access: Access<'_>) -> HookResult<bool> {
        (**self).on_authorize(client, access).await
    }

    async fn on_client_connected(&self, client: &ClientInfo) {
        (**self).on_client_connected(client).await;
    }

    async fn on_client_disconnected(&self, client: &ClientInfo, graceful: bool) {
        (**self).on_client_disconnected(client, graceful).await;
    }
}

/// Chains several providers.
///
/// Authentication and authorization succeed only if every provider says
/// yes; the first refusal or error short-circuits. Events reach every
/// provider in insertion order.
#[derive(Default)]
pub struct CompositeHooks {
    hooks: Vec<Box<dyn Hooks>>,
}

impl CompositeHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<H: Hooks + 'static>(&mut self, hooks: H) {
        self.hooks.push(Box::new(hooks));
    }

    pub fn with<H: Hooks + 'static>(mut self, hooks: H) -> Self {
        self.add(hooks);
        self
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

#[async_trait]
impl Hooks for CompositeHooks {
    async fn on_authenticate(
        &self,
        client: &ClientInfo,
        password: Option<&[u8]>,
    ) -> HookResult<bool> {
        for hooks in &self.hooks {
            if !hooks.on_authenticate(client, password).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn on_authorize(&self, client: &ClientInfo, access: Access<'_>) -> HookResult<bool> {
        for hooks in &self.hooks {
            if !hooks.on_authorize(client, access).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn on_client_connected(&self, client: &ClientInfo) {
        for hooks in &self.hooks {
            hooks.on_client_connected(client).await;
        }
    }

    async fn on_client_disconnected(&self, client: &ClientInfo, graceful: bool) {
        for hooks in &self.hooks {
            hooks.on_client_disconnected(client, graceful).await;
        }
    }
}
