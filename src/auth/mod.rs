//! Authentication
//!
//! Static username/password authentication. Passwords are stored either in
//! plaintext or as argon2 PHC strings.

use std::collections::HashMap;

use argon2::{Argon2, PasswordHash, PasswordVerifier};
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::AuthConfig;
use crate::hooks::{ClientInfo, HookError, HookResult, Hooks};


enum Credential {
    Plain(String),
    /// Argon2 PHC string
    Hash(String),
}

struct UserEntry {
    credential: Credential,
    role: Option<String>,
}

pub struct AuthProvider {
    enabled: bool,
    allow_anonymous: bool,
    users: HashMap<String, UserEntry>,
}

impl AuthProvider {
    pub fn new(config: &AuthConfig) -> Self {
        let users = config
            .users
            .iter()
            .filter_map(|user| {
                let credential = match (&user.password, &user.password_hash) {
                    (_, Some(hash)) => Credential::Hash(hash.clone()),
                    (Some(password), None) => Credential::Plain(password.clone()),
                    (None, None) => return None,
                };
                Some((
                    user.username.clone(),
                    UserEntry {
                        credential,
                        role: user.role.clone(),
                    },
                ))
            })
            .collect();

        Self {
            enabled: config.enabled,
            allow_anonymous: config.allow_anonymous,
            users,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// ACL role configured for a username
    pub fn user_role(&self, username: &str) -> Option<&str> {
        self.users.get(username).and_then(|u| u.role.as_deref())
    }

    async fn verify(credential: &Credential, password: &[u8]) -> HookResult<bool> {
        match credential {
            Credential::Plain(stored) => Ok(password == stored.as_bytes()),
            Credential::Hash(hash) => {
                let hash = hash.clone();
                let password = password.to_vec();
                tokio::task::spawn_blocking(move || verify_hash(&hash, &password))
                    .await
                    .map_err(|e| HookError::Internal(e.to_string()))
            }
        }
    }
}

fn verify_hash(hash: &str, password: &[u8]) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default().verify_password(password, &parsed).is_ok(),
        Err(e) => {
            warn!("Unparseable password hash: {}", e);
            false
        }
    }
}

#[async_trait]
impl Hooks for AuthProvider {
    async fn on_authenticate(
        &self,
        client: &ClientInfo,
        password: Option<&[u8]>,
    ) -> HookResult<bool> {
        if !self.enabled {
            return Ok(true);
        }

        let Some(username) = client.username() else {
            if !self.allow_anonymous {
                debug!("Anonymous connection refused for {}", client.client_id);
            }
            return Ok(self.allow_anonymous);
        };

        let Some(user) = self.users.get(username) else {
            debug!("Unknown user '{}' for {}", username, client.client_id);
            return Ok(false);
        };

        let accepted = Self::verify(&user.credential, password.unwrap_or_default()).await?;
        if !accepted {
            debug!("Bad password for user '{}' ({})", username, client.client_id);
        }
        Ok(accepted)
    }
}
