//! Access control
//!
//! Topic authorization by role:
//! - Patterns use MQTT wildcards (`#` and `+`)
//! - `%c` expands to the client id and `%u` to the username
//! - Users without a role (and anonymous clients) get the default
//!   permissions
//!
//! A subscribe request is checked by matching its filter against the
//! patterns as if it were a topic, so `sensors/#` grants `sensors/+/temp`
//! but `sensors/+` does not grant `sensors/#`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::auth::AuthProvider;
use crate::config::AclConfig;
use crate::hooks::{Access, ClientInfo, HookResult, Hooks};
use crate::topic;


struct AclRoleEntry {
    publish: Vec<String>,
    subscribe: Vec<String>,
}

pub struct AclProvider {
    enabled: bool,
    roles: HashMap<String, AclRoleEntry>,
    default_publish: Vec<String>,
    default_subscribe: Vec<String>,
    /// Source of the username -> role mapping
    auth_provider: Arc<AuthProvider>,
}

impl AclProvider {
    pub fn new(config: &AclConfig, auth_provider: Arc<AuthProvider>) -> Self {
        let roles = config
            .roles
            .iter()
            .map(|role| {
                (
                    role.name.clone(),
                    AclRoleEntry {
                        publish: role.publish.clone(),
                        subscribe: role.subscribe.clone(),
                    },
                )
            })
            .collect();

        Self {
            enabled: config.enabled,
            roles,
            default_publish: config.default.publish.clone(),
            default_subscribe: config.default.subscribe.clone(),
            auth_provider,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn matches_pattern(pattern: &str, target: &str, client: &ClientInfo) -> bool {
        if !pattern.contains('%') {
            return Self::pattern_match(pattern, target);
        }
        let pattern = pattern
            .replace("%c", &client.client_id)
            .replace("%u", client.username().unwrap_or(""));
        Self::pattern_match(&pattern, target)
    }

    /// Topic matching without the `$` exclusion: an explicit ACL pattern
    /// such as `#` is meant to cover every topic.
    fn pattern_match(pattern: &str, target: &str) -> bool {
        if target.starts_with('$') && pattern.starts_with(['+', '#']) {
            let (_, target_rest) = target.split_once('/').unwrap_or((target, ""));
            return match pattern.split_once('/') {
                Some((_, pattern_rest)) => topic::matches(pattern_rest, target_rest),
                None => pattern == "#" || !target.contains('/'),
            };
        }
        topic::matches(pattern, target)
    }

    fn check_patterns(patterns: &[String], target: &str, client: &ClientInfo) -> bool {
        patterns
            .iter()
            .any(|p| Self::matches_pattern(p, target, client))
    }

    fn role_for(&self, client: &ClientInfo) -> Option<&AclRoleEntry> {
        let role = self.auth_provider.user_role(client.username()?)?;
        self.roles.get(role)
    }
}

#[async_trait]
impl Hooks for AclProvider {
    async fn on_authorize(&self, client: &ClientInfo, access: Access<'_>) -> HookResult<bool> {
        if !self.enabled {
            return Ok(true);
        }

        let (target, role_patterns, default_patterns) = match access {
            Access::Publish { topic, .. } => (
                topic,
                self.role_for(client).map(|r| &r.publish),
                &self.default_publish,
            ),
            Access::Subscribe { filter, .. } => (
                filter,
                self.role_for(client).map(|r| &r.subscribe),
                &self.default_subscribe,
            ),
        };

        if let Some(patterns) = role_patterns {
            if Self::check_patterns(patterns, target, client) {
                return Ok(true);
            }
        }
        if Self::check_patterns(default_patterns, target, client) {
            return Ok(true);
        }

        debug!("ACL denied {:?} for {}", access, client.client_id);
        Ok(false)
    }
}
