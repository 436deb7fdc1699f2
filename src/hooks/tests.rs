//! Hooks module tests

use std::sync::atomic::{AtomicUsize, Ordering};

use super::*;

fn client() -> ClientInfo {
    ClientInfo::new("client1", Some("user"))
}

#[tokio::test]
async fn test_default_hooks_allow_all() {
    let hooks = DefaultHooks;

    assert!(hooks.on_authenticate(&client(), Some(b"pass")).await.unwrap());
    assert!(hooks
        .on_authorize(
            &client(),
            Access::Publish {
                topic: "test/topic",
                qos: QoS::AtMostOnce,
                retain: false,
            },
        )
        .await
        .unwrap());
    assert!(hooks
        .on_authorize(
            &client(),
            Access::Subscribe {
                filter: "test/#",
                qos: QoS::AtLeastOnce,
            },
        )
        .await
        .unwrap());
}

struct DenyPublish;

#[async_trait]
impl Hooks for DenyPublish {
    async fn on_authorize(&self, _client: &ClientInfo, access: Access<'_>) -> HookResult<bool> {
        Ok(!matches!(access, Access::Publish { .. }))
    }
}

struct Failing;

#[async_trait]
impl Hooks for Failing {
    async fn on_authenticate(
        &self,
        _client: &ClientInfo,
        _password: Option<&[u8]>,
    ) -> HookResult<bool> {
        Err(HookError::Internal("backend down".into()))
    }
}

#[derive(Default)]
struct Counting {
    connected: AtomicUsize,
    disconnected: AtomicUsize,
}

#[async_trait]
impl Hooks for Counting {
    async fn on_client_connected(&self, _client: &ClientInfo) {
        self.connected.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_client_disconnected(&self, _client: &ClientInfo, _graceful: bool) {
        self.disconnected.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_composite_requires_all() {
    let hooks = CompositeHooks::new().with(DefaultHooks).with(DenyPublish);
    assert_eq!(hooks.len(), 2);

    let publish = Access::Publish {
        topic: "a",
        qos: QoS::AtMostOnce,
        retain: false,
    };
    let subscribe = Access::Subscribe {
        filter: "a",
        qos: QoS::AtMostOnce,
    };
    assert!(!hooks.on_authorize(&client(), publish).await.unwrap());
    assert!(hooks.on_authorize(&client(), subscribe).await.unwrap());
}

#[tokio::test]
async fn test_composite_propagates_errors() {
    let hooks = CompositeHooks::new().with(Failing).with(DefaultHooks);
    let err = hooks.on_authenticate(&client(), None).await.unwrap_err();
    assert_eq!(err.to_string(), "hook error: backend down");
}

#[tokio::test]
async fn test_composite_events_reach_every_provider() {
    let first = Arc::new(Counting::default());
    let second = Arc::new(Counting::default());
    let hooks = CompositeHooks::new()
        .with(first.clone())
        .with(second.clone());

    hooks.on_client_connected(&client()).await;
    hooks.on_client_disconnected(&client(), true).await;

    for counter in [&first, &second] {
        assert_eq!(counter.connected.load(Ordering::SeqCst), 1);
        assert_eq!(counter.disconnected.load(Ordering::SeqCst), 1);
    }
}

#[tokio::test]
async fn test_empty_composite_allows() {
    let hooks = CompositeHooks::new();
    assert!(hooks.is_empty());
    assert!(hooks.on_authenticate(&client(), None).await.unwrap());
}
