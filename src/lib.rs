//! EdgeMQ - embeddable MQTT v3.1.1/v5.0 pub/sub broker
//!
//! A TCP broker with retained messages, an in-process inline client and a
//! threshold pipeline that classifies numeric readings published to one
//! topic and republishes the label to another.

pub mod acl;
pub mod auth;
pub mod broker;
pub mod codec;
pub mod config;
pub mod hooks;
pub mod pipeline;
pub mod protocol;
pub mod retained;
pub mod session;
pub mod topic;

pub use acl::AclProvider;
pub use auth::AuthProvider;
pub use broker::{Broker, BrokerConfig, BrokerError, InlineClient, InlineHandler, InlineMessage};
pub use config::Config;
pub use hooks::{CompositeHooks, DefaultHooks, Hooks};
pub use pipeline::ThresholdPipeline;
pub use protocol::{ProtocolVersion, QoS};
