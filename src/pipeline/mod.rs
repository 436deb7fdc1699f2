//! Threshold pipeline
//!
//! An inline subscriber that reads a decimal number from each payload on
//! its input filter and republishes a label to the output topic, retained
//! at QoS 0: `high` when the value is above the threshold, `normal`
//! otherwise. Payloads that do not parse count as `normal`.

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::broker::{BrokerError, InlineClient, InlineHandler, InlineMessage};
use crate::config::PipelineConfig;
use crate::protocol::QoS;

/// Classification of one reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    High,
    Normal,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Level::High => "high",
            Level::Normal => "normal",
        }
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Numeric value of a payload, if it is the textual form of a float
pub fn parse_reading(payload: &[u8]) -> Option<f64> {
    std::str::from_utf8(payload).ok()?.parse::<f64>().ok()
}

#[derive(Debug, Clone)]
pub struct ThresholdPipeline {
    output_topic: String,
    threshold: f64,
}

impl ThresholdPipeline {
    pub fn new(output_topic: impl Into<String>, threshold: f64) -> Self {
        Self {
            output_topic: output_topic.into(),
            threshold,
        }
    }

    pub fn output_topic(&self) -> &str {
        &self.output_topic
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// `High` only for a reading strictly above the threshold
    pub fn classify(&self, payload: &[u8]) -> Level {
        match parse_reading(payload) {
            Some(value) if value > self.threshold => Level::High,
            _ => Level::Normal,
        }
    }

    /// Subscribe the pipeline to the configured input filter
    pub async fn start(config: &PipelineConfig, client: &InlineClient) -> Result<(), BrokerError> {
        let pipeline = Self::new(config.output_topic.clone(), config.threshold);
        client
            .subscribe(&config.input_topic, config.subscription_id, pipeline)
            .await?;
        debug!(
            "Threshold pipeline {} -> {} (threshold {})",
            config.input_topic, config.output_topic, config.threshold
        );
        Ok(())
    }
}

#[async_trait]
impl InlineHandler for ThresholdPipeline {
    async fn on_message(&self, client: &InlineClient, message: InlineMessage) {
        debug!(
            "Inline client received {:?} on {} (subscription {:?})",
            String::from_utf8_lossy(&message.payload),
            message.topic,
            message.subscription_id
        );

        let level = self.classify(&message.payload);
        match client
            .publish(&self.output_topic, level.as_str(), true, QoS::AtMostOnce)
            .await
        {
            Ok(delivered) => debug!(
                "Published {} to {} ({} subscriber(s))",
                level, self.output_topic, delivered
            ),
            Err(e) => warn!("Pipeline publish to {} failed: {}", self.output_topic, e),
        }
    }
}
