//! Generic query driver.
//!
//! Issues one `Query` per configured channel and extracts the value with an optional
//! regex. Enough for the temperature controller (`KRDG? B` → `+012.345`) and for
//! stage position read-back (`POS? 1`).
//!
//! ## Configuration Example
//!
//! ```toml
//! [[instruments]]
//! id = "tempcontroller"
//! kind = "query"
//! link = { type = "serial", port = "/dev/ttyUSB1", baud_rate = 57600 }
//!
//! [[instruments.channels]]
//! attribute = "TB"
//! command = "KRDG? B"
//! unit = "K"
//! ```

use super::InstrumentDriver;
use crate::adapters::{LinkAdapter, LinkRequest};
use crate::core::{Attribute, AttributeValue};
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One attribute read by one query.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryChannel {
    /// Attribute name in the store
    pub attribute: String,
    /// Command sent as a query
    pub command: String,
    /// Physical unit
    #[serde(default)]
    pub unit: String,
    /// Extraction regex; the first capture group (or whole match) is the value
    #[serde(default)]
    pub pattern: Option<String>,
    /// Multiplier applied to numeric values
    #[serde(default = "default_scale")]
    pub scale: f64,
    /// Parse as a number; keep the text otherwise
    #[serde(default = "default_numeric")]
    pub numeric: bool,
}

fn default_scale() -> f64 {
    1.0
}

fn default_numeric() -> bool {
    true
}

impl QueryChannel {
    /// Channel with the default scale and no pattern.
    pub fn new(attribute: impl Into<String>, command: impl Into<String>, unit: &str) -> Self {
        Self {
            attribute: attribute.into(),
            command: command.into(),
            unit: unit.to_string(),
            pattern: None,
            scale: default_scale(),
            numeric: true,
        }
    }
}

struct CompiledChannel {
    channel: QueryChannel,
    pattern: Option<Regex>,
}

impl CompiledChannel {
    fn extract(&self, reply: &str) -> AppResult<AttributeValue> {
        let raw = match &self.pattern {
            Some(re) => {
                let caps = re.captures(reply).ok_or_else(|| {
                    DaqError::ProtocolError(format!(
                        "reply '{reply}' to '{}' does not match '{}'",
                        self.channel.command,
                        re.as_str()
                    ))
                })?;
                caps.get(1)
                    .or_else(|| caps.get(0))
                    .map(|m| m.as_str())
                    .unwrap_or_default()
            }
            None => reply,
        };

        if !self.channel.numeric {
            return Ok(AttributeValue::Text(raw.trim().to_string()));
        }
        let value: f64 = raw.trim().parse().map_err(|_| {
            DaqError::ProtocolError(format!(
                "non-numeric reply '{raw}' to '{}'",
                self.channel.command
            ))
        })?;
        Ok(AttributeValue::Number(value * self.channel.scale))
    }
}

/// Driver issuing one query per channel.
pub struct QueryDriver {
    id: String,
    channels: Vec<CompiledChannel>,
}

impl QueryDriver {
    /// Build a driver, compiling every pattern.
    pub fn new(id: impl Into<String>, channels: Vec<QueryChannel>) -> AppResult<Self> {
        let id = id.into();
        let channels = channels
            .into_iter()
            .map(|channel| {
                let pattern = channel
                    .pattern
                    .as_deref()
                    .map(Regex::new)
                    .transpose()
                    .map_err(|e| {
                        DaqError::Configuration(format!(
                            "instrument '{id}', attribute '{}': bad pattern: {e}",
                            channel.attribute
                        ))
                    })?;
                Ok(CompiledChannel { channel, pattern })
            })
            .collect::<AppResult<Vec<_>>>()?;
        Ok(Self { id, channels })
    }
}

#[async_trait]
impl InstrumentDriver for QueryDriver {
    fn id(&self) -> &str {
        &self.id
    }

    fn attribute_names(&self) -> Vec<String> {
        self.channels
            .iter()
            .map(|c| c.channel.attribute.clone())
            .collect()
    }

    async fn poll(
        &mut self,
        link: &mut dyn LinkAdapter,
        timeout: Duration,
    ) -> AppResult<Vec<Attribute>> {
        let mut batch = Vec::with_capacity(self.channels.len());
        for compiled in &self.channels {
            let reply = link
                .transact(&LinkRequest::Query(compiled.channel.command.clone()), timeout)
                .await?
                .into_text()?;
            let value = compiled.extract(&reply)?;
            batch.push(Attribute {
                name: compiled.channel.attribute.clone(),
                value,
                unit: compiled.channel.unit.clone(),
                timestamp: Utc::now(),
                valid: true,
            });
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{LinkReply, MockAdapter};

    #[tokio::test]
    async fn test_poll_temperature_controller() {
        let mut link = MockAdapter::new(
            "lakeshore",
            Box::new(|req| match req {
                LinkRequest::Query(cmd) if cmd == "KRDG? B" => Ok(LinkReply::Text("+012.345".into())),
                LinkRequest::Query(cmd) if cmd == "KRDG? A" => Ok(LinkReply::Text("+300.0".into())),
                other => Ok(LinkReply::Text(format!("?{other:?}"))),
            }),
        );
        link.connect().await.unwrap();

        let mut driver = QueryDriver::new(
            "tempcontroller",
            vec![
                QueryChannel::new("TA", "KRDG? A", "K"),
                QueryChannel::new("TB", "KRDG? B", "K"),
            ],
        )
        .unwrap();
        let batch = driver.poll(&mut link, Duration::from_secs(1)).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[1].name, "TB");
        assert_eq!(batch[1].value, AttributeValue::Number(12.345));
        assert_eq!(driver.attribute_names(), vec!["TA", "TB"]);
    }

    #[tokio::test]
    async fn test_pattern_and_scale() {
        let mut link = MockAdapter::fixed("stage", "1TP-12.500");
        link.connect().await.unwrap();

        let mut channel = QueryChannel::new("x", "1TP?", "mm");
        channel.pattern = Some(r"TP([-+0-9.eE]+)".to_string());
        channel.scale = 0.5;
        let mut driver = QueryDriver::new("stage", vec![channel]).unwrap();

        let batch = driver.poll(&mut link, Duration::from_secs(1)).await.unwrap();
        assert_eq!(batch[0].value, AttributeValue::Number(-6.25));
    }

    #[tokio::test]
    async fn test_garbage_reply_is_protocol_error() {
        let mut link = MockAdapter::fixed("lakeshore", "ERR");
        link.connect().await.unwrap();
        let mut driver =
            QueryDriver::new("tempcontroller", vec![QueryChannel::new("TB", "KRDG? B", "K")])
                .unwrap();
        let err = driver.poll(&mut link, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, DaqError::ProtocolError(_)));
    }

    #[test]
    fn test_bad_pattern_is_configuration_error() {
        let mut channel = QueryChannel::new("TB", "KRDG? B", "K");
        channel.pattern = Some("(".to_string());
        assert!(matches!(
            QueryDriver::new("tc", vec![channel]),
            Err(DaqError::Configuration(_))
        ));
    }
}
