//! MG15 vacuum gauge controller (Modbus TCP, port 502).
//!
//! Holding registers 0..21 carry seven channels of three registers each: a
//! big-endian IEEE-754 pressure in mbar split over two registers, then a gauge state
//! code. Pressures are published in torr.

use super::InstrumentDriver;
use crate::adapters::mock::Responder;
use crate::adapters::{LinkAdapter, LinkReply, LinkRequest};
use crate::core::{Attribute, AttributeValue};
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// mbar → torr
pub const MBAR_TO_TORR: f64 = 76000.0 / 101_325.0;

const CHANNELS: u16 = 7;
const REGISTERS_PER_CHANNEL: u16 = 3;

/// Gauge state codes.
pub fn gauge_state(code: u16) -> &'static str {
    match code {
        0 => "Status OK",
        1 => "Wait for emission",
        2 => "Emission OFF",
        3 => "Short cathode",
        4 => "Pressure too high (out of vacuum gauge range)",
        5 => "Anode voltage failure",
        6 => "Bias voltage failure",
        7 => "Reflector voltage failure",
        8 => "Degas failure",
        9 => "Gauge not calibrated",
        10 => "No emission",
        11 => "Offset calibration",
        12 => "Low vacuum (out of vacuum gauge range)",
        13 => "High vacuum (out of vacuum gauge range)",
        14 => "There is no meaningful vacuum value to display",
        15 => "No hardware for passive vacuum gauge",
        16 => "Passive gauge EEPROM failure",
        17 => "Filament failure",
        18 => "Degassing",
        19 => "Sensor break for active vacuum gauge",
        _ => "Unknown state",
    }
}

/// Maps one controller channel to an attribute.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GaugeChannel {
    /// 1-based channel number
    pub channel: u16,
    /// Attribute name for the pressure
    pub attribute: String,
}

/// Channels wired on the beamline: main chamber, middle chamber, load lock.
pub fn default_channels() -> Vec<GaugeChannel> {
    [(1, "torr_main"), (2, "torr_middle"), (3, "torr_loadlock")]
        .into_iter()
        .map(|(channel, attribute)| GaugeChannel {
            channel,
            attribute: attribute.to_string(),
        })
        .collect()
}

/// Pressure (mbar) and state code of `channel` (1-based).
pub fn decode_channel(registers: &[u16], channel: u16) -> Option<(f32, u16)> {
    let base = usize::from(channel.checked_sub(1)?.checked_mul(REGISTERS_PER_CHANNEL)?);
    let hi = *registers.get(base)?;
    let lo = *registers.get(base + 1)?;
    let state = *registers.get(base + 2)?;
    let bits = (u32::from(hi) << 16) | u32::from(lo);
    Some((f32::from_bits(bits), state))
}

/// Gauge controller driver.
pub struct Mg15Driver {
    id: String,
    channels: Vec<GaugeChannel>,
}

impl Mg15Driver {
    /// Rejects gauge channels outside 1..=7.
    pub fn new(id: impl Into<String>, channels: Vec<GaugeChannel>) -> AppResult<Self> {
        let id = id.into();
        if let Some(bad) = channels
            .iter()
            .find(|c| c.channel == 0 || c.channel > CHANNELS)
        {
            return Err(DaqError::Configuration(format!(
                "instrument '{id}': gauge channel {} out of range 1..={CHANNELS}",
                bad.channel
            )));
        }
        Ok(Self { id, channels })
    }
}

#[async_trait]
impl InstrumentDriver for Mg15Driver {
    fn id(&self) -> &str {
        &self.id
    }

    fn attribute_names(&self) -> Vec<String> {
        self.channels
            .iter()
            .flat_map(|c| [c.attribute.clone(), format!("{}_state", c.attribute)])
            .collect()
    }

    async fn poll(
        &mut self,
        link: &mut dyn LinkAdapter,
        timeout: Duration,
    ) -> AppResult<Vec<Attribute>> {
        let request = LinkRequest::ReadHoldingRegisters {
            address: 0,
            count: CHANNELS * REGISTERS_PER_CHANNEL,
        };
        let registers = link.transact(&request, timeout).await?.into_registers()?;
        let now = Utc::now();

        let mut batch = Vec::with_capacity(self.channels.len() * 2);
        for gauge in &self.channels {
            let (mbar, code) = decode_channel(&registers, gauge.channel).ok_or_else(|| {
                DaqError::ProtocolError(format!(
                    "short register read ({} registers) for channel {}",
                    registers.len(),
                    gauge.channel
                ))
            })?;
            batch.push(Attribute {
                name: gauge.attribute.clone(),
                value: AttributeValue::Number(f64::from(mbar) * MBAR_TO_TORR),
                unit: "torr".to_string(),
                timestamp: now,
                valid: code == 0,
            });
            batch.push(Attribute {
                name: format!("{}_state", gauge.attribute),
                value: gauge_state(code).into(),
                unit: String::new(),
                timestamp: now,
                valid: true,
            });
        }
        Ok(batch)
    }

    fn simulator(&self) -> Option<Responder> {
        Some(Box::new(|request| match request {
            LinkRequest::ReadHoldingRegisters { count, .. } => {
                let mut registers = Vec::with_capacity(usize::from(*count));
                for mbar in [2.0e-10_f32, 5.0e-9, 1.0e3, 0.0, 0.0, 0.0, 0.0] {
                    let bits = mbar.to_bits();
                    registers.extend([(bits >> 16) as u16, (bits & 0xFFFF) as u16, 0]);
                }
                registers.truncate(usize::from(*count));
                Ok(LinkReply::Registers(registers))
            }
            _ => Ok(LinkReply::Ack),
        }))
    }
}
