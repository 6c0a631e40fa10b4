//! Sumitomo F70H helium compressor.
//!
//! RS-232 at 9600 baud, `\r` framing both ways. Every frame is `$<CMD>` followed by
//! a CRC-16 (poly 0xA001, init 0xFFFF) of the preceding ASCII bytes, written as four
//! upper-case hex digits. Replies echo the command and carry comma-separated data:
//!
//! ```text
//! -> $TEA<crc>
//! <- $TEA,020,025,023,<crc>
//! ```
//!
//! Status (`STA`) is a 16-bit hex word: bit 0 system on, bits 1..=7 alarms,
//! bits 9..=11 operating state.

use super::InstrumentDriver;
use crate::adapters::mock::Responder;
use crate::adapters::{LinkAdapter, LinkReply, LinkRequest};
use crate::core::Attribute;
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;

/// Operating states, indexed by status bits 9..=11.
pub const STATES: [&str; 8] = [
    "Local Off",
    "Local On",
    "Remote Off",
    "Remote On",
    "Cold Head Run",
    "Cold Head Pause",
    "Fault Off",
    "Oil Fault Off",
];

/// Alarm bits: (status bit, attribute suffix, label).
pub const ALARM_BITS: [(u32, &str, &str); 7] = [
    (1, "motor_temperature", "Motor Temperature"),
    (2, "phase_sequence", "Phase Sequence/Fuse"),
    (3, "helium_temperature", "Helium Temperature"),
    (4, "water_temperature", "Water Temperature"),
    (5, "water_flow", "Water Flow"),
    (6, "oil_level", "Oil Level"),
    (7, "pressure", "Pressure"),
];

const PREFIX: &str = "compressor";

/// CRC-16 over ASCII bytes, LSB first.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            let lsb = crc & 1;
            crc >>= 1;
            if lsb == 1 {
                crc ^= 0xA001;
            }
        }
    }
    crc
}

fn checksum(message: &str) -> String {
    format!("{:04X}", crc16(message.as_bytes()))
}

/// Frame a command: `$`, upper-cased command, checksum.
pub fn make_command(command: &str) -> String {
    let message = format!("${}", command.to_uppercase());
    let crc = checksum(&message);
    message + &crc
}

/// Validate a reply frame and split its data fields.
pub fn parse_reply(reply: &str) -> AppResult<Vec<String>> {
    let reply = reply.trim();
    if !reply.is_ascii() || reply.len() < 10 || !reply.starts_with('$') {
        return Err(DaqError::ProtocolError(format!("malformed F70H reply '{reply}'")));
    }
    let (body, received) = reply.split_at(reply.len() - 4);
    let expected = checksum(body);
    if received != expected {
        return Err(DaqError::ProtocolError(format!(
            "F70H checksum mismatch for {}: {received} != {expected}",
            &reply[1..4]
        )));
    }
    // `$CMD,` ... `,CRCC`
    let data = &reply[5..reply.len() - 5];
    Ok(data.split(',').map(str::to_string).collect())
}

/// Build a reply frame the way the compressor does.
pub fn make_reply(command: &str, fields: &[&str]) -> String {
    let body = format!("${},{},", command.to_uppercase(), fields.join(","));
    let crc = checksum(&body);
    body + &crc
}

/// Decoded status word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Status(pub u16);

impl Status {
    /// Bit 0.
    pub fn system_on(self) -> bool {
        self.0 & 1 == 1
    }

    /// Operating state from bits 9 to 11.
    pub fn state(self) -> &'static str {
        STATES[usize::from((self.0 >> 9) & 0x7)]
    }

    /// Alarm flag `bit` (1 to 7).
    pub fn alarm(self, bit: u32) -> bool {
        (self.0 >> bit) & 1 == 1
    }

    /// Labels of every raised alarm.
    pub fn active_alarms(self) -> Vec<&'static str> {
        ALARM_BITS
            .iter()
            .filter(|(bit, _, _)| self.alarm(*bit))
            .map(|(_, _, label)| *label)
            .collect()
    }
}

/// Attribute name for an alarm bit.
pub fn alarm_attribute(suffix: &str) -> String {
    format!("{PREFIX}_alarm_{suffix}")
}

/// Compressor driver.
pub struct F70hDriver {
    id: String,
}

impl F70hDriver {
    /// Driver publishing under instrument `id`.
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    async fn query(
        link: &mut dyn LinkAdapter,
        command: &str,
        timeout: Duration,
    ) -> AppResult<Vec<String>> {
        let reply = link
            .transact(&LinkRequest::Query(make_command(command)), timeout)
            .await?
            .into_text()?;
        parse_reply(&reply)
    }
}

fn parse_int(field: Option<&String>, what: &str) -> AppResult<f64> {
    field
        .and_then(|f| f.trim().parse::<i64>().ok())
        .map(|v| v as f64)
        .ok_or_else(|| DaqError::ProtocolError(format!("missing or bad {what} field")))
}

#[async_trait]
impl InstrumentDriver for F70hDriver {
    fn id(&self) -> &str {
        &self.id
    }

    fn attribute_names(&self) -> Vec<String> {
        let mut names: Vec<String> = [
            "he_discharge_temp",
            "water_out_temp",
            "water_in_temp",
            "return_pressure",
            "system_on",
            "state",
        ]
        .iter()
        .map(|n| format!("{PREFIX}_{n}"))
        .collect();
        names.extend(ALARM_BITS.iter().map(|(_, suffix, _)| alarm_attribute(suffix)));
        names
    }

    async fn poll(
        &mut self,
        link: &mut dyn LinkAdapter,
        timeout: Duration,
    ) -> AppResult<Vec<Attribute>> {
        let temps = Self::query(link, "TEA", timeout).await?;
        let pressure = Self::query(link, "PR1", timeout).await?;
        let status = Self::query(link, "STA", timeout).await?;

        let word = status
            .first()
            .and_then(|s| u16::from_str_radix(s.trim(), 16).ok())
            .map(Status)
            .ok_or_else(|| DaqError::ProtocolError(format!("bad STA data {status:?}")))?;

        // One timestamp for the whole cycle
        let now = Utc::now();
        let named = |suffix: &str, value: crate::core::AttributeValue, unit: &str| Attribute {
            name: format!("{PREFIX}_{suffix}"),
            value,
            unit: unit.to_string(),
            timestamp: now,
            valid: true,
        };

        let mut batch = vec![
            named("he_discharge_temp", parse_int(temps.first(), "TEA")?.into(), "°C"),
            named("water_out_temp", parse_int(temps.get(1), "TEA")?.into(), "°C"),
            named("water_in_temp", parse_int(temps.get(2), "TEA")?.into(), "°C"),
            named("return_pressure", parse_int(pressure.first(), "PR1")?.into(), "psig"),
            named("system_on", f64::from(u8::from(word.system_on())).into(), ""),
            named("state", word.state().into(), ""),
        ];
        for (bit, suffix, _) in ALARM_BITS {
            batch.push(named(
                &format!("alarm_{suffix}"),
                f64::from(u8::from(word.alarm(bit))).into(),
                "",
            ));
        }
        Ok(batch)
    }

    fn simulator(&self) -> Option<Responder> {
        Some(Box::new(|request| {
            let LinkRequest::Query(frame) = request else {
                return Ok(LinkReply::Ack);
            };
            let command = frame.get(1..4).unwrap_or_default();
            let fields: &[&str] = match command {
                "TEA" => &["020", "025", "023"],
                "PR1" => &["095"],
                // Remote On, system on
                "STA" => &["0601"],
                _ => &["0"],
            };
            Ok(LinkReply::Text(make_reply(command, fields)))
        }))
    }
}
