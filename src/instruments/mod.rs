//! Instrument drivers
//!
//! A driver knows one instrument's command set: which requests to issue per polling
//! cycle and how to turn the raw replies into [`Attribute`]s. Drivers hold no
//! connection of their own; the polling engine lends them the instrument's link for
//! the duration of one cycle.
//!
//! - [`QueryDriver`]: configurable query/regex driver (temperature controller, stage positions)
//! - [`F70hDriver`]: Sumitomo F70H helium compressor
//! - [`Mg15Driver`]: MG15 vacuum gauge controller over Modbus
//! - [`MirrorDriver`]: re-publishes another process's exchange server
//! - [`SlitIndicator`]: analyzer slit selection (set by the operator, not polled)

pub mod f70h;
pub mod mg15;
pub mod mirror;
pub mod query;
pub mod slit;

pub use f70h::F70hDriver;
pub use mg15::Mg15Driver;
pub use mirror::MirrorDriver;
pub use query::{QueryChannel, QueryDriver};
pub use slit::{SlitIndicator, SlitSetting};

use crate::adapters::mock::Responder;
use crate::adapters::LinkAdapter;
use crate::core::Attribute;
use crate::error::AppResult;
use async_trait::async_trait;
use std::time::Duration;

/// Command set and reply parsing for one instrument.
#[async_trait]
pub trait InstrumentDriver: Send {
    /// Instrument identifier, unique per process.
    fn id(&self) -> &str;

    /// Names of every attribute a successful poll produces.
    ///
    /// The polling engine marks exactly these stale after repeated failures.
    fn attribute_names(&self) -> Vec<String>;

    /// Run one polling cycle over `link`.
    ///
    /// Every transaction is bounded by `timeout`. The returned attributes are
    /// written to the store as one batch.
    async fn poll(
        &mut self,
        link: &mut dyn LinkAdapter,
        timeout: Duration,
    ) -> AppResult<Vec<Attribute>>;

    /// Responder for a simulated link that speaks this instrument's protocol.
    fn simulator(&self) -> Option<Responder> {
        None
    }
}
