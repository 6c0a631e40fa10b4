//! Telemetry core for an ARPES data-acquisition system.
//!
//! Instruments (compressor, vacuum gauges, temperature controller, stage) are polled
//! over their links into a process-local [`store::AttributeStore`]. Other processes,
//! above all the acquisition program at the end of each scan, read the store through
//! the line-based [`exchange`] protocol. The [`scan`] orchestrator captures exactly
//! one snapshot per scan, the [`alarm`] engine notifies on debounced transitions and
//! the [`motion`] queue serializes stage moves per axis.
//!
//! [`app::DaqApp`] wires everything together from a [`config::Settings`].

pub mod adapters;
pub mod alarm;
pub mod app;
pub mod config;
pub mod core;
pub mod error;
pub mod error_recovery;
pub mod exchange;
pub mod instruments;
pub mod motion;
pub mod polling;
pub mod scan;
pub mod store;
