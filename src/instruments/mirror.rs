//! Mirror of another process's attribute store.
//!
//! The aggregating front-end polls each instrument process's exchange server and
//! re-publishes what it gets. Remote timestamps and validity are kept as received;
//! names the remote has never seen are skipped, so they age out locally.

use super::InstrumentDriver;
use crate::adapters::{LinkAdapter, LinkRequest};
use crate::core::Attribute;
use crate::error::{AppResult, DaqError};
use crate::exchange::protocol::{self, Record, Reply, Request};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::debug;

/// Re-publishes records fetched from a remote exchange server.
pub struct MirrorDriver {
    id: String,
    names: Vec<String>,
    // Names received so far, for mirrors of everything
    seen: BTreeSet<String>,
}

impl MirrorDriver {
    /// Mirror `names`; empty mirrors everything the remote has.
    pub fn new(id: impl Into<String>, names: Vec<String>) -> Self {
        Self {
            id: id.into(),
            names,
            seen: BTreeSet::new(),
        }
    }
}

#[async_trait]
impl InstrumentDriver for MirrorDriver {
    fn id(&self) -> &str {
        &self.id
    }

    fn attribute_names(&self) -> Vec<String> {
        if self.names.is_empty() {
            self.seen.iter().cloned().collect()
        } else {
            self.names.clone()
        }
    }

    async fn poll(
        &mut self,
        link: &mut dyn LinkAdapter,
        timeout: Duration,
    ) -> AppResult<Vec<Attribute>> {
        let request = Request::Attributes(self.names.clone()).encode();
        let lines = link
            .transact(&LinkRequest::Query(request), timeout)
            .await?
            .into_lines()?;

        match protocol::decode_reply(&lines)? {
            Reply::Records(records) => {
                let batch: Vec<Attribute> = records
                    .into_iter()
                    .filter_map(|record| match record {
                        Record::Found(attr) => Some(attr),
                        Record::NotFound(name) => {
                            debug!(instrument = %self.id, %name, "remote does not know attribute");
                            None
                        }
                    })
                    .collect();
                if self.names.is_empty() {
                    self.seen.extend(batch.iter().map(|a| a.name.clone()));
                }
                Ok(batch)
            }
            Reply::Ok(text) => Err(DaqError::ProtocolError(format!(
                "unexpected control reply 'OK {text}' to attribute request"
            ))),
        }
    }
}
