//! Device polling work function
//!
//! Each job names a device and a list of OIDs. Every OID is fetched with a
//! single get; when the agent has no such object the subtree is walked
//! instead. The resulting points are written to the time-series store.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use collector_queue::{handler_fn, JobHandler, Payload};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::influx::PointWriter;
use crate::snmp::{DeviceClient, Target};
use crate::transform::to_points;

fn default_community() -> String {
    "public".to_string()
}

/// Job payload for one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceJob {
    pub hostname: String,
    #[serde(default = "default_community")]
    pub community: String,
    pub oids: Vec<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl DeviceJob {
    pub fn from_payload(payload: Payload) -> anyhow::Result<Self> {
        serde_json::from_value(serde_json::Value::Object(payload))
            .context("invalid device job payload")
    }

    pub fn into_payload(self) -> anyhow::Result<Payload> {
        match serde_json::to_value(self)? {
            serde_json::Value::Object(map) => Ok(map),
            other => anyhow::bail!("device job serialized to {other}"),
        }
    }

    fn target(&self) -> Target {
        Target {
            hostname: self.hostname.clone(),
            community: self.community.clone(),
        }
    }
}

/// Polls devices and writes their variables as points
pub struct DevicePoller {
    client: Arc<dyn DeviceClient>,
    writer: Arc<dyn PointWriter>,
}

impl DevicePoller {
    pub fn new(client: Arc<dyn DeviceClient>, writer: Arc<dyn PointWriter>) -> Self {
        Self { client, writer }
    }

    /// Poll one device. Returns the number of points written.
    #[instrument(skip(self, job), fields(hostname = %job.hostname, oids = job.oids.len()))]
    pub async fn poll(&self, job: &DeviceJob) -> anyhow::Result<usize> {
        let target = job.target();
        let timestamp = Some(Utc::now().timestamp());
        let mut written = 0;

        for oid in &job.oids {
            let variable = self
                .client
                .get(&target, oid)
                .await
                .with_context(|| format!("get {oid} from {}", job.hostname))?;

            let variables = if variable.snmp_type.is_missing() {
                debug!(%oid, "no single value, walking subtree");
                self.client
                    .walk(&target, oid)
                    .await
                    .with_context(|| format!("walk {oid} on {}", job.hostname))?
            } else {
                vec![variable]
            };

            let points = to_points(&variables, &job.tags, timestamp)
                .with_context(|| format!("normalize {oid} from {}", job.hostname))?;
            self.writer
                .write_points(&points)
                .await
                .with_context(|| format!("write points for {oid}"))?;
            written += points.len();
        }

        info!(points = written, "device polled");
        Ok(written)
    }

    /// Wrap this poller as a queue work function
    pub fn into_handler(self: Arc<Self>) -> JobHandler {
        handler_fn(move |payload| {
            let poller = Arc::clone(&self);
            async move {
                let job = DeviceJob::from_payload(payload)?;
                poller.poll(&job).await?;
                Ok(())
            }
        })
    }
}
