//! InfluxDB 1.x writer using the HTTP line protocol

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, error};

use crate::config::InfluxConfig;
use crate::transform::{Point, SnmpValue};

/// Writer errors
#[derive(Debug, thiserror::Error)]
pub enum WriterError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("write rejected with HTTP {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Destination for time-series points
#[async_trait]
pub trait PointWriter: Send + Sync + 'static {
    /// Write points with second precision
    async fn write_points(&self, points: &[Point]) -> Result<(), WriterError>;
}

/// HTTP client for `/write`
pub struct InfluxWriter {
    client: Client,
    config: InfluxConfig,
}

impl InfluxWriter {
    pub fn new(config: InfluxConfig) -> Result<Self, WriterError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| WriterError::Connection(e.to_string()))?;
        Ok(Self { client, config })
    }

    fn write_url(&self) -> String {
        format!("{}/write", self.config.url.trim_end_matches('/'))
    }
}

#[async_trait]
impl PointWriter for InfluxWriter {
    async fn write_points(&self, points: &[Point]) -> Result<(), WriterError> {
        if points.is_empty() {
            return Ok(());
        }

        let body = encode_lines(points);
        let mut request = self
            .client
            .post(self.write_url())
            .query(&[("db", self.config.database.as_str()), ("precision", "s")])
            .body(body);

        if let Some(username) = &self.config.username {
            request = request.basic_auth(username, self.config.password.as_deref());
        }

        let response = request
            .send()
            .await
            .map_err(|e| WriterError::Connection(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            error!(status = %status, body = %body, "InfluxDB write failed");
            return Err(WriterError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        debug!(count = points.len(), "points written");
        Ok(())
    }
}

/// Encode points as newline-separated line protocol
pub fn encode_lines(points: &[Point]) -> String {
    points
        .iter()
        .filter_map(encode_line)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Encode one point; `None` for points without a value
pub fn encode_line(point: &Point) -> Option<String> {
    let field = match &point.value {
        SnmpValue::Integer(v) => format!("{v}i"),
        SnmpValue::Float(v) => v.to_string(),
        SnmpValue::Text(v) => format!("\"{}\"", escape_field(v)),
        SnmpValue::Null => return None,
    };

    let mut line = escape_measurement(&point.measurement);
    for (key, value) in &point.tags {
        if value.is_empty() {
            continue;
        }
        line.push(',');
        line.push_str(&escape_tag(key));
        line.push('=');
        line.push_str(&escape_tag(value));
    }
    line.push_str(" value=");
    line.push_str(&field);
    if let Some(timestamp) = point.timestamp {
        line.push(' ');
        line.push_str(&timestamp.to_string());
    }
    Some(line)
}

fn escape_measurement(s: &str) -> String {
    s.replace(',', "\\,").replace(' ', "\\ ")
}

fn escape_tag(s: &str) -> String {
    s.replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}

fn escape_field(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}
