//! SNMP device client backed by the Net-SNMP command line tools
//!
//! Runs `snmpget`/`snmpwalk` with numeric output (`-OentU`) and parses each
//! `OID = TYPE: VALUE` line into an [`SnmpVariable`].

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::config::SnmpConfig;

/// SNMP errors
#[derive(Debug, thiserror::Error)]
pub enum SnmpError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {status}: {stderr}")]
    CommandFailed {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("{program} timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },

    #[error("unparsable SNMP output: {0}")]
    Parse(String),
}

/// Device address and credentials
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub hostname: String,
    pub community: String,
}

/// SNMP value type as reported by the agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnmpType {
    Integer,
    Counter32,
    Counter64,
    Gauge32,
    Timeticks,
    Unsigned32,
    String,
    HexString,
    IpAddress,
    Oid,
    Opaque,
    NoSuchObject,
    NoSuchInstance,
    EndOfMibView,
    Other(String),
}

impl SnmpType {
    fn from_label(label: &str) -> Self {
        match label {
            "INTEGER" => Self::Integer,
            "Counter32" => Self::Counter32,
            "Counter64" => Self::Counter64,
            "Gauge32" => Self::Gauge32,
            "Timeticks" => Self::Timeticks,
            "Unsigned32" | "UInteger32" => Self::Unsigned32,
            "STRING" => Self::String,
            "Hex-STRING" => Self::HexString,
            "IpAddress" => Self::IpAddress,
            "OID" => Self::Oid,
            "Opaque" => Self::Opaque,
            other => Self::Other(other.to_string()),
        }
    }

    /// Whether the agent reported that no value exists
    pub fn is_missing(&self) -> bool {
        matches!(
            self,
            Self::NoSuchObject | Self::NoSuchInstance | Self::EndOfMibView
        )
    }
}

/// One variable binding returned by the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnmpVariable {
    /// Requested OID, without the leading dot
    pub oid: String,
    /// Suffix below the requested OID for walked variables
    pub index: Option<String>,
    pub snmp_type: SnmpType,
    /// Raw value text
    pub value: String,
}

/// Source of SNMP variables
#[async_trait]
pub trait DeviceClient: Send + Sync + 'static {
    /// Fetch a single OID
    async fn get(&self, target: &Target, oid: &str) -> Result<SnmpVariable, SnmpError>;

    /// Fetch every variable below `oid`
    async fn walk(&self, target: &Target, oid: &str) -> Result<Vec<SnmpVariable>, SnmpError>;
}

/// Parser for Net-SNMP numeric output
pub struct OutputParser {
    line: Regex,
}

impl OutputParser {
    pub fn new() -> Result<Self, SnmpError> {
        let line = Regex::new(r"^\.?(?P<oid>\d+(?:\.\d+)*) = (?P<rest>.*)$")
            .map_err(|e| SnmpError::Parse(e.to_string()))?;
        Ok(Self { line })
    }

    /// Parse command output for a request on `base_oid`
    ///
    /// With `walk` the suffix below `base_oid` becomes the variable index.
    /// Lines that do not start a new binding continue the previous value.
    pub fn parse(
        &self,
        base_oid: &str,
        output: &str,
        walk: bool,
    ) -> Result<Vec<SnmpVariable>, SnmpError> {
        let base = base_oid.trim_start_matches('.');
        let mut variables: Vec<SnmpVariable> = Vec::new();

        for line in output.lines() {
            let Some(caps) = self.line.captures(line) else {
                match variables.last_mut() {
                    Some(last) => {
                        last.value.push('\n');
                        last.value.push_str(line);
                        continue;
                    }
                    None if line.trim().is_empty() => continue,
                    None => return Err(SnmpError::Parse(line.to_string())),
                }
            };

            let oid = &caps["oid"];
            let (snmp_type, value) = parse_rest(&caps["rest"]);
            let index = if walk {
                oid.strip_prefix(base)
                    .and_then(|suffix| suffix.strip_prefix('.'))
                    .map(str::to_string)
            } else {
                None
            };

            variables.push(SnmpVariable {
                oid: base.to_string(),
                index,
                snmp_type,
                value,
            });
        }

        // Quoted strings may span lines, so unquote once they are complete
        for variable in &mut variables {
            if variable.snmp_type == SnmpType::String {
                variable.value = unquote(&variable.value);
            }
        }

        Ok(variables)
    }
}

fn parse_rest(rest: &str) -> (SnmpType, String) {
    if rest.starts_with("No Such Object") {
        return (SnmpType::NoSuchObject, String::new());
    }
    if rest.starts_with("No Such Instance") {
        return (SnmpType::NoSuchInstance, String::new());
    }
    if rest.starts_with("No more variables") {
        return (SnmpType::EndOfMibView, String::new());
    }
    if rest == "\"\"" {
        return (SnmpType::String, String::new());
    }

    match rest.split_once(':') {
        Some((label, value)) => {
            let snmp_type = SnmpType::from_label(label.trim());
            let value = value.strip_prefix(' ').unwrap_or(value);
            (snmp_type, value.trim_end().to_string())
        }
        None => (SnmpType::Other(rest.to_string()), String::new()),
    }
}

fn unquote(value: &str) -> String {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
        .to_string()
}

/// [`DeviceClient`] that shells out to `snmpget` and `snmpwalk`
pub struct NetSnmpClient {
    config: SnmpConfig,
    parser: OutputParser,
}

impl NetSnmpClient {
    pub fn new(config: SnmpConfig) -> Result<Self, SnmpError> {
        Ok(Self {
            config,
            parser: OutputParser::new()?,
        })
    }

    /// Bound on a whole command run, covering every retry
    fn command_timeout(&self) -> Duration {
        self.config.timeout * (self.config.retries + 1) + Duration::from_secs(1)
    }

    async fn run(&self, program: &str, target: &Target, oid: &str) -> Result<String, SnmpError> {
        let mut command = Command::new(program);
        command
            .arg("-v")
            .arg(&self.config.version)
            .arg("-c")
            .arg(&target.community)
            .arg("-r")
            .arg(self.config.retries.to_string())
            .arg("-t")
            .arg(self.config.timeout.as_secs().max(1).to_string())
            .arg("-OentU")
            .arg(&target.hostname)
            .arg(oid)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let timeout = self.command_timeout();
        let output = tokio::time::timeout(timeout, command.output())
            .await
            .map_err(|_| SnmpError::Timeout {
                program: program.to_string(),
                timeout,
            })?
            .map_err(|source| SnmpError::Spawn {
                program: program.to_string(),
                source,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            return Err(SnmpError::CommandFailed {
                program: program.to_string(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(stdout)
    }
}

#[async_trait]
impl DeviceClient for NetSnmpClient {
    #[instrument(skip(self, target), fields(hostname = %target.hostname))]
    async fn get(&self, target: &Target, oid: &str) -> Result<SnmpVariable, SnmpError> {
        let output = self.run("snmpget", target, oid).await?;
        let variable = self
            .parser
            .parse(oid, &output, false)?
            .into_iter()
            .next()
            .ok_or_else(|| SnmpError::Parse(format!("no variable returned for {oid}")))?;
        debug!(snmp_type = ?variable.snmp_type, "got variable");
        Ok(variable)
    }

    #[instrument(skip(self, target), fields(hostname = %target.hostname))]
    async fn walk(&self, target: &Target, oid: &str) -> Result<Vec<SnmpVariable>, SnmpError> {
        let output = self.run("snmpwalk", target, oid).await?;
        let variables = self.parser.parse(oid, &output, true)?;
        debug!(count = variables.len(), "walked subtree");
        Ok(variables)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> OutputParser {
        OutputParser::new().unwrap()
    }

    #[test]
    fn test_parse_get() {
        let vars = parser()
            .parse("1.3.6.1.2.1.1.3.0", ".1.3.6.1.2.1.1.3.0 = Timeticks: 1234567\n", false)
            .unwrap();
        assert_eq!(
            vars,
            vec![SnmpVariable {
                oid: "1.3.6.1.2.1.1.3.0".to_string(),
                index: None,
                snmp_type: SnmpType::Timeticks,
                value: "1234567".to_string(),
            }]
        );
    }

    #[test]
    fn test_parse_walk_indexes() {
        let output = "\
.1.3.6.1.2.1.2.2.1.2.1 = STRING: \"lo\"
.1.3.6.1.2.1.2.2.1.2.2 = STRING: \"eth0\"
.1.3.6.1.2.1.2.2.1.10.1.7 = Counter32: 42
";
        let vars = parser().parse(".1.3.6.1.2.1.2.2.1", output, true).unwrap();
        assert_eq!(vars.len(), 3);
        assert_eq!(vars[0].oid, "1.3.6.1.2.1.2.2.1");
        assert_eq!(vars[0].index.as_deref(), Some("2.1"));
        assert_eq!(vars[0].value, "lo");
        assert_eq!(vars[1].value, "eth0");
        assert_eq!(vars[2].index.as_deref(), Some("10.1.7"));
        assert_eq!(vars[2].snmp_type, SnmpType::Counter32);
    }

    #[test]
    fn test_parse_missing_values() {
        let output = "\
.1.3.6.1.2.1.1.9 = No Such Object available on this agent at this OID
.1.3.6.1.2.1.1.1 = No Such Instance currently exists at this OID
.1.3.6.1.2.1.99 = No more variables left in this MIB View (It is past the end of the MIB tree)
";
        let vars = parser().parse("1.3.6.1.2.1", output, false).unwrap();
        let types: Vec<SnmpType> = vars.into_iter().map(|v| v.snmp_type).collect();
        assert_eq!(
            types,
            vec![
                SnmpType::NoSuchObject,
                SnmpType::NoSuchInstance,
                SnmpType::EndOfMibView
            ]
        );
        assert!(types.iter().all(SnmpType::is_missing));
    }

    #[test]
    fn test_parse_multiline_string_and_empty_string() {
        let output = "\
.1.3.6.1.2.1.1.1.0 = STRING: \"Linux router
kernel 6.1\"
.1.3.6.1.2.1.1.4.0 = \"\"
";
        let vars = parser().parse("1.3.6.1.2.1.1", output, true).unwrap();
        assert_eq!(vars.len(), 2);
        assert_eq!(vars[0].value, "Linux router\nkernel 6.1");
        assert_eq!(vars[1].snmp_type, SnmpType::String);
        assert_eq!(vars[1].value, "");
    }

    #[test]
    fn test_parse_other_types() {
        let output = "\
.1.3.6.1.2.1.4.20.1.1.10.0.0.1 = IpAddress: 10.0.0.1
.1.3.6.1.2.1.2.2.1.6.2 = Hex-STRING: 00 1A 2B 3C 4D 5E
.1.3.6.1.2.1.1.2.0 = OID: .1.3.6.1.4.1.8072.3.2.10
.1.3.6.1.4.1.2021.10.1.6.1 = Opaque: Float: 0.150000
.1.3.6.1.2.1.1.8.0 = Network Address: 0A:00:00:01
";
        let vars = parser().parse("1.3.6.1", output, true).unwrap();
        assert_eq!(vars[0].snmp_type, SnmpType::IpAddress);
        assert_eq!(vars[0].value, "10.0.0.1");
        assert_eq!(vars[1].snmp_type, SnmpType::HexString);
        assert_eq!(vars[1].value, "00 1A 2B 3C 4D 5E");
        assert_eq!(vars[2].snmp_type, SnmpType::Oid);
        assert_eq!(vars[3].snmp_type, SnmpType::Opaque);
        assert_eq!(vars[3].value, "Float: 0.150000");
        assert_eq!(
            vars[4].snmp_type,
            SnmpType::Other("Network Address".to_string())
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            parser().parse("1.3", "Timeout: No Response from 10.0.0.1", false),
            Err(SnmpError::Parse(_))
        ));
    }

    #[test]
    fn test_command_timeout_covers_retries() {
        let client = NetSnmpClient::new(SnmpConfig {
            version: "2c".to_string(),
            retries: 2,
            timeout: Duration::from_secs(3),
        })
        .unwrap();
        assert_eq!(client.command_timeout(), Duration::from_secs(10));
    }
}
