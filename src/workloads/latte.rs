//! Latte network latency client against a server peer.
//!
//! Each flow runs one `latte.exe` client against its server's receiver and
//! parses the summary and histogram latte prints to standard output. The
//! server side listens on its own; the client only needs its address.

use std::fmt;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::layout::{ClientInstance, Layout, Role};
use crate::metrics::{Metric, MetricsContext, MetricsParser, ParseError};
use crate::packages::PackagePath;
use crate::process::ProcessRequest;
use crate::workload::{Workload, WorkloadContext, WorkloadIdentity};

const EXECUTABLE: &str = "latte.exe";
const HISTOGRAM_LIMIT: u32 = 1;
const HISTOGRAM_BUCKETS: u32 = 9998;

const PERCENTILES: [(f64, &str); 7] = [
    (0.25, "P25"),
    (0.50, "P50"),
    (0.75, "P75"),
    (0.90, "P90"),
    (0.99, "P99"),
    (0.999, "P99.9"),
    (0.9999, "P99.99"),
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LatteProtocol {
    #[default]
    Tcp,
    Udp,
}

impl fmt::Display for LatteProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LatteProtocol::Tcp => write!(f, "tcp"),
            LatteProtocol::Udp => write!(f, "udp"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatteConfig {
    /// Port the server's latte receiver listens on.
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_iterations")]
    pub iterations: u64,

    /// Spin count before a RIO completion queue poll blocks.
    #[serde(default = "default_rio_poll")]
    pub rio_poll: u64,

    #[serde(default)]
    pub protocol: LatteProtocol,

    #[serde(default = "default_package")]
    pub package: String,

    /// Past this the client is killed and the flow ends degraded.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_port() -> u16 {
    6100
}

fn default_iterations() -> u64 {
    100_100
}

fn default_rio_poll() -> u64 {
    100_000
}

fn default_package() -> String {
    "latte".to_string()
}

fn default_timeout_secs() -> u64 {
    600
}

impl Default for LatteConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            iterations: default_iterations(),
            rio_poll: default_rio_poll(),
            protocol: LatteProtocol::default(),
            package: default_package(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl LatteConfig {
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(Error::Config("latte.port must not be 0".to_string()));
        }
        if self.iterations == 0 || self.timeout_secs == 0 {
            return Err(Error::Config(
                "latte.iterations and latte.timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

pub struct LatteClient {
    identity: WorkloadIdentity,
    config: LatteConfig,
    /// Local address latte binds to, taken from the layout's client entry.
    bind_address: Option<String>,
}

impl LatteClient {
    pub fn new(config: LatteConfig, layout: &Layout) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            identity: WorkloadIdentity::new("latte", Some(Role::Client), config.package.clone()),
            bind_address: layout
                .instances_with_role(Role::Client)
                .next()
                .map(|client| client.address.clone()),
            config,
        })
    }

    fn arguments(&self, server: &ClientInstance) -> String {
        let mut arguments = format!(
            "-so -c -a {}:{} -rio -i {} -riopoll {} -{} -hist -hl {HISTOGRAM_LIMIT} -hc {HISTOGRAM_BUCKETS}",
            server.address, self.config.port, self.config.iterations, self.config.rio_poll, self.config.protocol,
        );
        if let Some(bind) = &self.bind_address {
            arguments.push_str(&format!(" -bl {bind}"));
        }
        arguments
    }
}

#[async_trait]
impl Workload for LatteClient {
    fn identity(&self) -> &WorkloadIdentity {
        &self.identity
    }

    async fn initialize(&self, _ctx: &WorkloadContext, package: &PackagePath, _cancel: &CancelToken) -> Result<()> {
        let executable = package.join(EXECUTABLE);
        if !executable.is_file() {
            return Err(Error::DependencyMissing {
                package: executable.display().to_string(),
            });
        }
        debug!(executable = %executable.display(), "Latte executable found");
        Ok(())
    }

    fn command(&self, package: &PackagePath, peer: Option<&ClientInstance>) -> Result<ProcessRequest> {
        let server = peer.ok_or_else(|| {
            Error::Config("the latte client needs a server instance in the layout".to_string())
        })?;
        Ok(ProcessRequest::new(package.join(EXECUTABLE).display().to_string())
            .arguments(self.arguments(server))
            .working_dir(&package.path)
            .timeout(Duration::from_secs(self.config.timeout_secs)))
    }

    fn metrics_parser(&self) -> Box<dyn MetricsParser> {
        Box::new(LatteParser)
    }

    fn metrics_context(&self, peer: Option<&ClientInstance>) -> MetricsContext {
        let mut ctx = MetricsContext::new("Latte", format!("Latte_{}", self.config.protocol))
            .categorization(self.config.protocol.to_string().to_uppercase());
        if let Some(peer) = peer {
            ctx.tags.insert("server".to_string(), peer.name.clone());
        }
        ctx
    }
}

static SUMMARY_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(Latency\(usec\)|CPU\(%\)|CtxSwitch/sec|SysCall/sec|Interrupt/sec)\s+([\d.]+)").unwrap()
});
static HISTOGRAM_ROW: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*(?:>=\s*)?(\d+)\s+(\d+)\s*$").unwrap());

/// Parses latte's client summary and, when present, its `-hist` table into
/// latency percentiles.
///
/// ```text
/// Latency(usec) 71.07
/// CPU(%)        1.3
/// CtxSwitch/sec 29033     (2.06/iteration)
/// Interval(usec)   Frequency
///       0          0
///       1          86
/// ```
pub struct LatteParser;

impl LatteParser {
    fn summary_metric(key: &str, value: f64) -> Metric {
        match key {
            "Latency(usec)" => Metric::new("Latency", value, "microseconds"),
            "CPU(%)" => Metric::new("CPU", value, "%"),
            other => Metric::new(other, value, "count/sec"),
        }
    }

    /// `(bucket, frequency)` rows following the `Interval(usec)` header.
    fn histogram(raw: &str) -> Vec<(u64, u64)> {
        raw.lines()
            .skip_while(|line| !line.trim_start().starts_with("Interval(usec)"))
            .skip(1)
            .filter_map(|line| {
                let caps = HISTOGRAM_ROW.captures(line)?;
                Some((caps[1].parse().ok()?, caps[2].parse().ok()?))
            })
            .collect()
    }
}

impl MetricsParser for LatteParser {
    fn parse(&self, raw: &str) -> std::result::Result<Vec<Metric>, ParseError> {
        let mut metrics = Vec::new();
        for caps in SUMMARY_LINE.captures_iter(raw) {
            let value = caps[2]
                .parse::<f64>()
                .map_err(|e| ParseError(format!("bad value for {}: {e}", &caps[1])))?;
            metrics.push(Self::summary_metric(&caps[1], value));
        }
        if !metrics.iter().any(|m| m.name == "Latency") {
            return Err(ParseError("no latte latency summary in output".to_string()));
        }

        let rows = Self::histogram(raw);
        let total: u64 = rows.iter().map(|(_, count)| count).sum();
        if total > 0 {
            for (fraction, label) in PERCENTILES {
                let target = (total as f64 * fraction).ceil() as u64;
                let mut seen = 0;
                if let Some((bucket, _)) = rows.iter().find(|(_, count)| {
                    seen += count;
                    seen >= target
                }) {
                    metrics.push(Metric::new(format!("Latency-{label}"), *bucket as f64, "microseconds"));
                }
            }
        }
        Ok(metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OUTPUT: &str = "\
Protocol      TCP
SendMethod    RIO
ReceiveMethod RIO
SO_SNDBUF     Default
SO_RCVBUF     Default
MsgSize(byte) 4
Iterations    100100
Latency(usec) 71.07
CPU(%)        1.3
CtxSwitch/sec 29033     (2.06/iteration)
SysCall/sec   48368     (3.44/iteration)
Interrupt/sec 28547     (2.03/iteration)

Interval(usec)   Frequency
      0          0
      50         10
      60         60
      70         20
      80         9
>=    9999       1
";

    fn layout() -> Layout {
        Layout::new(vec![
            ClientInstance::new("client-1", Role::Client, "10.0.0.1", 4500),
            ClientInstance::new("server-1", Role::Server, "10.0.0.2", 4500),
        ])
    }

    fn server() -> ClientInstance {
        ClientInstance::new("server-1", Role::Server, "10.0.0.2", 4500)
    }

    #[test]
    fn parses_summary_and_percentiles() {
        let metrics = LatteParser.parse(OUTPUT).unwrap();
        let value = |name: &str| metrics.iter().find(|m| m.name == name).map(|m| m.value);

        assert_eq!(value("Latency"), Some(71.07));
        assert_eq!(value("CPU"), Some(1.3));
        assert_eq!(value("CtxSwitch/sec"), Some(29033.0));
        assert_eq!(value("Interrupt/sec"), Some(28547.0));
        assert_eq!(value("Latency-P25"), Some(60.0));
        assert_eq!(value("Latency-P50"), Some(60.0));
        assert_eq!(value("Latency-P90"), Some(70.0));
        assert_eq!(value("Latency-P99"), Some(80.0));
        assert_eq!(value("Latency-P99.99"), Some(9999.0));
        assert_eq!(metrics.len(), 12);
    }

    #[test]
    fn summary_without_histogram_is_enough() {
        let metrics = LatteParser.parse("Latency(usec) 42.5\nCPU(%) 0.8\n").unwrap();
        assert_eq!(metrics.len(), 2);
        assert_eq!(metrics[0].unit, "microseconds");
    }

    #[test]
    fn output_without_latency_is_rejected() {
        let err = LatteParser.parse("Connection refused\n").unwrap_err();
        assert!(err.to_string().contains("latency"));
    }

    #[test]
    fn command_targets_server_and_binds_client_address() {
        let client = LatteClient::new(LatteConfig::default(), &layout()).unwrap();
        let package = PackagePath::new("latte", "/opt/latte");

        let request = client.command(&package, Some(&server())).unwrap();

        assert!(request.command.ends_with("latte.exe"));
        assert_eq!(
            request.arguments,
            "-so -c -a 10.0.0.2:6100 -rio -i 100100 -riopoll 100000 -tcp -hist -hl 1 -hc 9998 -bl 10.0.0.1"
        );
        assert_eq!(request.timeout, Some(Duration::from_secs(600)));
        assert!(!request.elevated);
    }

    #[test]
    fn command_needs_a_server() {
        let client = LatteClient::new(LatteConfig::default(), &Layout::default()).unwrap();
        let package = PackagePath::new("latte", "/opt/latte");
        assert!(matches!(client.command(&package, None), Err(Error::Config(_))));
    }

    #[test]
    fn udp_scenario_and_categorization() {
        let config = LatteConfig {
            protocol: LatteProtocol::Udp,
            ..Default::default()
        };
        let client = LatteClient::new(config, &layout()).unwrap();
        let ctx = client.metrics_context(Some(&server()));
        assert_eq!(ctx.scenario, "Latte_udp");
        assert_eq!(ctx.categorization.as_deref(), Some("UDP"));
        assert_eq!(ctx.tags["server"], "server-1");
    }

    #[test]
    fn zero_port_is_rejected() {
        let config = LatteConfig {
            port: 0,
            ..Default::default()
        };
        assert!(LatteClient::new(config, &layout()).is_err());
    }
}
