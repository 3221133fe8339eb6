//! Sysbench OLTP client against a MySQL server peer.

use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::layout::{ClientInstance, Role};
use crate::metrics::{Metric, MetricsContext, MetricsParser, ParseError};
use crate::packages::PackagePath;
use crate::process::ProcessRequest;
use crate::workload::{Workload, WorkloadContext, WorkloadIdentity};

const STATE_KEY: &str = "SysbenchOLTPState";
const INITIALIZED_FLAG: &str = "SysbenchInitialized";
const SYSBENCH_BINARY: &str = "src/sysbench";
const BALANCED_SCRIPT: &str = "balanced-client.sh";
const MAX_THREADS: u32 = 64;
const DEFAULT_TABLES: u32 = 10;

/// Workloads that only ever touch one table.
const ONE_TABLE_WORKLOADS: [&str; 2] = ["select_random_points", "select_random_ranges"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SysbenchScenario {
    #[default]
    Default,
    /// Tables are moved onto the server's data disks before the run.
    Balanced,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SysbenchConfig {
    /// Sysbench Lua workload, e.g. `oltp_read_write`.
    #[serde(default = "default_workload")]
    pub workload: String,

    #[serde(default = "default_database_name")]
    pub database_name: String,

    #[serde(default)]
    pub num_tables: Option<u32>,

    /// Rows per table. Defaults to a power of ten scaled by core count.
    #[serde(default)]
    pub record_count: Option<u64>,

    #[serde(default)]
    pub threads: Option<u32>,

    #[serde(default = "default_duration_secs")]
    pub duration_secs: u64,

    #[serde(default)]
    pub scenario: SysbenchScenario,

    #[serde(default = "default_package")]
    pub package: String,

    /// Directory holding `balanced-client.sh`.
    #[serde(default = "default_scripts_dir")]
    pub scripts_dir: PathBuf,

    #[serde(default)]
    pub core_count: Option<usize>,

    /// Attempts per client flow. Transient failures against the server
    /// (dropped connections, a restarting MySQL) are retried.
    #[serde(default = "default_flow_attempts")]
    pub flow_attempts: u32,
}

fn default_workload() -> String {
    "oltp_read_write".to_string()
}

fn default_database_name() -> String {
    "sbtest".to_string()
}

fn default_duration_secs() -> u64 {
    300
}

fn default_package() -> String {
    "sysbench".to_string()
}

fn default_scripts_dir() -> PathBuf {
    PathBuf::from("scripts/sysbencholtp")
}

fn default_flow_attempts() -> u32 {
    3
}

impl Default for SysbenchConfig {
    fn default() -> Self {
        Self {
            workload: default_workload(),
            database_name: default_database_name(),
            num_tables: None,
            record_count: None,
            threads: None,
            duration_secs: default_duration_secs(),
            scenario: SysbenchScenario::default(),
            package: default_package(),
            scripts_dir: default_scripts_dir(),
            core_count: None,
            flow_attempts: default_flow_attempts(),
        }
    }
}

impl SysbenchConfig {
    pub fn validate(&self) -> Result<()> {
        if self.workload.trim().is_empty() {
            return Err(Error::Config("sysbench.workload must not be empty".to_string()));
        }
        if self.duration_secs == 0 {
            return Err(Error::Config("sysbench.duration_secs must be at least 1".to_string()));
        }
        if self.flow_attempts == 0 {
            return Err(Error::Config("sysbench.flow_attempts must be at least 1".to_string()));
        }
        if self.num_tables == Some(0) || self.threads == Some(0) || self.core_count == Some(0) {
            return Err(Error::Config(
                "sysbench table, thread and core counts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }

    fn balanced(&self) -> bool {
        self.scenario == SysbenchScenario::Balanced
    }

    /// Configured tables are ignored in the balanced scenario.
    pub fn table_count(&self) -> u32 {
        if ONE_TABLE_WORKLOADS.contains(&self.workload.as_str()) {
            return 1;
        }
        match self.num_tables {
            Some(n) if !self.balanced() => n,
            _ => DEFAULT_TABLES,
        }
    }

    /// `10^log2(cores)` rows per table, a hundred times more outside the
    /// balanced scenario.
    pub fn records_per_table(&self, cores: usize) -> u64 {
        if let Some(n) = self.record_count
            && !self.balanced()
        {
            return n;
        }
        let mut exponent = cores.max(1).ilog2();
        if !self.balanced() {
            exponent += 2;
        }
        10u64.saturating_pow(exponent)
    }

    /// Eight threads per core (one when balanced), capped at 64.
    pub fn thread_count(&self, cores: usize) -> u32 {
        let default = if self.balanced() {
            1
        } else {
            u32::try_from(cores.saturating_mul(8)).unwrap_or(u32::MAX)
        };
        self.threads.unwrap_or(default).min(MAX_THREADS)
    }
}

/// Record the server publishes under `SysbenchOLTPState`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SysbenchState {
    #[serde(rename = "SysbenchInitialized", default)]
    pub initialized: bool,
    #[serde(rename = "DiskPathsArgument", default)]
    pub disk_paths: Option<String>,
}

pub struct SysbenchClient {
    identity: WorkloadIdentity,
    config: SysbenchConfig,
    tables: u32,
    records: u64,
    threads: u32,
}

impl SysbenchClient {
    pub fn new(config: SysbenchConfig) -> Result<Self> {
        config.validate()?;
        let cores = config.core_count.unwrap_or_else(super::logical_cores);
        Ok(Self {
            identity: WorkloadIdentity::new("sysbench", Some(Role::Client), config.package.clone()),
            tables: config.table_count(),
            records: config.records_per_table(cores),
            threads: config.thread_count(cores),
            config,
        })
    }

    fn sysbench(&self, package: &PackagePath) -> ProcessRequest {
        ProcessRequest::new(package.join(SYSBENCH_BINARY).display().to_string())
            .working_dir(&package.path)
            .elevated(true)
    }

    /// Arguments shared by `run` and `cleanup`; also what telemetry records
    /// as the scenario.
    fn workload_arguments(&self) -> String {
        format!(
            "{} --threads={} --tables={} --table-size={} --mysql-db={}",
            self.config.workload, self.threads, self.tables, self.records, self.config.database_name
        )
    }

    fn execution_arguments(&self, host: &str, action: &str) -> String {
        format!(
            "{} --mysql-host={host} --time={} {action}",
            self.workload_arguments(),
            self.config.duration_secs
        )
    }

    fn mysql_query(&self, host: &str, sql: &str) -> ProcessRequest {
        let db = &self.config.database_name;
        ProcessRequest::new("mysql").arguments(format!("-u {db} -h {host} {db} --execute=\"USE {db}; {sql}\""))
    }

    /// Current table and row counts on the server, -1 when unknown.
    async fn existing_dataset(&self, ctx: &WorkloadContext, host: &str, cancel: &CancelToken) -> Result<(i64, i64)> {
        let tables = ctx
            .run_checked(&self.mysql_query(host, "SHOW tables; SELECT FOUND_ROWS();"), cancel)
            .await?;
        let Some(tables) = first_count(&tables.stdout, false) else {
            return Ok((-1, -1));
        };

        // Sysbench always names its tables sbtest1, sbtest2, ...
        let rows = ctx
            .run_checked(&self.mysql_query(host, "SELECT COUNT(*) FROM sbtest1;"), cancel)
            .await?;
        Ok((tables, first_count(&rows.stdout, true).unwrap_or(-1)))
    }
}

#[async_trait]
impl Workload for SysbenchClient {
    fn identity(&self) -> &WorkloadIdentity {
        &self.identity
    }

    async fn initialize(&self, ctx: &WorkloadContext, package: &PackagePath, cancel: &CancelToken) -> Result<()> {
        ctx.state
            .run_once(STATE_KEY, INITIALIZED_FLAG, || async {
                let steps = [
                    ProcessRequest::new("./autogen.sh"),
                    ProcessRequest::new("./configure"),
                    ProcessRequest::new("make").arguments("-j"),
                    ProcessRequest::new("make").arguments("install"),
                ];
                for step in steps {
                    ctx.run_checked(&step.working_dir(&package.path).elevated(true), cancel)
                        .await?;
                }
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn prepare(
        &self,
        ctx: &WorkloadContext,
        package: &PackagePath,
        peer: Option<&ClientInstance>,
        cancel: &CancelToken,
    ) -> Result<()> {
        let host = mysql_host(peer);
        let (tables, rows) = self.existing_dataset(ctx, host, cancel).await?;

        if i64::from(self.tables) > tables || i64::try_from(self.records).unwrap_or(i64::MAX) > rows {
            info!(
                host,
                tables,
                rows,
                want_tables = self.tables,
                want_rows = self.records,
                "Preparing sysbench tables"
            );
            let cleanup = self.sysbench(package).arguments(self.execution_arguments(host, "cleanup"));
            ctx.run_checked(&cleanup, cancel).await?;

            let prepare = self.sysbench(package).arguments(format!(
                "oltp_common --tables={} --table-size={} --mysql-db={} --mysql-host={host} prepare",
                self.tables, self.records, self.config.database_name
            ));
            ctx.run_checked(&prepare, cancel).await?;
        } else {
            debug!(host, tables, rows, "Sysbench tables already prepared");
        }

        if self.config.balanced() {
            let peer = peer.ok_or_else(|| {
                Error::Config("the balanced sysbench scenario needs a server in the layout".to_string())
            })?;
            let server: SysbenchState = ctx.state.fetch_remote(peer, STATE_KEY).await?;
            let disk_paths = server.disk_paths.ok_or_else(|| Error::State {
                key: STATE_KEY.to_string(),
                reason: format!("server {peer} did not publish DiskPathsArgument"),
            })?;

            let scripts = &self.config.scripts_dir;
            let balanced = ProcessRequest::new(scripts.join(BALANCED_SCRIPT).display().to_string())
                .arguments(format!("{host} {DEFAULT_TABLES} {} {disk_paths}", self.config.database_name))
                .working_dir(scripts)
                .elevated(true);
            ctx.run_checked(&balanced, cancel).await?;
        }
        Ok(())
    }

    fn command(&self, package: &PackagePath, peer: Option<&ClientInstance>) -> Result<ProcessRequest> {
        Ok(self
            .sysbench(package)
            .arguments(self.execution_arguments(mysql_host(peer), "run")))
    }

    fn metrics_parser(&self) -> Box<dyn MetricsParser> {
        Box::new(SysbenchParser)
    }

    fn metrics_context(&self, peer: Option<&ClientInstance>) -> MetricsContext {
        let scenario = match self.config.scenario {
            SysbenchScenario::Default => "Default",
            SysbenchScenario::Balanced => "Balanced",
        };
        let mut ctx = MetricsContext::new("MySQL-Sysbench", format!("OLTP {scenario}"));
        ctx.tags.insert("arguments".to_string(), self.workload_arguments());
        if let Some(peer) = peer {
            ctx.tags.insert("server".to_string(), peer.name.clone());
        }
        ctx
    }

    fn flow_attempts(&self) -> Option<u32> {
        Some(self.config.flow_attempts)
    }
}

fn mysql_host(peer: Option<&ClientInstance>) -> &str {
    peer.map_or("localhost", |p| p.address.as_str())
}

static POSITIVE_COUNT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[1-9][0-9]*").unwrap());
static ANY_COUNT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[1-9][0-9]*|0").unwrap());

/// First integer in a mysql client result table.
fn first_count(output: &str, allow_zero: bool) -> Option<i64> {
    let pattern = if allow_zero { &ANY_COUNT } else { &POSITIVE_COUNT };
    pattern.find(output).and_then(|m| m.as_str().parse().ok())
}

static QUERY_ROW: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*(read|write|other|total):\s+(\d+)\s*$").unwrap());
static RATE_ROW: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(transactions|queries|ignored errors|reconnects):\s+(\d+)\s+\(([\d.]+) per sec\.\)").unwrap()
});
static TOTAL_TIME: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^\s*total time:\s+([\d.]+)s").unwrap());
static TOTAL_EVENTS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*total number of events:\s+(\d+)").unwrap());
static LATENCY_ROW: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*(min|avg|max|95th percentile|sum):\s+([\d.]+)\s*$").unwrap());

/// Reads the standard sysbench run report.
pub struct SysbenchParser;

impl MetricsParser for SysbenchParser {
    fn parse(&self, raw: &str) -> std::result::Result<Vec<Metric>, ParseError> {
        let mut metrics = Vec::new();

        for caps in QUERY_ROW.captures_iter(raw) {
            metrics.push(Metric::new(format!("# {} queries", &caps[1]), number(&caps[2])?, "count"));
        }
        for caps in RATE_ROW.captures_iter(raw) {
            let what = &caps[1];
            metrics.push(Metric::new(format!("# {what}"), number(&caps[2])?, "count"));
            metrics.push(Metric::new(format!("{what}/sec"), number(&caps[3])?, format!("{what}/sec")));
        }
        if let Some(caps) = TOTAL_TIME.captures(raw) {
            metrics.push(Metric::new("elapsed time", number(&caps[1])?, "seconds"));
        }
        if let Some(caps) = TOTAL_EVENTS.captures(raw) {
            metrics.push(Metric::new("# events", number(&caps[1])?, "count"));
        }

        let latency = raw.find("Latency (ms):").map_or("", |start| &raw[start..]);
        for caps in LATENCY_ROW.captures_iter(latency) {
            let stat = match &caps[1] {
                "95th percentile" => "p95",
                other => other,
            };
            metrics.push(Metric::new(format!("latency {stat}"), number(&caps[2])?, "milliseconds"));
        }

        if metrics.is_empty() {
            return Err(ParseError("no sysbench statistics found in output".to_string()));
        }
        Ok(metrics)
    }
}

fn number(text: &str) -> std::result::Result<f64, ParseError> {
    text.parse::<f64>()
        .map_err(|e| ParseError(format!("invalid number '{text}': {e}")))
}
