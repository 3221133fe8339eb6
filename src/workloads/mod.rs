//! Built-in benchmark workloads.

mod latte;
mod speccpu;
mod sysbench;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::layout::Layout;
use crate::workload::Workload;

pub use latte::{LatteClient, LatteConfig, LatteParser, LatteProtocol};
pub use speccpu::{SpecCpu, SpecCpuConfig, SpecCpuParser};
pub use sysbench::{SysbenchClient, SysbenchConfig, SysbenchParser, SysbenchScenario, SysbenchState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum WorkloadKind {
    /// SPEC CPU 2017 (single role).
    Speccpu,
    /// Sysbench OLTP client against MySQL server peers.
    Sysbench,
    /// Latte network latency client against server peers.
    Latte,
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkloadKind::Speccpu => write!(f, "speccpu"),
            WorkloadKind::Sysbench => write!(f, "sysbench"),
            WorkloadKind::Latte => write!(f, "latte"),
        }
    }
}

/// Per-workload settings, the `[workloads]` section of the config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadsConfig {
    #[serde(default)]
    pub speccpu: SpecCpuConfig,
    #[serde(default)]
    pub sysbench: SysbenchConfig,
    #[serde(default)]
    pub latte: LatteConfig,
}

impl WorkloadsConfig {
    pub fn validate(&self) -> Result<()> {
        self.speccpu.validate()?;
        self.sysbench.validate()?;
        self.latte.validate()
    }

    /// Builds the workload for `kind`. Client workloads read their own
    /// address from `layout`.
    pub fn build(&self, kind: WorkloadKind, layout: &Layout) -> Result<Box<dyn Workload>> {
        Ok(match kind {
            WorkloadKind::Speccpu => Box::new(SpecCpu::new(self.speccpu.clone())?),
            WorkloadKind::Sysbench => Box::new(SysbenchClient::new(self.sysbench.clone())?),
            WorkloadKind::Latte => Box::new(LatteClient::new(self.latte.clone(), layout)?),
        })
    }
}

/// Logical processors available to this process.
pub(crate) fn logical_cores() -> usize {
    std::thread::available_parallelism().map_or(1, |n| n.get())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::Role;

    #[test]
    fn builds_each_kind() {
        let config = WorkloadsConfig::default();
        let sysbench = config.build(WorkloadKind::Sysbench, &Layout::default()).unwrap();
        assert_eq!(sysbench.identity().role, Some(Role::Client));
        assert_eq!(sysbench.identity().package, "sysbench");

        let latte = config.build(WorkloadKind::Latte, &Layout::default()).unwrap();
        assert_eq!(latte.identity().role, Some(Role::Client));
        assert_eq!(latte.identity().package, "latte");
    }

    #[test]
    fn invalid_section_is_rejected() {
        let config: WorkloadsConfig = toml::from_str(
            r#"
            [sysbench]
            duration_secs = 0
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
        assert!(config.build(WorkloadKind::Sysbench, &Layout::default()).is_err());
    }

    #[test]
    fn kind_display_matches_cli_name() {
        assert_eq!(WorkloadKind::Speccpu.to_string(), "speccpu");
        assert_eq!(WorkloadKind::Latte.to_string(), "latte");
    }
}
