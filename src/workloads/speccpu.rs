//! SPEC CPU 2017 run from an ISO image package.
//!
//! The package directory holds exactly one `.iso`. First use mounts it,
//! installs the suite into the package directory and writes the runcpu
//! configuration; later runs skip straight to `runspeccpu.sh`.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::{NoExpand, Regex};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::layout::ClientInstance;
use crate::metrics::{Metric, MetricsContext, MetricsParser, ParseError};
use crate::packages::PackagePath;
use crate::process::{ProcessExecution, ProcessRequest};
use crate::workload::{Workload, WorkloadContext, WorkloadIdentity};

const STATE_KEY: &str = "SpecCpuState";
const INITIALIZED_FLAG: &str = "SpecCpuInitialized";
const RUN_SHELL: &str = "runspeccpu.sh";
const MOUNT_DIR: &str = "speccpu_mount";
const RESULT_DIR: &str = "result";

const PROFILES: [&str; 4] = ["intrate", "intspeed", "fprate", "fpspeed"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecCpuConfig {
    /// runcpu benchmark set, e.g. `intrate` or `fpspeed`.
    #[serde(default = "default_profile")]
    pub profile: String,

    /// Run peak tuning in addition to base.
    #[serde(default)]
    pub run_peak: bool,

    #[serde(default = "default_base_flags")]
    pub base_flags: String,

    #[serde(default = "default_peak_flags")]
    pub peak_flags: String,

    /// GCC major version. 10 and later need the `GCCge10` define.
    #[serde(default = "default_compiler_version")]
    pub compiler_version: u32,

    #[serde(default = "default_package")]
    pub package: String,

    /// Directory holding `runspeccpu.sh` and the config templates.
    #[serde(default = "default_scripts_dir")]
    pub scripts_dir: PathBuf,

    /// Copies and threads; defaults to the logical core count.
    #[serde(default)]
    pub core_count: Option<usize>,
}

fn default_profile() -> String {
    "intrate".to_string()
}

fn default_base_flags() -> String {
    "-g -O3 -march=native".to_string()
}

fn default_peak_flags() -> String {
    "-g -Ofast -march=native -flto".to_string()
}

fn default_compiler_version() -> u32 {
    10
}

fn default_package() -> String {
    "speccpu2017".to_string()
}

fn default_scripts_dir() -> PathBuf {
    PathBuf::from("scripts/speccpu")
}

impl Default for SpecCpuConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            run_peak: false,
            base_flags: default_base_flags(),
            peak_flags: default_peak_flags(),
            compiler_version: default_compiler_version(),
            package: default_package(),
            scripts_dir: default_scripts_dir(),
            core_count: None,
        }
    }
}

impl SpecCpuConfig {
    pub fn validate(&self) -> Result<()> {
        if !PROFILES.contains(&self.profile.as_str()) {
            return Err(Error::Config(format!(
                "unknown SPECcpu profile '{}', expected one of {}",
                self.profile,
                PROFILES.join(", ")
            )));
        }
        if self.core_count == Some(0) {
            return Err(Error::Config("speccpu.core_count must be at least 1".to_string()));
        }
        Ok(())
    }

    /// runcpu `--tune` value.
    pub fn tuning(&self) -> &'static str {
        if self.run_peak { "all" } else { "base" }
    }
}

pub struct SpecCpu {
    identity: WorkloadIdentity,
    config: SpecCpuConfig,
    config_file: &'static str,
    core_count: usize,
}

impl SpecCpu {
    pub fn new(config: SpecCpuConfig) -> Result<Self> {
        config.validate()?;
        let config_file = config_file_for_arch(std::env::consts::ARCH)?;
        let core_count = config.core_count.unwrap_or_else(super::logical_cores);
        Ok(Self {
            identity: WorkloadIdentity::new("speccpu", None, config.package.clone()),
            config,
            config_file,
            core_count,
        })
    }

    fn runcpu_arguments(&self) -> String {
        format!(
            "--config {} --iterations 2 --copies {cores} --threads {cores} --tune {} --reportable {}",
            self.config_file,
            self.config.tuning(),
            self.config.profile,
            cores = self.core_count,
        )
    }

    async fn install(&self, ctx: &WorkloadContext, package: &PackagePath, iso: &Path, cancel: &CancelToken) -> Result<()> {
        let mount = mount_dir(package);
        tokio::fs::create_dir_all(&mount).await?;

        let steps = [
            ProcessRequest::new("mount")
                .arguments(format!("-t iso9660 -o ro,exec,loop {} {}", iso.display(), mount.display()))
                .working_dir(&package.path),
            ProcessRequest::new("./install.sh")
                .arguments(format!("-f -d {}", package.path.display()))
                .working_dir(&mount),
        ];
        for step in steps {
            ctx.run_checked(&step.elevated(true), cancel).await?;
        }

        self.write_runcpu_config(package).await?;

        let steps = [
            ProcessRequest::new("chmod")
                .arguments(format!("-R ugo=rwx {}", package.path.display()))
                .working_dir(&package.path),
            ProcessRequest::new("umount")
                .arguments(mount.display().to_string())
                .working_dir(&package.path),
        ];
        for step in steps {
            ctx.run_checked(&step.elevated(true), cancel).await?;
        }
        Ok(())
    }

    async fn write_runcpu_config(&self, package: &PackagePath) -> Result<()> {
        let template_path = self.config.scripts_dir.join(self.config_file);
        let template = tokio::fs::read_to_string(&template_path).await?;

        tokio::fs::copy(self.config.scripts_dir.join(RUN_SHELL), package.join(RUN_SHELL)).await?;

        let config_dir = package.join("config");
        tokio::fs::create_dir_all(&config_dir).await?;
        let target = config_dir.join(self.config_file);
        tokio::fs::write(&target, render_config(&template, &self.config)).await?;
        debug!(path = %target.display(), "runcpu configuration written");
        Ok(())
    }
}

#[async_trait]
impl Workload for SpecCpu {
    fn identity(&self) -> &WorkloadIdentity {
        &self.identity
    }

    async fn initialize(&self, ctx: &WorkloadContext, package: &PackagePath, cancel: &CancelToken) -> Result<()> {
        let iso = find_iso(package)?;
        info!(image = %iso.display(), "SPECcpu image found");

        ctx.state
            .run_once(STATE_KEY, INITIALIZED_FLAG, || self.install(ctx, package, &iso, cancel))
            .await?;
        Ok(())
    }

    fn command(&self, package: &PackagePath, _peer: Option<&ClientInstance>) -> Result<ProcessRequest> {
        Ok(ProcessRequest::new("bash")
            .arguments(format!("{RUN_SHELL} \"{}\"", self.runcpu_arguments()))
            .working_dir(&package.path)
            .elevated(true))
    }

    fn metrics_parser(&self) -> Box<dyn MetricsParser> {
        Box::new(SpecCpuParser)
    }

    fn metrics_context(&self, _peer: Option<&ClientInstance>) -> MetricsContext {
        MetricsContext::new("SPECcpu", "SPECcpu")
            .categorization(format!("{}-{}", self.config.profile, self.config.tuning()))
    }

    async fn collect_results(&self, _execution: &ProcessExecution, package: &PackagePath) -> Result<Vec<String>> {
        let mut documents = Vec::new();
        for path in result_files(package, is_result_text)? {
            documents.push(tokio::fs::read_to_string(&path).await?);
        }
        Ok(documents)
    }

    async fn results_captured(&self, package: &PackagePath) -> Result<()> {
        for path in result_files(package, is_result_text)? {
            tokio::fs::remove_file(&path).await?;
        }
        Ok(())
    }

    fn artifacts(&self, package: &PackagePath) -> Result<Vec<PathBuf>> {
        result_files(package, |name| name.contains("CPU2017"))
    }

    fn artifact_folder(&self) -> &str {
        "speccpu"
    }
}

fn config_file_for_arch(arch: &str) -> Result<&'static str> {
    match arch {
        "x86_64" => Ok("vc-linux-x64.cfg"),
        "aarch64" => Ok("vc-linux-arm64.cfg"),
        other => Err(Error::Config(format!("CPU architecture '{other}' is not supported for SPECcpu"))),
    }
}

fn mount_dir(package: &PackagePath) -> PathBuf {
    package
        .path
        .parent()
        .unwrap_or(package.path.as_path())
        .join(MOUNT_DIR)
}

/// The single `.iso` at the top level of the package directory.
fn find_iso(package: &PackagePath) -> Result<PathBuf> {
    let mut images: Vec<PathBuf> = std::fs::read_dir(&package.path)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("iso"))
        })
        .collect();

    match images.len() {
        0 => Err(Error::DependencyMissing {
            package: format!("{}/*.iso", package.path.display()),
        }),
        1 => Ok(images.remove(0)),
        _ => {
            images.sort();
            let candidates: Vec<String> = images
                .iter()
                .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
                .collect();
            Err(Error::DependencyMissing {
                package: format!(
                    "{}/*.iso (expected one image, found {})",
                    package.path.display(),
                    candidates.join(", ")
                ),
            })
        }
    }
}

fn is_result_text(name: &str) -> bool {
    name.starts_with("CPU2017.") && name.ends_with(".txt")
}

/// Files directly under `result/` whose name passes `select`, sorted by name.
fn result_files(package: &PackagePath, select: impl Fn(&str) -> bool) -> Result<Vec<PathBuf>> {
    let dir = package.join(RESULT_DIR);
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files: Vec<PathBuf> = std::fs::read_dir(&dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.is_file()
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(&select)
        })
        .collect();
    files.sort();
    Ok(files)
}

static BASE_FLAGS_PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\$BaseOptimizingFlags\$").unwrap());
static PEAK_FLAGS_PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\$PeakOptimizingFlags\$").unwrap());
static GCC10_PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\$Gcc10Workaround\$").unwrap());

fn render_config(template: &str, config: &SpecCpuConfig) -> String {
    let gcc10 = if config.compiler_version >= 10 { "%define GCCge10" } else { "" };
    let text = BASE_FLAGS_PLACEHOLDER.replace_all(template, NoExpand(&config.base_flags));
    let text = PEAK_FLAGS_PLACEHOLDER.replace_all(&text, NoExpand(&config.peak_flags));
    GCC10_PLACEHOLDER.replace_all(&text, NoExpand(gcc10)).into_owned()
}

static BENCHMARK_ROW: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(\d{3}\.\S+)\s+\d+\s+[\d.]+\s+([\d.]+)\s+\*(?:\s+\d+\s+[\d.]+\s+([\d.]+)\s+\*)?").unwrap()
});
static SUMMARY_ROW: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(SPEC(?:rate|speed)(?:\(R\))?2017_(?:int|fp)_(?:base|peak))\s+([\d.]+|Not Run)").unwrap()
});

/// Reads a runcpu `CPU2017.*.txt` report.
///
/// Selected (`*`) benchmark ratios come from the final results table, which
/// follows the last `=====` rule. Summary scores marked `Not Run` are skipped.
pub struct SpecCpuParser;

impl MetricsParser for SpecCpuParser {
    fn parse(&self, raw: &str) -> std::result::Result<Vec<Metric>, ParseError> {
        let lines: Vec<&str> = raw.lines().collect();
        let table_start = lines
            .iter()
            .rposition(|l| l.trim_start().starts_with("====="))
            .map_or(0, |i| i + 1);

        let mut metrics = Vec::new();
        for line in &lines[table_start..] {
            let Some(caps) = BENCHMARK_ROW.captures(line) else {
                continue;
            };
            let bench = &caps[1];
            metrics.push(Metric::new(format!("{bench}_base"), parse_score(&caps[2])?, "Score"));
            if let Some(peak) = caps.get(3) {
                metrics.push(Metric::new(format!("{bench}_peak"), parse_score(peak.as_str())?, "Score"));
            }
        }

        for caps in SUMMARY_ROW.captures_iter(raw) {
            if &caps[2] == "Not Run" {
                continue;
            }
            let name = caps[1].replace("(R)", "");
            metrics.push(Metric::new(name, parse_score(&caps[2])?, "Score"));
        }

        if metrics.is_empty() {
            return Err(ParseError("no SPECcpu scores found in report".to_string()));
        }
        Ok(metrics)
    }
}

fn parse_score(text: &str) -> std::result::Result<f64, ParseError> {
    text.parse::<f64>()
        .map_err(|e| ParseError(format!("invalid score '{text}': {e}")))
}
