//! The ordered tool invocations that make up a transfer.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::TransferError;

// Regex: "  12,345,678   45%  10.2MB/s ..."
static RSYNC_PROGRESS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*([\d,]+)\s+(\d+)%").expect("valid rsync progress regex"));

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressFormat {
    #[default]
    None,
    /// `rsync --info=progress2`
    Rsync,
}

impl ProgressFormat {
    /// Completed fraction reported by one output line, if any.
    ///
    /// rsync rewrites its progress line with carriage returns, so a single
    /// line may carry several updates; the last one wins.
    pub fn parse(&self, line: &str) -> Option<f64> {
        match self {
            ProgressFormat::None => None,
            ProgressFormat::Rsync => line.split('\r').rev().find_map(|segment| {
                let captures = RSYNC_PROGRESS.captures(segment)?;
                let percentage: f64 = captures.get(2)?.as_str().parse().ok()?;
                Some((percentage / 100.0).clamp(0.0, 1.0))
            }),
        }
    }
}

/// One tool invocation. Arguments may contain the placeholders `{source}`,
/// `{destination}`, `{base_system}`, `{install_payload}` and
/// `{destination_device}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSpec {
    pub label: String,
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub progress: ProgressFormat,
}

/// Values substituted into step arguments.
#[derive(Debug, Clone, Default)]
pub struct Placeholders {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub base_system: Option<PathBuf>,
    pub install_payload: Option<PathBuf>,
    pub destination_device: PathBuf,
}

impl StepSpec {
    pub fn new(label: &str, program: &str, args: &[&str], progress: ProgressFormat) -> Self {
        Self {
            label: label.to_string(),
            program: PathBuf::from(program),
            args: args.iter().map(|a| a.to_string()).collect(),
            progress,
        }
    }

    pub fn expand_args(&self, values: &Placeholders) -> Result<Vec<String>, TransferError> {
        self.args
            .iter()
            .map(|arg| expand(arg, values))
            .collect()
    }
}

fn expand(arg: &str, values: &Placeholders) -> Result<String, TransferError> {
    let mut out = arg
        .replace("{source}", &display(&values.source))
        .replace("{destination_device}", &display(&values.destination_device))
        .replace("{destination}", &display(&values.destination));

    if out.contains("{base_system}") {
        let path = values
            .base_system
            .as_deref()
            .ok_or(TransferError::MissingSourcePath("base system"))?;
        out = out.replace("{base_system}", &display(path));
    }
    if out.contains("{install_payload}") {
        let path = values
            .install_payload
            .as_deref()
            .ok_or(TransferError::MissingSourcePath("install payload"))?;
        out = out.replace("{install_payload}", &display(path));
    }
    Ok(out)
}

fn display(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferPlan {
    pub steps: Vec<StepSpec>,
}

impl TransferPlan {
    /// Configured steps followed by one copy step per additions directory.
    pub fn new(steps: Vec<StepSpec>, additions: &[PathBuf]) -> Self {
        let mut steps = steps;
        for addition in additions {
            let source = format!("{}/", display(addition));
            steps.push(StepSpec {
                label: format!(
                    "Installing additions from {}",
                    addition
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_else(|| display(addition))
                ),
                program: PathBuf::from("rsync"),
                args: vec![
                    "-a".to_string(),
                    "--info=progress2".to_string(),
                    source,
                    "{destination}/".to_string(),
                ],
                progress: ProgressFormat::Rsync,
            });
        }
        Self { steps }
    }

    /// Erase the destination, restore the base system onto it, then copy
    /// the installer payload alongside.
    pub fn default_steps() -> Vec<StepSpec> {
        vec![
            StepSpec::new(
                "Erasing destination",
                "find",
                &["{destination}", "-mindepth", "1", "-delete"],
                ProgressFormat::None,
            ),
            StepSpec::new(
                "Restoring base system",
                "rsync",
                &[
                    "-a",
                    "--info=progress2",
                    "--no-inc-recursive",
                    "{base_system}/",
                    "{destination}/",
                ],
                ProgressFormat::Rsync,
            ),
            StepSpec::new(
                "Copying installer payload",
                "rsync",
                &[
                    "-a",
                    "--info=progress2",
                    "--no-inc-recursive",
                    "{install_payload}",
                    "{destination}/",
                ],
                ProgressFormat::Rsync,
            ),
        ]
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl Default for TransferPlan {
    fn default() -> Self {
        Self::new(Self::default_steps(), &[])
    }
}
