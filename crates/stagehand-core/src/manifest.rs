use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Preflight,
    SetupAssistant,
    Userland,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Preflight => "preflight",
            Self::SetupAssistant => "setupassistant",
            Self::Userland => "userland",
        }
    }

    /// Phases run by the root daemon before any user session exists; these
    /// reject user-context items.
    pub fn is_root_only(self) -> bool {
        matches!(self, Self::Preflight | Self::SetupAssistant)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ItemType {
    Package,
    RootScript,
    UserScript,
    RootFile,
    UserFile,
}

impl ItemType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Package => "package",
            Self::RootScript => "rootscript",
            Self::UserScript => "userscript",
            Self::RootFile => "rootfile",
            Self::UserFile => "userfile",
        }
    }

    pub fn is_user_context(self) -> bool {
        matches!(self, Self::UserScript | Self::UserFile)
    }
}

/// Unrecognised values are kept as `Unknown` so a manifest loaded without
/// validation still parses; validation rejects them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(from = "String", into = "String")]
pub enum FailPolicy {
    FailureIsNotAnOption,
    Failable,
    FailableExecution,
    Unknown,
}

impl FailPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FailureIsNotAnOption => "failure_is_not_an_option",
            Self::Failable => "failable",
            Self::FailableExecution => "failable_execution",
            Self::Unknown => "unknown",
        }
    }
}

impl From<String> for FailPolicy {
    fn from(value: String) -> Self {
        match value.as_str() {
            "failure_is_not_an_option" => Self::FailureIsNotAnOption,
            "failable" => Self::Failable,
            "failable_execution" => Self::FailableExecution,
            _ => Self::Unknown,
        }
    }
}

impl From<FailPolicy> for String {
    fn from(policy: FailPolicy) -> Self {
        policy.as_str().to_string()
    }
}

/// Unrecognised architecture predicates mean "do not skip".
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(from = "String", into = "String")]
pub enum SkipIf {
    Intel,
    X86_64,
    Arm64,
    AppleSilicon,
    Unknown,
}

impl SkipIf {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Intel => "intel",
            Self::X86_64 => "x86_64",
            Self::Arm64 => "arm64",
            Self::AppleSilicon => "apple_silicon",
            Self::Unknown => "unknown",
        }
    }
}

impl From<String> for SkipIf {
    fn from(value: String) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "intel" => Self::Intel,
            "x86_64" => Self::X86_64,
            "arm64" => Self::Arm64,
            "apple_silicon" => Self::AppleSilicon,
            _ => Self::Unknown,
        }
    }
}

impl From<SkipIf> for String {
    fn from(skip_if: SkipIf) -> Self {
        skip_if.as_str().to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Item {
    pub name: String,
    #[serde(rename = "type")]
    pub item_type: ItemType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub file: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packageid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub donotwait: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub pkg_required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_if: Option<SkipIf>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub retries: u32,
    #[serde(default, rename = "retrywait", skip_serializing_if = "is_zero_u64")]
    pub retry_wait: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_policy: Option<FailPolicy>,
}

fn is_zero(value: &u32) -> bool {
    *value == 0
}

fn is_zero_u64(value: &u64) -> bool {
    *value == 0
}

impl Item {
    /// Missing policy means scripts may fail but downloads, installs, and
    /// file placement must succeed.
    pub fn effective_fail_policy(&self) -> FailPolicy {
        self.fail_policy.unwrap_or(FailPolicy::FailableExecution)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Manifest {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub preflight: Vec<Item>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub setupassistant: Vec<Item>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub userland: Vec<Item>,
}

impl Manifest {
    pub fn from_json_str(input: &str) -> Result<Self> {
        serde_json::from_str(input).context("failed to parse bootstrap manifest")
    }

    pub fn load(path: &Path, validate: bool) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read bootstrap manifest: {}", path.display()))?;
        let manifest = Self::from_json_str(&raw)
            .with_context(|| format!("failed to parse bootstrap manifest: {}", path.display()))?;
        if validate {
            manifest.validate()?;
        }
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<()> {
        if self.preflight.len() > 1 {
            return Err(anyhow!(
                "preflight phase supports a single rootscript, got {} items",
                self.preflight.len()
            ));
        }
        for item in &self.preflight {
            validate_item_for_phase(item, Phase::Preflight)?;
            if item.item_type != ItemType::RootScript {
                return Err(anyhow!(
                    "preflight phase only supports rootscript items, got '{}' for '{}'",
                    item.item_type.as_str(),
                    item.name
                ));
            }
        }
        for item in &self.setupassistant {
            validate_item_for_phase(item, Phase::SetupAssistant)?;
        }
        for item in &self.userland {
            validate_item_for_phase(item, Phase::Userland)?;
        }
        Ok(())
    }

    pub fn items_for(&self, phase: Phase) -> &[Item] {
        match phase {
            Phase::Preflight => &self.preflight,
            Phase::SetupAssistant => &self.setupassistant,
            Phase::Userland => &self.userland,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.preflight.is_empty() && self.setupassistant.is_empty() && self.userland.is_empty()
    }
}

pub fn validate_item_for_phase(item: &Item, phase: Phase) -> Result<()> {
    if phase.is_root_only() && item.item_type.is_user_context() {
        return Err(anyhow!(
            "phase '{}' only supports root operations (package, rootscript, rootfile), not '{}' for '{}'",
            phase.as_str(),
            item.item_type.as_str(),
            item.name
        ));
    }

    if item.fail_policy == Some(FailPolicy::Unknown) {
        return Err(anyhow!(
            "invalid fail_policy for item '{}' (must be failure_is_not_an_option, failable, or failable_execution)",
            item.name
        ));
    }

    Ok(())
}
