//! Pipeline configuration.
//!
//! Loaded from an optional JSON file; every field has a default so a file
//! only needs to name what it changes. The CLI applies flag overrides on top.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use accelflow_core::error::{EngineError, Result};
use accelflow_core::types::{DeviceClass, FrameDims, QueueRole};
use serde::{Deserialize, Serialize};

pub const DEFAULT_WIDTH: u32 = 640;
pub const DEFAULT_HEIGHT: u32 = 480;
pub const DEFAULT_TITLE: &str = "accelflow";

/// Which queues the host blocks on after submitting a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitPolicy {
    /// Block on the egress queue only. Upstream stages are implicitly done
    /// once egress has drained the final channel.
    #[default]
    Egress,
    /// Finish ingest, transform and egress, in stage order.
    All,
}

impl WaitPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Egress => "egress",
            Self::All => "all",
        }
    }

    /// Queues to finish, in order.
    pub fn queues(self) -> &'static [QueueRole] {
        match self {
            Self::Egress => &[QueueRole::Egress],
            Self::All => &QueueRole::ALL,
        }
    }
}

/// How often the input buffer is refilled from the frame source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadPolicy {
    /// Map and refill the input buffer every cycle.
    #[default]
    Every,
    /// Upload on the first cycle only; later cycles reprocess the resident
    /// frame (still images).
    Once,
}

impl UploadPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Every => "every",
            Self::Once => "once",
        }
    }
}

macro_rules! impl_policy_text {
    ($ty:ident { $($text:literal => $variant:ident),+ $(,)? }) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = EngineError;

            fn from_str(s: &str) -> Result<Self> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($text => Ok(Self::$variant),)+
                    other => Err(EngineError::Config(format!(
                        concat!("unknown ", stringify!($ty), " `{}`"),
                        other
                    ))),
                }
            }
        }
    };
}

impl_policy_text!(WaitPolicy { "egress" => Egress, "all" => All });
impl_policy_text!(UploadPolicy { "every" => Every, "once" => Once });

/// Kernel entry-point names inside the pipeline binary.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KernelNames {
    pub ingest: String,
    pub transform: String,
    pub egress: String,
}

impl Default for KernelNames {
    fn default() -> Self {
        Self {
            ingest: "ingest".into(),
            transform: "transform".into(),
            egress: "egress".into(),
        }
    }
}

impl KernelNames {
    pub fn name(&self, stage: QueueRole) -> &str {
        match stage {
            QueueRole::Ingest => &self.ingest,
            QueueRole::Transform => &self.transform,
            QueueRole::Egress => &self.egress,
        }
    }

    fn validate(&self) -> Result<()> {
        for stage in QueueRole::ALL {
            let name = self.name(stage);
            if name.trim().is_empty() {
                return Err(EngineError::Config(format!("{stage} kernel name is empty")));
            }
        }
        if self.ingest == self.transform
            || self.ingest == self.egress
            || self.transform == self.egress
        {
            return Err(EngineError::Config(format!(
                "kernel names must be distinct, got {}/{}/{}",
                self.ingest, self.transform, self.egress
            )));
        }
        Ok(())
    }
}

/// Which device to open.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeviceSelector {
    /// Restrict the search to one platform index. `None` searches all.
    pub platform: Option<usize>,
    /// Index among the matching devices, in enumeration order.
    pub device: usize,
    pub class: DeviceClass,
}

/// Complete pipeline configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Precompiled pipeline image. Optional only for runtimes that supply a
    /// default image.
    pub binary: Option<PathBuf>,
    pub kernels: KernelNames,
    pub device: DeviceSelector,
    pub wait: WaitPolicy,
    pub upload: UploadPolicy,
    pub width: u32,
    pub height: u32,
    /// Stop after this many frames. `None` runs until stopped.
    pub max_frames: Option<u64>,
    /// Display title; the status label is `"<title> | FPS: <n>"`.
    pub title: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            binary: None,
            kernels: KernelNames::default(),
            device: DeviceSelector::default(),
            wait: WaitPolicy::default(),
            upload: UploadPolicy::default(),
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            max_frames: None,
            title: DEFAULT_TITLE.into(),
        }
    }
}

impl PipelineConfig {
    pub fn from_json_str(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| EngineError::Config(format!("invalid pipeline config: {e}")))
    }

    /// Read a JSON config file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Config(format!("cannot read config {}: {e}", path.display()))
        })?;
        Self::from_json_str(&text)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| EngineError::Config(format!("cannot serialize config: {e}")))
    }

    /// Validated frame dimensions.
    pub fn dims(&self) -> Result<FrameDims> {
        FrameDims::new(self.width, self.height)
    }

    /// Check everything that can be checked without a device.
    pub fn validate(&self) -> Result<()> {
        self.kernels.validate()?;
        if self.max_frames == Some(0) {
            return Err(EngineError::Config("max_frames must be at least 1".into()));
        }
        self.dims().map(|_| ())
    }
}
