use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::backbone::Backbone;
use crate::device::DeviceChoice;
use crate::error::LoadError;

/// Shape record written next to a checkpoint by the training run. Training
/// hyper-parameters stored alongside are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub backbone: String,
    pub num_disease_classes: usize,
    pub num_fitzpatrick_classes: usize,
}

impl ModelConfig {
    pub fn load(path: &Path) -> Result<Self, LoadError> {
        let text = std::fs::read_to_string(path).map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| LoadError::Config {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Files making up one trained model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub checkpoint: PathBuf,
    pub config: PathBuf,
    pub labels: PathBuf,
    /// Backbone graph; defaults to `<artifacts>/<backbone>.onnx` once the
    /// backbone is known.
    pub backbone_graph: Option<PathBuf>,
    pub root: PathBuf,
}

impl ArtifactPaths {
    /// Layout written by the training run.
    pub fn in_dir(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            checkpoint: root.join("checkpoints").join("best_model.safetensors"),
            config: root.join("config.json"),
            labels: root.join("label_mapping.csv"),
            backbone_graph: None,
            root,
        }
    }

    pub fn backbone_graph_for(&self, backbone: Backbone) -> PathBuf {
        self.backbone_graph
            .clone()
            .unwrap_or_else(|| self.root.join(backbone.graph_file_name()))
    }
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct ServiceConfig {
    /// Directory holding config.json, label_mapping.csv, the checkpoint and the backbone graph.
    #[arg(long, env = "FITZ_ARTIFACTS_DIR", default_value = "models")]
    pub artifacts_dir: PathBuf,

    /// Checkpoint to load instead of <artifacts>/checkpoints/best_model.safetensors.
    #[arg(long, env = "FITZ_CHECKPOINT")]
    pub checkpoint: Option<PathBuf>,

    /// Backbone graph to load instead of <artifacts>/<backbone>.onnx.
    #[arg(long, env = "FITZ_BACKBONE_GRAPH")]
    pub backbone_graph: Option<PathBuf>,

    /// Directory with index.html and other static assets.
    #[arg(long, env = "FITZ_STATIC_DIR", default_value = "static")]
    pub static_dir: PathBuf,

    #[arg(long, env = "FITZ_HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, env = "FITZ_PORT", default_value_t = 8000)]
    pub port: u16,

    /// auto, cuda, coreml or cpu.
    #[arg(long, env = "FITZ_DEVICE", default_value = "auto")]
    pub device: DeviceChoice,

    /// Disease candidates returned when the request does not ask for a count.
    #[arg(long, env = "FITZ_TOP_K", default_value_t = 5)]
    pub top_k: usize,

    /// Largest accepted request body, in bytes.
    #[arg(long, env = "FITZ_MAX_UPLOAD_BYTES", default_value_t = 20 * 1024 * 1024)]
    pub max_upload_bytes: usize,
}

impl ServiceConfig {
    pub fn artifact_paths(&self) -> ArtifactPaths {
        let mut paths = ArtifactPaths::in_dir(&self.artifacts_dir);
        if let Some(checkpoint) = &self.checkpoint {
            paths.checkpoint = checkpoint.clone();
        }
        paths.backbone_graph = self.backbone_graph.clone();
        paths
    }

    pub fn listen_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(format!("{}:{}", self.host, self.port).parse()?)
    }
}
