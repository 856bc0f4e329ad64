use std::path::PathBuf;

use thiserror::Error;

/// Failures while building or driving the network itself.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("unsupported backbone: {0}")]
    UnsupportedBackbone(String),

    #[error("backbone produces {actual}-dim features, model expects {expected}")]
    FeatureDim { expected: usize, actual: usize },

    #[error("model is in training mode; call eval() before running inference")]
    NotInEvalMode,

    #[error("`{layer}` expects {expected} input features, got {actual}")]
    Shape {
        layer: String,
        expected: usize,
        actual: usize,
    },
}

/// A parameter whose checkpoint shape disagrees with the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeMismatch {
    pub name: String,
    pub expected: Vec<usize>,
    pub found: Vec<usize>,
}

/// Startup failures. Any of these keeps the service from serving.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("model checkpoint not found: {}", .0.display())]
    CheckpointNotFound(PathBuf),

    #[error("failed to read {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed model config {}", path.display())]
    Config {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("failed to load backbone graph {}", path.display())]
    Backbone {
        path: PathBuf,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("malformed checkpoint {}: {reason}", path.display())]
    Checkpoint { path: PathBuf, reason: String },

    #[error(
        "checkpoint does not match the model: missing {missing:?}, unexpected {unexpected:?}, mismatched {mismatched:?}"
    )]
    StateMismatch {
        missing: Vec<String>,
        unexpected: Vec<String>,
        mismatched: Vec<ShapeMismatch>,
    },

    #[error("malformed label mapping {}: {reason}", path.display())]
    Labels { path: PathBuf, reason: String },
}
