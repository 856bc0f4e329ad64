use std::fmt;
use std::path::Path;
use std::str::FromStr;

use anyhow::{anyhow, bail};
use ndarray::{Array2, ArrayView4, Ix2};
use ort::{inputs, GraphOptimizationLevel, Session, ValueType};
use tracing::debug;

use crate::error::ModelError;

/// Feature extractors the service knows how to serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backbone {
    EfficientNetB3,
}

impl Backbone {
    pub fn name(&self) -> &'static str {
        match self {
            Backbone::EfficientNetB3 => "efficientnet_b3",
        }
    }

    /// Width of the pooled embedding once the native classifier is stripped.
    pub fn feature_dim(&self) -> usize {
        match self {
            Backbone::EfficientNetB3 => 1536,
        }
    }

    /// File name of the exported feature-extractor graph inside an artifacts directory.
    pub fn graph_file_name(&self) -> String {
        format!("{}.onnx", self.name())
    }
}

impl FromStr for Backbone {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "efficientnet_b3" => Ok(Backbone::EfficientNetB3),
            other => Err(ModelError::UnsupportedBackbone(other.to_string())),
        }
    }
}

impl fmt::Display for Backbone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Maps a normalised `[batch, 3, H, W]` image tensor to `[batch, feature_dim]`
/// embeddings.
pub trait FeatureExtractor: Send + Sync {
    fn feature_dim(&self) -> usize;

    fn extract(&self, input: ArrayView4<'_, f32>) -> anyhow::Result<Array2<f32>>;
}

/// Backbone executed by ONNX Runtime. The graph carries its own weights.
#[derive(Debug)]
pub struct OnnxBackbone {
    session: Session,
    input_name: String,
    output_name: String,
    feature_dim: usize,
}

impl OnnxBackbone {
    pub fn load(path: &Path, backbone: Backbone) -> anyhow::Result<Self> {
        // Without an explicit intra-op pool, ONNX Runtime sizes one to the CPU count.
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .commit_from_file(path)?;

        let input_name = session
            .inputs
            .first()
            .map(|input| input.name.clone())
            .ok_or_else(|| anyhow!("{} declares no inputs", path.display()))?;
        let output = session
            .outputs
            .first()
            .ok_or_else(|| anyhow!("{} declares no outputs", path.display()))?;
        let output_name = output.name.clone();

        let feature_dim = backbone.feature_dim();
        if let ValueType::Tensor { dimensions, .. } = &output.output_type {
            // Dynamic axes are reported as -1 and can only be checked at run time.
            if let Some(&width) = dimensions.last() {
                if width > 0 && width as usize != feature_dim {
                    bail!(
                        "{} produces {width}-dim features, {backbone} expects {feature_dim}",
                        path.display()
                    );
                }
            }
        }
        debug!(%backbone, input = %input_name, output = %output_name, "backbone graph loaded");

        Ok(Self {
            session,
            input_name,
            output_name,
            feature_dim,
        })
    }
}

impl FeatureExtractor for OnnxBackbone {
    fn feature_dim(&self) -> usize {
        self.feature_dim
    }

    fn extract(&self, input: ArrayView4<'_, f32>) -> anyhow::Result<Array2<f32>> {
        let outputs = self
            .session
            .run(inputs![self.input_name.as_str() => input]?)?;
        let features = outputs[self.output_name.as_str()]
            .try_extract_tensor::<f32>()?
            .into_dimensionality::<Ix2>()?
            .to_owned();
        Ok(features)
    }
}
