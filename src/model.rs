//! Multi-task network: a shared backbone, a shared projection stage, and one
//! head per task.
//!
//! Layer slots mirror the trained network, so a parameter is addressed as
//! `<stage>.<slot>.<weight|bias>` (e.g. `shared_features.1.weight`). Dropout
//! and activation slots carry no parameters but still take up an index.

use std::collections::HashSet;

use ndarray::{Array, Array1, Array2, ArrayView4, Dimension, Ix1, Ix2};

use crate::backbone::{Backbone, FeatureExtractor};
use crate::checkpoint::StateDict;
use crate::error::{LoadError, ModelError, ShapeMismatch};

pub const SHARED_DIMS: [usize; 2] = [512, 256];
pub const DISEASE_HIDDEN: usize = 128;
pub const FITZPATRICK_HIDDEN: usize = 64;
pub const DROPOUT: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Training,
    Evaluation,
}

/// Fully connected layer, `y = x · Wᵀ + b` with `W` stored as `[out, in]`.
#[derive(Debug, Clone)]
pub struct Linear {
    weight: Array2<f32>,
    bias: Array1<f32>,
}

impl Linear {
    fn zeros(in_features: usize, out_features: usize) -> Self {
        Self {
            weight: Array2::zeros((out_features, in_features)),
            bias: Array1::zeros(out_features),
        }
    }

    pub fn in_features(&self) -> usize {
        self.weight.ncols()
    }

    pub fn out_features(&self) -> usize {
        self.weight.nrows()
    }

    fn forward(&self, x: &Array2<f32>, name: &str) -> Result<Array2<f32>, ModelError> {
        if x.ncols() != self.in_features() {
            return Err(ModelError::Shape {
                layer: name.to_string(),
                expected: self.in_features(),
                actual: x.ncols(),
            });
        }
        Ok(x.dot(&self.weight.t()) + &self.bias)
    }
}

#[derive(Debug, Clone)]
pub enum Layer {
    Linear(Linear),
    Relu,
    Dropout(f32),
}

/// An ordered stack of layers addressed by slot index.
#[derive(Debug, Clone)]
pub struct Sequential {
    name: &'static str,
    layers: Vec<Layer>,
}

impl Sequential {
    fn new(name: &'static str, layers: Vec<Layer>) -> Self {
        Self { name, layers }
    }

    fn forward(&self, mut x: Array2<f32>) -> Result<Array2<f32>, ModelError> {
        for (slot, layer) in self.layers.iter().enumerate() {
            x = match layer {
                Layer::Linear(linear) => linear.forward(&x, &format!("{}.{slot}", self.name))?,
                Layer::Relu => x.mapv_into(|v| v.max(0.0)),
                // Identity outside of training; the model only runs in evaluation mode.
                Layer::Dropout(_) => x,
            };
        }
        Ok(x)
    }

    fn linears(&self) -> impl Iterator<Item = (String, &Linear)> {
        self.layers
            .iter()
            .enumerate()
            .filter_map(move |(slot, layer)| match layer {
                Layer::Linear(linear) => Some((format!("{}.{slot}", self.name), linear)),
                _ => None,
            })
    }

    fn linears_mut(&mut self) -> impl Iterator<Item = (String, &mut Linear)> {
        let name = self.name;
        self.layers
            .iter_mut()
            .enumerate()
            .filter_map(move |(slot, layer)| match layer {
                Layer::Linear(linear) => Some((format!("{name}.{slot}"), linear)),
                _ => None,
            })
    }
}

/// Raw, pre-softmax scores for both tasks, one row per batch item.
#[derive(Debug, Clone)]
pub struct TaskLogits {
    pub disease: Array2<f32>,
    pub fitzpatrick: Array2<f32>,
}

pub struct MultiTaskModel {
    backbone: Backbone,
    extractor: Box<dyn FeatureExtractor>,
    shared_features: Sequential,
    disease_head: Sequential,
    fitzpatrick_head: Sequential,
    mode: Mode,
}

impl std::fmt::Debug for MultiTaskModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiTaskModel")
            .field("backbone", &self.backbone)
            .field("shared_features", &self.shared_features)
            .field("disease_head", &self.disease_head)
            .field("fitzpatrick_head", &self.fitzpatrick_head)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl MultiTaskModel {
    /// Builds the network with zeroed parameters in training mode.
    pub fn new(
        backbone: Backbone,
        extractor: Box<dyn FeatureExtractor>,
        num_disease_classes: usize,
        num_fitzpatrick_classes: usize,
    ) -> Result<Self, ModelError> {
        let feature_dim = backbone.feature_dim();
        if extractor.feature_dim() != feature_dim {
            return Err(ModelError::FeatureDim {
                expected: feature_dim,
                actual: extractor.feature_dim(),
            });
        }
        let [hidden, shared_out] = SHARED_DIMS;
        let head_dropout = DROPOUT * 0.5;

        let shared_features = Sequential::new(
            "shared_features",
            vec![
                Layer::Dropout(DROPOUT),
                Layer::Linear(Linear::zeros(feature_dim, hidden)),
                Layer::Relu,
                Layer::Dropout(DROPOUT),
                Layer::Linear(Linear::zeros(hidden, shared_out)),
                Layer::Relu,
            ],
        );
        let disease_head = Sequential::new(
            "disease_head",
            vec![
                Layer::Linear(Linear::zeros(shared_out, DISEASE_HIDDEN)),
                Layer::Relu,
                Layer::Dropout(head_dropout),
                Layer::Linear(Linear::zeros(DISEASE_HIDDEN, num_disease_classes)),
            ],
        );
        let fitzpatrick_head = Sequential::new(
            "fitzpatrick_head",
            vec![
                Layer::Linear(Linear::zeros(shared_out, FITZPATRICK_HIDDEN)),
                Layer::Relu,
                Layer::Dropout(head_dropout),
                Layer::Linear(Linear::zeros(FITZPATRICK_HIDDEN, num_fitzpatrick_classes)),
            ],
        );

        Ok(Self {
            backbone,
            extractor,
            shared_features,
            disease_head,
            fitzpatrick_head,
            mode: Mode::Training,
        })
    }

    pub fn backbone(&self) -> Backbone {
        self.backbone
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn eval(&mut self) -> &mut Self {
        self.mode = Mode::Evaluation;
        self
    }

    pub fn num_disease_classes(&self) -> usize {
        last_out_features(&self.disease_head)
    }

    pub fn num_fitzpatrick_classes(&self) -> usize {
        last_out_features(&self.fitzpatrick_head)
    }

    fn stages(&self) -> [&Sequential; 3] {
        [&self.shared_features, &self.disease_head, &self.fitzpatrick_head]
    }

    /// Every learnable parameter name with its expected shape.
    pub fn parameter_shapes(&self) -> Vec<(String, Vec<usize>)> {
        self.stages()
            .into_iter()
            .flat_map(Sequential::linears)
            .flat_map(|(prefix, linear)| {
                [
                    (
                        format!("{prefix}.weight"),
                        vec![linear.out_features(), linear.in_features()],
                    ),
                    (format!("{prefix}.bias"), vec![linear.out_features()]),
                ]
            })
            .collect()
    }

    /// Copies parameters out of `state`. Names and shapes must correspond
    /// exactly; nothing is written unless the whole state matches.
    pub fn load_state(&mut self, mut state: StateDict) -> Result<(), LoadError> {
        let mut missing = Vec::new();
        let mut mismatched = Vec::new();
        for (name, expected) in self.parameter_shapes() {
            match state.get(&name) {
                None => missing.push(name),
                Some(tensor) if tensor.shape() != expected.as_slice() => {
                    mismatched.push(ShapeMismatch {
                        name,
                        expected,
                        found: tensor.shape().to_vec(),
                    })
                }
                Some(_) => {}
            }
        }
        let expected_names: HashSet<String> = self
            .parameter_shapes()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        let mut unexpected: Vec<String> = state
            .names()
            .filter(|name| !expected_names.contains(*name))
            .map(str::to_string)
            .collect();
        unexpected.sort();

        if !missing.is_empty() || !unexpected.is_empty() || !mismatched.is_empty() {
            return Err(LoadError::StateMismatch {
                missing,
                unexpected,
                mismatched,
            });
        }

        for stage in [
            &mut self.shared_features,
            &mut self.disease_head,
            &mut self.fitzpatrick_head,
        ] {
            for (prefix, linear) in stage.linears_mut() {
                linear.weight = take::<Ix2>(&mut state, &format!("{prefix}.weight"))?;
                linear.bias = take::<Ix1>(&mut state, &format!("{prefix}.bias"))?;
            }
        }
        Ok(())
    }

    /// Runs a normalised `[batch, 3, H, W]` tensor through the network.
    pub fn forward(&self, input: ArrayView4<'_, f32>) -> anyhow::Result<TaskLogits> {
        if self.mode != Mode::Evaluation {
            return Err(ModelError::NotInEvalMode.into());
        }
        let features = self.extractor.extract(input)?;
        let expected = self.backbone.feature_dim();
        if features.ncols() != expected {
            return Err(ModelError::FeatureDim {
                expected,
                actual: features.ncols(),
            }
            .into());
        }

        let shared = self.shared_features.forward(features)?;
        let disease = self.disease_head.forward(shared.clone())?;
        let fitzpatrick = self.fitzpatrick_head.forward(shared)?;
        Ok(TaskLogits {
            disease,
            fitzpatrick,
        })
    }
}

fn last_out_features(stage: &Sequential) -> usize {
    stage
        .linears()
        .last()
        .map(|(_, linear)| linear.out_features())
        .unwrap_or_default()
}

fn take<D: Dimension>(state: &mut StateDict, name: &str) -> Result<Array<f32, D>, LoadError> {
    state
        .remove(name)
        .and_then(|tensor| tensor.into_dimensionality::<D>().ok())
        .ok_or_else(|| LoadError::StateMismatch {
            missing: vec![name.to_string()],
            unexpected: Vec::new(),
            mismatched: Vec::new(),
        })
}
