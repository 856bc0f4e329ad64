use std::collections::HashMap;
use std::path::Path;

use ndarray::{ArrayD, IxDyn};
use safetensors::{Dtype, SafeTensors};
use tracing::{debug, info};

use crate::error::LoadError;

/// Prefixes a training run may nest the model parameters under, in lookup order.
pub const STATE_KEYS: [&str; 2] = ["model_state_dict", "state_dict"];

/// Parameters under this prefix belong to the exported backbone graph and are
/// not read from the checkpoint.
pub const BACKBONE_PREFIX: &str = "backbone.";

/// Where the model parameters sit inside a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateLayout {
    /// Tensor names are parameter names.
    Raw,
    /// Parameters are nested under `<key>.`; anything else is training bookkeeping.
    Wrapped { key: &'static str },
}

impl StateLayout {
    pub fn detect<'a>(names: impl IntoIterator<Item = &'a str> + Clone) -> Self {
        for key in STATE_KEYS {
            let prefix = format!("{key}.");
            if names.clone().into_iter().any(|name| name.starts_with(&prefix)) {
                return StateLayout::Wrapped { key };
            }
        }
        StateLayout::Raw
    }

    /// Parameter name for a stored tensor, or `None` when it lies outside the state.
    fn parameter_name<'a>(&self, stored: &'a str) -> Option<&'a str> {
        match self {
            StateLayout::Raw => Some(stored),
            StateLayout::Wrapped { key } => stored
                .strip_prefix(key)
                .and_then(|rest| rest.strip_prefix('.')),
        }
    }
}

/// Named parameter tensors.
#[derive(Debug, Clone, Default)]
pub struct StateDict {
    tensors: HashMap<String, ArrayD<f32>>,
}

impl StateDict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: ArrayD<f32>) {
        self.tensors.insert(name.into(), tensor);
    }

    pub fn remove(&mut self, name: &str) -> Option<ArrayD<f32>> {
        self.tensors.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&ArrayD<f32>> {
        self.tensors.get(name)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    /// Parses a safetensors payload and selects the parameter state inside it.
    /// Backbone tensors are counted and dropped whatever their dtype.
    pub fn from_safetensors(bytes: &[u8]) -> Result<Decoded, String> {
        let tensors = SafeTensors::deserialize(bytes).map_err(|err| err.to_string())?;
        let names = tensors.names();
        let layout = StateLayout::detect(names.iter().map(|name| name.as_str()));

        let mut state = StateDict::new();
        let mut backbone_tensors = 0;
        for (stored, view) in tensors.tensors() {
            let Some(name) = layout.parameter_name(&stored) else {
                continue;
            };
            if name.starts_with(BACKBONE_PREFIX) {
                backbone_tensors += 1;
                continue;
            }
            if view.dtype() != Dtype::F32 {
                return Err(format!("tensor `{stored}` is {:?}, expected F32", view.dtype()));
            }
            let values: Vec<f32> = view
                .data()
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect();
            let tensor = ArrayD::from_shape_vec(IxDyn(view.shape()), values)
                .map_err(|err| format!("tensor `{stored}`: {err}"))?;
            state.insert(name, tensor);
        }
        Ok(Decoded {
            state,
            layout,
            backbone_tensors,
        })
    }

    pub fn read(path: &Path) -> Result<Self, LoadError> {
        let bytes = std::fs::read(path).map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if let Ok((_, metadata)) = SafeTensors::read_metadata(&bytes) {
            if let Some(extra) = metadata.metadata() {
                debug!(?extra, "checkpoint metadata");
            }
        }
        let decoded = Self::from_safetensors(&bytes).map_err(|reason| LoadError::Checkpoint {
            path: path.to_path_buf(),
            reason,
        })?;
        info!(
            layout = ?decoded.layout,
            tensors = decoded.state.len(),
            skipped_backbone = decoded.backbone_tensors,
            "checkpoint read from {}",
            path.display()
        );
        Ok(decoded.state)
    }
}

/// A checkpoint payload split into the head state and what was left out.
#[derive(Debug)]
pub struct Decoded {
    pub state: StateDict,
    pub layout: StateLayout,
    pub backbone_tensors: usize,
}

impl FromIterator<(String, ArrayD<f32>)> for StateDict {
    fn from_iter<T: IntoIterator<Item = (String, ArrayD<f32>)>>(iter: T) -> Self {
        Self {
            tensors: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use safetensors::tensor::TensorView;

    fn encode(entries: &[(&str, Vec<usize>, Vec<f32>)]) -> Vec<u8> {
        let typed: Vec<(&str, Dtype, Vec<usize>, Vec<u8>)> = entries
            .iter()
            .map(|(name, shape, values)| {
                let bytes = values.iter().flat_map(|v| v.to_le_bytes()).collect();
                (*name, Dtype::F32, shape.clone(), bytes)
            })
            .collect();
        encode_typed(&typed)
    }

    fn encode_typed(entries: &[(&str, Dtype, Vec<usize>, Vec<u8>)]) -> Vec<u8> {
        let views: Vec<(String, TensorView<'_>)> = entries
            .iter()
            .map(|(name, dtype, shape, bytes)| {
                (
                    name.to_string(),
                    TensorView::new(*dtype, shape.clone(), bytes).unwrap(),
                )
            })
            .collect();
        safetensors::serialize(views, &None).unwrap()
    }

    #[test]
    fn detects_layouts() {
        assert_eq!(
            StateLayout::detect(["model_state_dict.a.weight", "epoch"]),
            StateLayout::Wrapped {
                key: "model_state_dict"
            }
        );
        assert_eq!(
            StateLayout::detect(["state_dict.a.weight"]),
            StateLayout::Wrapped { key: "state_dict" }
        );
        assert_eq!(StateLayout::detect(["a.weight"]), StateLayout::Raw);
    }

    #[test]
    fn model_state_dict_wins_over_state_dict() {
        let layout = StateLayout::detect(["state_dict.x", "model_state_dict.x"]);
        assert_eq!(
            layout,
            StateLayout::Wrapped {
                key: "model_state_dict"
            }
        );
    }

    #[test]
    fn wrapped_checkpoint_drops_bookkeeping() {
        let bytes = encode(&[
            ("model_state_dict.head.bias", vec![2], vec![1.0, 2.0]),
            ("optimizer_state_dict.step", vec![1], vec![10.0]),
        ]);
        let Decoded { state, layout, .. } = StateDict::from_safetensors(&bytes).unwrap();
        assert_eq!(
            layout,
            StateLayout::Wrapped {
                key: "model_state_dict"
            }
        );
        assert_eq!(state.len(), 1);
        let bias = state.get("head.bias").unwrap();
        assert_eq!(bias.shape(), &[2]);
        assert_eq!(bias.as_slice().unwrap(), &[1.0, 2.0]);
    }

    #[test]
    fn raw_checkpoint_keeps_names() {
        let bytes = encode(&[("head.weight", vec![1, 2], vec![0.5, -0.5])]);
        let Decoded { state, layout, .. } = StateDict::from_safetensors(&bytes).unwrap();
        assert_eq!(layout, StateLayout::Raw);
        assert_eq!(state.get("head.weight").unwrap().shape(), &[1, 2]);
    }

    #[test]
    fn backbone_tensors_are_left_to_the_graph() {
        let bytes = encode_typed(&[
            (
                "model_state_dict.backbone.features.0.0.weight",
                Dtype::F32,
                vec![1],
                1.0_f32.to_le_bytes().to_vec(),
            ),
            (
                "model_state_dict.backbone.features.0.1.num_batches_tracked",
                Dtype::I64,
                vec![],
                7_i64.to_le_bytes().to_vec(),
            ),
            (
                "model_state_dict.shared_features.1.bias",
                Dtype::F32,
                vec![1],
                0.5_f32.to_le_bytes().to_vec(),
            ),
        ]);
        let decoded = StateDict::from_safetensors(&bytes).unwrap();
        assert_eq!(decoded.backbone_tensors, 2);
        let names: Vec<&str> = decoded.state.names().collect();
        assert_eq!(names, ["shared_features.1.bias"]);
    }

    #[test]
    fn rejects_non_float_head_tensors() {
        let bytes = encode_typed(&[(
            "disease_head.3.bias",
            Dtype::I64,
            vec![1],
            3_i64.to_le_bytes().to_vec(),
        )]);
        assert!(StateDict::from_safetensors(&bytes).is_err());
    }

    #[test]
    fn rejects_garbage() {
        assert!(StateDict::from_safetensors(b"not a checkpoint").is_err());
    }
}
