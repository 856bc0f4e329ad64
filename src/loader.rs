use tracing::info;

use crate::backbone::{Backbone, FeatureExtractor, OnnxBackbone};
use crate::checkpoint::StateDict;
use crate::config::{ArtifactPaths, ModelConfig};
use crate::device::Device;
use crate::error::LoadError;
use crate::inference::Classifier;
use crate::labels::LabelMapping;
use crate::model::MultiTaskModel;

/// Loads the ONNX backbone graph named by the artifacts and assembles the
/// classifier around it.
pub fn load_artifacts(paths: &ArtifactPaths, device: Device) -> Result<Classifier, LoadError> {
    load_with(paths, device, |backbone| {
        let graph = paths.backbone_graph_for(backbone);
        let extractor =
            OnnxBackbone::load(&graph, backbone).map_err(|source| LoadError::Backbone {
                path: graph,
                source: source.into(),
            })?;
        Ok(Box::new(extractor))
    })
}

/// Same as [`load_artifacts`] with the feature extractor supplied by the caller.
pub fn load_with<F>(
    paths: &ArtifactPaths,
    device: Device,
    open_backbone: F,
) -> Result<Classifier, LoadError>
where
    F: FnOnce(Backbone) -> Result<Box<dyn FeatureExtractor>, LoadError>,
{
    if !paths.checkpoint.exists() {
        return Err(LoadError::CheckpointNotFound(paths.checkpoint.clone()));
    }

    let config = ModelConfig::load(&paths.config)?;
    let backbone: Backbone = config.backbone.parse()?;
    let extractor = open_backbone(backbone)?;
    let mut model = MultiTaskModel::new(
        backbone,
        extractor,
        config.num_disease_classes,
        config.num_fitzpatrick_classes,
    )?;

    let state = StateDict::read(&paths.checkpoint)?;
    model.load_state(state)?;
    model.eval();

    let labels = LabelMapping::load(&paths.labels)?;

    info!(
        %backbone,
        %device,
        disease_classes = config.num_disease_classes,
        fitzpatrick_classes = config.num_fitzpatrick_classes,
        labels = labels.len(),
        "model loaded"
    );
    Ok(Classifier::new(model, labels, device))
}
