#![allow(dead_code)]

use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use fitzpatrick_serve::backbone::{Backbone, FeatureExtractor};
use fitzpatrick_serve::config::ArtifactPaths;
use fitzpatrick_serve::device::Device;
use fitzpatrick_serve::error::LoadError;
use fitzpatrick_serve::inference::Classifier;
use fitzpatrick_serve::loader::load_with;
use fitzpatrick_serve::model::MultiTaskModel;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use ndarray::{Array2, ArrayView4, Axis};
use safetensors::tensor::TensorView;
use safetensors::Dtype;
use tempfile::TempDir;

pub const DISEASES: [&str; 6] = [
    "acne",
    "eczema",
    "melanoma",
    "psoriasis",
    "basal cell carcinoma",
    "vitiligo",
];

/// Cheap deterministic stand-in for the ONNX backbone: per-channel means
/// spread over the embedding with a fixed ramp.
pub struct ChannelMeans;

impl FeatureExtractor for ChannelMeans {
    fn feature_dim(&self) -> usize {
        Backbone::EfficientNetB3.feature_dim()
    }

    fn extract(&self, input: ArrayView4<'_, f32>) -> anyhow::Result<Array2<f32>> {
        let batch = input.len_of(Axis(0));
        let dim = self.feature_dim();
        let mut features = Array2::zeros((batch, dim));
        for b in 0..batch {
            let item = input.index_axis(Axis(0), b);
            let means: Vec<f32> = item
                .axis_iter(Axis(0))
                .map(|channel| channel.mean().unwrap_or_default())
                .collect();
            for i in 0..dim {
                features[[b, i]] = means[i % 3] * ((i % 7) as f32 + 1.0) / 7.0;
            }
        }
        Ok(features)
    }
}

pub fn open_stub(_: Backbone) -> Result<Box<dyn FeatureExtractor>, LoadError> {
    Ok(Box::new(ChannelMeans))
}

/// [`ChannelMeans`] that records how often the network ran.
pub struct Counted(pub Arc<AtomicUsize>);

impl FeatureExtractor for Counted {
    fn feature_dim(&self) -> usize {
        ChannelMeans.feature_dim()
    }

    fn extract(&self, input: ArrayView4<'_, f32>) -> anyhow::Result<Array2<f32>> {
        self.0.fetch_add(1, Ordering::SeqCst);
        ChannelMeans.extract(input)
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Layout {
    Raw,
    Wrapped(&'static str),
}

fn weight(seed: usize, i: usize) -> f32 {
    ((seed * 7919 + i) as f32 * 12.9898).sin() * 0.05
}

/// Every head parameter for a model with `num_disease` disease classes.
pub fn parameters(num_disease: usize) -> Vec<(String, Vec<usize>, Vec<f32>)> {
    let model = MultiTaskModel::new(Backbone::EfficientNetB3, Box::new(ChannelMeans), num_disease, 7)
        .expect("stub matches backbone");
    model
        .parameter_shapes()
        .into_iter()
        .enumerate()
        .map(|(seed, (name, shape))| {
            let len = shape.iter().product();
            let values = (0..len).map(|i| weight(seed, i)).collect();
            (name, shape, values)
        })
        .collect()
}

pub fn write_checkpoint(path: &Path, layout: Layout, tensors: &[(String, Vec<usize>, Vec<f32>)]) {
    let mut entries: Vec<(String, Vec<usize>, Vec<u8>)> = tensors
        .iter()
        .map(|(name, shape, values)| {
            let name = match layout {
                Layout::Raw => name.clone(),
                Layout::Wrapped(key) => format!("{key}.{name}"),
            };
            let bytes = values.iter().flat_map(|v| v.to_le_bytes()).collect();
            (name, shape.clone(), bytes)
        })
        .collect();
    if let Layout::Wrapped(_) = layout {
        entries.push((
            "optimizer_state_dict.state.0.step".to_string(),
            vec![1],
            12.0_f32.to_le_bytes().to_vec(),
        ));
    }
    let views: Vec<(String, TensorView<'_>)> = entries
        .iter()
        .map(|(name, shape, bytes)| {
            let view = TensorView::new(Dtype::F32, shape.clone(), bytes).expect("valid tensor");
            (name.clone(), view)
        })
        .collect();
    std::fs::create_dir_all(path.parent().expect("checkpoint has a parent")).expect("mkdir");
    safetensors::serialize_to_file(views, &None, path).expect("write checkpoint");
}

pub fn write_config(path: &Path, backbone: &str, num_disease: usize) {
    let config = format!(
        r#"{{"backbone": "{backbone}", "num_disease_classes": {num_disease}, "num_fitzpatrick_classes": 7, "epochs": 30}}"#
    );
    std::fs::write(path, config).expect("write config");
}

pub fn write_labels(path: &Path, labels: &[(&str, usize)]) {
    let mut csv = String::from("label,idx\n");
    for (label, idx) in labels {
        csv.push_str(&format!("{label},{idx}\n"));
    }
    std::fs::write(path, csv).expect("write labels");
}

pub fn all_labels() -> Vec<(&'static str, usize)> {
    DISEASES.iter().enumerate().map(|(idx, label)| (*label, idx)).collect()
}

/// A complete artifacts directory for a six-class model.
pub fn artifacts(layout: Layout) -> (TempDir, ArtifactPaths) {
    let dir = tempfile::tempdir().expect("tempdir");
    let paths = ArtifactPaths::in_dir(dir.path());
    write_config(&paths.config, "efficientnet_b3", DISEASES.len());
    write_labels(&paths.labels, &all_labels());
    write_checkpoint(&paths.checkpoint, layout, &parameters(DISEASES.len()));
    (dir, paths)
}

pub fn classifier() -> Classifier {
    let (_dir, paths) = artifacts(Layout::Raw);
    load_with(&paths, Device::Cpu, open_stub).expect("artifacts load")
}

/// A classifier plus the number of forward passes it has made.
pub fn counted_classifier() -> (Classifier, Arc<AtomicUsize>) {
    let (_dir, paths) = artifacts(Layout::Raw);
    let calls = Arc::new(AtomicUsize::new(0));
    let extractor = Counted(Arc::clone(&calls));
    let classifier = load_with(&paths, Device::Cpu, move |_| {
        Ok(Box::new(extractor) as Box<dyn FeatureExtractor>)
    })
    .expect("artifacts load");
    (classifier, calls)
}

pub fn gradient(width: u32, height: u32) -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
        Rgb([
            (x * 255 / width.max(1)) as u8,
            (y * 255 / height.max(1)) as u8,
            ((x + y) % 256) as u8,
        ])
    }))
}

pub fn png_bytes(image: &DynamicImage) -> Vec<u8> {
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .expect("encode png");
    bytes
}
