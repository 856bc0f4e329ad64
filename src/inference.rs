use fast_image_resize::{FilterType, ResizeAlg, ResizeOptions, Resizer};
use image::{DynamicImage, GenericImageView};
use ndarray::{Array, ArrayView1, Dim, Ix};
use serde::Serialize;

use crate::device::Device;
use crate::labels::{FitzpatrickScale, LabelMapping};
use crate::model::MultiTaskModel;

pub const INPUT_SIZE: u32 = 224;
pub const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const STD: [f32; 3] = [0.229, 0.224, 0.225];
pub const DEFAULT_TOP_K: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiseaseCandidate {
    pub label: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FitzpatrickCandidate {
    pub scale: &'static str,
    pub value: i8,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiseasePrediction {
    pub top_prediction: Option<DiseaseCandidate>,
    pub top_k: Vec<DiseaseCandidate>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FitzpatrickPrediction {
    pub top_prediction: Option<FitzpatrickCandidate>,
    pub all_scales: Vec<FitzpatrickCandidate>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionResult {
    pub disease: DiseasePrediction,
    pub fitzpatrick: FitzpatrickPrediction,
}

/// A loaded model with its label table, ready to serve.
#[derive(Debug)]
pub struct Classifier {
    model: MultiTaskModel,
    labels: LabelMapping,
    device: Device,
}

impl Classifier {
    pub fn new(model: MultiTaskModel, labels: LabelMapping, device: Device) -> Self {
        Self {
            model,
            labels,
            device,
        }
    }

    pub fn labels(&self) -> &LabelMapping {
        &self.labels
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn model(&self) -> &MultiTaskModel {
        &self.model
    }

    pub fn predict(&self, image: &DynamicImage, top_k: usize) -> anyhow::Result<PredictionResult> {
        let input = pre_processing(image)?;
        let logits = self.model.forward(input.view())?;

        let disease_probs = softmax(logits.disease.row(0));
        let fitzpatrick_probs = softmax(logits.fitzpatrick.row(0));

        // Indices without a label are skipped rather than reported.
        let disease: Vec<DiseaseCandidate> = rank(&disease_probs, top_k)
            .into_iter()
            .filter_map(|(idx, prob)| {
                self.labels.label(idx).map(|label| DiseaseCandidate {
                    label: label.to_string(),
                    confidence: confidence(prob),
                })
            })
            .collect();

        let fitzpatrick: Vec<FitzpatrickCandidate> =
            rank(&fitzpatrick_probs, fitzpatrick_probs.len())
                .into_iter()
                .map(|(idx, prob)| {
                    let scale = FitzpatrickScale::from_index(idx);
                    FitzpatrickCandidate {
                        scale: scale.label,
                        value: scale.value,
                        confidence: confidence(prob),
                    }
                })
                .collect();

        Ok(PredictionResult {
            disease: DiseasePrediction {
                top_prediction: disease.first().cloned(),
                top_k: disease,
            },
            fitzpatrick: FitzpatrickPrediction {
                top_prediction: fitzpatrick.first().cloned(),
                all_scales: fitzpatrick,
            },
        })
    }
}

/// Resize to 224x224, scale to [0, 1] and normalise with the ImageNet
/// statistics the network was trained with, as a `[1, 3, 224, 224]` batch.
pub fn pre_processing(image: &DynamicImage) -> anyhow::Result<Array<f32, Dim<[Ix; 4]>>> {
    let src = DynamicImage::ImageRgb8(image.to_rgb8());
    let mut img = DynamicImage::new_rgb8(INPUT_SIZE, INPUT_SIZE);
    let options = ResizeOptions {
        algorithm: ResizeAlg::Convolution(FilterType::Bilinear),
        ..Default::default()
    };
    Resizer::new().resize(&src, &mut img, &options)?;

    let size = INPUT_SIZE as usize;
    let mut input = Array::zeros((1, 3, size, size));
    for pixel in img.pixels() {
        let x = pixel.0 as usize;
        let y = pixel.1 as usize;
        let [r, g, b, _] = pixel.2 .0;
        for (c, value) in [r, g, b].into_iter().enumerate() {
            input[[0, c, y, x]] = ((value as f32) / 255. - MEAN[c]) / STD[c];
        }
    }
    Ok(input)
}

pub fn softmax(scores: ArrayView1<'_, f32>) -> Vec<f32> {
    let max = scores.fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
    let exps = scores.mapv(|v| (v - max).exp());
    let sum = exps.sum();
    exps.iter().map(|v| v / sum).collect()
}

/// The `k` most probable `(index, probability)` pairs, highest first.
pub fn rank(probs: &[f32], k: usize) -> Vec<(usize, f32)> {
    let mut ranked: Vec<(usize, f32)> = probs.iter().copied().enumerate().collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    ranked.truncate(k.min(probs.len()));
    ranked
}

/// Probability as a percentage with two decimals.
pub fn confidence(prob: f32) -> f64 {
    (f64::from(prob) * 100.0 * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use ndarray::array;
    use rstest::rstest;

    #[rstest]
    #[case(1, 1)]
    #[case(640, 480)]
    #[case(224, 224)]
    #[case(37, 1001)]
    fn any_resolution_becomes_fixed_batch(#[case] width: u32, #[case] height: u32) {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([10, 20, 30])));
        let input = pre_processing(&image).unwrap();
        assert_eq!(input.shape(), &[1, 3, 224, 224]);
    }

    #[test]
    fn normalises_each_channel() {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(50, 50, Rgb([255, 0, 128])));
        let input = pre_processing(&image).unwrap();
        let red = (1.0 - MEAN[0]) / STD[0];
        let green = (0.0 - MEAN[1]) / STD[1];
        let blue = (128.0 / 255.0 - MEAN[2]) / STD[2];
        assert!((input[[0, 0, 100, 100]] - red).abs() < 1e-5);
        assert!((input[[0, 1, 7, 200]] - green).abs() < 1e-5);
        assert!((input[[0, 2, 223, 0]] - blue).abs() < 1e-5);
    }

    #[test]
    fn softmax_is_a_distribution() {
        let probs = softmax(array![1.0_f32, 2.0, 3.0, 1000.0].view());
        assert!((probs.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert!(probs.iter().all(|p| p.is_finite()));
        assert!(probs[3] > 0.99);
    }

    #[test]
    fn rank_orders_and_truncates() {
        let ranked = rank(&[0.1, 0.5, 0.15, 0.25], 3);
        let indices: Vec<usize> = ranked.iter().map(|(idx, _)| *idx).collect();
        assert_eq!(indices, [1, 3, 2]);
        assert_eq!(rank(&[0.3, 0.7], 10).len(), 2);
        assert!(rank(&[0.3, 0.7], 0).is_empty());
    }

    #[rstest]
    #[case(0.123456, 12.35)]
    #[case(1.0, 100.0)]
    #[case(0.0, 0.0)]
    #[case(0.00004, 0.0)]
    fn confidence_is_rounded_percentage(#[case] prob: f32, #[case] expected: f64) {
        assert!((confidence(prob) - expected).abs() < 1e-9);
    }
}
