use std::{path::Path, sync::Arc};

use image::{imageops::FilterType, DynamicImage, RgbImage};
use serde::Serialize;

use crate::{
    error::{ClassificationFailure, InputProblem},
    labels::Diagnosis,
    model::{ImageTensor, InferenceError, InputShape, ModelHost},
};

/// Extensions accepted for upload, compared lower-cased.
pub const ALLOWED_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// Bilinear. Changing this changes model output.
const RESIZE_FILTER: FilterType = FilterType::Triangle;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ClassificationResult {
    #[serde(rename = "diagnosis")]
    pub label: Diagnosis,
    /// Percentage in [0, 100], two decimal places.
    pub confidence: f64,
}

/// Turns uploaded image bytes into a diagnosis using the shared [`ModelHost`].
#[derive(Debug, Clone)]
pub struct Classifier {
    host: Arc<ModelHost>,
}

impl Classifier {
    pub fn new(host: Arc<ModelHost>) -> Self {
        Self { host }
    }

    pub fn host(&self) -> &ModelHost {
        &self.host
    }

    /// Validates, preprocesses and classifies one image. Input checks run
    /// before the readiness check, so bad uploads are reported as such even
    /// while the model is unavailable.
    pub fn classify(
        &self,
        image_data: &[u8],
        filename: &str,
    ) -> Result<ClassificationResult, ClassificationFailure> {
        if image_data.is_empty() || filename.trim().is_empty() {
            return Err(ClassificationFailure::InvalidInput(InputProblem::Missing));
        }
        check_extension(filename)?;

        let img = image::load_from_memory(image_data).map_err(|err| {
            tracing::debug!(filename, "Image decode failed: {}", err);
            ClassificationFailure::InvalidInput(InputProblem::Corrupt)
        })?;

        let model = self
            .host
            .ready_model()
            .ok_or(ClassificationFailure::ModelUnavailable)?;

        let tensor = preprocess_image(&img, model.input_shape());

        let scores = model.infer(&tensor).map_err(|err| match err {
            InferenceError::Unavailable => ClassificationFailure::ModelUnavailable,
            other => ClassificationFailure::InternalError(other.to_string()),
        })?;

        decode_scores(&scores)
    }
}

fn check_extension(filename: &str) -> Result<(), ClassificationFailure> {
    let extension = Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    if ALLOWED_EXTENSIONS.contains(&extension.as_str()) {
        Ok(())
    } else {
        Err(ClassificationFailure::UnsupportedFormat { extension })
    }
}

/// RGB conversion, resize to the model's size, then scale to [0, 1].
pub fn preprocess_image(img: &DynamicImage, shape: InputShape) -> ImageTensor {
    let rgb: RgbImage = img.to_rgb8();
    let resized = image::imageops::resize(&rgb, shape.width, shape.height, RESIZE_FILTER);

    let data = resized
        .into_raw()
        .into_iter()
        .map(|value| f32::from(value) / 255.0)
        .collect();

    ImageTensor {
        shape: shape.batch_dims(),
        data,
    }
}

/// Argmax with the lowest index winning ties, plus the rounded percentage.
pub fn decode_scores(scores: &[f32]) -> Result<ClassificationResult, ClassificationFailure> {
    if scores.is_empty() {
        return Err(ClassificationFailure::InternalError(
            "model returned an empty score vector".into(),
        ));
    }
    if let Some(bad) = scores.iter().find(|score| !score.is_finite()) {
        return Err(ClassificationFailure::InternalError(format!(
            "model returned a non-finite score: {bad}"
        )));
    }

    let (index, max) = scores
        .iter()
        .enumerate()
        .fold((0, scores[0]), |best, (i, &score)| {
            if score > best.1 {
                (i, score)
            } else {
                best
            }
        });

    let rounded = (f64::from(max) * 100.0 * 100.0).round() / 100.0;
    let confidence = rounded.clamp(0.0, 100.0);
    if confidence != rounded {
        tracing::warn!(score = max, "Model score outside [0, 1], clamping confidence");
    }

    Ok(ClassificationResult {
        label: Diagnosis::from_index(index),
        confidence,
    })
}
