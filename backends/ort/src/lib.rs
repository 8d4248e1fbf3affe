use clip_embeddings_backend_core::{
    Backend, BackendError, Batch, Embeddings, SimilarityMetric,
};
use nohash_hasher::BuildNoHashHasher;
use ort::session::{builder::GraphOptimizationLevel, Session};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

/// ONNX Runtime backend for dual-encoder CLIP exports.
///
/// Expects `visual.onnx` and `textual.onnx` in the model directory, the
/// layout produced by the usual CLIP ONNX export tooling. The visual graph
/// takes `pixel_values` and the textual graph takes `input_ids` and
/// `attention_mask`; both emit projected embeddings as their first output.
pub struct OrtBackend {
    visual: Mutex<Session>,
    textual: Mutex<Session>,
    visual_output: String,
    textual_output: String,
}

impl OrtBackend {
    pub fn new(model_path: &Path, dtype: String) -> Result<Self, BackendError> {
        if dtype != "float32" {
            return Err(BackendError::Start(format!(
                "Dtype {dtype} is not supported for `ort`, only float32."
            )));
        };

        let visual_path = model_path.join("visual.onnx");
        let textual_path = model_path.join("textual.onnx");
        for p in [&visual_path, &textual_path] {
            if !p.exists() {
                return Err(BackendError::Start(format!(
                    "model file not found at {p:?}"
                )));
            }
        }

        tracing::info!("Starting ORT backend from {model_path:?}");

        let visual = Session::builder()
            .s()?
            .with_intra_threads(num_cpus::get())
            .s()?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .s()?
            .commit_from_file(visual_path)
            .s()?;

        let textual = Session::builder()
            .s()?
            .with_intra_threads(num_cpus::get())
            .s()?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .s()?
            .commit_from_file(textual_path)
            .s()?;

        let visual_output = visual
            .outputs()
            .first()
            .map(|o| o.name().to_string())
            .ok_or_else(|| BackendError::Start("visual graph has no outputs".to_string()))?;
        let textual_output = textual
            .outputs()
            .first()
            .map(|o| o.name().to_string())
            .ok_or_else(|| BackendError::Start("textual graph has no outputs".to_string()))?;

        Ok(Self {
            visual: Mutex::new(visual),
            textual: Mutex::new(textual),
            visual_output,
            textual_output,
        })
    }

    fn embed_images(&self, batch: &Batch, embeddings: &mut Embeddings) -> Result<(), BackendError> {
        let n = batch.image_indices.len();
        let [c, h, w] = batch.pixel_shape;

        let pixel_values =
            ndarray::Array4::from_shape_vec((n, c, h, w), batch.pixel_values.clone()).e()?;

        let inputs = ort::inputs![
            "pixel_values" => ort::value::Tensor::from_array(pixel_values).e()?,
        ];

        let mut session = self.visual.lock().unwrap();
        let outputs = session.run(inputs).e()?;

        let outputs = outputs
            .get(self.visual_output.as_str())
            .ok_or(BackendError::Inference(format!(
                "visual output `{}` missing from results",
                self.visual_output
            )))?
            .try_extract_array::<f32>()
            .e()?
            .to_owned();

        for (i, e) in batch.image_indices.iter().zip(outputs.rows()) {
            embeddings.insert(*i as usize, e.to_vec());
        }
        Ok(())
    }

    fn embed_texts(&self, batch: &Batch, embeddings: &mut Embeddings) -> Result<(), BackendError> {
        let n = batch.text_indices.len();
        let max_length = batch.max_length as usize;

        // Pad every row to the longest sequence in the batch
        let elems = n * max_length;
        let mut input_ids = Vec::with_capacity(elems);
        let mut attention_mask = Vec::with_capacity(elems);

        for i in 0..n {
            let start = batch.cumulative_seq_lengths[i] as usize;
            let end = batch.cumulative_seq_lengths[i + 1] as usize;
            let seq_length = end - start;

            for j in start..end {
                input_ids.push(batch.input_ids[j] as i64);
                attention_mask.push(1_i64);
            }
            for _ in 0..max_length - seq_length {
                input_ids.push(0);
                attention_mask.push(0_i64);
            }
        }

        let input_ids = ndarray::Array2::from_shape_vec((n, max_length), input_ids).e()?;
        let attention_mask =
            ndarray::Array2::from_shape_vec((n, max_length), attention_mask).e()?;

        let inputs = ort::inputs![
            "input_ids" => ort::value::Tensor::from_array(input_ids).e()?,
            "attention_mask" => ort::value::Tensor::from_array(attention_mask).e()?,
        ];

        let mut session = self.textual.lock().unwrap();
        let outputs = session.run(inputs).e()?;

        let outputs = outputs
            .get(self.textual_output.as_str())
            .ok_or(BackendError::Inference(format!(
                "textual output `{}` missing from results",
                self.textual_output
            )))?
            .try_extract_array::<f32>()
            .e()?
            .to_owned();

        for (i, e) in batch.text_indices.iter().zip(outputs.rows()) {
            embeddings.insert(*i as usize, e.to_vec());
        }
        Ok(())
    }
}

impl Backend for OrtBackend {
    fn health(&self) -> Result<(), BackendError> {
        Ok(())
    }

    fn metric(&self) -> SimilarityMetric {
        SimilarityMetric::Cosine
    }

    fn embed(&self, batch: Batch) -> Result<Embeddings, BackendError> {
        let mut embeddings =
            HashMap::with_capacity_and_hasher(batch.len(), BuildNoHashHasher::default());

        if !batch.image_indices.is_empty() {
            self.embed_images(&batch, &mut embeddings)?;
        }
        if !batch.text_indices.is_empty() {
            self.embed_texts(&batch, &mut embeddings)?;
        }

        Ok(embeddings)
    }
}

pub trait WrapErr<O> {
    fn s(self) -> Result<O, BackendError>;
    fn e(self) -> Result<O, BackendError>;
}

impl<O, R> WrapErr<O> for Result<O, ort::Error<R>> {
    fn s(self) -> Result<O, BackendError> {
        self.map_err(|e| BackendError::Start(e.to_string()))
    }
    fn e(self) -> Result<O, BackendError> {
        self.map_err(|e| BackendError::Inference(e.to_string()))
    }
}

impl<O> WrapErr<O> for Result<O, ndarray::ShapeError> {
    fn s(self) -> Result<O, BackendError> {
        self.map_err(|e| BackendError::Start(e.to_string()))
    }
    fn e(self) -> Result<O, BackendError> {
        self.map_err(|e| BackendError::Inference(e.to_string()))
    }
}
