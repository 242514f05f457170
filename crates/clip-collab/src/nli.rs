//! ONNX natural-language-inference scorer.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ort::session::Session;
use ort::value::Tensor;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use clip_core::{ClipError, ContradictionScorer, DetectionConfig, Result};

use crate::onnx::{build_session, load_tokenizer};

const TOOL: &str = "scorer";

/// Cross-encoder inputs are capped at 512 tokens for the pair.
const MAX_TOKENS: usize = 512;

struct Inner {
    session: Mutex<Session>,
    tokenizer: Tokenizer,

    /// Index of the CONTRADICTION class in the model's logits.
    contradiction_label: usize,
}

/// Scores a segment pair as the softmax probability of the contradiction
/// class from an MNLI-style sequence-classification model.
pub struct OnnxNliScorer {
    inner: Arc<Inner>,
    model_id: String,
}

impl OnnxNliScorer {
    pub fn new(config: &DetectionConfig) -> Result<Self> {
        let model_path = config.model_path.as_ref().ok_or_else(|| {
            ClipError::config("detection.model_path is not set")
        })?;
        let tokenizer_path = config.tokenizer_path.clone().unwrap_or_else(|| {
            model_path
                .parent()
                .map(|p| p.join("tokenizer.json"))
                .unwrap_or_else(|| PathBuf::from("tokenizer.json"))
        });

        let session = build_session(TOOL, model_path, config.num_threads)?;
        let tokenizer = load_tokenizer(TOOL, &tokenizer_path)?;

        let model_id = model_path
            .parent()
            .and_then(|p| p.file_name())
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "nli".to_string());

        info!(
            "NLI scorer initialized: model={}, contradiction_label={}",
            model_id, config.contradiction_label
        );

        Ok(Self {
            inner: Arc::new(Inner {
                session: Mutex::new(session),
                tokenizer,
                contradiction_label: config.contradiction_label,
            }),
            model_id,
        })
    }
}

impl Inner {
    fn score_pair(&self, text_a: &str, text_b: &str) -> Result<f32> {
        let encoding = self
            .tokenizer
            .encode((text_a, text_b), true)
            .map_err(|e| ClipError::collaborator(TOOL, format!("Tokenization failed: {}", e)))?;

        let len = encoding.get_ids().len().min(MAX_TOKENS).max(1);
        let mut input_ids = vec![0i64; len];
        let mut attention_mask = vec![0i64; len];
        for (j, (id, m)) in encoding
            .get_ids()
            .iter()
            .zip(encoding.get_attention_mask())
            .take(len)
            .enumerate()
        {
            input_ids[j] = *id as i64;
            attention_mask[j] = *m as i64;
        }

        let input_ids_tensor = Tensor::from_array((vec![1, len], input_ids)).map_err(|e| {
            ClipError::collaborator(TOOL, format!("Failed to create input tensor: {}", e))
        })?;
        let attention_mask_tensor =
            Tensor::from_array((vec![1, len], attention_mask)).map_err(|e| {
                ClipError::collaborator(TOOL, format!("Failed to create mask tensor: {}", e))
            })?;

        let mut session = self
            .session
            .lock()
            .map_err(|e| ClipError::collaborator(TOOL, format!("Failed to lock session: {}", e)))?;

        let outputs = session
            .run(ort::inputs![
                "input_ids" => input_ids_tensor,
                "attention_mask" => attention_mask_tensor
            ])
            .map_err(|e| ClipError::collaborator(TOOL, format!("Inference failed: {}", e)))?;

        let (_, output) = outputs
            .iter()
            .next()
            .ok_or_else(|| ClipError::collaborator(TOOL, "No output tensor found"))?;

        let view = output
            .try_extract_array::<f32>()
            .map_err(|e| ClipError::collaborator(TOOL, format!("Failed to extract tensor: {}", e)))?;

        // (batch, labels) logits for batch row 0
        let logits: Vec<f32> = view.iter().copied().collect();
        let probs = softmax(&logits);
        debug!("NLI probabilities: {:?}", probs);

        probs
            .get(self.contradiction_label)
            .copied()
            .ok_or_else(|| {
                ClipError::collaborator(
                    TOOL,
                    format!(
                        "contradiction label {} out of range for {} logits",
                        self.contradiction_label,
                        probs.len()
                    ),
                )
            })
    }
}

/// Numerically stable softmax.
fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.iter().map(|e| e / sum).collect()
}

#[async_trait]
impl ContradictionScorer for OnnxNliScorer {
    async fn score(&self, text_a: &str, text_b: &str) -> Result<f32> {
        let inner = Arc::clone(&self.inner);
        let (a, b) = (text_a.to_string(), text_b.to_string());
        tokio::task::spawn_blocking(move || inner.score_pair(&a, &b))
            .await
            .map_err(|e| ClipError::collaborator(TOOL, format!("scoring task failed: {}", e)))?
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}
