//! ONNX-based embedding model implementation.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ndarray::ArrayViewD;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use clip_core::{ClipError, Embedder, EmbeddingConfig, Result};

use crate::mock::l2_normalize;

const TOOL: &str = "embedder";

/// Sentence-embedding models in this family cap input at 512 tokens.
const MAX_TOKENS: usize = 512;

/// Build an optimized inference session.
pub(crate) fn build_session(
    tool: &'static str,
    model_path: &Path,
    num_threads: usize,
) -> Result<Session> {
    info!("Loading ONNX model from {:?}", model_path);

    Session::builder()
        .map_err(|e| ClipError::collaborator(tool, format!("Failed to create session builder: {}", e)))?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .map_err(|e| ClipError::collaborator(tool, format!("Failed to set optimization level: {}", e)))?
        .with_intra_threads(num_threads)
        .map_err(|e| ClipError::collaborator(tool, format!("Failed to set thread count: {}", e)))?
        .commit_from_file(model_path)
        .map_err(|e| ClipError::collaborator(tool, format!("Failed to load model: {}", e)))
}

/// Load a tokenizer.json.
pub(crate) fn load_tokenizer(tool: &'static str, tokenizer_path: &Path) -> Result<Tokenizer> {
    info!("Loading tokenizer from {:?}", tokenizer_path);

    Tokenizer::from_file(tokenizer_path)
        .map_err(|e| ClipError::collaborator(tool, format!("Failed to load tokenizer: {}", e)))
}

struct Inner {
    /// ONNX inference session (wrapped in Mutex for interior mutability).
    session: Mutex<Session>,

    /// Tokenizer for the model.
    tokenizer: Tokenizer,

    dimension: usize,
}

/// ONNX-based embedder using all-MiniLM-L6-v2 or a compatible model.
pub struct OnnxEmbedder {
    inner: Arc<Inner>,
    model_id: String,
}

impl OnnxEmbedder {
    /// Create a new embedder from model and tokenizer paths.
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let session = build_session(TOOL, &config.model_path, config.num_threads)?;
        let tokenizer = load_tokenizer(TOOL, &config.tokenizer_path)?;

        let model_id = config
            .model_path
            .parent()
            .and_then(|p| p.file_name())
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "onnx".to_string());

        info!(
            "Embedder initialized: model={}, dim={}",
            model_id, config.dimension
        );

        Ok(Self {
            inner: Arc::new(Inner {
                session: Mutex::new(session),
                tokenizer,
                dimension: config.dimension,
            }),
            model_id,
        })
    }
}

impl Inner {
    /// Embed one text: tokenize, run, mean-pool, normalize.
    fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let encoding = self
            .tokenizer
            .encode(text, true)
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

        debug!("Embedding text: tokens={}", len);

        let input_ids_tensor = Tensor::from_array((vec![1, len], input_ids)).map_err(|e| {
            ClipError::collaborator(TOOL, format!("Failed to create input tensor: {}", e))
        })?;
        let attention_mask_tensor = Tensor::from_array((vec![1, len], attention_mask.clone()))
            .map_err(|e| {
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

        let shape: Vec<usize> = view.shape().to_vec();
        let embedding = match shape.len() {
            // (batch, seq, hidden): mean pool over attended tokens
            3 => mean_pool(&view, &attention_mask),
            // (batch, hidden): already pooled
            2 => (0..shape[1]).map(|j| view[[0, j]]).collect(),
            _ => {
                return Err(ClipError::collaborator(
                    TOOL,
                    format!("Unexpected output shape: {:?}", shape),
                ))
            }
        };

        if embedding.len() != self.dimension {
            return Err(ClipError::collaborator(
                TOOL,
                format!(
                    "model produced dimension {}, expected {}",
                    embedding.len(),
                    self.dimension
                ),
            ));
        }

        Ok(l2_normalize(embedding))
    }
}

/// Mean pooling over the sequence dimension with attention mask, batch row 0.
fn mean_pool(tensor: &ArrayViewD<'_, f32>, attention_mask: &[i64]) -> Vec<f32> {
    let shape = tensor.shape();
    let seq_len = shape[1];
    let hidden_dim = shape[2];

    let mut sum = vec![0.0f32; hidden_dim];
    let mut valid = 0usize;
    for (j, &m) in attention_mask.iter().take(seq_len).enumerate() {
        if m == 1 {
            valid += 1;
            for (k, s) in sum.iter_mut().enumerate() {
                *s += tensor[[0, j, k]];
            }
        }
    }

    if valid == 0 {
        return sum;
    }
    sum.iter().map(|s| s / valid as f32).collect()
}

#[async_trait]
impl Embedder for OnnxEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let inner = Arc::clone(&self.inner);
        let text = text.to_string();
        tokio::task::spawn_blocking(move || inner.embed_one(&text))
            .await
            .map_err(|e| ClipError::collaborator(TOOL, format!("embedding task failed: {}", e)))?
    }

    fn dimension(&self) -> usize {
        self.inner.dimension
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    #[test]
    fn test_mean_pool_ignores_padding() {
        let data = Array3::from_shape_vec(
            (1, 3, 2),
            vec![1.0, 2.0, 3.0, 4.0, 100.0, 100.0],
        )
        .unwrap()
        .into_dyn();

        let pooled = mean_pool(&data.view(), &[1, 1, 0]);
        assert_eq!(pooled, vec![2.0, 3.0]);
    }

    #[test]
    fn test_missing_model_is_collaborator_failure() {
        let dir = tempfile::tempdir().unwrap();
        let config = EmbeddingConfig {
            model_path: dir.path().join("model.onnx"),
            tokenizer_path: dir.path().join("tokenizer.json"),
            ..EmbeddingConfig::default()
        };
        let err = OnnxEmbedder::new(&config).err().unwrap();
        assert_eq!(err.error_code(), "COLLABORATOR_FAILURE");
    }
}
