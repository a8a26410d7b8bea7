//! Embeddings: OpenAI `/v1/embeddings` to upstream `batchEmbedContents` and back.

use super::gemini_types::{BatchEmbedRequest, BatchEmbedResponse, Content, EmbedContentRequest, Part};
use super::openai_types::{EmbeddingData, EmbeddingsRequest, EmbeddingsResponse};

pub const DEFAULT_EMBEDDING_MODEL: &str = "gemini-embedding-001";

/// Upstream model path (`models/<name>`) for an embeddings request.
pub fn embedding_model(requested: Option<&str>) -> String {
    match requested {
        Some(m) if m.starts_with("models/") => m.to_string(),
        Some(m) if m.starts_with("gemini-") => format!("models/{m}"),
        _ => format!("models/{DEFAULT_EMBEDDING_MODEL}"),
    }
}

pub fn openai_to_gemini(req: &EmbeddingsRequest, model: &str) -> BatchEmbedRequest {
    let requests = req
        .input
        .to_vec()
        .into_iter()
        .map(|text| EmbedContentRequest {
            model: model.to_string(),
            content: Content {
                role: None,
                parts: vec![Part::text(text)],
            },
            output_dimensionality: req.dimensions,
        })
        .collect();

    BatchEmbedRequest { requests }
}

pub fn gemini_to_openai(resp: BatchEmbedResponse, model: &str) -> EmbeddingsResponse {
    let data = resp
        .embeddings
        .into_iter()
        .enumerate()
        .map(|(index, e)| EmbeddingData {
            object: "embedding".to_string(),
            index,
            embedding: e.values,
        })
        .collect();

    EmbeddingsResponse {
        object: "list".to_string(),
        data,
        model: model.to_string(),
    }
}
