//! Local reranking of vector hits. The relevance score blends normalized
//! similarity with a content-length signal:
//! `0.7 * (1 - distance) + 0.3 * min(1, len/500)`, clamped to [0, 1].
//! Distance is cosine distance from the SurrealDB backend, so it lies in
//! [0, 2]; backends with a different distance range need the normalization
//! adapted here.

use common::storage::vector::{ChunkMetadata, VectorHit};
use serde::{Deserialize, Serialize};

/// Characters of text considered "full" for the length signal.
const IDEAL_CHUNK_CHARS: f32 = 500.0;
const SIMILARITY_WEIGHT: f32 = 0.7;
const LENGTH_WEIGHT: f32 = 0.3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedChunk {
    pub text: String,
    pub relevance: f32,
    pub similarity: f32,
    pub distance: f32,
    pub text_length: usize,
    pub metadata: ChunkMetadata,
}

impl RankedChunk {
    pub fn chunk_id(&self) -> String {
        format!("{}_chunk_{}", self.metadata.doc_id, self.metadata.chunk_index)
    }
}

pub fn rerank_hits(hits: Vec<VectorHit>) -> Vec<RankedChunk> {
    let mut ranked: Vec<RankedChunk> = hits
        .into_iter()
        .map(|hit| {
            let text_length = hit.text.chars().count();
            let similarity = (1.0 - hit.distance).max(0.0);
            let length_score = (text_length as f32 / IDEAL_CHUNK_CHARS).min(1.0);
            let relevance = (SIMILARITY_WEIGHT * similarity + LENGTH_WEIGHT * length_score)
                .clamp(0.0, 1.0);

            RankedChunk {
                text: hit.text,
                relevance,
                similarity,
                distance: hit.distance,
                text_length,
                metadata: hit.metadata,
            }
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.relevance
            .partial_cmp(&a.relevance)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_id().cmp(&b.chunk_id()))
    });

    ranked
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(doc_id: &str, index: usize, distance: f32, text: &str) -> VectorHit {
        VectorHit {
            text: text.to_string(),
            distance,
            metadata: ChunkMetadata {
                doc_id: doc_id.to_string(),
                chunk_index: index,
                ingestion_date: "2026-01-01T00:00:00Z".to_string(),
                rbac_namespace: "general".to_string(),
                tags: Vec::new(),
                embedding_model: "test".to_string(),
            },
        }
    }

    #[test]
    fn empty_input_reranks_to_empty() {
        assert!(rerank_hits(Vec::new()).is_empty());
    }

    #[test]
    fn closer_hits_rank_higher_at_equal_length() {
        let text = "t".repeat(500);
        let ranked = rerank_hits(vec![
            hit("far", 0, 0.8, &text),
            hit("near", 0, 0.1, &text),
        ]);

        assert_eq!(ranked[0].metadata.doc_id, "near");
        assert!(ranked[0].relevance > ranked[1].relevance);
    }

    #[test]
    fn length_signal_breaks_similarity_ties() {
        let ranked = rerank_hits(vec![
            hit("short", 0, 0.2, "tiny"),
            hit("long", 0, 0.2, &"x".repeat(600)),
        ]);

        assert_eq!(ranked[0].metadata.doc_id, "long");
    }

    #[test]
    fn relevance_follows_the_blend_formula() {
        let ranked = rerank_hits(vec![hit("d", 0, 0.5, &"y".repeat(250))]);

        // 0.7 * 0.5 + 0.3 * 0.5 = 0.5
        assert!((ranked[0].relevance - 0.5).abs() < 1e-6);
        assert!((ranked[0].similarity - 0.5).abs() < 1e-6);
    }

    #[test]
    fn scores_clamp_for_far_distances() {
        // Cosine distance can reach 2.0 for opposite vectors.
        let ranked = rerank_hits(vec![hit("opposite", 0, 2.0, "text here")]);

        assert!((ranked[0].similarity - 0.0).abs() < 1e-6);
        assert!(ranked[0].relevance >= 0.0 && ranked[0].relevance <= 1.0);
    }
}
