/// Candidate scoring and ordering
use crate::infer::ItemEmbedding;
use clip_embeddings_backend::SimilarityMetric;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use thiserror::Error;

/// Upper bound on concurrent scoring tasks
const MAX_SCORING_FANOUT: usize = 32;

/// One scored candidate
#[derive(Debug, Clone)]
pub struct Rank {
    /// Position of the candidate in the request
    pub index: usize,
    pub score: f32,
}

#[derive(Debug, Error, Clone)]
pub enum RankError {
    #[error("query failed to embed: {0}")]
    Query(String),
    #[error("candidate {index} failed to embed: {reason}")]
    Candidate { index: usize, reason: String },
}

/// Score every candidate against the query and order them, best first.
///
/// A failed candidate fails the whole call: a ranking with holes would be
/// smaller than the requested set. Ties keep the original candidate order so
/// repeated calls stay deterministic.
pub(crate) async fn rank_candidates(
    metric: SimilarityMetric,
    query: Vec<f32>,
    candidates: Vec<ItemEmbedding>,
) -> Result<Vec<Rank>, RankError> {
    let mut embeddings = Vec::with_capacity(candidates.len());
    for (index, candidate) in candidates.into_iter().enumerate() {
        match candidate {
            Ok(embedding) => embeddings.push(embedding),
            Err(err) => {
                return Err(RankError::Candidate {
                    index,
                    reason: err.to_string(),
                })
            }
        }
    }

    let query = Arc::new(query);
    let mut ranks: Vec<Rank> = stream::iter(embeddings.into_iter().enumerate())
        .map(|(index, embedding)| {
            let query = query.clone();
            async move {
                Rank {
                    index,
                    score: similarity(metric, &query, &embedding),
                }
            }
        })
        .buffer_unordered(MAX_SCORING_FANOUT)
        .collect()
        .await;

    // Completion order is arbitrary; restore candidate order first so the
    // stable descending sort breaks ties on it
    ranks.sort_by_key(|rank| rank.index);
    ranks.sort_by(|a, b| b.score.total_cmp(&a.score));

    Ok(ranks)
}

/// Map the backend's native metric onto a score where higher means more
/// similar
pub fn similarity(metric: SimilarityMetric, a: &[f32], b: &[f32]) -> f32 {
    match metric {
        SimilarityMetric::Cosine => {
            let norms = norm(a) * norm(b);
            if norms == 0.0 {
                0.0
            } else {
                dot(a, b) / norms
            }
        }
        SimilarityMetric::InnerProduct => dot(a, b),
        SimilarityMetric::Euclidean => {
            let squared: f32 = a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum();
            -squared.sqrt()
        }
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn norm(a: &[f32]) -> f32 {
    dot(a, a).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity() {
        let a = vec![1.0, 0.0];
        let b = vec![1.0, 0.0];
        let c = vec![0.0, 1.0];
        let d = vec![-1.0, 0.0];

        assert!((similarity(SimilarityMetric::Cosine, &a, &b) - 1.0).abs() < 1e-6);
        assert!(similarity(SimilarityMetric::Cosine, &a, &c).abs() < 1e-6);
        assert!((similarity(SimilarityMetric::Cosine, &a, &d) + 1.0).abs() < 1e-6);

        // Scale invariance
        let scaled = vec![7.5, 0.0];
        assert!((similarity(SimilarityMetric::Cosine, &a, &scaled) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_zero_norm() {
        let zero = vec![0.0, 0.0];
        let a = vec![1.0, 0.0];
        assert_eq!(similarity(SimilarityMetric::Cosine, &zero, &a), 0.0);
    }

    #[test]
    fn test_euclidean_orders_like_cosine_on_unit_vectors() {
        // On normalized embeddings both metrics must produce the same order
        let query = vec![1.0, 0.0];
        let near = vec![0.8, 0.6];
        let far = vec![0.0, 1.0];

        let cos_near = similarity(SimilarityMetric::Cosine, &query, &near);
        let cos_far = similarity(SimilarityMetric::Cosine, &query, &far);
        let euc_near = similarity(SimilarityMetric::Euclidean, &query, &near);
        let euc_far = similarity(SimilarityMetric::Euclidean, &query, &far);

        assert!(cos_near > cos_far);
        assert!(euc_near > euc_far);
    }

    #[tokio::test]
    async fn test_rank_candidates_sorted_descending() {
        let query = vec![1.0, 0.0];
        let candidates: Vec<ItemEmbedding> = vec![
            Ok(vec![0.0, 1.0]),
            Ok(vec![1.0, 0.0]),
            Ok(vec![0.7, 0.7]),
        ];

        let ranks = rank_candidates(SimilarityMetric::Cosine, query, candidates)
            .await
            .unwrap();

        assert_eq!(ranks.len(), 3);
        assert_eq!(ranks[0].index, 1);
        assert_eq!(ranks[1].index, 2);
        assert_eq!(ranks[2].index, 0);
        assert!(ranks[0].score >= ranks[1].score);
        assert!(ranks[1].score >= ranks[2].score);
    }

    #[tokio::test]
    async fn test_rank_candidates_stable_ties() {
        let query = vec![1.0, 0.0];
        // Identical candidates score identically; order must follow the request
        let candidates: Vec<ItemEmbedding> = vec![
            Ok(vec![0.5, 0.5]),
            Ok(vec![0.5, 0.5]),
            Ok(vec![0.5, 0.5]),
        ];

        let ranks = rank_candidates(SimilarityMetric::Cosine, query, candidates)
            .await
            .unwrap();

        let indices: Vec<usize> = ranks.iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_rank_candidates_failed_candidate() {
        use crate::infer::ItemError;

        let query = vec![1.0, 0.0];
        let candidates: Vec<ItemEmbedding> = vec![
            Ok(vec![0.0, 1.0]),
            Err(ItemError::Decode("bad image".to_string())),
        ];

        let err = rank_candidates(SimilarityMetric::Cosine, query, candidates)
            .await
            .unwrap_err();

        match err {
            RankError::Candidate { index, .. } => assert_eq!(index, 1),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
