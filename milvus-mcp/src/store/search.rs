//! Scoring, term selection and rank fusion for the local store

use crate::search::{normalize_bm25_score, Metric, Ranker};
use serde_json::Value;
use std::collections::HashMap;

/// Entity id paired with its score
pub(crate) type Scored = (i64, f64);

/// Read a dense vector stored as a JSON array
pub(crate) fn vector_of(value: &Value) -> Option<Vec<f32>> {
    value
        .as_array()?
        .iter()
        .map(|v| v.as_f64().map(|f| f as f32))
        .collect()
}

/// Score a candidate against a query vector
///
/// COSINE and IP are similarities; L2 is the squared euclidean distance.
pub(crate) fn score(metric: Metric, query: &[f32], candidate: &[f32]) -> f64 {
    let pairs = query.iter().zip(candidate).map(|(a, b)| (f64::from(*a), f64::from(*b)));
    match metric {
        Metric::Ip => pairs.map(|(a, b)| a * b).sum(),
        Metric::L2 => pairs.map(|(a, b)| (a - b) * (a - b)).sum(),
        Metric::Cosine => {
            let (mut dot, mut qq, mut cc) = (0.0, 0.0, 0.0);
            for (a, b) in pairs {
                dot += a * b;
                qq += a * a;
                cc += b * b;
            }
            if qq == 0.0 || cc == 0.0 {
                0.0
            } else {
                dot / (qq.sqrt() * cc.sqrt())
            }
        }
    }
}

/// Order best-first for the metric; ties keep their input order
pub(crate) fn rank(scored: &mut [Scored], metric: Metric) {
    if metric.higher_is_better() {
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
    } else {
        scored.sort_by(|a, b| a.1.total_cmp(&b.1));
    }
}

/// Lowercased word terms of a text query, deduplicated in first-seen order
pub(crate) fn query_terms(text: &str) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    for word in text.split(|c: char| !c.is_alphanumeric()) {
        if word.is_empty() {
            continue;
        }
        let term = word.to_lowercase();
        if !terms.contains(&term) {
            terms.push(term);
        }
    }
    terms
}

/// Drop the lowest-weight fraction of query terms
///
/// Terms are weighted by inverse document frequency. At least one term is
/// always kept and the survivors stay in query order.
pub(crate) fn drop_terms(
    terms: Vec<(String, u64)>,
    total_docs: u64,
    drop_ratio: f64,
) -> Vec<String> {
    let drop = ((terms.len() as f64) * drop_ratio).floor() as usize;
    let drop = drop.min(terms.len().saturating_sub(1));
    if drop == 0 {
        return terms.into_iter().map(|(t, _)| t).collect();
    }

    let idf = |df: u64| {
        let n = total_docs as f64;
        let df = df as f64;
        (1.0 + (n - df + 0.5) / (df + 0.5)).ln()
    };

    let mut by_weight: Vec<usize> = (0..terms.len()).collect();
    by_weight.sort_by(|a, b| idf(terms[*a].1).total_cmp(&idf(terms[*b].1)));
    let dropped: Vec<usize> = by_weight.into_iter().take(drop).collect();

    terms
        .into_iter()
        .enumerate()
        .filter(|(i, _)| !dropped.contains(i))
        .map(|(_, (t, _))| t)
        .collect()
}

/// FTS5 query matching any of the terms
pub(crate) fn match_any(terms: &[String]) -> String {
    terms
        .iter()
        .map(|t| format!("\"{}\"", t.replace('"', "")))
        .collect::<Vec<_>>()
        .join(" OR ")
}

/// Fuse a dense and a BM25 result list into one ranking
///
/// Both lists must already be ordered best-first. Equal fused scores keep
/// the order in which entities first appear, dense list first.
pub(crate) fn fuse(
    dense: &[Scored],
    dense_metric: Metric,
    sparse: &[Scored],
    ranker: Ranker,
    limit: usize,
) -> Vec<Scored> {
    let mut order: Vec<i64> = Vec::new();
    let mut fused: HashMap<i64, f64> = HashMap::new();

    let mut add = |id: i64, contribution: f64| {
        let entry = fused.entry(id).or_insert_with(|| {
            order.push(id);
            0.0
        });
        *entry += contribution;
    };

    match ranker {
        Ranker::Rrf { k } => {
            let k = f64::from(k);
            for (rank, (id, _)) in dense.iter().enumerate() {
                add(*id, 1.0 / (k + rank as f64 + 1.0));
            }
            for (rank, (id, _)) in sparse.iter().enumerate() {
                add(*id, 1.0 / (k + rank as f64 + 1.0));
            }
        }
        Ranker::Weighted {
            dense: dense_weight,
            sparse: sparse_weight,
        } => {
            for (id, score) in dense {
                add(*id, dense_weight * dense_metric.normalize(*score));
            }
            for (id, score) in sparse {
                add(*id, sparse_weight * normalize_bm25_score(*score));
            }
        }
    }

    let mut ranked: Vec<Scored> = order
        .into_iter()
        .map(|id| (id, fused.get(&id).copied().unwrap_or(0.0)))
        .collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    ranked.truncate(limit);
    ranked
}
