use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;

use crate::config::RetrievalConfig;
use crate::embedder::Embedder;
use crate::error::{bounded, GloveboxError, Result};
use crate::models::{DocumentType, RetrievalHit, RetrievalResult};
use crate::page_images::PageImages;
use crate::vector_store::{rank_order, QueryFilter, ScoredChunk, VectorStore};

const TOC_MARKERS: &[&str] = &["pictorial index", "table of contents", "alphabetical index"];

const KEYWORD_STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "been", "by", "can", "could", "did", "do", "does",
    "for", "from", "had", "has", "have", "how", "i", "in", "is", "it", "may", "my", "of", "on",
    "or", "our", "should", "that", "the", "their", "these", "this", "those", "to", "was", "we",
    "were", "what", "when", "where", "which", "will", "with", "would", "you", "your",
];

/// How candidates are thresholded and ranked. The similarity floor applies
/// to the raw cosine score; ranking uses the weighted blend with keyword overlap.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scoring {
    pub min_similarity: f32,
    pub semantic_weight: f32,
    pub keyword_weight: f32,
}

impl Scoring {
    pub fn from_config(config: &RetrievalConfig) -> Self {
        Self {
            min_similarity: config.min_similarity,
            semantic_weight: config.semantic_weight.max(0.0),
            keyword_weight: config.keyword_weight.max(0.0),
        }
    }

    pub fn semantic_only(min_similarity: f32) -> Self {
        Self {
            min_similarity,
            semantic_weight: 1.0,
            keyword_weight: 0.0,
        }
    }

    fn blend(&self, semantic: f32, keyword: f32) -> f32 {
        self.semantic_weight * semantic + self.keyword_weight * keyword
    }
}

fn keyword_set(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(str::to_lowercase)
        .filter(|word| !KEYWORD_STOPWORDS.contains(&word.as_str()))
        .collect()
}

/// Share of the query's content words that also appear in `content`, in `[0, 1]`.
pub fn keyword_score(query: &str, content: &str) -> f32 {
    let query_words = keyword_set(query);
    if query_words.is_empty() {
        return 0.0;
    }
    let content_words = keyword_set(content);
    let matched = query_words.intersection(&content_words).count();
    matched as f32 / query_words.len() as f32
}

/// Recognizes table-of-contents and index pages: dense in page references,
/// thin on content, and otherwise over-represented in keyword-heavy queries.
pub struct TocDetector {
    page_refs: Vec<Regex>,
}

impl TocDetector {
    pub fn new() -> Self {
        Self {
            page_refs: [r"(?:→\s*)?P\.\s*\d+", r"\.{3,}\s*\d+"]
                .iter()
                .filter_map(|pattern| Regex::new(pattern).ok())
                .collect(),
        }
    }

    pub fn is_toc_or_index(&self, content: &str) -> bool {
        let refs: usize = self
            .page_refs
            .iter()
            .map(|re| re.find_iter(content).count())
            .sum();
        let words = content.split_whitespace().count();
        if words > 0 && refs >= 4 && refs as f32 / words as f32 > 0.03 {
            return true;
        }

        let lower = content.to_lowercase();
        TOC_MARKERS.iter().any(|marker| lower.contains(marker))
    }
}

impl Default for TocDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct Retriever {
    store: VectorStore,
    embedder: Arc<dyn Embedder>,
    pages: PageImages,
    toc: Arc<TocDetector>,
    oversample: usize,
    scoring: Scoring,
    embed_timeout: Duration,
}

impl Retriever {
    pub fn new(
        store: VectorStore,
        embedder: Arc<dyn Embedder>,
        pages: PageImages,
        oversample: usize,
        scoring: Scoring,
        embed_timeout: Duration,
    ) -> Self {
        Self {
            store,
            embedder,
            pages,
            toc: Arc::new(TocDetector::new()),
            oversample: oversample.max(1),
            scoring,
            embed_timeout,
        }
    }

    /// Top `k` passages for `query`, at most one per page unless fewer
    /// distinct pages qualify. Embedding failures are returned; backend
    /// failures come back as a degraded (possibly empty) result.
    pub async fn retrieve(
        &self,
        query: &str,
        k: usize,
        document_type: Option<DocumentType>,
    ) -> Result<RetrievalResult> {
        if k == 0 {
            return Ok(RetrievalResult::empty(k));
        }

        let query_vector = bounded(
            "embedding",
            self.embed_timeout,
            self.embedder.embed(query),
        )
        .await
        .map_err(|err| match err {
            GloveboxError::Timeout { .. } => err,
            other => GloveboxError::Retrieval(format!("query embedding failed: {other}")),
        })?;

        let filter = QueryFilter {
            document_type,
            min_score: Some(self.scoring.min_similarity),
        };
        let (candidates, degraded) = self
            .store
            .query(&query_vector, k.saturating_mul(self.oversample), &filter)
            .await
            .into_parts();
        let candidate_count = candidates.len();

        let hits: Vec<RetrievalHit> =
            select_hits(candidates, query, k, &self.scoring, &self.toc)
                .into_iter()
                .map(|scored| RetrievalHit {
                    source: self.pages.resolve(&scored.chunk, scored.score),
                    score: scored.score,
                    chunk: scored.chunk,
                })
                .collect();

        tracing::debug!(
            k,
            candidates = candidate_count,
            selected = hits.len(),
            degraded = degraded.is_some(),
            "retrieval complete"
        );

        Ok(RetrievalResult {
            hits,
            query_vector,
            k,
            degraded,
        })
    }
}

/// Thresholds on similarity, drops TOC/index pages, re-scores with the
/// keyword blend, ranks, then prefers unseen (document, page) pairs before
/// filling with same-page hits.
pub fn select_hits(
    candidates: Vec<ScoredChunk>,
    query: &str,
    k: usize,
    scoring: &Scoring,
    toc: &TocDetector,
) -> Vec<ScoredChunk> {
    let mut ranked: Vec<ScoredChunk> = candidates
        .into_iter()
        .filter(|c| c.score >= scoring.min_similarity && !toc.is_toc_or_index(&c.chunk.content))
        .map(|mut c| {
            c.score = scoring.blend(c.score, keyword_score(query, &c.chunk.content));
            c
        })
        .collect();
    ranked.sort_by(rank_order);

    let mut seen_pages = HashSet::new();
    let mut picked = Vec::with_capacity(k);
    let mut skipped = Vec::new();

    for candidate in ranked {
        if picked.len() >= k {
            break;
        }
        let page_key = (
            candidate.chunk.document_name.clone(),
            candidate.chunk.page_number,
            // Unpaged chunks never collide with each other.
            candidate
                .chunk
                .page_number
                .is_none()
                .then_some(candidate.chunk.chunk_index),
        );
        if seen_pages.insert(page_key) {
            picked.push(candidate);
        } else {
            skipped.push(candidate);
        }
    }

    if picked.len() < k {
        let missing = k - picked.len();
        picked.extend(skipped.into_iter().take(missing));
        picked.sort_by(rank_order);
    }

    picked
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::db::test_support::temp_database;
    use crate::embedder::HashingEmbedder;
    use crate::models::DocumentChunk;
    use crate::vector_store::SqliteVectorBackend;

    fn scored(document: &str, index: i64, page: Option<i64>, score: f32, content: &str) -> ScoredChunk {
        ScoredChunk {
            chunk: DocumentChunk {
                document_name: document.to_string(),
                document_type: DocumentType::Manual,
                chunk_index: index,
                content: content.to_string(),
                page_number: page,
                token_count: 10,
                chapter: None,
                section: None,
                topics: vec![],
                embedding: vec![],
                created_at: Utc::now(),
            },
            score,
        }
    }

    #[test]
    fn prefers_distinct_pages_and_keeps_scores_non_increasing() {
        let toc = TocDetector::new();
        let candidates = vec![
            scored("m.pdf", 0, Some(1), 0.9, "a"),
            scored("m.pdf", 1, Some(1), 0.85, "b"),
            scored("m.pdf", 2, Some(2), 0.6, "c"),
            scored("m.pdf", 3, Some(3), 0.5, "d"),
        ];

        let hits = select_hits(candidates, "", 3, &Scoring::semantic_only(0.2), &toc);
        let pages: Vec<_> = hits.iter().map(|h| h.chunk.page_number).collect();
        assert_eq!(pages, vec![Some(1), Some(2), Some(3)]);
        assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn fills_with_same_page_hits_when_pages_run_out() {
        let toc = TocDetector::new();
        let candidates = vec![
            scored("m.pdf", 0, Some(1), 0.9, "a"),
            scored("m.pdf", 1, Some(1), 0.8, "b"),
            scored("m.pdf", 2, Some(2), 0.7, "c"),
        ];

        let hits = select_hits(candidates, "", 3, &Scoring::semantic_only(0.2), &toc);
        let indices: Vec<_> = hits.iter().map(|h| h.chunk.chunk_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn ties_break_on_chunk_index_then_document_name() {
        let toc = TocDetector::new();
        let candidates = vec![
            scored("b.pdf", 4, Some(9), 0.5, "x"),
            scored("a.pdf", 4, Some(8), 0.5, "y"),
            scored("c.pdf", 2, Some(7), 0.5, "z"),
        ];

        let hits = select_hits(candidates.clone(), "", 3, &Scoring::semantic_only(0.0), &toc);
        let order: Vec<_> = hits
            .iter()
            .map(|h| (h.chunk.document_name.as_str(), h.chunk.chunk_index))
            .collect();
        assert_eq!(order, vec![("c.pdf", 2), ("a.pdf", 4), ("b.pdf", 4)]);

        let reversed: Vec<_> = candidates.into_iter().rev().collect();
        let again = select_hits(reversed, "", 3, &Scoring::semantic_only(0.0), &toc);
        assert_eq!(
            again.iter().map(|h| h.chunk.chunk_index).collect::<Vec<_>>(),
            hits.iter().map(|h| h.chunk.chunk_index).collect::<Vec<_>>()
        );
    }

    #[test]
    fn drops_low_scores_and_index_pages() {
        let toc = TocDetector::new();
        let index_page = "Brake fluid P. 412 Brake pads P. 415 Brake lights P. 420 Brakes P. 300";
        let candidates = vec![
            scored("m.pdf", 0, Some(1), 0.95, index_page),
            scored("m.pdf", 1, Some(2), 0.9, "Table of Contents 1 Safety ...... 12"),
            scored("m.pdf", 2, Some(3), 0.1, "weak"),
            scored("m.pdf", 3, Some(4), 0.6, "Check the brake fluid level monthly."),
        ];

        let hits = select_hits(candidates, "", 3, &Scoring::semantic_only(0.2), &toc);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk.chunk_index, 3);
    }

    #[test]
    fn unpaged_chunks_are_not_collapsed() {
        let toc = TocDetector::new();
        let candidates = vec![
            scored("m.pdf", 0, None, 0.9, "a"),
            scored("m.pdf", 1, None, 0.8, "b"),
        ];
        assert_eq!(select_hits(candidates, "", 2, &Scoring::semantic_only(0.0), &toc).len(), 2);
    }

    #[test]
    fn keyword_score_counts_shared_content_words() {
        let score = keyword_score("How do I check the brake fluid?", "Brake fluid reservoir, MIN and MAX");
        assert!((score - 2.0 / 3.0).abs() < 1e-6);
        assert_eq!(keyword_score("the of", "the of"), 0.0);
        assert_eq!(keyword_score("towing capacity", "Rotate the tires"), 0.0);
    }

    #[test]
    fn exact_term_match_outranks_a_near_tie() {
        let toc = TocDetector::new();
        let candidates = vec![
            scored("m.pdf", 0, Some(1), 0.62, "Rotate the tires every 5,000 miles."),
            scored("m.pdf", 1, Some(2), 0.60, "Towing capacity is 5,000 lb with the tow package."),
        ];
        let hybrid = Scoring {
            min_similarity: 0.2,
            semantic_weight: 0.7,
            keyword_weight: 0.3,
        };

        let blended = select_hits(candidates.clone(), "towing capacity", 2, &hybrid, &toc);
        assert_eq!(blended[0].chunk.chunk_index, 1);
        assert!((blended[0].score - (0.7 * 0.60 + 0.3)).abs() < 1e-5);
        assert!((blended[1].score - 0.7 * 0.62).abs() < 1e-5);

        let semantic = select_hits(candidates, "towing capacity", 2, &Scoring::semantic_only(0.2), &toc);
        assert_eq!(semantic[0].chunk.chunk_index, 0);
    }

    #[test]
    fn similarity_floor_ignores_keyword_overlap() {
        let toc = TocDetector::new();
        let candidates = vec![
            scored("m.pdf", 0, Some(1), 0.15, "towing capacity"),
            scored("m.pdf", 1, Some(2), 0.25, "unrelated words"),
        ];
        let hybrid = Scoring {
            min_similarity: 0.2,
            semantic_weight: 0.7,
            keyword_weight: 0.3,
        };

        let hits = select_hits(candidates, "towing capacity", 3, &hybrid, &toc);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk.chunk_index, 1);
    }

    enum BrokenEmbedder {
        Stalls,
        Fails,
    }

    #[async_trait::async_trait]
    impl Embedder for BrokenEmbedder {
        fn model_id(&self) -> &str {
            "broken"
        }

        fn dimension(&self) -> usize {
            8
        }

        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            match self {
                BrokenEmbedder::Stalls => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(vec![0.0; 8])
                }
                BrokenEmbedder::Fails => Err(GloveboxError::embedding("broken", "connection refused")),
            }
        }
    }

    fn broken_retriever(dir: &std::path::Path, db: &crate::db::Database, embedder: BrokenEmbedder) -> Retriever {
        let store = VectorStore::new(
            Arc::new(SqliteVectorBackend::new(db.pool().clone())),
            None,
            false,
            Duration::from_secs(2),
        );
        Retriever::new(
            store,
            Arc::new(embedder),
            PageImages::new(dir.join("page_images")),
            4,
            Scoring::semantic_only(0.2),
            Duration::from_millis(150),
        )
    }

    #[tokio::test]
    async fn stalled_embedder_surfaces_a_timeout() {
        let (dir, _config, db) = temp_database().await;
        let retriever = broken_retriever(dir.path(), &db, BrokenEmbedder::Stalls);

        let started = std::time::Instant::now();
        let err = retriever.retrieve("brake fluid", 3, None).await.unwrap_err();
        assert!(err.is_timeout(), "unexpected error: {err}");
        assert!(matches!(err, GloveboxError::Timeout { boundary: "embedding", .. }));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn embedder_errors_become_retrieval_failures() {
        let (dir, _config, db) = temp_database().await;
        let retriever = broken_retriever(dir.path(), &db, BrokenEmbedder::Fails);

        let err = retriever.retrieve("brake fluid", 3, None).await.unwrap_err();
        assert!(!err.is_timeout());
        match err {
            GloveboxError::Retrieval(message) => assert!(message.contains("connection refused")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn empty_store_yields_empty_result() {
        let (dir, _config, db) = temp_database().await;
        let store = VectorStore::new(
            Arc::new(SqliteVectorBackend::new(db.pool().clone())),
            None,
            false,
            Duration::from_secs(2),
        );
        let retriever = Retriever::new(
            store,
            Arc::new(HashingEmbedder::new(64)),
            PageImages::new(dir.path().join("page_images")),
            4,
            Scoring::semantic_only(0.2),
            Duration::from_secs(2),
        );

        let result = retriever.retrieve("brake fluid", 3, None).await.unwrap();
        assert!(result.hits.is_empty());
        assert!(!result.is_degraded());
        assert_eq!(result.k, 3);
        assert_eq!(result.query_vector.len(), 64);
    }
}
