use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::db::{Database, DecisionRecord};
use crate::router::{ExpertKind, QueryIntent};

#[derive(Debug, Clone, Serialize)]
pub struct ExpertStats {
    pub expert: ExpertKind,
    pub name: &'static str,
    pub total_queries: i64,
    pub positive_feedback: i64,
    pub negative_feedback: i64,
    pub satisfaction_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedbackStats {
    pub updated_at: DateTime<Utc>,
    pub experts: Vec<ExpertStats>,
    pub total_queries: i64,
    pub total_feedback: i64,
}

/// Routing decisions and user ratings, persisted so stats survive restarts.
#[derive(Clone)]
pub struct ExpertFeedback {
    db: Database,
}

impl ExpertFeedback {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Best effort: a failed write must not fail the answer it describes.
    pub async fn record_decision(
        &self,
        response_id: &str,
        expert: ExpertKind,
        intent: Option<QueryIntent>,
        question: &str,
    ) {
        let decision = DecisionRecord {
            response_id: response_id.to_string(),
            expert,
            query_intent: intent,
            question: question.to_string(),
        };
        if let Err(err) = self.db.record_decision(&decision).await {
            tracing::warn!(response_id, error = %err, "failed to record routing decision");
        }
    }

    /// `None` when the response id was never recorded.
    pub async fn record_feedback(
        &self,
        response_id: &str,
        helpful: bool,
        comment: Option<&str>,
    ) -> anyhow::Result<Option<ExpertKind>> {
        let Some(expert) = self.db.decision_expert(response_id).await? else {
            return Ok(None);
        };

        self.db
            .record_feedback(response_id, expert, helpful, comment)
            .await?;

        tracing::info!(response_id, expert = expert.as_str(), helpful, "recorded expert feedback");
        Ok(Some(expert))
    }

    pub async fn stats(&self) -> anyhow::Result<FeedbackStats> {
        let mut experts = Vec::with_capacity(ExpertKind::ALL.len());
        for kind in ExpertKind::ALL {
            let counts = self.db.expert_counts(kind).await?;
            experts.push(ExpertStats {
                expert: kind,
                name: kind.profile().name,
                total_queries: counts.total_queries,
                positive_feedback: counts.positive_feedback,
                negative_feedback: counts.negative_feedback,
                satisfaction_rate: satisfaction_rate(
                    counts.positive_feedback,
                    counts.negative_feedback,
                ),
            });
        }

        Ok(FeedbackStats {
            updated_at: Utc::now(),
            total_queries: experts.iter().map(|e| e.total_queries).sum(),
            total_feedback: experts
                .iter()
                .map(|e| e.positive_feedback + e.negative_feedback)
                .sum(),
            experts,
        })
    }
}

/// Share of helpful ratings; 0.5 until any rating exists.
fn satisfaction_rate(positive: i64, negative: i64) -> f64 {
    let total = positive + negative;
    if total == 0 {
        0.5
    } else {
        positive as f64 / total as f64
    }
}
