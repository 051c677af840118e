use std::sync::Arc;
use std::time::Instant;

use uuid::Uuid;

use crate::error::{GloveboxError, Result};
use crate::feedback::ExpertFeedback;
use crate::models::{
    AskRequest, AskResponse, ChatMessage, ChatRequest, ChatResponse, DocumentType, RetrievalHit,
    Role, SearchPassage, SearchRequest, SearchResponse,
};
use crate::page_images::{extract_key_terms, with_highlight};
use crate::retrieval::Retriever;
use crate::router::{ExpertKind, ExpertRouter};
use crate::session::SessionStore;
use crate::synthesizer::AnswerSynthesizer;

const MAX_SEARCH_LIMIT: usize = 20;

#[derive(Clone)]
pub struct ChatService {
    retriever: Retriever,
    router: Arc<dyn ExpertRouter>,
    synthesizer: AnswerSynthesizer,
    sessions: SessionStore,
    feedback: ExpertFeedback,
    default_k: usize,
}

impl ChatService {
    pub fn new(
        retriever: Retriever,
        router: Arc<dyn ExpertRouter>,
        synthesizer: AnswerSynthesizer,
        sessions: SessionStore,
        feedback: ExpertFeedback,
        default_k: usize,
    ) -> Self {
        Self {
            retriever,
            router,
            synthesizer,
            sessions,
            feedback,
            default_k: default_k.max(1),
        }
    }

    pub fn model_id(&self) -> &str {
        self.synthesizer.model_id()
    }

    pub fn feedback(&self) -> &ExpertFeedback {
        &self.feedback
    }

    /// Ranked passages without generation. Retrieval failures come back as
    /// an empty, degraded result.
    pub async fn search(&self, request: SearchRequest) -> Result<SearchResponse> {
        let query = request.query.trim();
        if query.is_empty() {
            return Err(GloveboxError::InvalidInput("query must not be empty".to_string()));
        }
        let limit = request.limit.clamp(1, MAX_SEARCH_LIMIT);

        let (hits, degraded) = self.retrieve_hits(query, limit, request.document_type).await;
        let results = hits
            .into_iter()
            .map(|hit| SearchPassage {
                document_name: hit.chunk.document_name,
                page_number: hit.chunk.page_number,
                chapter: hit.chunk.chapter,
                section: hit.chunk.section,
                score: hit.score,
                content: hit.chunk.content,
            })
            .collect();

        Ok(SearchResponse { results, degraded })
    }

    /// Single-turn question. Only empty input is an error; every other
    /// failure ends in a grounded answer or the apology.
    pub async fn ask(&self, request: AskRequest) -> Result<AskResponse> {
        let started = Instant::now();
        let question = request.question.trim();
        if question.is_empty() {
            return Err(GloveboxError::InvalidInput("question must not be empty".to_string()));
        }

        let profile = self.router.classify(question);
        let (hits, _) = self
            .retrieve_hits(question, self.default_k, request.document_type)
            .await;
        let answer = self.synthesizer.answer(question, &hits, &[], profile).await;

        let key_terms = if answer.generated {
            extract_key_terms(&answer.text)
        } else {
            vec![]
        };
        let sources = answer
            .sources
            .into_iter()
            .map(|source| with_highlight(source, &key_terms))
            .collect();

        let response_id = Uuid::new_v4().to_string();
        self.feedback
            .record_decision(&response_id, profile.kind, None, question)
            .await;

        tracing::info!(
            expert = profile.kind.as_str(),
            hits = hits.len(),
            generated = answer.generated,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "ask complete"
        );

        Ok(AskResponse {
            answer: answer.text,
            sources,
            key_terms,
            model: answer.model,
            expert: profile.kind,
            response_id,
        })
    }

    /// Multi-turn chat. The last message must be a non-empty user turn.
    /// History comes from the session store when it is reachable, otherwise
    /// from the earlier messages the client sent.
    pub async fn chat(&self, request: ChatRequest) -> Result<ChatResponse> {
        let started = Instant::now();
        let Some((last, earlier)) = request.messages.split_last() else {
            return Err(GloveboxError::InvalidInput("messages must not be empty".to_string()));
        };
        let question = last.content.trim();
        if last.role != Role::User || question.is_empty() {
            return Err(GloveboxError::InvalidInput(
                "last message must be a non-empty user message".to_string(),
            ));
        }

        let intent = self.router.intent(question);
        let profile = if intent.needs_retrieval() {
            self.router.classify(question)
        } else {
            ExpertKind::General.profile()
        };

        let (history, mut stateful) = self.load_history(request.session_id.as_deref()).await;
        let history = if history.is_empty() {
            earlier.to_vec()
        } else {
            history
        };

        let hits = if intent.needs_retrieval() {
            self.retrieve_hits(question, self.default_k, None).await.0
        } else {
            vec![]
        };

        let answer = self
            .synthesizer
            .answer(question, &hits, &history, profile)
            .await;

        let mut session_id = request.session_id.clone();
        if stateful && answer.generated {
            match self
                .persist_turn(session_id.as_deref(), question, &answer.text, &answer.sources)
                .await
            {
                Ok(id) => session_id = Some(id),
                Err(err) => {
                    tracing::warn!(phase = "session", error = %err, "session write failed; continuing stateless");
                    stateful = false;
                }
            }
        }

        let response_id = Uuid::new_v4().to_string();
        self.feedback
            .record_decision(&response_id, profile.kind, Some(intent), question)
            .await;

        tracing::info!(
            intent = intent.as_str(),
            expert = profile.kind.as_str(),
            hits = hits.len(),
            history = history.len(),
            stateful,
            generated = answer.generated,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "chat turn complete"
        );

        Ok(ChatResponse {
            message: answer.text,
            sources: answer.sources,
            session_id,
            model: answer.model,
            query_intent: intent,
            expert: profile.kind,
            response_id,
        })
    }

    pub async fn clear_session(&self, session_id: &str) -> Result<bool> {
        self.sessions.clear(session_id).await
    }

    async fn retrieve_hits(
        &self,
        query: &str,
        k: usize,
        document_type: Option<DocumentType>,
    ) -> (Vec<RetrievalHit>, bool) {
        match self.retriever.retrieve(query, k, document_type).await {
            Ok(result) => {
                if let Some(reason) = &result.degraded {
                    tracing::warn!(phase = "retrieval", reason = %reason, "serving degraded retrieval");
                }
                let degraded = result.is_degraded();
                (result.hits, degraded)
            }
            Err(err) => {
                tracing::error!(
                    phase = "retrieval",
                    timed_out = err.is_timeout(),
                    error = %err,
                    "retrieval failed; answering without documents"
                );
                (vec![], true)
            }
        }
    }

    /// Returns `(history, stateful)`; `stateful` is false when the store failed.
    async fn load_history(&self, session_id: Option<&str>) -> (Vec<ChatMessage>, bool) {
        let Some(session_id) = session_id else {
            return (vec![], true);
        };
        match self.sessions.history(session_id).await {
            Ok(history) => (history, true),
            Err(err) => {
                tracing::warn!(phase = "session", error = %err, "session read failed; continuing stateless");
                (vec![], false)
            }
        }
    }

    async fn persist_turn(
        &self,
        session_id: Option<&str>,
        question: &str,
        answer: &str,
        sources: &[crate::models::SourceReference],
    ) -> Result<String> {
        let id = self
            .sessions
            .append(session_id, &ChatMessage::user(question))
            .await?;
        self.sessions
            .append(Some(&id), &ChatMessage::assistant(answer, sources.to_vec()))
            .await
    }
}
