use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Semaphore;

use crate::config::{AppConfig, VehicleProfile};
use crate::error::GloveboxError;
use crate::models::{ChatMessage, RetrievalHit, Role, SourceReference};
use crate::ollama::{OllamaClient, OllamaMessage};
use crate::router::ExpertProfile;

pub const APOLOGY_MESSAGE: &str =
    "I'm sorry, I couldn't generate an answer right now. Please try again in a moment.";

const ANSWER_RULES: &str = "Answer from the documentation excerpts when they are relevant and \
    cite them inline as [S1], [S2]. If the excerpts do not cover the question, say so before \
    giving general guidance. Never invent specifications, capacities or part numbers.";

#[derive(Debug, Clone, PartialEq)]
pub struct PromptMessage {
    pub role: Role,
    pub content: String,
}

/// Text generation backend. Returns the model's raw text.
#[async_trait]
pub trait AnswerModel: Send + Sync {
    fn model_id(&self) -> &str;

    async fn complete(
        &self,
        system: &str,
        messages: &[PromptMessage],
        max_tokens: usize,
    ) -> anyhow::Result<String>;
}

pub struct OllamaChatModel {
    client: OllamaClient,
    model: String,
}

impl OllamaChatModel {
    pub fn new(client: OllamaClient, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }
}

#[async_trait]
impl AnswerModel for OllamaChatModel {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        system: &str,
        messages: &[PromptMessage],
        max_tokens: usize,
    ) -> anyhow::Result<String> {
        let mut wire = Vec::with_capacity(messages.len() + 1);
        wire.push(OllamaMessage {
            role: "system",
            content: system,
        });
        wire.extend(messages.iter().map(|message| OllamaMessage {
            role: message.role.as_str(),
            content: &message.content,
        }));

        self.client.chat(&self.model, &wire, max_tokens, 0.2).await
    }
}

#[derive(Debug, Clone)]
pub struct Answer {
    pub text: String,
    pub sources: Vec<SourceReference>,
    pub model: String,
    /// False when the apology was substituted for a model answer.
    pub generated: bool,
}

#[derive(Debug, Clone)]
pub struct Prompt {
    pub system: String,
    pub messages: Vec<PromptMessage>,
    pub sources: Vec<SourceReference>,
}

#[derive(Clone)]
pub struct AnswerSynthesizer {
    model: Arc<dyn AnswerModel>,
    vehicle: VehicleProfile,
    max_context_tokens: usize,
    max_output_tokens: usize,
    history_token_budget: usize,
    timeout: Duration,
    generation_limit: Arc<Semaphore>,
}

impl AnswerSynthesizer {
    pub fn new(config: &AppConfig, model: Arc<dyn AnswerModel>, generation_limit: Arc<Semaphore>) -> Self {
        Self {
            model,
            vehicle: config.vehicle.clone(),
            max_context_tokens: config.tokens.max_context_tokens,
            max_output_tokens: config.tokens.max_output_tokens,
            history_token_budget: config.tokens.history_token_budget,
            timeout: config.timeouts.generation,
            generation_limit,
        }
    }

    pub fn model_id(&self) -> &str {
        self.model.model_id()
    }

    pub async fn answer(
        &self,
        question: &str,
        hits: &[RetrievalHit],
        history: &[ChatMessage],
        profile: &ExpertProfile,
    ) -> Answer {
        let prompt = self.build_prompt(question, hits, history, profile);
        let started = Instant::now();

        // One deadline covers queueing for a permit and the model call.
        let result = tokio::time::timeout(self.timeout, async {
            let _permit = self
                .generation_limit
                .acquire()
                .await
                .map_err(|_| anyhow::anyhow!("generation limiter closed"))?;
            self.model
                .complete(&prompt.system, &prompt.messages, self.max_output_tokens)
                .await
        })
        .await;

        let failure = match result {
            Ok(Ok(text)) if !text.trim().is_empty() => {
                tracing::info!(
                    expert = profile.kind.as_str(),
                    sources = prompt.sources.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "generated answer"
                );
                return Answer {
                    text,
                    sources: prompt.sources,
                    model: self.model_id().to_string(),
                    generated: true,
                };
            }
            Ok(Ok(_)) => GloveboxError::Generation("model returned empty text".to_string()),
            Ok(Err(err)) => GloveboxError::Generation(format!("{err:#}")),
            Err(_) => GloveboxError::Timeout {
                boundary: "generation",
                millis: self.timeout.as_millis() as u64,
            },
        };

        tracing::error!(
            phase = "generation",
            expert = profile.kind.as_str(),
            model = self.model_id(),
            timed_out = failure.is_timeout(),
            error = %failure,
            "answer generation failed; returning apology"
        );
        Answer {
            text: APOLOGY_MESSAGE.to_string(),
            sources: vec![],
            model: self.model_id().to_string(),
            generated: false,
        }
    }

    /// System instructions, the history window, then a final user turn
    /// carrying tagged excerpts and the question.
    pub fn build_prompt(
        &self,
        question: &str,
        hits: &[RetrievalHit],
        history: &[ChatMessage],
        profile: &ExpertProfile,
    ) -> Prompt {
        let included = within_context_budget(hits, self.max_context_tokens);

        let mut system = profile.system_prompt(&self.vehicle);
        system.push_str("\n\n");
        system.push_str(ANSWER_RULES);
        if included.is_empty() {
            system.push_str("\n\n");
            system.push_str(profile.fallback());
        }

        let mut messages: Vec<PromptMessage> =
            history_window(history, self.history_token_budget)
                .iter()
                .map(|message| PromptMessage {
                    role: message.role,
                    content: message.content.clone(),
                })
                .collect();

        let mut user_turn = String::new();
        if !included.is_empty() {
            user_turn.push_str("Documentation excerpts:\n\n");
            for (idx, hit) in included.iter().enumerate() {
                user_turn.push_str(&format!(
                    "[S{}] {}{}\n{}\n\n",
                    idx + 1,
                    hit.chunk.document_name,
                    source_label(hit),
                    hit.chunk.content
                ));
            }
        }
        user_turn.push_str("Question: ");
        user_turn.push_str(question.trim());
        messages.push(PromptMessage {
            role: Role::User,
            content: user_turn,
        });

        Prompt {
            system,
            messages,
            sources: included.iter().map(|hit| hit.source.clone()).collect(),
        }
    }
}

fn source_label(hit: &RetrievalHit) -> String {
    let mut label = String::new();
    if let Some(page) = hit.chunk.page_number {
        label.push_str(&format!(", page {page}"));
    }
    if let Some(chapter) = &hit.chunk.chapter {
        label.push_str(&format!(" ({chapter})"));
    }
    label
}

/// Longest prefix of the ranked hits whose token counts fit the budget.
fn within_context_budget(hits: &[RetrievalHit], max_tokens: usize) -> &[RetrievalHit] {
    let mut total = 0usize;
    for (idx, hit) in hits.iter().enumerate() {
        total += hit.chunk.token_count.max(0) as usize;
        if total > max_tokens {
            return &hits[..idx];
        }
    }
    hits
}

/// Newest turns that fit the budget, in chronological order.
pub fn history_window(history: &[ChatMessage], budget: usize) -> &[ChatMessage] {
    let mut used = 0usize;
    let mut start = history.len();
    for (idx, message) in history.iter().enumerate().rev() {
        used += approx_tokens(&message.content);
        if used > budget {
            break;
        }
        start = idx;
    }
    &history[start..]
}

fn approx_tokens(text: &str) -> usize {
    text.split_whitespace().count().max(1)
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Mutex;

    use super::*;

    pub enum Script {
        Reply(String),
        Fail,
        Hang,
    }

    /// Answer model double that records every prompt it receives.
    pub struct ScriptedModel {
        script: Script,
        pub seen: Mutex<Vec<(String, Vec<PromptMessage>)>>,
    }

    impl ScriptedModel {
        pub fn new(script: Script) -> Self {
            Self {
                script,
                seen: Mutex::new(vec![]),
            }
        }

        pub fn replying(text: &str) -> Arc<Self> {
            Arc::new(Self::new(Script::Reply(text.to_string())))
        }
    }

    #[async_trait]
    impl AnswerModel for ScriptedModel {
        fn model_id(&self) -> &str {
            "scripted"
        }

        async fn complete(
            &self,
            system: &str,
            messages: &[PromptMessage],
            _max_tokens: usize,
        ) -> anyhow::Result<String> {
            self.seen
                .lock()
                .expect("lock")
                .push((system.to_string(), messages.to_vec()));
            match &self.script {
                Script::Reply(text) => Ok(text.clone()),
                Script::Fail => anyhow::bail!("model exploded"),
                Script::Hang => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok("too late".to_string())
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::test_support::{Script, ScriptedModel};
    use super::*;
    use crate::models::{DocumentChunk, DocumentType};
    use crate::router::ExpertKind;

    fn config() -> AppConfig {
        let mut config = AppConfig::from_env();
        config.tokens.max_context_tokens = 100;
        config.tokens.history_token_budget = 6;
        config.timeouts.generation = Duration::from_millis(200);
        config
    }

    fn hit(index: i64, page: i64, tokens: i64, content: &str) -> RetrievalHit {
        let chunk = DocumentChunk {
            document_name: "manual.pdf".to_string(),
            document_type: DocumentType::Manual,
            chunk_index: index,
            content: content.to_string(),
            page_number: Some(page),
            token_count: tokens,
            chapter: None,
            section: None,
            topics: vec![],
            embedding: vec![],
            created_at: Utc::now(),
        };
        let source = SourceReference {
            document: chunk.document_name.clone(),
            page: Some(page),
            chapter: None,
            section: None,
            topics: vec![],
            relevance: 0.9 - index as f32 * 0.1,
            thumbnail_url: None,
            fullsize_url: None,
            highlighted_url: None,
        };
        RetrievalHit {
            chunk,
            score: source.relevance,
            source,
        }
    }

    fn synthesizer(model: Arc<dyn AnswerModel>) -> AnswerSynthesizer {
        AnswerSynthesizer::new(&config(), model, Arc::new(Semaphore::new(1)))
    }

    #[tokio::test]
    async fn returns_model_text_verbatim_with_hit_sources() {
        let model = ScriptedModel::replying("Use DOT 3 brake fluid [S1].");
        let synth = synthesizer(model.clone());
        let hits = vec![hit(0, 1, 40, "Brake fluid: DOT 3"), hit(1, 2, 40, "Reservoir")];

        let answer = synth
            .answer("Which brake fluid?", &hits, &[], ExpertKind::Safety.profile())
            .await;

        assert!(answer.generated);
        assert_eq!(answer.text, "Use DOT 3 brake fluid [S1].");
        assert_eq!(answer.sources.len(), 2);
        assert_eq!(answer.model, "scripted");

        let seen = model.seen.lock().unwrap();
        let (system, messages) = &seen[0];
        assert!(system.contains("safety expert"));
        let last = &messages.last().unwrap().content;
        assert!(last.contains("[S1] manual.pdf, page 1"));
        assert!(last.contains("[S2] manual.pdf, page 2"));
        assert!(last.ends_with("Question: Which brake fluid?"));
    }

    #[tokio::test]
    async fn failures_and_timeouts_become_the_apology() {
        let hits = vec![hit(0, 1, 10, "text")];
        for script in [Script::Fail, Script::Hang, Script::Reply("   ".to_string())] {
            let synth = synthesizer(Arc::new(ScriptedModel::new(script)));
            let answer = synth
                .answer("q", &hits, &[], ExpertKind::General.profile())
                .await;
            assert_eq!(answer.text, APOLOGY_MESSAGE);
            assert!(answer.sources.is_empty());
            assert!(!answer.generated);
        }
    }

    #[tokio::test]
    async fn queued_generations_share_one_deadline() {
        let limit = Arc::new(Semaphore::new(1));
        let mut config = config();
        config.timeouts.generation = Duration::from_millis(300);
        let synth = AnswerSynthesizer::new(
            &config,
            Arc::new(ScriptedModel::new(Script::Hang)),
            limit,
        );
        let hits = vec![hit(0, 1, 10, "text")];
        let profile = ExpertKind::General.profile();

        let timed = |synth: AnswerSynthesizer, hits: Vec<RetrievalHit>| async move {
            let started = Instant::now();
            let answer = synth.answer("q", &hits, &[], profile).await;
            (answer, started.elapsed())
        };
        let (a, b, c) = tokio::join!(
            timed(synth.clone(), hits.clone()),
            timed(synth.clone(), hits.clone()),
            timed(synth.clone(), hits.clone()),
        );

        for (answer, elapsed) in [a, b, c] {
            assert_eq!(answer.text, APOLOGY_MESSAGE);
            assert!(!answer.generated);
            assert!(elapsed < Duration::from_millis(450), "waited {elapsed:?}");
        }
    }

    #[test]
    fn context_budget_drops_trailing_hits_from_prompt_and_sources() {
        let synth = synthesizer(ScriptedModel::replying("ok"));
        let hits = vec![
            hit(0, 1, 60, "first"),
            hit(1, 2, 30, "second"),
            hit(2, 3, 30, "third"),
        ];
        let prompt = synth.build_prompt("q", &hits, &[], ExpertKind::General.profile());
        assert_eq!(prompt.sources.len(), 2);
        assert!(!prompt.messages[0].content.contains("third"));
    }

    #[test]
    fn history_window_keeps_newest_turns_within_budget() {
        let history = vec![
            ChatMessage::user("one two three"),
            ChatMessage::assistant("four five", vec![]),
            ChatMessage::user("six seven"),
            ChatMessage::assistant("eight", vec![]),
        ];
        let window = history_window(&history, 6);
        assert_eq!(window.len(), 3);
        assert_eq!(window[0].content, "four five");
        assert!(history_window(&history, 0).is_empty());
    }

    #[test]
    fn empty_retrieval_adds_profile_fallback_guidance() {
        let synth = synthesizer(ScriptedModel::replying("ok"));
        let prompt = synth.build_prompt("q", &[], &[], ExpertKind::Maintenance.profile());
        assert!(prompt.system.contains(ExpertKind::Maintenance.profile().fallback()));
        assert!(prompt.sources.is_empty());
        assert_eq!(prompt.messages.len(), 1);
        assert_eq!(prompt.messages[0].content, "Question: q");
    }
}
