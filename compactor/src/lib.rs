//! Background compaction of conversation history.
//!
//! A single worker task summarizes old conversation rounds through an
//! injected chat-completion adapter once the number of uncompacted rounds
//! crosses a threshold. `notify_rounds_changed` is non-blocking and
//! coalesces; readers observe the latest [`CompactedMessage`] from an
//! append-only queue. Failures are logged and the previous compaction is
//! preserved.

mod openai;

use std::sync::Arc;
use std::sync::RwLock;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;

pub use openai::OpenAiChatClient;
pub use openai::OpenAiConfig;

/// How long `stop` waits for the worker to wind down.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-post message budget inside the summarization prompt.
const POST_PREVIEW_LIMIT: usize = 1024;

#[derive(Error, Debug)]
pub enum CompactorErr {
    #[error("LLM returned empty summary")]
    EmptySummary,

    #[error("unexpected status {0}: {1}")]
    UnexpectedStatus(reqwest::StatusCode, String),

    #[error("exceeded retry limit, last status: {0}")]
    RetryLimit(reqwest::StatusCode),

    #[error("malformed completion response: {0}")]
    MalformedResponse(String),

    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}

/// One conversation round as the compactor sees it.
#[derive(Debug, Clone, Default)]
pub struct Round {
    pub user_query: String,
    pub posts: Vec<Post>,
}

#[derive(Debug, Clone)]
pub struct Post {
    pub send_from: String,
    pub send_to: String,
    pub message: String,
}

/// Summary of rounds `start_index..=end_index` (1-based). Produced
/// monotonically: successive compactions only extend `end_index`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactedMessage {
    pub start_index: usize,
    pub end_index: usize,
    pub summary: String,
}

impl CompactedMessage {
    pub fn to_system_message(&self) -> String {
        format!(
            "[Conversation History Summary (Rounds {}-{})]\n{}",
            self.start_index, self.end_index, self.summary
        )
    }
}

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
}

/// Seam to whatever LLM performs the summarization.
#[async_trait]
pub trait ChatCompletion: Send + Sync {
    async fn chat_completion(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
    ) -> Result<ChatResponse, CompactorErr>;
}

/// Returns the current rounds; injected by the owner of the conversation.
pub type RoundsGetter = dyn Fn() -> Vec<Round> + Send + Sync;

#[derive(Debug, Clone)]
pub struct CompactorConfig {
    /// Compact once this many rounds are not covered by the latest
    /// compaction.
    pub threshold: usize,
    /// Keep this many recent rounds uncompacted.
    pub retain_recent: usize,
    pub enabled: bool,
    /// Overrides the built-in prompt; `{PREVIOUS_SUMMARY}` and `{content}`
    /// are substituted.
    pub prompt_template: Option<String>,
}

impl Default for CompactorConfig {
    fn default() -> Self {
        Self {
            threshold: 10,
            retain_recent: 3,
            enabled: true,
            prompt_template: None,
        }
    }
}

const DEFAULT_PROMPT_TEMPLATE: &str = "\
Summarize the following conversation history concisely.
Focus on: key decisions made, important information exchanged, and current state.
Preserve any critical details that would be needed to continue the conversation.

## Previous summary
{PREVIOUS_SUMMARY}

## Conversation to summarize
{content}

Provide a clear, structured summary:";

pub struct ContextCompactor {
    config: CompactorConfig,
    llm: Arc<dyn ChatCompletion>,
    rounds_getter: Arc<RoundsGetter>,
    compactions: Arc<RwLock<Vec<CompactedMessage>>>,
    work_available: Arc<Notify>,
    shutdown: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl ContextCompactor {
    pub fn new(
        config: CompactorConfig,
        llm: Arc<dyn ChatCompletion>,
        rounds_getter: Arc<RoundsGetter>,
    ) -> Self {
        Self {
            config,
            llm,
            rounds_getter,
            compactions: Arc::new(RwLock::new(Vec::new())),
            work_available: Arc::new(Notify::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    /// Starts the worker. Safe to call multiple times.
    pub fn start(&mut self) {
        if !self.config.enabled || self.worker.is_some() {
            return;
        }
        self.shutdown.store(false, Ordering::SeqCst);

        let config = self.config.clone();
        let llm = self.llm.clone();
        let rounds_getter = self.rounds_getter.clone();
        let compactions = self.compactions.clone();
        let work_available = self.work_available.clone();
        let shutdown = self.shutdown.clone();
        self.worker = Some(tokio::spawn(async move {
            loop {
                work_available.notified().await;
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(err) =
                    try_compact(&config, llm.as_ref(), &rounds_getter, &compactions).await
                {
                    warn!("compaction failed: {err}");
                }
            }
            debug!("compactor worker exited");
        }));
        info!("compactor worker started");
    }

    /// Stops the worker, waiting at most a bounded join.
    pub async fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.work_available.notify_one();
        if let Some(mut worker) = self.worker.take() {
            if tokio::time::timeout(STOP_TIMEOUT, &mut worker).await.is_err() {
                warn!("compactor worker did not stop in time; aborting it");
                worker.abort();
            }
        }
        info!("compactor worker stopped");
    }

    /// Non-blocking wake-up; multiple notifications before a pass coalesce
    /// into a single pass.
    pub fn notify_rounds_changed(&self) {
        if !self.config.enabled {
            return;
        }
        self.work_available.notify_one();
    }

    /// Latest compaction, if any.
    pub fn get_compaction(&self) -> Option<CompactedMessage> {
        self.compactions
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .last()
            .cloned()
    }
}

async fn try_compact(
    config: &CompactorConfig,
    llm: &dyn ChatCompletion,
    rounds_getter: &Arc<RoundsGetter>,
    compactions: &RwLock<Vec<CompactedMessage>>,
) -> Result<(), CompactorErr> {
    let rounds = (rounds_getter)();
    let total = rounds.len();
    if total == 0 {
        return Ok(());
    }

    let previous = compactions
        .read()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .last()
        .cloned();
    let compacted_end = previous.as_ref().map(|c| c.end_index).unwrap_or(0);

    let uncompacted = total - compacted_end;
    if uncompacted < config.threshold {
        return Ok(());
    }

    let new_end = total.saturating_sub(config.retain_recent);
    if new_end == 0 || compacted_end >= new_end {
        return Ok(());
    }

    info!(
        "compacting rounds 1-{new_end} (uncompacted={uncompacted}, threshold={})",
        config.threshold
    );

    let previous_summary = previous
        .as_ref()
        .map(|c| c.summary.clone())
        .unwrap_or_else(|| "None".to_string());

    let mut content_parts: Vec<String> = Vec::new();
    for (index, round) in rounds.iter().enumerate().take(new_end).skip(compacted_end) {
        content_parts.push(format!("\n--- Round {} ---", index + 1));
        content_parts.push(format!("User Query: {}", round.user_query));
        for post in &round.posts {
            content_parts.push(format!(
                "  {} -> {}: {}",
                post.send_from,
                post.send_to,
                preview(&post.message)
            ));
        }
    }
    let content = content_parts.join("\n");

    let template = config
        .prompt_template
        .as_deref()
        .unwrap_or(DEFAULT_PROMPT_TEMPLATE);
    let prompt = template
        .replace("{PREVIOUS_SUMMARY}", &previous_summary)
        .replace("{content}", &content);

    let messages = [
        ChatMessage::new(
            "system",
            "You are a helpful assistant that summarizes conversations.",
        ),
        ChatMessage::new("user", prompt),
    ];
    let response = llm.chat_completion(&messages, 0.3).await?;
    if response.content.trim().is_empty() {
        return Err(CompactorErr::EmptySummary);
    }

    compactions
        .write()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .push(CompactedMessage {
            start_index: 1,
            end_index: new_end,
            summary: response.content,
        });
    info!("compaction complete (rounds 1-{new_end})");
    Ok(())
}

fn preview(message: &str) -> String {
    if message.len() <= POST_PREVIEW_LIMIT {
        return message.to_string();
    }
    let mut end = POST_PREVIEW_LIMIT;
    while end > 0 && !message.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &message[..end])
}
