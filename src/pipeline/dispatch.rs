//! Dispatch pipeline: JSONL prompts in, ordered JSONL outcomes out.
//!
//! Pipeline flow:
//! prompts.jsonl → [preamble] + row → Dispatcher (rate limited) → outcomes.jsonl
//!
//! A row is either `{"user_content": "..."}`, which becomes a single-turn
//! prompt, or `{"messages": [...]}`, which is sent after the preamble.
//! Message rows come from outside, so each assembled prompt is validated
//! before anything is sent.

use crate::client::{ChatClient, RateLimiter};
use crate::curation::validate_prompt;
use crate::models::{
    ChatMessage, Config, Conversation, CuratorError, DispatchOutcome, DispatchRequest, DispatchStats,
    Result,
};
use crate::pipeline::write_jsonl;
use crate::pool::Dispatcher;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Deserialize;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Input row forms accepted by [`load_requests`].
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PromptRow {
    Prompt { user_content: String },
    Messages { messages: Vec<ChatMessage> },
}

impl PromptRow {
    fn into_conversation(self, preamble: &str) -> Conversation {
        match self {
            Self::Prompt { user_content } => Conversation::prompt(preamble, user_content),
            Self::Messages { messages } => Conversation::with_preamble(preamble, messages),
        }
    }
}

/// Load dispatch requests from a JSONL file, numbering rows in file order.
pub fn load_requests(path: &Path, preamble: &str) -> Result<Vec<DispatchRequest>> {
    let file = File::open(path).map_err(|e| CuratorError::io("opening prompts file", e))?;
    let reader = BufReader::new(file);
    let mut conversations = Vec::new();

    for (line_num, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| CuratorError::io("reading prompts file", e))?;
        if line.trim().is_empty() {
            continue;
        }
        let row: PromptRow = serde_json::from_str(&line).map_err(|e| {
            CuratorError::ParseError(format!(
                "Line {}: expected user_content or messages: {}",
                line_num + 1,
                e
            ))
        })?;
        let conversation = row.into_conversation(preamble);
        validate_prompt(&conversation).map_err(|reason| {
            CuratorError::ParseError(format!("Line {}: {}", line_num + 1, reason))
        })?;
        conversations.push(conversation);
    }

    info!(count = conversations.len(), path = %path.display(), "Loaded prompts");
    Ok(DispatchRequest::enumerate(conversations))
}

/// File-level driver around [`Dispatcher`].
pub struct DispatchPipeline {
    dispatcher: Dispatcher,
    progress: ProgressBar,
}

impl DispatchPipeline {
    /// Build the limiter and dispatcher from config.
    ///
    /// B_i(model supported) → Result
    pub fn new(config: &Config, client: Arc<dyn ChatClient>, show_progress: bool) -> Result<Self> {
        let limiter = Arc::new(RateLimiter::new(config.rate_limit.budget()?));
        let mut dispatcher = Dispatcher::new(client, limiter, &config.dispatch.model)?
            .with_completion_reserve(config.dispatch.completion_reserve)
            .with_max_retries(config.openai.max_retries);
        if let Some(deadline) = config.dispatch.deadline() {
            dispatcher = dispatcher.with_deadline(deadline);
        }
        Ok(Self::from_dispatcher(dispatcher, show_progress))
    }

    pub fn from_dispatcher(dispatcher: Dispatcher, show_progress: bool) -> Self {
        let progress = if show_progress {
            let pb = ProgressBar::new(0);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ({percent}%) {msg}")
                    .map(|style| style.progress_chars("##-"))
                    .unwrap_or_else(|_| ProgressStyle::default_bar()),
            );
            pb
        } else {
            ProgressBar::hidden()
        };

        Self {
            dispatcher: dispatcher.with_progress(progress.clone()),
            progress,
        }
    }

    /// Cancelling this token cancels the run in progress.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.dispatcher.cancellation_token()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Dispatch every request and write one outcome line per request.
    pub async fn run(&self, requests: Vec<DispatchRequest>, output: &Path) -> Result<DispatchStats> {
        let start = Instant::now();
        let total = requests.len();

        info!(
            total_requests = total,
            requests_per_window = self.dispatcher.limiter().budget().request_capacity,
            tokens_per_window = self.dispatcher.limiter().budget().token_capacity,
            "Starting dispatch"
        );

        self.progress.set_length(total as u64);
        let outcomes: Vec<DispatchOutcome> = self.dispatcher.dispatch(requests).await;
        write_jsonl(output, &outcomes)?;

        let stats = DispatchStats::from_outcomes(&outcomes, start.elapsed().as_secs_f64());
        self.progress.finish_with_message(format!(
            "Done! {} succeeded, {} failed",
            stats.succeeded,
            stats.total_failed()
        ));

        let limiter = self.dispatcher.limiter().stats();
        info!(
            succeeded = stats.succeeded,
            failed = stats.total_failed(),
            throughput = format!("{:.0}/hr", stats.throughput_per_hour),
            mean_wait_secs = format!("{:.2}", limiter.mean_wait_secs),
            rejected_by_limiter = limiter.total_rejected,
            "Dispatch pipeline complete"
        );

        Ok(stats)
    }
}
