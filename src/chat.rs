//! Chat request handling: validation, prompt shaping, generation dispatch,
//! reply cleanup, and the word chunker behind the streaming route.

use std::iter;
use std::sync::Arc;
use std::time::Duration;
use std::vec;

use rand::random;
use rocket::futures::stream::{self, Stream};
use tokio::{task, time};
use tracing::{debug, error, warn};

use crate::config::{AppConfig, GenerationConfig};
use crate::engine::{GenerationOptions, SpecialTokens};
use crate::error::ChatError;
use crate::session::{ModelSession, SessionError};
use crate::types::{ChatRequest, ChatResponse, ChatStatus, StreamChunk};

pub const FALLBACK_REPLY: &str = "I'm sorry, I couldn't generate a response. Please try again.";

pub const MAX_TEMPERATURE: f64 = 2.0;

const ROLE_TAGS: [&str; 2] = ["Human:", "Assistant:"];

pub fn build_prompt(message: &str) -> String {
    format!("Human: {message}\nAssistant:")
}

/// Turns raw model output into the reply text.
///
/// The continuation model echoes the prompt, so the exact prompt prefix is
/// dropped first; any role tags the model invented are removed afterwards.
/// Applying this to an already clean reply returns it unchanged.
pub fn clean_reply(raw: &str, prompt: &str) -> String {
    let text = raw.strip_prefix(prompt).unwrap_or(raw).trim();
    let mut text = text.to_string();
    // 删除一个 tag 可能拼出新的 tag（"HumHuman:an:"），所以循环到没有为止
    while ROLE_TAGS.iter().any(|tag| text.contains(tag)) {
        for tag in ROLE_TAGS {
            text = text.replace(tag, "");
        }
    }
    text.trim().to_string()
}

/// Lazy chunk sequence handed to the SSE route; owns its data.
pub type ChunkSequence = iter::Chain<
    iter::Map<vec::IntoIter<String>, fn(String) -> StreamChunk>,
    iter::Once<StreamChunk>,
>;

/// Word chunks for a finished reply followed by the terminal chunk, or a
/// single error chunk.
pub fn chunk_sequence(outcome: Result<String, ChatError>) -> ChunkSequence {
    let (words, last) = match outcome {
        Ok(reply) => {
            let words: Vec<String> = reply.split_whitespace().map(|w| format!("{w} ")).collect();
            (words, StreamChunk::finished())
        }
        Err(err) => (Vec::new(), StreamChunk::error(err.public_message())),
    };
    let to_chunk: fn(String) -> StreamChunk = StreamChunk::token;
    words.into_iter().map(to_chunk).chain(iter::once(last))
}

/// Emits the chunks with `delay` between consecutive chunks; nothing waits
/// after a `done` chunk.
pub fn paced(chunks: ChunkSequence, delay: Duration) -> impl Stream<Item = StreamChunk> + Send {
    stream::unfold((chunks, false), move |(mut chunks, wait)| async move {
        if wait {
            time::sleep(delay).await;
        }
        let chunk = chunks.next()?;
        let wait_next = !chunk.done;
        Some((chunk, (chunks, wait_next)))
    })
}

#[derive(Clone)]
pub struct ChatHandler {
    session: Arc<ModelSession>,
    generation: GenerationConfig,
    max_message_length: usize,
    request_timeout: Duration,
}

impl ChatHandler {
    pub fn new(session: Arc<ModelSession>, config: &AppConfig) -> Self {
        Self {
            session,
            generation: config.generation.clone(),
            max_message_length: config.max_message_length,
            request_timeout: config.request_timeout,
        }
    }

    pub async fn handle(&self, request: ChatRequest) -> Result<ChatResponse, ChatError> {
        if !self.session.is_ready() {
            return Err(ChatError::ServiceUnavailable);
        }
        self.validate_message(&request.message)?;
        let max_length = request
            .max_length
            .unwrap_or(self.generation.default_max_length);
        let temperature = request.temperature.unwrap_or(self.generation.temperature);
        if max_length == 0 {
            return Err(ChatError::InvalidInput(
                "max_length must be a positive integer".to_string(),
            ));
        }
        if !(temperature.is_finite() && temperature > 0.0 && temperature <= MAX_TEMPERATURE)
        {
            return Err(ChatError::InvalidInput(format!(
                "temperature must be in (0, {MAX_TEMPERATURE}]"
            )));
        }

        let reply = self
            .generate_reply(&request.message, max_length, temperature)
            .await?;

        Ok(ChatResponse {
            reply,
            status: ChatStatus::Success,
        })
    }

    /// Generates the whole reply up front, using the configured default
    /// length and temperature, and returns it as chunks ready for [`paced`].
    /// Only an unloaded session is reported as `Err`; every other failure
    /// becomes the single error chunk of the sequence.
    pub async fn stream(&self, message: &str) -> Result<ChunkSequence, ChatError> {
        if !self.session.is_ready() {
            return Err(ChatError::ServiceUnavailable);
        }

        let outcome = match self.validate_message(message) {
            Ok(()) => {
                self.generate_reply(
                    message,
                    self.generation.default_max_length,
                    self.generation.temperature,
                )
                .await
            }
            Err(err) => Err(err),
        };
        if let Err(ChatError::Internal(detail)) = &outcome {
            error!("stream generation failed: {detail}");
        }
        Ok(chunk_sequence(outcome))
    }

    pub fn validate_message(&self, message: &str) -> Result<(), ChatError> {
        if message.trim().is_empty() {
            return Err(ChatError::InvalidInput("Message cannot be empty".to_string()));
        }
        if message.chars().count() > self.max_message_length {
            return Err(ChatError::InvalidInput(format!(
                "Message too long. Maximum length is {} characters",
                self.max_message_length
            )));
        }
        Ok(())
    }

    /// 请求值 clamp 到硬上限，其余参数取配置默认值
    pub fn generation_options(
        &self,
        max_length: u32,
        temperature: f64,
        tokens: SpecialTokens,
    ) -> GenerationOptions {
        let max_length = max_length.min(self.generation.max_model_length);
        GenerationOptions {
            max_length: max_length as usize,
            temperature,
            sampling: self.generation.do_sample,
            top_p: self.generation.top_p,
            top_k: self.generation.top_k,
            repetition_penalty: self.generation.repetition_penalty,
            repeat_last_n: self.generation.repeat_last_n,
            seed: self.generation.seed.unwrap_or_else(random),
            pad_token_id: tokens.pad_token_id.or(tokens.eos_token_id),
            eos_token_id: tokens.eos_token_id,
        }
    }

    async fn generate_reply(
        &self,
        message: &str,
        max_length: u32,
        temperature: f64,
    ) -> Result<String, ChatError> {
        let tokens = self
            .session
            .engine()
            .map(|engine| engine.special_tokens())
            .ok_or(ChatError::ServiceUnavailable)?;

        let prompt = build_prompt(message);
        let options = self.generation_options(max_length, temperature, tokens);
        debug!(max_length = options.max_length, temperature, "dispatching generation");

        // 生成是 CPU 密集的同步调用，放到 blocking 线程池，避免卡住 /health
        // 超时后 blocking 线程仍会跑完，只是结果被丢弃
        let session = self.session.clone();
        let task_prompt = prompt.clone();
        let handle = task::spawn_blocking(move || session.generate(&task_prompt, &options));
        let raw = time::timeout(self.request_timeout, handle)
            .await
            .map_err(|_| {
                ChatError::Internal(format!(
                    "generation timed out after {:?}",
                    self.request_timeout
                ))
            })?
            .map_err(|e| ChatError::Internal(format!("generation task failed: {e}")))?
            .map_err(|e| match e {
                SessionError::NotLoaded => ChatError::ServiceUnavailable,
                SessionError::Generation(err) => ChatError::Internal(format!("{err:#}")),
            })?;

        let reply = clean_reply(&raw, &prompt);
        if reply.is_empty() {
            warn!("model produced an empty reply, using fallback sentence");
            return Ok(FALLBACK_REPLY.to_string());
        }
        Ok(reply)
    }
}
