//! Model session: the single loaded engine shared by every request.
//!
//! The engine (tokenizer + weights) is stored as one `Option<Arc<_>>`, so a
//! reader sees either a complete engine or nothing. Loading builds the new
//! engine first and only then swaps it in.

use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::ModelConfig;
use crate::engine::{EngineLoader, GenerationOptions, LoadProfile, TextGenerator};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("model is not loaded")]
    NotLoaded,

    #[error("generation failed: {0:#}")]
    Generation(#[from] anyhow::Error),
}

pub struct ModelSession {
    config: ModelConfig,
    loader: Box<dyn EngineLoader>,
    engine: RwLock<Option<Arc<dyn TextGenerator>>>,
}

impl ModelSession {
    pub fn new(config: ModelConfig, loader: Box<dyn EngineLoader>) -> Self {
        Self {
            config,
            loader,
            engine: RwLock::new(None),
        }
    }

    /// 直接用一个现成的 engine 构造（已加载状态）
    pub fn with_engine(
        config: ModelConfig,
        loader: Box<dyn EngineLoader>,
        engine: Arc<dyn TextGenerator>,
    ) -> Self {
        Self {
            config,
            loader,
            engine: RwLock::new(Some(engine)),
        }
    }

    /// Loads the primary model, falling back to the conservative path on
    /// failure. Returns `false` when both attempts fail, leaving the session
    /// in whatever state it was before the call.
    ///
    /// Blocking: downloads weights and builds the model.
    pub fn load(&self) -> bool {
        let primary = &self.config.primary;
        info!(
            model = %self.config.model_name,
            repo = %primary.repo,
            file = %primary.file,
            "loading model"
        );

        let err = match self.loader.load(primary, &self.config, LoadProfile::Preferred) {
            Ok(engine) => {
                self.install(engine);
                return true;
            }
            Err(err) => err,
        };
        warn!("primary model load failed: {err:#}; trying fallback");

        let fallback = self.config.fallback.as_ref().unwrap_or(primary);
        match self.loader.load(fallback, &self.config, LoadProfile::Conservative) {
            Ok(engine) => {
                info!(repo = %fallback.repo, file = %fallback.file, "fallback model loaded");
                self.install(engine);
                true
            }
            Err(err) => {
                // 已加载的旧 engine（reload 场景）保持不变
                error!("fallback model load failed: {err:#}");
                false
            }
        }
    }

    /// Manual reload; same semantics as [`ModelSession::load`].
    pub fn reload(&self) -> bool {
        self.load()
    }

    pub fn is_ready(&self) -> bool {
        self.engine.read().is_some()
    }

    /// Snapshot of the current engine; stays valid even if a reload swaps it.
    pub fn engine(&self) -> Option<Arc<dyn TextGenerator>> {
        self.engine.read().clone()
    }

    pub fn model_name(&self) -> Option<String> {
        self.engine.read().as_ref().map(|e| e.model_name().to_string())
    }

    /// Blocking generation against the current engine. No retry.
    pub fn generate(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<String, SessionError> {
        let engine = self.engine().ok_or(SessionError::NotLoaded)?;
        Ok(engine.generate(prompt, options)?)
    }

    fn install(&self, engine: Arc<dyn TextGenerator>) {
        *self.engine.write() = Some(engine);
    }
}

#[cfg(test)]
pub(crate) mod fakes {
    //! Scripted engines and loaders used by the handler and route tests.

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    use anyhow::{anyhow, Result};
    use parking_lot::Mutex;

    use super::*;
    use crate::config::ModelSource;
    use crate::engine::SpecialTokens;

    pub struct ScriptedEngine {
        /// `None` 表示 generate 直接失败
        output: Option<String>,
        /// 模拟慢模型：generate 返回前阻塞这么久
        delay: Duration,
        pub calls: Mutex<Vec<(String, GenerationOptions)>>,
    }

    impl ScriptedEngine {
        pub fn replying(output: impl Into<String>) -> Arc<Self> {
            Arc::new(Self {
                output: Some(output.into()),
                delay: Duration::ZERO,
                calls: Mutex::new(Vec::new()),
            })
        }

        pub fn slow(output: impl Into<String>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                output: Some(output.into()),
                delay,
                calls: Mutex::new(Vec::new()),
            })
        }

        /// Echoes the prompt followed by `reply`, like a continuation model.
        pub fn continuing(reply: &str, message: &str) -> Arc<Self> {
            Self::replying(format!("Human: {message}\nAssistant: {reply}"))
        }

        pub fn failing() -> Arc<Self> {
            Arc::new(Self {
                output: None,
                delay: Duration::ZERO,
                calls: Mutex::new(Vec::new()),
            })
        }

        pub fn last_options(&self) -> Option<GenerationOptions> {
            self.calls.lock().last().map(|(_, opts)| opts.clone())
        }
    }

    impl TextGenerator for ScriptedEngine {
        fn generate(&self, prompt: &str, options: &GenerationOptions) -> Result<String> {
            self.calls.lock().push((prompt.to_string(), options.clone()));
            if !self.delay.is_zero() {
                thread::sleep(self.delay);
            }
            self.output.clone().ok_or_else(|| anyhow!("scripted generation failure"))
        }

        fn special_tokens(&self) -> SpecialTokens {
            SpecialTokens {
                eos_token_id: Some(2),
                pad_token_id: Some(2),
            }
        }

        fn model_name(&self) -> &str {
            "scripted"
        }
    }

    /// Loader that fails for the first `failures` calls, then succeeds.
    pub struct FlakyLoader {
        failures: usize,
        pub attempts: Arc<AtomicUsize>,
        pub seen: Arc<Mutex<Vec<(ModelSource, LoadProfile)>>>,
    }

    impl FlakyLoader {
        pub fn new(failures: usize) -> Self {
            Self {
                failures,
                attempts: Arc::new(AtomicUsize::new(0)),
                seen: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl EngineLoader for FlakyLoader {
        fn load(
            &self,
            source: &ModelSource,
            _config: &ModelConfig,
            profile: LoadProfile,
        ) -> Result<Arc<dyn TextGenerator>> {
            self.seen.lock().push((source.clone(), profile));
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures {
                return Err(anyhow!("download failed"));
            }
            let engine: Arc<dyn TextGenerator> = ScriptedEngine::replying("ok");
            Ok(engine)
        }
    }

    pub fn loaded_session(engine: Arc<ScriptedEngine>) -> ModelSession {
        ModelSession::with_engine(
            ModelConfig::default(),
            Box::new(FlakyLoader::new(usize::MAX)),
            engine,
        )
    }

    pub fn unloaded_session() -> ModelSession {
        ModelSession::new(ModelConfig::default(), Box::new(FlakyLoader::new(usize::MAX)))
    }
}
