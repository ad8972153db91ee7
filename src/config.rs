//! 进程级配置：启动时从环境变量读取一次，之后只读

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use candle_core::DType;
use tracing::warn;

/// 模型权重来源：hf-hub 上的 GGUF 仓库 + tokenizer 仓库
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSource {
    pub repo: String,
    pub file: String,
    pub tokenizer_repo: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevicePreference {
    Cpu,
    Auto,
}

#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub model_name: String,
    pub primary: ModelSource,
    /// 主模型加载失败时使用；为空则用保守参数重试 primary
    pub fallback: Option<ModelSource>,
    pub cache_dir: PathBuf,
    pub device: DevicePreference,
    /// 量化 GGUF 在 candle 里按 f32 计算，这里只接受 f32
    pub dtype: DType,
    /// 缩小上下文窗口，换取更低的 KV cache 内存占用
    pub low_memory: bool,
    pub eos_token: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_name: "tinyllama-1.1b-chat".to_string(),
            primary: ModelSource {
                repo: "TheBloke/TinyLlama-1.1B-Chat-v1.0-GGUF".to_string(),
                file: "tinyllama-1.1b-chat-v1.0.Q4_K_M.gguf".to_string(),
                tokenizer_repo: "TinyLlama/TinyLlama-1.1B-Chat-v1.0".to_string(),
            },
            fallback: Some(ModelSource {
                repo: "TheBloke/TinyLlama-1.1B-Chat-v1.0-GGUF".to_string(),
                file: "tinyllama-1.1b-chat-v1.0.Q2_K.gguf".to_string(),
                tokenizer_repo: "TinyLlama/TinyLlama-1.1B-Chat-v1.0".to_string(),
            }),
            cache_dir: PathBuf::from("./model_cache"),
            device: DevicePreference::Cpu,
            dtype: DType::F32,
            low_memory: true,
            eos_token: "</s>".to_string(),
        }
    }
}

/// 生成参数的默认值；每个请求在此基础上派生 GenerationOptions
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    /// max_length 的硬上限，请求值会被 clamp 到这里
    pub max_model_length: u32,
    /// 请求没给 max_length / temperature 时使用（流式接口总是用它们）
    pub default_max_length: u32,
    pub temperature: f64,
    pub do_sample: bool,
    pub top_p: f64,
    pub top_k: usize,
    pub repetition_penalty: f32,
    pub repeat_last_n: usize,
    pub seed: Option<u64>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_model_length: 150,
            default_max_length: 100,
            temperature: 0.7,
            do_sample: true,
            top_p: 0.9,
            top_k: 50,
            repetition_penalty: 1.1,
            repeat_last_n: 64,
            seed: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub model: ModelConfig,
    pub generation: GenerationConfig,
    pub max_message_length: usize,
    /// 流式接口每个词之间的人为停顿
    pub stream_delay: Duration,
    /// 单次生成的超时
    pub request_timeout: Duration,
    pub host: String,
    pub port: u16,
    pub allowed_origins: Vec<String>,
    pub static_dir: PathBuf,
    pub log_level: String,
    /// 额外写一份日志文件；None 表示只输出到终端
    pub log_file: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            model: ModelConfig::default(),
            generation: GenerationConfig::default(),
            max_message_length: 500,
            stream_delay: Duration::from_millis(100),
            request_timeout: Duration::from_secs(30),
            host: "0.0.0.0".to_string(),
            port: 8000,
            allowed_origins: vec!["*".to_string()],
            static_dir: PathBuf::from("./static"),
            log_level: "info".to_string(),
            log_file: Some(PathBuf::from("chatbot.log")),
        }
    }
}

impl AppConfig {
    /// Builds the config from process environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`AppConfig::from_env`] but with an injectable lookup, so
    /// tests never touch the real environment.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let model = &mut config.model;

        if let Some(name) = lookup("MODEL_NAME") {
            model.model_name = name;
        }
        if let Some(repo) = lookup("MODEL_REPO") {
            model.primary.repo = repo;
        }
        if let Some(file) = lookup("MODEL_FILE") {
            model.primary.file = file;
        }
        if let Some(repo) = lookup("TOKENIZER_REPO") {
            model.primary.tokenizer_repo = repo;
        }

        // FALLBACK_MODEL_REPO=none 关闭独立的 fallback 模型
        match lookup("FALLBACK_MODEL_REPO").as_deref() {
            Some("none") | Some("") => model.fallback = None,
            Some(repo) => {
                let base = model.fallback.clone().unwrap_or_else(|| model.primary.clone());
                model.fallback = Some(ModelSource {
                    repo: repo.to_string(),
                    ..base
                });
            }
            None => {}
        }
        if let Some(fallback) = model.fallback.as_mut() {
            if let Some(file) = lookup("FALLBACK_MODEL_FILE") {
                fallback.file = file;
            }
            if let Some(repo) = lookup("FALLBACK_TOKENIZER_REPO") {
                fallback.tokenizer_repo = repo;
            }
        }

        if let Some(dir) = lookup("MODEL_CACHE_DIR") {
            model.cache_dir = PathBuf::from(dir);
        }
        if let Some(cpu_only) = parse_flag(&lookup, "USE_CPU_ONLY") {
            model.device = if cpu_only {
                DevicePreference::Cpu
            } else {
                DevicePreference::Auto
            };
        }
        if let Some(raw) = lookup("MODEL_DTYPE") {
            match parse_dtype(&raw) {
                Some(DType::F32) => model.dtype = DType::F32,
                Some(other) => warn!(
                    "MODEL_DTYPE={raw:?} ({other:?}) is not supported for quantized models, using f32"
                ),
                None => warn!("ignoring unsupported MODEL_DTYPE={raw:?}"),
            }
        }
        if let Some(low_memory) = parse_flag(&lookup, "LOW_MEMORY") {
            model.low_memory = low_memory;
        }
        if let Some(token) = lookup("EOS_TOKEN") {
            model.eos_token = token;
        }

        let generation = &mut config.generation;
        if let Some(max) = parse_var(&lookup, "MAX_MODEL_LENGTH") {
            generation.max_model_length = max;
        }
        if let Some(max) = parse_var(&lookup, "DEFAULT_MAX_LENGTH") {
            generation.default_max_length = max;
        }
        if let Some(temperature) = parse_var(&lookup, "DEFAULT_TEMPERATURE") {
            generation.temperature = temperature;
        }
        if let Some(seed) = parse_var(&lookup, "SAMPLING_SEED") {
            generation.seed = Some(seed);
        }

        if let Some(max) = parse_var(&lookup, "MAX_MESSAGE_LENGTH") {
            config.max_message_length = max;
        }
        if let Some(ms) = parse_var(&lookup, "STREAM_DELAY_MS") {
            config.stream_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_var(&lookup, "REQUEST_TIMEOUT") {
            config.request_timeout = Duration::from_secs(secs);
        }
        if let Some(host) = lookup("HOST") {
            config.host = host;
        }
        if let Some(port) = parse_var(&lookup, "PORT") {
            config.port = port;
        }
        if let Some(origins) = lookup("ALLOWED_ORIGINS") {
            config.allowed_origins = origins
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(dir) = lookup("STATIC_DIR") {
            config.static_dir = PathBuf::from(dir);
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            config.log_level = level.to_lowercase();
        }
        match lookup("LOG_FILE").as_deref().map(str::trim) {
            Some("") | Some("none") => config.log_file = None,
            Some(path) => config.log_file = Some(PathBuf::from(path)),
            None => {}
        }

        config
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    let parsed = raw.trim().parse().ok();
    if parsed.is_none() {
        warn!("ignoring unparsable {key}={raw:?}, keeping default");
    }
    parsed
}

fn parse_flag(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<bool> {
    let raw = lookup(key)?;
    match raw.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => {
            warn!("ignoring unparsable {key}={raw:?}, keeping default");
            None
        }
    }
}

fn parse_dtype(raw: &str) -> Option<DType> {
    match raw.trim().to_lowercase().as_str() {
        "f32" | "float32" => Some(DType::F32),
        "f16" | "float16" => Some(DType::F16),
        "bf16" | "bfloat16" => Some(DType::BF16),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_with(vars: &[(&str, &str)]) -> AppConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = config_with(&[]);
        assert_eq!(config.max_message_length, 500);
        assert_eq!(config.generation.max_model_length, 150);
        assert_eq!(config.generation.temperature, 0.7);
        assert_eq!(config.generation.top_k, 50);
        assert_eq!(config.model.device, DevicePreference::Cpu);
        assert_eq!(config.model.dtype, DType::F32);
        assert_eq!(config.stream_delay, Duration::from_millis(100));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.generation.default_max_length, 100);
        assert_eq!(config.log_file, Some(PathBuf::from("chatbot.log")));
        assert_eq!(config.allowed_origins, vec!["*".to_string()]);
        assert_eq!(config.bind_address(), "0.0.0.0:8000");
        assert!(config.model.fallback.is_some());
    }

    #[test]
    fn env_overrides_are_applied() {
        let config = config_with(&[
            ("MODEL_NAME", "custom"),
            ("MODEL_REPO", "me/model-GGUF"),
            ("USE_CPU_ONLY", "false"),
            ("MODEL_DTYPE", "float32"),
            ("REQUEST_TIMEOUT", "5"),
            ("LOG_FILE", "/var/log/chatbot/server.log"),
            ("DEFAULT_TEMPERATURE", "0.4"),
            ("MAX_MESSAGE_LENGTH", "42"),
            ("PORT", "9000"),
            ("ALLOWED_ORIGINS", "http://a.test, http://b.test,"),
            ("STREAM_DELAY_MS", "0"),
            ("LOW_MEMORY", "0"),
        ]);
        assert_eq!(config.model.model_name, "custom");
        assert_eq!(config.model.primary.repo, "me/model-GGUF");
        assert_eq!(config.model.device, DevicePreference::Auto);
        assert_eq!(config.model.dtype, DType::F32);
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.log_file, Some(PathBuf::from("/var/log/chatbot/server.log")));
        assert_eq!(config.generation.temperature, 0.4);
        assert!(!config.model.low_memory);
        assert_eq!(config.max_message_length, 42);
        assert_eq!(config.port, 9000);
        assert_eq!(config.stream_delay, Duration::ZERO);
        assert_eq!(
            config.allowed_origins,
            vec!["http://a.test".to_string(), "http://b.test".to_string()]
        );
    }

    #[test]
    fn unparsable_values_keep_defaults() {
        let config = config_with(&[
            ("PORT", "not-a-port"),
            ("MAX_MODEL_LENGTH", "-3"),
            ("MODEL_DTYPE", "int4"),
        ]);
        assert_eq!(config.port, 8000);
        assert_eq!(config.generation.max_model_length, 150);
        assert_eq!(config.model.dtype, DType::F32);
    }

    #[test]
    fn half_precision_dtypes_fall_back_to_f32() {
        for raw in ["f16", "bf16", "float16"] {
            let config = config_with(&[("MODEL_DTYPE", raw)]);
            assert_eq!(config.model.dtype, DType::F32, "{raw}");
        }
    }

    #[test]
    fn log_file_can_be_disabled() {
        assert_eq!(config_with(&[("LOG_FILE", "none")]).log_file, None);
        assert_eq!(config_with(&[("LOG_FILE", "")]).log_file, None);
    }

    #[test]
    fn fallback_can_be_disabled_or_redirected() {
        let disabled = config_with(&[("FALLBACK_MODEL_REPO", "none")]);
        assert!(disabled.model.fallback.is_none());

        let redirected = config_with(&[
            ("FALLBACK_MODEL_REPO", "other/small-GGUF"),
            ("FALLBACK_MODEL_FILE", "small.gguf"),
        ]);
        let fallback = redirected.model.fallback.expect("fallback configured");
        assert_eq!(fallback.repo, "other/small-GGUF");
        assert_eq!(fallback.file, "small.gguf");
    }
}
