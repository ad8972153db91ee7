use std::fs::File;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use candle_core::quantized::gguf_file;
use candle_core::{DType, Device, Tensor};
use candle_transformers::generation::LogitsProcessor;
use candle_transformers::models::quantized_llama as qllama;
use hf_hub::api::sync::ApiBuilder;
use parking_lot::Mutex;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::config::{DevicePreference, ModelConfig, ModelSource};

/// low_memory 时的上下文窗口（token 数）
const LOW_MEMORY_CONTEXT: usize = 512;

/// 每次请求的生成参数，由请求 + 配置默认值 + tokenizer 特殊 token 派生
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOptions {
    /// 总长度上限（prompt + 新生成的 token）
    pub max_length: usize,
    pub temperature: f64,
    pub sampling: bool,
    pub top_p: f64,
    pub top_k: usize,
    pub repetition_penalty: f32,
    pub repeat_last_n: usize,
    pub seed: u64,
    pub pad_token_id: Option<u32>,
    pub eos_token_id: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpecialTokens {
    pub eos_token_id: Option<u32>,
    pub pad_token_id: Option<u32>,
}

/// 统一的生成能力抽象：tokenizer + 模型作为一个整体
///
/// `generate` is blocking and CPU bound; callers on the async runtime must
/// move it to the blocking pool. The returned text is the prompt followed by
/// the continuation, like a plain text-generation pipeline.
pub trait TextGenerator: Send + Sync {
    fn generate(&self, prompt: &str, options: &GenerationOptions) -> Result<String>;

    fn special_tokens(&self) -> SpecialTokens;

    fn model_name(&self) -> &str;
}

/// 加载档位：Preferred 按配置走，Conservative 固定 CPU + f32 + 小上下文
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadProfile {
    Preferred,
    Conservative,
}

/// Builds a ready [`TextGenerator`] from a model source.
pub trait EngineLoader: Send + Sync {
    fn load(
        &self,
        source: &ModelSource,
        config: &ModelConfig,
        profile: LoadProfile,
    ) -> Result<Arc<dyn TextGenerator>>;
}

pub struct CandleLoader;

impl EngineLoader for CandleLoader {
    fn load(
        &self,
        source: &ModelSource,
        config: &ModelConfig,
        profile: LoadProfile,
    ) -> Result<Arc<dyn TextGenerator>> {
        let engine: Arc<dyn TextGenerator> = CandleEngine::new(source, config, profile)?;
        Ok(engine)
    }
}

pub struct CandleEngine {
    model_name: String,
    device: Device,
    model: Mutex<qllama::ModelWeights>,
    tokenizer: Tokenizer,
    special_tokens: SpecialTokens,
    context_window: usize,
    /// logits 后处理使用的精度
    dtype: DType,
}

impl CandleEngine {
    pub fn new(
        source: &ModelSource,
        config: &ModelConfig,
        profile: LoadProfile,
    ) -> Result<Arc<Self>> {
        let (device, low_memory) = match profile {
            LoadProfile::Preferred => {
                let device = match config.device {
                    DevicePreference::Cpu => Device::Cpu,
                    DevicePreference::Auto => Device::cuda_if_available(0)?,
                };
                (device, config.low_memory)
            }
            LoadProfile::Conservative => (Device::Cpu, true),
        };

        let api = ApiBuilder::new()
            .with_cache_dir(config.cache_dir.clone())
            .build()?;

        let model_path = api.model(source.repo.clone()).get(&source.file)?;
        let mut file = File::open(&model_path)?;
        let start = Instant::now();

        let content = gguf_file::Content::read(&mut file)?;
        let mut total_size_in_bytes = 0usize;
        for (_, tensor) in content.tensor_infos.iter() {
            let elem_count = tensor.shape.elem_count();
            total_size_in_bytes +=
                elem_count * tensor.ggml_dtype.type_size() / tensor.ggml_dtype.block_size();
        }
        info!(
            "loaded {} tensors ({}) from {} in {:.2}s",
            content.tensor_infos.len(),
            format_size(total_size_in_bytes),
            source.file,
            start.elapsed().as_secs_f32(),
        );

        let model = qllama::ModelWeights::from_gguf(content, &mut file, &device)?;

        let tokenizer_path = api.model(source.tokenizer_repo.clone()).get("tokenizer.json")?;
        let tokenizer = Tokenizer::from_file(tokenizer_path)
            .map_err(|e| anyhow::anyhow!("Error loading tokenizer: {e}"))?;

        let eos_token_id = tokenizer.token_to_id(&config.eos_token);
        // 没有 pad token 的模型沿用 eos
        let pad_token_id = tokenizer
            .get_padding()
            .map(|padding| padding.pad_id)
            .or(eos_token_id);

        let context_window = if low_memory {
            LOW_MEMORY_CONTEXT
        } else {
            qllama::MAX_SEQ_LEN
        };

        info!(
            model = %config.model_name,
            ?profile,
            ?device,
            dtype = ?config.dtype,
            context_window,
            "model ready"
        );

        Ok(Arc::new(Self {
            model_name: config.model_name.clone(),
            device,
            model: Mutex::new(model),
            tokenizer,
            special_tokens: SpecialTokens {
                eos_token_id,
                pad_token_id,
            },
            context_window,
            dtype: config.dtype,
        }))
    }

    fn prepare_logits(
        &self,
        logits: &Tensor,
        options: &GenerationOptions,
        history: &[u32],
    ) -> Result<Tensor> {
        let logits = logits.to_dtype(self.dtype)?;
        let logits = if options.repetition_penalty == 1.0 {
            logits
        } else {
            let start = history.len().saturating_sub(options.repeat_last_n);
            candle_transformers::utils::apply_repeat_penalty(
                &logits,
                options.repetition_penalty,
                &history[start..],
            )?
        };
        if options.sampling {
            Ok(top_k_filter(&logits, options.top_k)?)
        } else {
            Ok(logits)
        }
    }
}

impl TextGenerator for CandleEngine {
    fn generate(&self, prompt: &str, options: &GenerationOptions) -> Result<String> {
        let encoding = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| anyhow::anyhow!("Error encoding prompt: {e}"))?;
        let mut tokens = encoding.get_ids().to_vec();

        // max_length 包含 prompt；至少生成一个 token
        let max_length = options.max_length.min(self.context_window);
        let to_generate = max_length.saturating_sub(tokens.len()).max(1);

        // prompt 太长时截掉开头，给生成留位置
        if tokens.len() + to_generate > self.context_window {
            let keep = self.context_window.saturating_sub(to_generate);
            tokens = tokens[tokens.len() - keep..].to_vec();
        }

        let (temperature, top_p) = if options.sampling && options.temperature > 0.0 {
            (Some(options.temperature), Some(options.top_p))
        } else {
            (None, None)
        };
        let mut logits_processor = LogitsProcessor::new(options.seed, temperature, top_p);

        let mut model = self.model.lock();

        let input = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
        let mut logits = model.forward(&input, 0)?.squeeze(0)?;

        let mut generated = Vec::with_capacity(to_generate);
        for step in 0..to_generate {
            let logits_step = self.prepare_logits(&logits, options, &tokens)?;
            let next_token = logits_processor.sample(&logits_step)?;
            if Some(next_token) == options.eos_token_id {
                break;
            }
            tokens.push(next_token);
            generated.push(next_token);

            if step + 1 == to_generate {
                break;
            }
            let input = Tensor::new(&[next_token], &self.device)?.unsqueeze(0)?;
            logits = model.forward(&input, tokens.len() - 1)?.squeeze(0)?;
        }
        drop(model);

        debug!(
            prompt_tokens = encoding.get_ids().len(),
            generated = generated.len(),
            "generation finished"
        );

        let continuation = self
            .tokenizer
            .decode(&generated, true)
            .map_err(|e| anyhow::anyhow!("Error decoding: {e}"))?;

        Ok(format!("{prompt}{continuation}"))
    }

    fn special_tokens(&self) -> SpecialTokens {
        self.special_tokens
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}

/// 只保留概率最高的 k 个 logits，其余置为 -inf；k=0 表示不过滤
pub fn top_k_filter(logits: &Tensor, k: usize) -> candle_core::Result<Tensor> {
    let values: Vec<f32> = logits.to_vec1()?;
    if k == 0 || k >= values.len() {
        return Ok(logits.clone());
    }
    let mut sorted = values.clone();
    sorted.sort_by(|a, b| b.total_cmp(a));
    let threshold = sorted[k - 1];
    let masked: Vec<f32> = values
        .iter()
        .map(|&v| if v >= threshold { v } else { f32::NEG_INFINITY })
        .collect();
    Tensor::new(masked.as_slice(), logits.device())
}

// 小工具：人类可读的字节数
fn format_size(size: usize) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    let size_f = size as f64;
    if size_f > GB {
        format!("{:.2} GiB", size_f / GB)
    } else if size_f > MB {
        format!("{:.2} MiB", size_f / MB)
    } else if size_f > KB {
        format!("{:.2} KiB", size_f / KB)
    } else {
        format!("{size} B")
    }
}
