use serde::{Deserialize, Serialize};

/// 未给出的 max_length / temperature 由 GenerationConfig 的默认值补上
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
}

impl ChatRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            max_length: None,
            temperature: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatStatus {
    Success,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub reply: String,
    pub status: ChatStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStatus {
    Loaded,
    NotLoaded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub model_status: ModelStatus,
    pub message: String,
}

/// 流式接口的一帧；终止帧 token 为空且 done=true，错误帧只带 error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub done: bool,
}

impl StreamChunk {
    pub fn token(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            error: None,
            done: false,
        }
    }

    pub fn finished() -> Self {
        Self {
            token: Some(String::new()),
            error: None,
            done: true,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            token: None,
            error: Some(message.into()),
            done: true,
        }
    }

    /// One `data: <json>\n\n` frame of the event stream.
    pub fn to_sse_frame(&self) -> String {
        match serde_json::to_string(self) {
            Ok(json) => format!("data: {json}\n\n"),
            // 只含 String/bool 字段，实际不会失败
            Err(_) => "data: {\"error\":\"serialization failed\",\"done\":true}\n\n".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub detail: String,
}
