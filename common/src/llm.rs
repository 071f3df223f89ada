use std::time::Duration;

use async_openai::types::{
    ChatCompletionRequestSystemMessage, ChatCompletionRequestUserMessage,
    CreateChatCompletionRequestArgs, CreateEmbeddingRequestArgs, ResponseFormat,
    ResponseFormatJsonSchema,
};
use async_trait::async_trait;
use tokio::time::timeout;
use tracing::debug;

use crate::{config::AppConfig, error::AppError};

const ANSWER_SYSTEM_MESSAGE: &str =
    "You are a knowledge assistant. Answer clearly and concisely using only the material you are given.";

/// Language-model provider boundary. All pipeline code talks to this trait so
/// tests can substitute a deterministic implementation.
#[async_trait]
pub trait LlmService: Send + Sync {
    /// Fixed-dimension embedding for the configured model.
    async fn generate_embedding(&self, text: &str) -> Result<Vec<f32>, AppError>;

    /// Embedding with an explicit model, used when the healing agent switches
    /// to the alternate embedding model.
    async fn generate_embedding_with_model(
        &self,
        text: &str,
        model: &str,
    ) -> Result<Vec<f32>, AppError>;

    async fn generate_response(&self, prompt: &str) -> Result<String, AppError>;

    /// Structured completion. The caller supplies a JSON schema; malformed
    /// output surfaces as `AppError::LlmParsing` and callers fall back.
    async fn generate_json(
        &self,
        prompt: &str,
        schema_name: &str,
        schema: serde_json::Value,
    ) -> Result<serde_json::Value, AppError>;

    fn embedding_dimension(&self) -> usize;

    fn model_label(&self) -> &str;
}

pub struct OpenAiLlm {
    client: async_openai::Client<async_openai::config::OpenAIConfig>,
    generation_model: String,
    embedding_model: String,
    embedding_dimensions: u32,
    deadline: Duration,
}

impl OpenAiLlm {
    pub fn from_config(config: &AppConfig) -> Self {
        let client = async_openai::Client::with_config(
            async_openai::config::OpenAIConfig::new()
                .with_api_key(&config.openai_api_key)
                .with_api_base(&config.openai_base_url),
        );

        Self {
            client,
            generation_model: config.generation_model.clone(),
            embedding_model: config.embedding_model.clone(),
            embedding_dimensions: config.embedding_dimensions,
            deadline: Duration::from_secs(config.request_timeout_secs),
        }
    }

    async fn with_deadline<T>(
        &self,
        label: &str,
        fut: impl std::future::Future<Output = Result<T, AppError>> + Send,
    ) -> Result<T, AppError> {
        timeout(self.deadline, fut)
            .await
            .map_err(|_| AppError::Timeout(format!("{label} exceeded {:?}", self.deadline)))?
    }

    async fn embed(&self, text: &str, model: &str) -> Result<Vec<f32>, AppError> {
        let request = CreateEmbeddingRequestArgs::default()
            .model(model)
            .dimensions(self.embedding_dimensions)
            .input([text])
            .build()?;

        let response = self.client.embeddings().create(request).await?;

        let embedding = response
            .data
            .first()
            .ok_or_else(|| AppError::LlmParsing("No embedding data received".into()))?
            .embedding
            .clone();

        debug!(dimensions = embedding.len(), model, "embedding created");

        Ok(embedding)
    }
}

#[async_trait]
impl LlmService for OpenAiLlm {
    async fn generate_embedding(&self, text: &str) -> Result<Vec<f32>, AppError> {
        let model = self.embedding_model.clone();
        self.with_deadline("embedding", self.embed(text, &model))
            .await
    }

    async fn generate_embedding_with_model(
        &self,
        text: &str,
        model: &str,
    ) -> Result<Vec<f32>, AppError> {
        self.with_deadline("embedding", self.embed(text, model))
            .await
    }

    async fn generate_response(&self, prompt: &str) -> Result<String, AppError> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.generation_model)
            .messages([
                ChatCompletionRequestSystemMessage::from(ANSWER_SYSTEM_MESSAGE).into(),
                ChatCompletionRequestUserMessage::from(prompt).into(),
            ])
            .build()?;

        let response = self
            .with_deadline("generation", async {
                Ok(self.client.chat().create(request).await?)
            })
            .await?;

        let content = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.as_ref())
            .ok_or_else(|| AppError::LlmParsing("No content found in LLM response".into()))?;

        Ok(content.clone())
    }

    async fn generate_json(
        &self,
        prompt: &str,
        schema_name: &str,
        schema: serde_json::Value,
    ) -> Result<serde_json::Value, AppError> {
        let response_format = ResponseFormat::JsonSchema {
            json_schema: ResponseFormatJsonSchema {
                description: None,
                name: schema_name.into(),
                schema: Some(schema),
                strict: Some(true),
            },
        };

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.generation_model)
            .messages([ChatCompletionRequestUserMessage::from(prompt).into()])
            .response_format(response_format)
            .build()?;

        let response = self
            .with_deadline("structured generation", async {
                Ok(self.client.chat().create(request).await?)
            })
            .await?;

        let content = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.as_ref())
            .ok_or_else(|| AppError::LlmParsing("No content found in LLM response".into()))?;

        serde_json::from_str(content)
            .map_err(|e| AppError::LlmParsing(format!("Structured output was not valid JSON: {e}")))
    }

    fn embedding_dimension(&self) -> usize {
        self.embedding_dimensions as usize
    }

    fn model_label(&self) -> &str {
        &self.generation_model
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use std::sync::Mutex;

    use super::{async_trait, AppError, LlmService};

    /// Deterministic offline stand-in for the OpenAI client. Embeddings are
    /// bag-of-words hashes so related texts land near each other; responses
    /// and structured outputs are canned.
    pub struct MockLlm {
        dimension: usize,
        response: Mutex<String>,
        json: Mutex<Option<serde_json::Value>>,
        fail_json: bool,
    }

    impl MockLlm {
        pub fn new(dimension: usize) -> Self {
            Self {
                dimension,
                response: Mutex::new("mock answer".to_string()),
                json: Mutex::new(None),
                fail_json: false,
            }
        }

        pub fn with_response(self, response: impl Into<String>) -> Self {
            *self.response.lock().unwrap() = response.into();
            self
        }

        pub fn with_json(self, value: serde_json::Value) -> Self {
            *self.json.lock().unwrap() = Some(value);
            self
        }

        /// Every structured call fails, exercising classification and
        /// metadata fallbacks.
        pub fn failing_json(mut self) -> Self {
            self.fail_json = true;
            self
        }

        pub fn hashed_embedding(&self, text: &str) -> Vec<f32> {
            let mut vector = vec![0.0f32; self.dimension];
            for word in text.to_lowercase().split_whitespace() {
                let mut hash: usize = 5381;
                for byte in word.bytes() {
                    hash = hash.wrapping_mul(33).wrapping_add(byte as usize);
                }
                vector[hash % self.dimension] += 1.0;
            }
            let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
            if norm > 0.0 {
                for v in &mut vector {
                    *v /= norm;
                }
            }
            vector
        }
    }

    #[async_trait]
    impl LlmService for MockLlm {
        async fn generate_embedding(&self, text: &str) -> Result<Vec<f32>, AppError> {
            Ok(self.hashed_embedding(text))
        }

        async fn generate_embedding_with_model(
            &self,
            text: &str,
            _model: &str,
        ) -> Result<Vec<f32>, AppError> {
            Ok(self.hashed_embedding(text))
        }

        async fn generate_response(&self, _prompt: &str) -> Result<String, AppError> {
            Ok(self.response.lock().unwrap().clone())
        }

        async fn generate_json(
            &self,
            _prompt: &str,
            schema_name: &str,
            _schema: serde_json::Value,
        ) -> Result<serde_json::Value, AppError> {
            if self.fail_json {
                return Err(AppError::LlmParsing(format!(
                    "mock failure for schema {schema_name}"
                )));
            }
            self.json
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| AppError::LlmParsing("no canned JSON configured".into()))
        }

        fn embedding_dimension(&self) -> usize {
            self.dimension
        }

        fn model_label(&self) -> &str {
            "mock-llm"
        }
    }
}
