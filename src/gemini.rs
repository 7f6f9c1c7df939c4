//! Language-model clients: lyrics transcription from audio and an airplay
//! safety verdict from lyrics, both over the Gemini `generateContent` API.

use crate::config::ModelConfig;
use crate::error::{Error, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use serde_json::{Value, json};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub trait Transcriber: Send + Sync {
    /// Lyrics of the song at `path`, or `None` when none could be produced.
    fn transcribe(&self, path: &Path) -> Option<String>;
}

pub trait Classifier: Send + Sync {
    fn classify(&self, lyrics: &str) -> Option<Verdict>;
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Verdict {
    #[serde(default)]
    pub is_safe_for_radio: bool,
    #[serde(default = "unknown_reason")]
    pub explanation: String,
}

fn unknown_reason() -> String {
    "Unknown".to_string()
}

const HARM_CATEGORIES: &[&str] = &[
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
];

pub struct GeminiClient {
    agent: ureq::Agent,
    endpoint: String,
    api_key: String,
    system_prompt: String,
}

impl GeminiClient {
    pub fn new(config: &ModelConfig, system_prompt: String) -> Result<Self> {
        let api_key = config
            .resolved_api_key()
            .ok_or_else(|| Error::Config("no model API key configured".into()))?;
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(300))
            .build();
        let endpoint = format!(
            "{}/models/{}:generateContent",
            config.base_url.trim_end_matches('/'),
            config.model
        );
        info!(model = %config.model, "Model client configured");
        Ok(Self {
            agent,
            endpoint,
            api_key,
            system_prompt,
        })
    }

    /// Build a client whose system prompt is read from `prompt_file`.
    pub fn with_prompt_file(config: &ModelConfig, prompt_file: &Path) -> Result<Self> {
        let prompt = fs::read_to_string(prompt_file).map_err(|e| {
            Error::Config(format!("cannot read prompt {}: {}", prompt_file.display(), e))
        })?;
        Self::new(config, prompt)
    }

    fn request_body(&self, parts: Value) -> Value {
        let safety: Vec<Value> = HARM_CATEGORIES
            .iter()
            .map(|c| json!({ "category": c, "threshold": "BLOCK_NONE" }))
            .collect();
        json!({
            "system_instruction": { "parts": [{ "text": self.system_prompt }] },
            "contents": [{ "role": "user", "parts": parts }],
            "safetySettings": safety,
        })
    }

    /// Text of the first candidate's first part.
    fn generate(&self, parts: Value) -> Result<String> {
        let response = self
            .agent
            .post(&self.endpoint)
            .query("key", &self.api_key)
            .send_json(self.request_body(parts))
            .map_err(|e| match e {
                ureq::Error::Status(code, resp) => Error::Model(format!(
                    "status {}: {}",
                    code,
                    resp.into_string().unwrap_or_default()
                )),
                ureq::Error::Transport(t) => Error::Model(t.to_string()),
            })?;
        let body: Value = response
            .into_json()
            .map_err(|e| Error::Model(format!("invalid response: {}", e)))?;
        body.pointer("/candidates/0/content/parts/0/text")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::Model("response has no text".into()))
    }
}

impl Transcriber for GeminiClient {
    fn transcribe(&self, path: &Path) -> Option<String> {
        let bytes = match fs::read(path) {
            Ok(b) => b,
            Err(e) => {
                error!(file = %path.display(), error = %e, "Could not read audio for transcription");
                return None;
            }
        };
        let mime = mime_type(path);
        info!(file = %path.display(), mime, "Transcribing");
        let parts = json!([
            { "text": "." },
            { "inline_data": { "mime_type": mime, "data": STANDARD.encode(bytes) } }
        ]);
        match self.generate(parts) {
            Ok(text) if !text.trim().is_empty() => Some(text),
            Ok(_) => {
                warn!(file = %path.display(), "Empty transcription");
                None
            }
            Err(e) => {
                error!(file = %path.display(), error = %e, "Transcription failed");
                None
            }
        }
    }
}

impl Classifier for GeminiClient {
    fn classify(&self, lyrics: &str) -> Option<Verdict> {
        let text = match self.generate(json!([{ "text": lyrics }])) {
            Ok(t) => t,
            Err(e) => {
                error!(error = %e, "Sentiment request failed");
                return None;
            }
        };
        debug!(raw = %text, "Sentiment reply");
        match extract_verdict(&text) {
            Ok(v) => Some(v),
            Err(e) => {
                error!(error = %e, "Could not parse sentiment reply");
                None
            }
        }
    }
}

pub fn mime_type(path: &Path) -> &'static str {
    let is_mp3 = path
        .extension()
        .is_some_and(|e| e.eq_ignore_ascii_case("mp3"));
    if is_mp3 { "audio/mp3" } else { "audio/webm" }
}

/// Parse a model reply that may wrap its JSON in code fences or prose.
pub fn extract_verdict(reply: &str) -> Result<Verdict> {
    let unfenced = reply.replace("```json", "").replace("```", "");
    let object = match unfenced.find('{') {
        Some(start) => match unfenced[start..].find('}') {
            Some(len) => &unfenced[start..=start + len],
            None => &unfenced[start..],
        },
        None => unfenced.trim(),
    };
    Ok(serde_json::from_str(object)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn config(url: &str) -> ModelConfig {
        ModelConfig {
            api_key: "test-key".into(),
            model: "test-model".into(),
            base_url: url.into(),
        }
    }

    fn reply(text: &str) -> String {
        json!({ "candidates": [{ "content": { "parts": [{ "text": text }] } }] }).to_string()
    }

    #[test]
    fn verdict_from_fenced_reply() {
        let v = extract_verdict(
            "Here you go:\n```json\n{\"is_safe_for_radio\": true, \"explanation\": \"fine\"}\n```",
        )
        .unwrap();
        assert!(v.is_safe_for_radio);
        assert_eq!(v.explanation, "fine");
    }

    #[test]
    fn verdict_defaults_and_errors() {
        let v = extract_verdict("{}").unwrap();
        assert!(!v.is_safe_for_radio);
        assert_eq!(v.explanation, "Unknown");
        assert!(extract_verdict("no json here").is_err());
    }

    #[test]
    fn mime_follows_extension() {
        assert_eq!(mime_type(Path::new("a.MP3")), "audio/mp3");
        assert_eq!(mime_type(Path::new("a.webm")), "audio/webm");
    }

    #[test]
    fn missing_key_is_a_config_error() {
        let mut cfg = config("http://localhost");
        cfg.api_key.clear();
        // only meaningful when the environment does not provide one
        if std::env::var("GEMINI_API_KEY").is_err() {
            assert!(matches!(
                GeminiClient::new(&cfg, String::new()),
                Err(Error::Config(_))
            ));
        }
    }

    #[test]
    fn classifies_through_api() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/models/test-model:generateContent")
            .match_query(Matcher::UrlEncoded("key".into(), "test-key".into()))
            .match_body(Matcher::PartialJson(json!({
                "system_instruction": { "parts": [{ "text": "judge" }] }
            })))
            .with_status(200)
            .with_body(reply("```json\n{\"is_safe_for_radio\": false, \"explanation\": \"violent\"}\n```"))
            .create();

        let client = GeminiClient::new(&config(&server.url()), "judge".into()).unwrap();
        let verdict = client.classify("some lyrics").unwrap();
        assert!(!verdict.is_safe_for_radio);
        assert_eq!(verdict.explanation, "violent");
        mock.assert();
    }

    #[test]
    fn transcribes_inline_audio() {
        let dir = tempfile::tempdir().unwrap();
        let song = dir.path().join("song.mp3");
        fs::write(&song, b"abc").unwrap();

        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/models/test-model:generateContent")
            .match_query(Matcher::Any)
            .match_body(Matcher::PartialJson(json!({
                "contents": [{ "parts": [
                    { "text": "." },
                    { "inline_data": { "mime_type": "audio/mp3", "data": "YWJj" } }
                ] }]
            })))
            .with_status(200)
            .with_body(reply("la la la"))
            .create();

        let client = GeminiClient::new(&config(&server.url()), "transcribe".into()).unwrap();
        assert_eq!(client.transcribe(&song).as_deref(), Some("la la la"));
        mock.assert();
    }

    #[test]
    fn failures_yield_none() {
        let mut server = mockito::Server::new();
        let _mock = server
            .mock("POST", "/models/test-model:generateContent")
            .match_query(Matcher::Any)
            .with_status(500)
            .create();
        let client = GeminiClient::new(&config(&server.url()), String::new()).unwrap();
        assert!(client.classify("x").is_none());
        assert!(client.transcribe(Path::new("/nonexistent/song.mp3")).is_none());
    }
}
