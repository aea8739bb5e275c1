//! Offline backend used when no native inference library is linked.
//!
//! The vocabulary is one token per byte plus BOS and EOS. A "model" here is
//! a reply picked deterministically from the prompt; after each decode the
//! logits put almost all mass on the next byte of that reply, then on EOS.
//! Tokens still go through the real sampler, so streaming is genuine
//! per-step generation.

use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::inference::backend::{
    Backend, BackendError, ContextParams, ModelParams, Session, TokenId,
};

pub const BOS_TOKEN: TokenId = 256;
pub const EOS_TOKEN: TokenId = 257;
pub const VOCAB_SIZE: usize = 258;

/// Logit given to the scripted next token; everything else sits at zero.
const FAVOURED_LOGIT: f32 = 40.0;

const DEFAULT_CONTEXT: u32 = 2048;

const REPLIES: [&str; 4] = [
    "Based on the context provided, I can help you with that.",
    "That is an interesting question. Let me work through it step by step.",
    "I understand what you are asking. Here is a detailed response:",
    "Thanks for the question. I will give you a complete answer.",
];

const LONG_PROMPT: usize = 100;
const LONG_PROMPT_SUFFIX: &str =
    " Given the detail in your message, I can offer a more nuanced view.";

/// Pick the reply for a prompt. Same prompt, same reply.
pub fn scripted_reply(prompt: &[u8]) -> String {
    let hash = prompt.iter().fold(0usize, |acc, &b| acc.wrapping_add(b as usize));
    let mut reply = REPLIES[hash % REPLIES.len()].to_string();
    if prompt.len() > LONG_PROMPT {
        reply.push_str(LONG_PROMPT_SUFFIX);
    }
    reply
}

#[derive(Debug, Clone, Default)]
pub struct FallbackBackend {
    script: Option<String>,
    step_delay: Duration,
}

impl FallbackBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply with `script` regardless of the prompt.
    pub fn with_script(mut self, script: impl Into<String>) -> Self {
        self.script = Some(script.into());
        self
    }

    /// Sleep this long in every decode call.
    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }
}

impl Backend for FallbackBackend {
    fn name(&self) -> &'static str {
        "fallback"
    }

    fn load(
        &self,
        path: &Path,
        _model: &ModelParams,
        context: &ContextParams,
    ) -> Result<Box<dyn Session>, BackendError> {
        let meta = fs::metadata(path)
            .map_err(|e| BackendError::ModelLoadFailed(format!("{}: {e}", path.display())))?;
        if !meta.is_file() {
            return Err(BackendError::ModelLoadFailed(format!(
                "{} is not a file",
                path.display()
            )));
        }

        let n_ctx = if context.n_ctx == 0 {
            DEFAULT_CONTEXT
        } else {
            context.n_ctx
        };

        Ok(Box::new(FallbackSession {
            script: self.script.clone(),
            step_delay: self.step_delay,
            n_ctx: n_ctx as usize,
            cache: Vec::new(),
            prompt_len: 0,
            reply: None,
            logits: vec![0.0; VOCAB_SIZE],
        }))
    }
}

struct FallbackSession {
    script: Option<String>,
    step_delay: Duration,
    n_ctx: usize,

    /// Every token decoded since the last clear.
    cache: Vec<TokenId>,

    /// Length of the first decoded batch; the prompt.
    prompt_len: usize,
    reply: Option<Vec<u8>>,
    logits: Vec<f32>,
}

impl FallbackSession {
    fn refresh_logits(&mut self) {
        self.logits.iter_mut().for_each(|l| *l = 0.0);

        let produced = self.cache.len().saturating_sub(self.prompt_len);
        let next = self
            .reply
            .as_ref()
            .and_then(|r| r.get(produced))
            .map(|&b| b as TokenId)
            .unwrap_or(EOS_TOKEN);
        self.logits[next as usize] = FAVOURED_LOGIT;
    }
}

impl Session for FallbackSession {
    fn n_vocab(&self) -> usize {
        VOCAB_SIZE
    }

    fn n_ctx(&self) -> usize {
        self.n_ctx
    }

    fn kv_cache_used(&self) -> usize {
        self.cache.len()
    }

    fn kv_cache_clear(&mut self) {
        self.cache.clear();
        self.prompt_len = 0;
        self.reply = None;
    }

    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<TokenId>, BackendError> {
        let mut tokens = Vec::with_capacity(text.len() + 1);
        if add_bos {
            tokens.push(BOS_TOKEN);
        }
        tokens.extend(text.bytes().map(TokenId::from));
        Ok(tokens)
    }

    fn decode(&mut self, tokens: &[TokenId]) -> Result<(), BackendError> {
        if let Some(bad) = tokens.iter().find(|&&t| t < 0 || t as usize >= VOCAB_SIZE) {
            return Err(BackendError::DecodeFailed(format!("token {bad} out of range")));
        }
        if self.cache.len() + tokens.len() > self.n_ctx {
            return Err(BackendError::DecodeFailed(format!(
                "context full ({} + {} > {})",
                self.cache.len(),
                tokens.len(),
                self.n_ctx
            )));
        }
        if !self.step_delay.is_zero() {
            std::thread::sleep(self.step_delay);
        }

        self.cache.extend_from_slice(tokens);
        if self.reply.is_none() {
            self.prompt_len = self.cache.len();
            let reply = match &self.script {
                Some(script) => script.clone().into_bytes(),
                None => {
                    let prompt: Vec<u8> = self
                        .cache
                        .iter()
                        .filter(|&&t| t < 256)
                        .map(|&t| t as u8)
                        .collect();
                    scripted_reply(&prompt).into_bytes()
                }
            };
            self.reply = Some(reply);
        }
        self.refresh_logits();
        Ok(())
    }

    fn logits(&self) -> Result<&[f32], BackendError> {
        if self.reply.is_none() {
            return Err(BackendError::DecodeFailed("no tokens decoded".to_string()));
        }
        Ok(&self.logits)
    }

    fn token_to_piece(&self, token: TokenId) -> Result<Vec<u8>, BackendError> {
        match token {
            0..=255 => Ok(vec![token as u8]),
            BOS_TOKEN | EOS_TOKEN => Ok(Vec::new()),
            _ => Err(BackendError::DecodeFailed(format!("unknown token {token}"))),
        }
    }

    fn is_end_of_generation(&self, token: TokenId) -> bool {
        token == EOS_TOKEN
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(backend: &FallbackBackend, n_ctx: u32) -> (tempfile::NamedTempFile, Box<dyn Session>) {
        let file = tempfile::NamedTempFile::new().unwrap();
        let ctx = ContextParams {
            n_ctx,
            ..Default::default()
        };
        let session = backend
            .load(file.path(), &ModelParams::default(), &ctx)
            .unwrap();
        (file, session)
    }

    #[test]
    fn test_load_missing_file() {
        let result = FallbackBackend::new().load(
            Path::new("/nonexistent/model.gguf"),
            &ModelParams::default(),
            &ContextParams::default(),
        );
        assert!(matches!(result, Err(BackendError::ModelLoadFailed(_))));
    }

    #[test]
    fn test_tokenize_bytes() {
        let (_f, session) = open(&FallbackBackend::new(), 64);
        let tokens = session.tokenize("Hi", true).unwrap();
        assert_eq!(tokens, vec![BOS_TOKEN, b'H' as TokenId, b'i' as TokenId]);
        assert_eq!(session.token_to_piece(b'H' as TokenId).unwrap(), b"H");
        assert!(session.token_to_piece(EOS_TOKEN).unwrap().is_empty());
    }

    #[test]
    fn test_logits_follow_script() {
        let (_f, mut session) = open(&FallbackBackend::new().with_script("ok"), 64);
        assert!(session.logits().is_err());

        session.decode(&[BOS_TOKEN, b'q' as TokenId]).unwrap();
        let logits = session.logits().unwrap();
        assert_eq!(logits[b'o' as usize], FAVOURED_LOGIT);

        session.decode(&[b'o' as TokenId]).unwrap();
        session.decode(&[b'k' as TokenId]).unwrap();
        assert_eq!(session.logits().unwrap()[EOS_TOKEN as usize], FAVOURED_LOGIT);
        assert_eq!(session.kv_cache_used(), 4);

        session.kv_cache_clear();
        assert_eq!(session.kv_cache_used(), 0);
    }

    #[test]
    fn test_context_limit() {
        let (_f, mut session) = open(&FallbackBackend::new(), 4);
        assert!(session.decode(&[1, 2, 3, 4, 5]).is_err());
        session.decode(&[1, 2, 3, 4]).unwrap();
        assert!(session.decode(&[5]).is_err());
    }

    #[test]
    fn test_reply_is_deterministic() {
        assert_eq!(scripted_reply(b"hello"), scripted_reply(b"hello"));
        assert!(scripted_reply(&[b'x'; 200]).ends_with(LONG_PROMPT_SUFFIX));
    }
}
