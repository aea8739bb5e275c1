//! The token loop: tokenize, evaluate the prompt, then sample and evaluate
//! one token at a time until a stop condition.
//!
//! Text is produced incrementally. Token pieces are raw bytes and may split
//! a UTF-8 character, so bytes are held back until they decode. Stop
//! strings are matched against the accumulated text; the fragment that
//! completes a stop string is cut right after it and is the last one sent.

use tracing::debug;

use crate::inference::backend::Session;
use crate::inference::engine::EngineError;
use crate::inference::sampling::{Sampler, SamplingParams};
use crate::inference::types::GenerateOptions;

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub max_tokens: usize,
    pub stop: Vec<String>,
    pub sampling: SamplingParams,
}

impl From<&GenerateOptions> for GenerationParams {
    fn from(opts: &GenerateOptions) -> Self {
        Self {
            max_tokens: opts.max_tokens(),
            stop: opts.stop.iter().filter(|s| !s.is_empty()).cloned().collect(),
            sampling: opts.sampling(),
        }
    }
}

/// A piece of generated text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub text: String,
    pub done: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// The backend produced an end-of-generation token.
    EndOfText,
    StopString,
    MaxTokens,
    ContextFull,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub reason: FinishReason,
}

/// Run one generation on `session`, handing each fragment to `deliver`.
///
/// Exactly one delivered fragment has `done = true` and it is the last.
/// Fragments with no text are only sent when they are the final one.
pub fn run(
    session: &mut dyn Session,
    prompt: &str,
    params: &GenerationParams,
    deliver: &mut dyn FnMut(Fragment) -> anyhow::Result<()>,
) -> Result<Completion, EngineError> {
    session.kv_cache_clear();

    let tokens = session
        .tokenize(prompt, true)
        .map_err(EngineError::TokenizeFailed)?;
    let n_ctx = session.n_ctx();
    if tokens.len() >= n_ctx {
        return Err(EngineError::ContextOverflow {
            tokens: tokens.len(),
            n_ctx,
        });
    }

    debug!(prompt_tokens = tokens.len(), n_ctx, "Evaluating prompt");
    session.decode(&tokens).map_err(EngineError::EvalFailed)?;

    let mut sampler = Sampler::new(params.sampling);
    let mut text = String::new();
    let mut pending: Vec<u8> = Vec::new();
    let mut generated = 0;
    let longest_stop = params.stop.iter().map(String::len).max().unwrap_or(0);

    let mut emit = |fragment: Fragment| deliver(fragment).map_err(EngineError::Delivery);

    let reason = loop {
        let logits = session
            .logits()
            .map_err(|e| EngineError::SampleFailed(e.to_string()))?;
        let token = sampler
            .sample(logits)
            .ok_or_else(|| EngineError::SampleFailed("no candidate tokens".to_string()))?;

        if session.is_end_of_generation(token) {
            break FinishReason::EndOfText;
        }

        session.decode(&[token]).map_err(EngineError::EvalFailed)?;
        generated += 1;

        let piece = session.token_to_piece(token).map_err(EngineError::EvalFailed)?;
        pending.extend_from_slice(&piece);
        let start = text.len();
        text.push_str(&take_valid_utf8(&mut pending));

        if let Some(end) = find_stop(&text, start, longest_stop, &params.stop) {
            emit(Fragment {
                text: text[start..end].to_string(),
                done: true,
            })?;
            return Ok(Completion {
                prompt_tokens: tokens.len(),
                completion_tokens: generated,
                reason: FinishReason::StopString,
            });
        }

        let limit = if generated >= params.max_tokens {
            Some(FinishReason::MaxTokens)
        } else if session.kv_cache_used() >= n_ctx {
            Some(FinishReason::ContextFull)
        } else {
            None
        };

        if let Some(reason) = limit {
            let mut last = text[start..].to_string();
            last.push_str(&String::from_utf8_lossy(&pending));
            emit(Fragment {
                text: last,
                done: true,
            })?;
            return Ok(Completion {
                prompt_tokens: tokens.len(),
                completion_tokens: generated,
                reason,
            });
        }

        if text.len() > start {
            emit(Fragment {
                text: text[start..].to_string(),
                done: false,
            })?;
        }
    };

    emit(Fragment {
        text: String::from_utf8_lossy(&pending).into_owned(),
        done: true,
    })?;
    Ok(Completion {
        prompt_tokens: tokens.len(),
        completion_tokens: generated,
        reason,
    })
}

/// Drain the longest valid UTF-8 prefix of `pending`. Invalid sequences
/// (as opposed to incomplete trailing ones) become U+FFFD.
fn take_valid_utf8(pending: &mut Vec<u8>) -> String {
    let mut out = String::new();
    loop {
        match std::str::from_utf8(pending) {
            Ok(s) => {
                out.push_str(s);
                pending.clear();
                return out;
            }
            Err(e) => {
                let valid = e.valid_up_to();
                out.push_str(&String::from_utf8_lossy(&pending[..valid]));
                match e.error_len() {
                    Some(bad) => {
                        out.push(char::REPLACEMENT_CHARACTER);
                        pending.drain(..valid + bad);
                    }
                    None => {
                        pending.drain(..valid);
                        return out;
                    }
                }
            }
        }
    }
}

/// End offset of the earliest stop string that ends after `start`.
///
/// Only the tail that could hold a new match is searched.
fn find_stop(text: &str, start: usize, longest: usize, stops: &[String]) -> Option<usize> {
    if stops.is_empty() || text.len() == start {
        return None;
    }
    let mut from = start.saturating_sub(longest.saturating_sub(1));
    while !text.is_char_boundary(from) {
        from -= 1;
    }
    let window = &text[from..];
    stops
        .iter()
        .filter_map(|stop| window.find(stop.as_str()).map(|i| from + i + stop.len()))
        .filter(|&end| end > start)
        .min()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::backend::{Backend, ContextParams, ModelParams};
    use crate::inference::fallback::FallbackBackend;

    fn session(script: &str, n_ctx: u32) -> (tempfile::NamedTempFile, Box<dyn Session>) {
        let file = tempfile::NamedTempFile::new().unwrap();
        let ctx = ContextParams {
            n_ctx,
            ..Default::default()
        };
        let session = FallbackBackend::new()
            .with_script(script)
            .load(file.path(), &ModelParams::default(), &ctx)
            .unwrap();
        (file, session)
    }

    fn params(max_tokens: usize, stop: &[&str]) -> GenerationParams {
        GenerationParams {
            max_tokens,
            stop: stop.iter().map(|s| s.to_string()).collect(),
            sampling: SamplingParams::greedy(),
        }
    }

    fn collect(
        session: &mut dyn Session,
        prompt: &str,
        params: &GenerationParams,
    ) -> (Vec<Fragment>, Completion) {
        let mut fragments = Vec::new();
        let completion = run(session, prompt, params, &mut |f| {
            fragments.push(f);
            Ok(())
        })
        .unwrap();
        (fragments, completion)
    }

    fn joined(fragments: &[Fragment]) -> String {
        fragments.iter().map(|f| f.text.as_str()).collect()
    }

    #[test]
    fn test_runs_to_end_of_text() {
        let (_f, mut s) = session("abc", 64);
        let (fragments, completion) = collect(s.as_mut(), "p", &params(512, &[]));

        assert_eq!(joined(&fragments), "abc");
        assert_eq!(fragments.len(), 4);
        assert_eq!(fragments.last().unwrap(), &Fragment { text: String::new(), done: true });
        assert_eq!(completion.reason, FinishReason::EndOfText);
        assert_eq!(completion.completion_tokens, 3);
        assert_eq!(completion.prompt_tokens, 2);
    }

    #[test]
    fn test_max_tokens_marks_last_fragment_done() {
        let (_f, mut s) = session("abcdef", 64);
        let (fragments, completion) = collect(s.as_mut(), "p", &params(2, &[]));

        assert_eq!(joined(&fragments), "ab");
        assert_eq!(fragments.len(), 2);
        assert!(fragments[1].done);
        assert!(!fragments[0].done);
        assert_eq!(completion.reason, FinishReason::MaxTokens);
    }

    #[test]
    fn test_stop_string_ends_generation() {
        let (_f, mut s) = session("hello STOP and more", 64);
        let (fragments, completion) = collect(s.as_mut(), "p", &params(512, &["STOP"]));

        let text = joined(&fragments);
        assert_eq!(text, "hello STOP");
        assert!(!text.contains(" and"));
        assert_eq!(completion.reason, FinishReason::StopString);
        assert_eq!(fragments.iter().filter(|f| f.done).count(), 1);
        assert!(fragments.last().unwrap().done);
    }

    #[test]
    fn test_earliest_stop_wins() {
        let (_f, mut s) = session("one. two! three", 64);
        let (fragments, _) = collect(s.as_mut(), "p", &params(512, &["!", "."]));
        assert_eq!(joined(&fragments), "one.");
    }

    #[test]
    fn test_multibyte_characters_are_held_back() {
        let (_f, mut s) = session("héé", 64);
        let (fragments, _) = collect(s.as_mut(), "p", &params(512, &[]));

        assert_eq!(joined(&fragments), "héé");
        // Continuation bytes yield no text on their own and are skipped.
        assert!(fragments.iter().all(|f| f.done || !f.text.is_empty()));
        assert_eq!(fragments.len(), 4);
    }

    #[test]
    fn test_context_overflow() {
        let (_f, mut s) = session("x", 8);
        let err = run(s.as_mut(), "a prompt that is too long", &params(4, &[]), &mut |_| Ok(()))
            .unwrap_err();
        assert!(matches!(err, EngineError::ContextOverflow { n_ctx: 8, .. }));
    }

    #[test]
    fn test_context_full_stops() {
        // BOS + "ab" leaves room for five generated tokens.
        let (_f, mut s) = session("0123456789", 8);
        let (fragments, completion) = collect(s.as_mut(), "ab", &params(512, &[]));
        assert_eq!(joined(&fragments), "01234");
        assert_eq!(completion.reason, FinishReason::ContextFull);
    }

    #[test]
    fn test_session_reused_between_runs() {
        let (_f, mut s) = session("same", 64);
        let (first, _) = collect(s.as_mut(), "p", &params(512, &[]));
        let (second, _) = collect(s.as_mut(), "p", &params(512, &[]));
        assert_eq!(first, second);
    }

    #[test]
    fn test_take_valid_utf8() {
        let mut pending = vec![b'a', 0xC3];
        assert_eq!(take_valid_utf8(&mut pending), "a");
        assert_eq!(pending, vec![0xC3]);
        pending.push(0xA9);
        assert_eq!(take_valid_utf8(&mut pending), "é");
        assert!(pending.is_empty());

        let mut pending = vec![0xFF, b'b'];
        assert_eq!(take_valid_utf8(&mut pending), "\u{FFFD}b");
    }

    #[test]
    fn test_find_stop_window() {
        let stops = vec!["STOP".to_string()];
        assert_eq!(find_stop("xxSTO", 4, 4, &stops), None);
        assert_eq!(find_stop("xxSTOP", 5, 4, &stops), Some(6));
        assert_eq!(find_stop("xxSTOP", 6, 4, &stops), None);
    }
}
