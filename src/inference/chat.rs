//! Flattens a conversation into a single prompt, and drives the
//! interactive chat prompt on top of an engine.

use std::io::{BufRead, Write};

use crate::inference::engine::InferenceEngine;
use crate::inference::types::{ChatMessage, ChatRequest, GenerateOptions, Role};

/// Cue appended after the last message; completion starts here.
pub const ASSISTANT_CUE: &str = "Assistant: ";

fn prefix(role: Role) -> Option<&'static str> {
    match role {
        Role::System => Some("System: "),
        Role::User => Some("User: "),
        Role::Assistant => Some(ASSISTANT_CUE),
        Role::Other => None,
    }
}

/// One `Role: content` line per known message, then the assistant cue.
/// Messages with unknown roles are skipped.
pub fn format_prompt(messages: &[ChatMessage]) -> String {
    let mut prompt = String::new();
    for msg in messages {
        if let Some(prefix) = prefix(msg.role) {
            prompt.push_str(prefix);
            prompt.push_str(&msg.content);
            prompt.push('\n');
        }
    }
    prompt.push_str(ASSISTANT_CUE);
    prompt
}

/// A conversation built up one exchange at a time, as the interactive
/// `chat` command does.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Conversation {
    system: Option<String>,
    turns: Vec<ChatMessage>,
}

impl Conversation {
    pub fn new(system: Option<String>) -> Self {
        Self {
            system: system.filter(|s| !s.trim().is_empty()),
            turns: Vec::new(),
        }
    }

    /// The history so far plus `input` as the next user message. The
    /// conversation itself is unchanged until [`Conversation::record`].
    pub fn with_user(&self, input: &str) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.turns.len() + 2);
        if let Some(system) = &self.system {
            messages.push(ChatMessage::new(Role::System, system.as_str()));
        }
        messages.extend(self.turns.iter().cloned());
        messages.push(ChatMessage::new(Role::User, input));
        messages
    }

    /// Keep a completed exchange.
    pub fn record(&mut self, input: &str, reply: &str) {
        self.turns.push(ChatMessage::new(Role::User, input));
        self.turns.push(ChatMessage::new(Role::Assistant, reply.trim()));
    }

    /// Forget every exchange; the system message stays.
    pub fn clear(&mut self) {
        self.turns.clear();
    }

    pub fn exchanges(&self) -> usize {
        self.turns.len() / 2
    }
}

/// One line typed at the chat prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatInput<'a> {
    Quit,
    Clear,
    Empty,
    Message(&'a str),
}

pub fn parse_input(line: &str) -> ChatInput<'_> {
    match line.trim() {
        "" => ChatInput::Empty,
        "/bye" | "/exit" => ChatInput::Quit,
        "/clear" => ChatInput::Clear,
        text => ChatInput::Message(text),
    }
}

/// Answer each line read from `input` through `engine`, streaming replies
/// to `output`, until `/bye` or end of input.
///
/// A failed turn is reported on `output` and left out of the history.
pub fn interact(
    engine: &dyn InferenceEngine,
    model: &str,
    options: &GenerateOptions,
    conversation: &mut Conversation,
    input: &mut dyn BufRead,
    output: &mut dyn Write,
) -> anyhow::Result<()> {
    let mut line = String::new();
    loop {
        write!(output, ">>> ")?;
        output.flush()?;

        line.clear();
        if input.read_line(&mut line)? == 0 {
            writeln!(output)?;
            return Ok(());
        }

        let text = match parse_input(&line) {
            ChatInput::Quit => {
                writeln!(output, "Goodbye!")?;
                return Ok(());
            }
            ChatInput::Clear => {
                conversation.clear();
                writeln!(output, "Conversation cleared.")?;
                continue;
            }
            ChatInput::Empty => continue,
            ChatInput::Message(text) => text,
        };

        let request = ChatRequest {
            model: model.to_string(),
            messages: conversation.with_user(text),
            stream: true,
            options: options.clone(),
        };
        let mut reply = String::new();
        let result = engine.chat_stream(&request, &mut |fragment| {
            output.write_all(fragment.text.as_bytes())?;
            output.flush()?;
            reply.push_str(&fragment.text);
            Ok(())
        });
        writeln!(output)?;

        match result {
            Ok(()) => conversation.record(text, &reply),
            Err(e) => writeln!(output, "Error: {e}")?,
        }
    }
}
