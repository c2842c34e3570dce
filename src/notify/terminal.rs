use anyhow::Result;
use chrono::Utc;
use tokio::io::{self, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::traits::{DeliveryReceipt, InboundReply, NotificationChannel};
use crate::process::BoxFuture;
use crate::prompt::PromptEvent;

/// Marks a stdin line as an answer to a prompt rather than agent input.
pub const REPLY_MARKER: char = ':';

/// Terminal channel: prompts go to stderr, answers come from stdin as
/// `:<prompt-id-prefix> <reply>`. Every other stdin line is passed through
/// to the supervised process when a passthrough sender is set.
pub struct TerminalChannel {
    passthrough: Option<mpsc::Sender<Vec<u8>>>,
}

impl TerminalChannel {
    pub fn new(passthrough: Option<mpsc::Sender<Vec<u8>>>) -> Self {
        Self { passthrough }
    }
}

/// Split a `:<ref> <reply>` line. The reply may be empty (just Enter).
pub fn parse_reply_line(line: &str) -> Option<InboundReply> {
    let rest = line.trim_end_matches(['\r', '\n']).strip_prefix(REPLY_MARKER)?;
    let (prompt_ref, value) = match rest.split_once(char::is_whitespace) {
        Some((prompt_ref, value)) => (prompt_ref, value.trim()),
        None => (rest, ""),
    };
    if prompt_ref.is_empty() {
        return None;
    }
    Some(InboundReply {
        prompt_ref: prompt_ref.to_string(),
        value: value.to_string(),
        channel: "terminal".into(),
    })
}

impl NotificationChannel for TerminalChannel {
    fn name(&self) -> &str {
        "terminal"
    }

    fn send<'a>(&'a self, event: &'a PromptEvent) -> BoxFuture<'a, Result<DeliveryReceipt>> {
        Box::pin(async move {
            let short = event.short_id();
            eprintln!();
            eprintln!("┌─ Agent is waiting for input ─────────────────────");
            eprintln!("│ Prompt:  {short} ({}, {} confidence)", event.prompt_type, event.confidence.tier);
            for line in event.excerpt.lines() {
                eprintln!("│   {line}");
            }
            for choice in &event.choices {
                eprintln!("│   [{}] {}", choice.number, choice.label);
            }
            eprintln!("├──────────────────────────────────────────────────");
            eprintln!("│ Answer with  {REPLY_MARKER}{short} <reply>   (y / n / #N / cancel / text)");
            eprintln!("└──────────────────────────────────────────────────");
            Ok(DeliveryReceipt {
                channel: "terminal".into(),
                prompt_id: event.id.to_string(),
                delivered_at: Utc::now(),
            })
        })
    }

    fn alert<'a>(&'a self, message: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            eprintln!("⚠ promptwarden: {message}");
            Ok(())
        })
    }

    fn listen(
        &self,
        sink: mpsc::Sender<InboundReply>,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut lines = BufReader::new(io::stdin()).lines();
            loop {
                let line = tokio::select! {
                    () = cancel.cancelled() => break,
                    line = lines.next_line() => line?,
                };
                let Some(line) = line else { break };

                if let Some(reply) = parse_reply_line(&line) {
                    if sink.send(reply).await.is_err() {
                        break;
                    }
                    continue;
                }
                if line.starts_with(REPLY_MARKER) {
                    eprintln!("⚠ promptwarden: expected {REPLY_MARKER}<prompt-id> <reply>");
                    continue;
                }
                if let Some(passthrough) = &self.passthrough {
                    let mut bytes = line.into_bytes();
                    bytes.push(b'\n');
                    if passthrough.send(bytes).await.is_err() {
                        break;
                    }
                }
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_channel_name() {
        assert_eq!(TerminalChannel::new(None).name(), "terminal");
    }

    #[test]
    fn reply_lines_are_split_on_first_space() {
        let reply = parse_reply_line(":3f2a9c yes please\n").unwrap();
        assert_eq!(reply.prompt_ref, "3f2a9c");
        assert_eq!(reply.value, "yes please");

        let enter = parse_reply_line(":3f2a9c").unwrap();
        assert_eq!(enter.value, "");
    }

    #[test]
    fn plain_lines_are_not_replies() {
        assert!(parse_reply_line("git status").is_none());
        assert!(parse_reply_line(": y").is_none());
    }
}
