use anyhow::Result;
use promptwarden::autopilot::{Autopilot, AutonomyMode, CommandOutcome};
use promptwarden::notify::InboundReply;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Prompt references starting with this are operator commands, e.g.
/// `:!kill` or `:!mode full` typed into the terminal.
const OPERATOR_PREFIX: char = '!';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorLine {
    Pause,
    Resume,
    Kill,
    Restart,
    Mode(AutonomyMode),
}

pub fn parse_operator_line(reply: &InboundReply) -> Option<Result<OperatorLine, String>> {
    let verb = reply.prompt_ref.strip_prefix(OPERATOR_PREFIX)?;
    let parsed = match verb.to_ascii_lowercase().as_str() {
        "pause" => Ok(OperatorLine::Pause),
        "resume" => Ok(OperatorLine::Resume),
        "kill" | "stop" => Ok(OperatorLine::Kill),
        "restart" => Ok(OperatorLine::Restart),
        "mode" => reply
            .value
            .parse()
            .map(OperatorLine::Mode)
            .map_err(|_| format!("unknown mode '{}' (off, assist, full)", reply.value)),
        other => Err(format!("unknown operator command '{other}'")),
    };
    Some(parsed)
}

async fn apply(autopilot: &Autopilot, line: OperatorLine) -> Result<CommandOutcome> {
    let outcome = match line {
        OperatorLine::Pause => autopilot.pause().await?,
        OperatorLine::Resume => autopilot.resume().await?,
        OperatorLine::Kill => autopilot.kill_switch().await?,
        OperatorLine::Restart => autopilot.restart().await?,
        OperatorLine::Mode(mode) => autopilot.set_mode(mode).await?,
    };
    Ok(outcome)
}

/// Split the terminal's inbound stream: operator commands are applied to
/// the autopilot here, prompt replies continue to the session.
pub async fn route_inbound(
    autopilot: Arc<Autopilot>,
    mut inbound: mpsc::Receiver<InboundReply>,
    replies: mpsc::Sender<InboundReply>,
) {
    while let Some(reply) = inbound.recv().await {
        match parse_operator_line(&reply) {
            None => {
                if replies.send(reply).await.is_err() {
                    break;
                }
            }
            Some(Ok(line)) => match apply(&autopilot, line).await {
                Ok(outcome) => eprintln!("◆ autopilot {}", outcome.after.label()),
                Err(e) => eprintln!("✗ {e}"),
            },
            Some(Err(message)) => eprintln!("✗ {message}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(prompt_ref: &str, value: &str) -> InboundReply {
        InboundReply {
            prompt_ref: prompt_ref.into(),
            value: value.into(),
            channel: "terminal".into(),
        }
    }

    #[test]
    fn prompt_replies_are_not_operator_lines() {
        assert!(parse_operator_line(&reply("3f2a", "y")).is_none());
    }

    #[test]
    fn operator_verbs_parse() {
        assert_eq!(
            parse_operator_line(&reply("!kill", "")),
            Some(Ok(OperatorLine::Kill))
        );
        assert_eq!(
            parse_operator_line(&reply("!mode", "full")),
            Some(Ok(OperatorLine::Mode(AutonomyMode::Full)))
        );
        assert!(matches!(
            parse_operator_line(&reply("!mode", "turbo")),
            Some(Err(_))
        ));
    }
}
