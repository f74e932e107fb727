//! Line-based call console

use anyhow::Result;
use relaycall_core::prelude::*;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

/// A command typed at the console
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Answer,
    Decline,
    HangUp,
    Mute,
    Camera,
    Call(PeerId),
    Status,
    Help,
    Quit,
}

impl ConsoleCommand {
    /// Parse one input line
    pub fn parse(line: &str) -> Result<Self, String> {
        let mut words = line.split_whitespace();
        let command = words.next().ok_or_else(|| "empty command".to_string())?;
        let parsed = match command.to_ascii_lowercase().as_str() {
            "a" | "answer" => Self::Answer,
            "d" | "decline" => Self::Decline,
            "h" | "hangup" | "end" => Self::HangUp,
            "m" | "mute" => Self::Mute,
            "v" | "camera" | "video" => Self::Camera,
            "s" | "status" => Self::Status,
            "?" | "help" => Self::Help,
            "q" | "quit" | "exit" => Self::Quit,
            "c" | "call" => {
                let peer = words
                    .next()
                    .ok_or_else(|| "usage: call <peer-id>".to_string())?;
                Self::Call(PeerId::new(peer))
            }
            other => return Err(format!("unknown command '{other}', type 'help'")),
        };
        if let Some(extra) = words.next() {
            return Err(format!("unexpected argument '{extra}'"));
        }
        Ok(parsed)
    }
}

/// One line describing `event`, if it is worth showing
pub fn describe(event: &CallEvent) -> Option<String> {
    match event {
        CallEvent::IncomingCall { from, name, .. } => Some(match name {
            Some(name) => format!("📞 Incoming call from {name} ({from}) - 'answer' or 'decline'"),
            None => format!("📞 Incoming call from {from} - 'answer' or 'decline'"),
        }),
        CallEvent::CallPlaced { to, .. } => Some(format!("📞 Calling {to}...")),
        CallEvent::StateChanged { state, .. } => match state {
            CallState::Negotiating => Some("🔄 Negotiating...".to_string()),
            CallState::Connected => Some("✅ Connected".to_string()),
            _ => None,
        },
        CallEvent::RemoteStream { stream, .. } => Some(format!(
            "🎥 Remote stream {} ({} tracks)",
            stream.id,
            stream.tracks.tracks().len()
        )),
        CallEvent::CallEnded {
            reason, duration, ..
        } => Some(match duration {
            Some(d) => format!("📴 Call ended: {} after {}s", end_reason(reason), d.num_seconds()),
            None => format!("📴 Call ended: {}", end_reason(reason)),
        }),
        CallEvent::Unavailable { error } => Some(format!("⚠️  {error}")),
    }
}

fn end_reason(reason: &EndReason) -> String {
    match reason {
        EndReason::LocalHangup => "you hung up".to_string(),
        EndReason::RemoteHangup => "peer hung up".to_string(),
        EndReason::Declined => "you declined".to_string(),
        EndReason::RemoteDeclined(Some(why)) => format!("declined ({why})"),
        EndReason::RemoteDeclined(None) => "declined".to_string(),
        EndReason::Timeout => "not answered".to_string(),
        EndReason::LinkFailure(why) => format!("connection lost ({why})"),
        EndReason::SignalRejected(why) => format!("negotiation failed ({why})"),
        EndReason::Shutdown => "client stopped".to_string(),
    }
}

/// Print the command list
pub fn print_help() {
    println!("Commands:");
    println!("  answer | a        Answer the ringing call");
    println!("  decline | d       Decline the ringing call");
    println!("  hangup | h        Hang up or cancel");
    println!("  call | c <peer>   Call a peer id");
    println!("  mute | m          Toggle microphone");
    println!("  camera | v        Toggle camera");
    println!("  status | s        Show call status");
    println!("  quit | q          Leave");
}

async fn execute(service: &CallService, command: ConsoleCommand) -> Result<()> {
    match command {
        ConsoleCommand::Answer => service.answer().await?,
        ConsoleCommand::Decline => service.decline().await?,
        ConsoleCommand::HangUp => service.end_call().await?,
        ConsoleCommand::Call(peer) => {
            service.place_call(peer).await?;
        }
        ConsoleCommand::Mute => {
            let muted = service.toggle_audio();
            println!("{}", if muted { "🔇 Muted" } else { "🔊 Unmuted" });
        }
        ConsoleCommand::Camera => {
            let off = service.toggle_video();
            println!("{}", if off { "📷 Camera off" } else { "📷 Camera on" });
        }
        ConsoleCommand::Status => {
            let snapshot = service.snapshot();
            let flags = service.media_flags();
            println!(
                "State: {:?} | Peer: {} | Muted: {} | Camera off: {}",
                snapshot.state,
                snapshot
                    .peer
                    .as_ref()
                    .map_or_else(|| "-".to_string(), ToString::to_string),
                flags.audio_muted,
                flags.video_off
            );
        }
        ConsoleCommand::Help => print_help(),
        ConsoleCommand::Quit => {}
    }
    Ok(())
}

/// Drive the service from stdin until quit, end of input, or (with
/// `exit_after_call`) the first call ends
pub async fn run(service: &CallService, auto_accept: bool, exit_after_call: bool) -> Result<()> {
    let mut events = service.subscribe_events();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    if let Some(text) = describe(&event) {
                        println!("{text}");
                    }
                    match event {
                        CallEvent::IncomingCall { .. } if auto_accept => {
                            println!("✅ Auto-accepting");
                            if let Err(e) = service.answer().await {
                                println!("⚠️  {e}");
                            }
                        }
                        CallEvent::CallEnded { .. } if exit_after_call => break,
                        _ => {}
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Console fell behind call events");
                }
                Err(RecvError::Closed) => break,
            },
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                match ConsoleCommand::parse(&line) {
                    Ok(ConsoleCommand::Quit) => break,
                    Ok(command) => {
                        if let Err(e) = execute(service, command).await {
                            println!("⚠️  {e}");
                        }
                    }
                    Err(e) => println!("⚠️  {e}"),
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaycall_core::CallId;

    #[test]
    fn test_parse_short_and_long_forms() {
        assert_eq!(ConsoleCommand::parse("a"), Ok(ConsoleCommand::Answer));
        assert_eq!(ConsoleCommand::parse(" ANSWER "), Ok(ConsoleCommand::Answer));
        assert_eq!(ConsoleCommand::parse("hangup"), Ok(ConsoleCommand::HangUp));
        assert_eq!(ConsoleCommand::parse("v"), Ok(ConsoleCommand::Camera));
        assert_eq!(ConsoleCommand::parse("quit"), Ok(ConsoleCommand::Quit));
    }

    #[test]
    fn test_parse_call_needs_peer() {
        assert_eq!(
            ConsoleCommand::parse("call b2"),
            Ok(ConsoleCommand::Call(PeerId::new("b2")))
        );
        assert!(ConsoleCommand::parse("call").is_err());
        assert!(ConsoleCommand::parse("call b2 c3").is_err());
    }

    #[test]
    fn test_parse_rejects_unknown() {
        assert!(ConsoleCommand::parse("dial b2").is_err());
        assert!(ConsoleCommand::parse("mute now").is_err());
        assert!(ConsoleCommand::parse("").is_err());
    }

    #[test]
    fn test_describe_events() {
        let call_id = CallId::new();
        let incoming = CallEvent::IncomingCall {
            call_id,
            from: PeerId::new("a1"),
            name: Some("Alice".to_string()),
        };
        assert!(describe(&incoming).unwrap().contains("Alice (a1)"));

        let ended = CallEvent::CallEnded {
            call_id,
            reason: EndReason::RemoteDeclined(Some("busy".to_string())),
            duration: None,
        };
        assert_eq!(
            describe(&ended).unwrap(),
            "📴 Call ended: declined (busy)"
        );

        let idle = CallEvent::StateChanged {
            call_id,
            state: CallState::Idle,
        };
        assert!(describe(&idle).is_none());
    }
}
