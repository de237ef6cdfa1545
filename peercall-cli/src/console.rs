//! Interactive console commands and event rendering

use anyhow::{bail, Result};
use peercall_core::prelude::*;
use peercall_core::CallDirection;

/// A line typed at the console
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    /// Show the command list
    Help,
    /// List online peers
    Peers,
    /// Call a peer
    Call(PeerId),
    /// Hang up the current call
    Hangup,
    /// Accept the incoming call
    Accept,
    /// Decline the incoming call
    Decline,
    /// Mute (`true`) or unmute the microphone
    Mute(bool),
    /// Hide (`true`) or show the camera
    Hide(bool),
    /// Show the current call
    Status,
    /// Make a simulated peer call us
    Ring(PeerId),
    /// Leave the console
    Quit,
}

/// Parse one console line; blank lines yield `None`
pub fn parse_command(line: &str) -> Result<Option<ConsoleCommand>> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let argument = words.next();
    if words.next().is_some() {
        bail!("too many arguments for '{verb}'");
    }

    let command = match (verb.to_ascii_lowercase().as_str(), argument) {
        ("help" | "?", None) => ConsoleCommand::Help,
        ("peers" | "ls", None) => ConsoleCommand::Peers,
        ("call", Some(peer)) => ConsoleCommand::Call(PeerId::new(peer)),
        ("ring", Some(peer)) => ConsoleCommand::Ring(PeerId::new(peer)),
        ("hangup" | "bye", None) => ConsoleCommand::Hangup,
        ("accept" | "yes" | "y", None) => ConsoleCommand::Accept,
        ("decline" | "no" | "n", None) => ConsoleCommand::Decline,
        ("mute", None) => ConsoleCommand::Mute(true),
        ("unmute", None) => ConsoleCommand::Mute(false),
        ("hide", None) => ConsoleCommand::Hide(true),
        ("show", None) => ConsoleCommand::Hide(false),
        ("status", None) => ConsoleCommand::Status,
        ("quit" | "exit", None) => ConsoleCommand::Quit,
        ("call" | "ring", None) => bail!("usage: {verb} <peer>"),
        (_, Some(_)) if is_known(verb) => bail!("'{verb}' takes no argument"),
        _ => bail!("unknown command '{verb}', type 'help'"),
    };
    Ok(Some(command))
}

fn is_known(verb: &str) -> bool {
    matches!(
        verb.to_ascii_lowercase().as_str(),
        "help"
            | "?"
            | "peers"
            | "ls"
            | "hangup"
            | "bye"
            | "accept"
            | "yes"
            | "y"
            | "decline"
            | "no"
            | "n"
            | "mute"
            | "unmute"
            | "hide"
            | "show"
            | "status"
            | "quit"
            | "exit"
    )
}

/// Command summary printed by `help`
pub const HELP: &str = "\
Commands:
  peers            list online peers
  call <peer>      call a peer
  ring <peer>      make a simulated peer call you
  accept | decline answer an incoming call
  hangup           end the current call
  mute | unmute    toggle the microphone
  hide | show      toggle the camera
  status           show the current call
  quit             leave";

/// One-line description of an event
pub fn describe(event: &CallEvent) -> String {
    match event {
        CallEvent::RosterChanged { peers } if peers.is_empty() => "👥 nobody else online".to_string(),
        CallEvent::RosterChanged { peers } => {
            let names: Vec<&str> = peers.iter().map(PeerId::as_str).collect();
            format!("👥 online: {}", names.join(", "))
        }
        CallEvent::IncomingCall { peer, .. } => {
            format!("📞 incoming call from {peer} (accept / decline)")
        }
        CallEvent::StateChanged { peer, state, .. } => format!("   call with {peer}: {state}"),
        CallEvent::LocalStreamReady { stream, .. } => {
            format!("🎥 local stream ready ({} tracks)", stream.tracks().len())
        }
        CallEvent::RemoteStreamReady { stream, .. } => {
            format!("🎥 remote stream {} ready", stream.id())
        }
        CallEvent::Declined { peer, .. } => format!("❌ {peer} declined the call"),
        CallEvent::CallEnded { peer, reason, .. } => format!("📴 call with {peer} ended: {reason}"),
    }
}

/// Summary of the current call
pub fn describe_call(info: Option<&CallInfo>) -> String {
    let Some(info) = info else {
        return "no call".to_string();
    };
    let direction = match info.direction {
        CallDirection::Outbound => "outgoing",
        CallDirection::Inbound => "incoming",
    };
    let mut out = format!(
        "{direction} call {} with {}: {}",
        info.call_id, info.peer, info.state
    );
    if let Some(duration) = info.duration() {
        out.push_str(&format!(" for {}s", duration.num_seconds()));
    }
    out
}
