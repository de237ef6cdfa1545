//! Tests for console parsing and rendering

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::super::console::*;
    use peercall_core::prelude::*;
    use peercall_core::{CallDirection, MediaStream};

    #[test]
    fn test_blank_lines_are_skipped() {
        assert_eq!(parse_command("").unwrap(), None);
        assert_eq!(parse_command("   \t ").unwrap(), None);
    }

    #[test]
    fn test_call_takes_a_peer() {
        assert_eq!(
            parse_command("call bob").unwrap(),
            Some(ConsoleCommand::Call(PeerId::new("bob")))
        );
        assert_eq!(
            parse_command("  ring   carol ").unwrap(),
            Some(ConsoleCommand::Ring(PeerId::new("carol")))
        );
        assert!(parse_command("call").is_err());
        assert!(parse_command("call bob carol").is_err());
    }

    #[test]
    fn test_aliases() {
        assert_eq!(parse_command("y").unwrap(), Some(ConsoleCommand::Accept));
        assert_eq!(parse_command("YES").unwrap(), Some(ConsoleCommand::Accept));
        assert_eq!(parse_command("n").unwrap(), Some(ConsoleCommand::Decline));
        assert_eq!(parse_command("bye").unwrap(), Some(ConsoleCommand::Hangup));
        assert_eq!(parse_command("ls").unwrap(), Some(ConsoleCommand::Peers));
        assert_eq!(parse_command("exit").unwrap(), Some(ConsoleCommand::Quit));
    }

    #[test]
    fn test_toggles() {
        assert_eq!(parse_command("mute").unwrap(), Some(ConsoleCommand::Mute(true)));
        assert_eq!(parse_command("unmute").unwrap(), Some(ConsoleCommand::Mute(false)));
        assert_eq!(parse_command("hide").unwrap(), Some(ConsoleCommand::Hide(true)));
        assert_eq!(parse_command("show").unwrap(), Some(ConsoleCommand::Hide(false)));
    }

    #[test]
    fn test_rejects_unknown_and_extra_arguments() {
        let err = parse_command("dance").unwrap_err();
        assert!(err.to_string().contains("unknown command"));

        let err = parse_command("hangup now").unwrap_err();
        assert!(err.to_string().contains("takes no argument"));
    }

    #[test]
    fn test_describe_roster() {
        let empty = CallEvent::RosterChanged { peers: vec![] };
        assert!(describe(&empty).contains("nobody"));

        let peers = CallEvent::RosterChanged {
            peers: vec![PeerId::new("bob"), PeerId::new("carol")],
        };
        assert!(describe(&peers).ends_with("bob, carol"));
    }

    #[test]
    fn test_describe_call_events() {
        let call_id = CallId::new();
        let peer = PeerId::new("bob");

        let incoming = CallEvent::IncomingCall {
            call_id,
            peer: peer.clone(),
        };
        assert!(describe(&incoming).contains("incoming call from bob"));

        let local = CallEvent::LocalStreamReady {
            call_id,
            stream: MediaStream::from_constraints(MediaConstraints::video_call()),
        };
        assert!(describe(&local).contains("2 tracks"));

        let ended = CallEvent::CallEnded {
            call_id,
            peer,
            reason: EndReason::RemoteHangup,
        };
        assert!(describe(&ended).ends_with("remote peer hung up"));
    }

    #[test]
    fn test_describe_call_snapshot() {
        assert_eq!(describe_call(None), "no call");

        let info = CallInfo {
            call_id: CallId::new(),
            peer: PeerId::new("bob"),
            direction: CallDirection::Inbound,
            state: CallState::Offered,
            created_at: chrono::Utc::now(),
            connected_at: None,
        };
        let text = describe_call(Some(&info));
        assert!(text.starts_with("incoming call"));
        assert!(text.contains("with bob"));
        assert!(!text.contains(" for "));
    }
}
