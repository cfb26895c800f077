//! Streaming matcher tests.

use proptest::prelude::*;
use rust_node_ssh::matcher::{
    BecomeHandshake, BecomeState, ByteSequenceMatcher, HandshakeEvent, OutputStream, SUDO_PROMPT,
    SUDO_SUCCESS,
};

/// Split `data` at the given cut points.
fn chunks(data: &[u8], mut cuts: Vec<usize>) -> Vec<&[u8]> {
    cuts.iter_mut().for_each(|c| *c %= data.len() + 1);
    cuts.sort_unstable();
    cuts.dedup();
    let mut out = Vec::new();
    let mut start = 0;
    for cut in cuts {
        out.push(&data[start..cut]);
        start = cut;
    }
    out.push(&data[start..]);
    out
}

proptest! {
    #[test]
    fn finds_prompt_across_any_split(
        prefix in "[a-z :]{0,40}",
        suffix in "[a-z :]{0,10}",
        cuts in prop::collection::vec(any::<usize>(), 0..8),
    ) {
        let data = format!("{prefix}{SUDO_PROMPT}{suffix}");
        let mut matcher = ByteSequenceMatcher::new(SUDO_PROMPT);
        let mut consumed = 0;
        let mut found = None;
        for chunk in chunks(data.as_bytes(), cuts) {
            if found.is_some() {
                break;
            }
            match matcher.feed(chunk) {
                Some(offset) => found = Some(consumed + offset),
                None => consumed += chunk.len(),
            }
        }
        prop_assert_eq!(found, Some(prefix.len() + SUDO_PROMPT.len()));
    }

    #[test]
    fn no_match_without_pattern(text in "[a-z ]{0,64}") {
        let mut matcher = ByteSequenceMatcher::new(SUDO_SUCCESS);
        prop_assert_eq!(matcher.feed(text.as_bytes()), None);
    }

    #[test]
    fn handshake_confirms_across_any_split(
        noise in "[a-z]{0,16}",
        cuts in prop::collection::vec(any::<usize>(), 0..6),
    ) {
        let data = format!("{noise}{SUDO_SUCCESS}\nrest");
        let mut handshake = BecomeHandshake::new();
        let mut confirmed = false;
        for chunk in chunks(data.as_bytes(), cuts) {
            let events = handshake.feed(OutputStream::Stdout, chunk);
            if events.iter().any(|e| matches!(e, HandshakeEvent::Confirmed { .. })) {
                confirmed = true;
                break;
            }
        }
        prop_assert!(confirmed);
        prop_assert!(handshake.is_confirmed());
    }
}

#[test]
fn rejected_password_is_seen_as_second_prompt() {
    let mut handshake = BecomeHandshake::new();
    let first = handshake.feed(OutputStream::Stderr, b"[sudo] SudoPass");
    assert!(first.is_empty());
    assert_eq!(
        handshake.feed(OutputStream::Stderr, b"word"),
        vec![HandshakeEvent::Prompt { attempt: 1 }]
    );
    assert_eq!(
        handshake.feed(OutputStream::Stderr, b"Sorry, try again.\nSudoPassword"),
        vec![HandshakeEvent::Prompt { attempt: 2 }]
    );
    assert_eq!(handshake.state(), BecomeState::PromptSent { attempts: 2 });
}

#[test]
fn custom_tokens() {
    let mut handshake = BecomeHandshake::with_tokens("Password:", "READY");
    assert_eq!(
        handshake.feed(OutputStream::Stderr, b"Password:"),
        vec![HandshakeEvent::Prompt { attempt: 1 }]
    );
    assert_eq!(
        handshake.feed(OutputStream::Stdout, b"xREADYy"),
        vec![HandshakeEvent::Confirmed { offset: 6 }]
    );
}
