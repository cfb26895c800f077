//! Streaming byte-sequence matching for the sudo handshake.
//!
//! Output arrives in arbitrary chunks, so a token such as `SudoPassword` may
//! be split across reads. [`ByteSequenceMatcher`] keeps its partial-match
//! state between calls. [`BecomeHandshake`] drives two of them per output
//! stream through the [`BecomeState`] machine.

/// Prompt passed to `sudo -p`.
pub const SUDO_PROMPT: &str = "SudoPassword";

/// Printed by the wrapped command once sudo has let it run.
pub const SUDO_SUCCESS: &str = "SUDO-SUCCESS";

/// Incremental matcher for one fixed byte sequence (Knuth-Morris-Pratt).
#[derive(Debug, Clone)]
pub struct ByteSequenceMatcher {
    pattern: Vec<u8>,
    failure: Vec<usize>,
    matched: usize,
}

impl ByteSequenceMatcher {
    /// Matcher for `pattern`. An empty pattern never matches.
    #[must_use]
    pub fn new(pattern: impl Into<Vec<u8>>) -> Self {
        let pattern = pattern.into();
        let mut failure = vec![0; pattern.len()];
        let mut k = 0;
        for i in 1..pattern.len() {
            while k > 0 && pattern[i] != pattern[k] {
                k = failure[k - 1];
            }
            if pattern[i] == pattern[k] {
                k += 1;
            }
            failure[i] = k;
        }
        Self {
            pattern,
            failure,
            matched: 0,
        }
    }

    /// The sequence being searched for.
    #[must_use]
    pub fn pattern(&self) -> &[u8] {
        &self.pattern
    }

    /// Consume one byte; true when it completes a match.
    ///
    /// Matches may overlap: after a hit the matcher keeps the longest
    /// border of the pattern as its partial state.
    pub fn push(&mut self, byte: u8) -> bool {
        if self.pattern.is_empty() {
            return false;
        }
        while self.matched > 0 && self.pattern[self.matched] != byte {
            self.matched = self.failure[self.matched - 1];
        }
        if self.pattern[self.matched] == byte {
            self.matched += 1;
        }
        if self.matched == self.pattern.len() {
            self.matched = self.failure[self.matched - 1];
            return true;
        }
        false
    }

    /// Consume `chunk` up to the first match.
    ///
    /// Returns the offset just past the matching byte. Bytes after it are
    /// not consumed.
    pub fn feed(&mut self, chunk: &[u8]) -> Option<usize> {
        chunk
            .iter()
            .position(|&b| self.push(b))
            .map(|i| i + 1)
    }

    /// Forget any partial match.
    pub fn reset(&mut self) {
        self.matched = 0;
    }
}

/// Progress of the sudo password handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BecomeState {
    /// Nothing seen yet.
    AwaitingPrompt,
    /// The prompt was answered this many times.
    PromptSent {
        /// Prompts seen so far.
        attempts: u32,
    },
    /// The success marker was printed; the command is running.
    Confirmed,
}

/// Which output stream a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

impl OutputStream {
    const fn index(self) -> usize {
        match self {
            Self::Stdout => 0,
            Self::Stderr => 1,
        }
    }

    /// Lowercase stream name, as used in log fields.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// Something the handshake saw in the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeEvent {
    /// sudo asked for the password.
    Prompt {
        /// 1 for the first prompt; anything higher means a rejected password.
        attempt: u32,
    },
    /// The success marker ended at this offset of the chunk.
    Confirmed {
        /// Offset just past the marker.
        offset: usize,
    },
}

/// Scans both output streams for the sudo prompt and the success marker.
///
/// Each stream has its own matchers so tokens split across chunks of one
/// stream are found even when the other stream interleaves.
#[derive(Debug, Clone)]
pub struct BecomeHandshake {
    prompt: [ByteSequenceMatcher; 2],
    confirm: [ByteSequenceMatcher; 2],
    state: BecomeState,
}

impl Default for BecomeHandshake {
    fn default() -> Self {
        Self::new()
    }
}

impl BecomeHandshake {
    /// Handshake for the standard prompt and marker.
    #[must_use]
    pub fn new() -> Self {
        Self::with_tokens(SUDO_PROMPT, SUDO_SUCCESS)
    }

    /// Handshake for custom tokens.
    #[must_use]
    pub fn with_tokens(prompt: &str, confirm: &str) -> Self {
        let prompt = ByteSequenceMatcher::new(prompt);
        let confirm = ByteSequenceMatcher::new(confirm);
        Self {
            prompt: [prompt.clone(), prompt],
            confirm: [confirm.clone(), confirm],
            state: BecomeState::AwaitingPrompt,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> BecomeState {
        self.state
    }

    /// Whether the marker has been seen.
    #[must_use]
    pub const fn is_confirmed(&self) -> bool {
        matches!(self.state, BecomeState::Confirmed)
    }

    /// Prompts seen while not yet confirmed.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        match self.state {
            BecomeState::AwaitingPrompt | BecomeState::Confirmed => 0,
            BecomeState::PromptSent { attempts } => attempts,
        }
    }

    /// Scan `chunk` from `stream`.
    ///
    /// Scanning stops at the marker; nothing is scanned once confirmed.
    pub fn feed(&mut self, stream: OutputStream, chunk: &[u8]) -> Vec<HandshakeEvent> {
        let mut events = Vec::new();
        if self.is_confirmed() {
            return events;
        }
        let i = stream.index();
        for (pos, &byte) in chunk.iter().enumerate() {
            if self.prompt[i].push(byte) {
                let attempt = self.attempts() + 1;
                self.state = BecomeState::PromptSent { attempts: attempt };
                events.push(HandshakeEvent::Prompt { attempt });
            }
            if self.confirm[i].push(byte) {
                self.state = BecomeState::Confirmed;
                events.push(HandshakeEvent::Confirmed { offset: pos + 1 });
                break;
            }
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_pattern_across_chunks() {
        let mut m = ByteSequenceMatcher::new("SudoPassword");
        assert_eq!(m.feed(b"xxSudoPa"), None);
        assert_eq!(m.feed(b"ssword: "), Some(6));
    }

    #[test]
    fn overlapping_prefix() {
        let mut m = ByteSequenceMatcher::new("aab");
        assert_eq!(m.feed(b"aaab"), Some(4));
    }

    #[test]
    fn empty_pattern_never_matches() {
        let mut m = ByteSequenceMatcher::new("");
        assert_eq!(m.feed(b"anything"), None);
    }

    #[test]
    fn reset_drops_partial_match() {
        let mut m = ByteSequenceMatcher::new("abc");
        assert_eq!(m.feed(b"ab"), None);
        m.reset();
        assert_eq!(m.feed(b"c"), None);
    }

    #[test]
    fn handshake_prompt_then_confirm() {
        let mut h = BecomeHandshake::new();
        assert_eq!(
            h.feed(OutputStream::Stderr, b"SudoPassword"),
            vec![HandshakeEvent::Prompt { attempt: 1 }]
        );
        assert_eq!(h.state(), BecomeState::PromptSent { attempts: 1 });
        assert_eq!(
            h.feed(OutputStream::Stdout, b"SUDO-SUCCESS\nhello\n"),
            vec![HandshakeEvent::Confirmed { offset: 12 }]
        );
        assert!(h.is_confirmed());
        assert!(h.feed(OutputStream::Stderr, b"SudoPassword").is_empty());
    }

    #[test]
    fn handshake_counts_repeated_prompts() {
        let mut h = BecomeHandshake::new();
        let events = h.feed(
            OutputStream::Stderr,
            b"SudoPasswordSorry, try again.\nSudoPassword",
        );
        assert_eq!(
            events,
            vec![
                HandshakeEvent::Prompt { attempt: 1 },
                HandshakeEvent::Prompt { attempt: 2 }
            ]
        );
        assert_eq!(h.attempts(), 2);
    }

    #[test]
    fn marker_without_prompt_confirms() {
        let mut h = BecomeHandshake::new();
        let events = h.feed(OutputStream::Stdout, b"SUDO-SUCCESS\n");
        assert_eq!(events, vec![HandshakeEvent::Confirmed { offset: 12 }]);
    }

    #[test]
    fn streams_keep_separate_partial_matches() {
        let mut h = BecomeHandshake::new();
        assert!(h.feed(OutputStream::Stdout, b"SUDO-").is_empty());
        assert!(h.feed(OutputStream::Stderr, b"noise").is_empty());
        assert_eq!(
            h.feed(OutputStream::Stdout, b"SUCCESS"),
            vec![HandshakeEvent::Confirmed { offset: 7 }]
        );
    }
}
