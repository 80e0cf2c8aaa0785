//! Running transcript of both sides of the conversation.

use serde::Serialize;

use crate::core::channel::Speaker;

/// Text of one turn by one speaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranscriptTurn {
    pub speaker: Speaker,
    pub text: String,
    /// No more text will be added
    pub sealed: bool,
    /// The turn was cut short by a barge-in
    pub interrupted: bool,
}

impl TranscriptTurn {
    fn open(speaker: Speaker) -> Self {
        Self {
            speaker,
            text: String::new(),
            sealed: false,
            interrupted: false,
        }
    }
}

/// Change reported to transcript listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptUpdate {
    pub speaker: Speaker,
    /// Full text of the turn so far
    pub text: String,
    pub is_final: bool,
}

/// Sealed turns in order, plus at most one open turn per speaker.
#[derive(Debug, Default)]
pub struct Transcript {
    sealed: Vec<TranscriptTurn>,
    local: Option<TranscriptTurn>,
    remote: Option<TranscriptTurn>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&mut self, speaker: Speaker) -> &mut Option<TranscriptTurn> {
        match speaker {
            Speaker::Local => &mut self.local,
            Speaker::Remote => &mut self.remote,
        }
    }

    /// Add a fragment to `speaker`'s open turn, opening one if needed.
    pub fn append(&mut self, speaker: Speaker, fragment: &str) -> TranscriptUpdate {
        let turn = self
            .slot(speaker)
            .get_or_insert_with(|| TranscriptTurn::open(speaker));
        turn.text.push_str(fragment);
        TranscriptUpdate {
            speaker,
            text: turn.text.clone(),
            is_final: false,
        }
    }

    /// Seal `speaker`'s open turn. Returns `None` if there was nothing to
    /// seal.
    pub fn seal(&mut self, speaker: Speaker, interrupted: bool) -> Option<TranscriptUpdate> {
        let mut turn = self.slot(speaker).take()?;
        turn.sealed = true;
        turn.interrupted = interrupted;
        let update = TranscriptUpdate {
            speaker,
            text: turn.text.clone(),
            is_final: true,
        };
        self.sealed.push(turn);
        Some(update)
    }

    pub fn open_turn(&self, speaker: Speaker) -> Option<&TranscriptTurn> {
        match speaker {
            Speaker::Local => self.local.as_ref(),
            Speaker::Remote => self.remote.as_ref(),
        }
    }

    pub fn turns(&self) -> &[TranscriptTurn] {
        &self.sealed
    }

    /// Sealed turns followed by the open ones.
    pub fn snapshot(&self) -> Vec<TranscriptTurn> {
        self.sealed
            .iter()
            .chain(self.local.iter())
            .chain(self.remote.iter())
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fragments_accumulate_per_speaker() {
        let mut transcript = Transcript::new();
        transcript.append(Speaker::Remote, "Namaste, ");
        transcript.append(Speaker::Local, "hello");
        let update = transcript.append(Speaker::Remote, "what is the age?");

        assert_eq!(update.text, "Namaste, what is the age?");
        assert!(!update.is_final);
        assert_eq!(transcript.open_turn(Speaker::Local).unwrap().text, "hello");
        assert!(transcript.turns().is_empty());
    }

    #[test]
    fn test_seal_moves_turn() {
        let mut transcript = Transcript::new();
        transcript.append(Speaker::Local, "twenty eight");
        let sealed = transcript.seal(Speaker::Local, false).unwrap();

        assert!(sealed.is_final);
        assert_eq!(sealed.text, "twenty eight");
        assert!(transcript.open_turn(Speaker::Local).is_none());
        assert_eq!(transcript.turns().len(), 1);
        assert!(transcript.turns()[0].sealed);

        assert!(transcript.seal(Speaker::Local, false).is_none());
    }

    #[test]
    fn test_snapshot_order() {
        let mut transcript = Transcript::new();
        transcript.append(Speaker::Remote, "How many days of fever?");
        transcript.seal(Speaker::Remote, true);
        transcript.append(Speaker::Local, "three");
        transcript.append(Speaker::Remote, "Okay");

        let snapshot = transcript.snapshot();
        assert_eq!(snapshot.len(), 3);
        assert!(snapshot[0].interrupted);
        assert_eq!(snapshot[1].speaker, Speaker::Local);
        assert!(!snapshot[2].sealed);
    }
}
