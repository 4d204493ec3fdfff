//! Recognition result snapshot.

use crate::detokenizer::Detokenizer;
use crate::types::DecodedToken;
use serde::Serialize;

/// Immutable snapshot of a stream's current transcript.
///
/// Rebuilt from the decode state on every request, so reading it twice
/// without an intervening decode yields identical values.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RecognitionResult {
    /// De-tokenized transcript
    pub text: String,
    /// Raw token pieces, one per decoded token
    pub tokens: Vec<String>,
    /// Token start times in seconds relative to the segment start
    ///
    /// Empty when the model is not frame aligned.
    pub timestamps: Vec<f32>,
    /// Token ids, parallel to `tokens`
    #[serde(skip)]
    pub token_ids: Vec<usize>,
    /// Segment index, incremented by every reset
    pub segment: usize,
    /// Segment start time in seconds from the beginning of the stream
    pub start_time: f32,
    /// Whether input is finished and fully decoded
    pub is_final: bool,
}

impl RecognitionResult {
    /// Build a result from decoded tokens.
    pub fn from_tokens(
        tokens: &[DecodedToken],
        detokenizer: &dyn Detokenizer,
        frame_shift_secs: f32,
    ) -> Self {
        let (token_ids, pieces): (Vec<usize>, Vec<String>) = tokens
            .iter()
            .map(|token| {
                let piece = detokenizer.piece(token.id).unwrap_or_else(|| {
                    tracing::warn!(
                        id = token.id,
                        vocab_size = detokenizer.vocab_size(),
                        "token id missing from token table"
                    );
                    String::new()
                });
                (token.id, piece)
            })
            .unzip();

        let timestamps = tokens
            .iter()
            .map(|token| token.frame.map(|frame| frame as f32 * frame_shift_secs))
            .collect::<Option<Vec<f32>>>()
            .unwrap_or_default();

        Self {
            text: detokenizer.text(&token_ids),
            tokens: pieces,
            timestamps,
            token_ids,
            ..Self::default()
        }
    }

    /// Attach segment position and finality.
    pub fn with_segment(mut self, segment: usize, start_time: f32, is_final: bool) -> Self {
        self.segment = segment;
        self.start_time = start_time;
        self.is_final = is_final;
        self
    }

    /// Token pieces paired with their timestamps.
    pub fn timed_tokens(&self) -> impl Iterator<Item = (&str, Option<f32>)> {
        self.tokens
            .iter()
            .enumerate()
            .map(|(i, token)| (token.as_str(), self.timestamps.get(i).copied()))
    }

    /// Canonical key-value serialization.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
