//! Token tables and conversion of token ids to text.

use crate::error::ConfigError;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use std::borrow::Cow;
use std::collections::HashMap;
use std::path::Path;
use tokenizers::Tokenizer;

/// SentencePiece word-boundary marker.
const WORD_BOUNDARY: char = '▁';

/// Maps token ids to text pieces.
pub trait Detokenizer: Send + Sync {
    /// Raw text piece for a token id.
    fn piece(&self, id: usize) -> Option<String>;

    /// Number of entries in the vocabulary.
    fn vocab_size(&self) -> usize;

    /// Display form of a single piece: word-boundary markers become spaces.
    fn display_piece(&self, piece: &str) -> String {
        piece.replace(WORD_BOUNDARY, " ")
    }

    /// Transcript of a token sequence. Unknown ids are skipped.
    fn text(&self, ids: &[usize]) -> String {
        let text: String = ids
            .iter()
            .filter_map(|&id| self.piece(id))
            .map(|piece| self.display_piece(&piece))
            .collect();
        text.trim().to_string()
    }
}

/// Symbol table loaded from a `tokens.txt` file.
///
/// Each line is `<symbol> <id>`; a line holding only an id maps that id to a
/// single space. Symbols are kept as bytes: byte-level vocabularies split
/// multi-byte characters across tokens, so text is only formed once the
/// pieces of a whole sequence are concatenated.
#[derive(Clone, Debug, Default)]
pub struct SymbolTable {
    id_to_sym: HashMap<usize, Vec<u8>>,
}

impl SymbolTable {
    /// Load a symbol table from a tokens.txt file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let table = Self::parse(&contents)?;

        tracing::info!(tokens = table.len(), path = %path.display(), "loaded token table");
        Ok(table)
    }

    /// Load a table whose symbols are base64 encoded (Whisper exports).
    pub fn load_base64(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut table = Self::load(path)?;
        table.apply_base64_decode();
        Ok(table)
    }

    /// Parse tokens.txt contents.
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let mut id_to_sym = HashMap::new();

        for (line_no, line) in contents.lines().enumerate() {
            let trimmed = line.trim_end_matches(['\r', '\n']);
            if trimmed.trim().is_empty() {
                continue;
            }

            let invalid = || ConfigError::InvalidTokenLine {
                line: line_no + 1,
                content: line.to_string(),
            };

            let (symbol, id) = match trimmed.rsplit_once(char::is_whitespace) {
                Some((symbol, id)) if !symbol.is_empty() => (symbol.as_bytes().to_vec(), id),
                _ => (b" ".to_vec(), trimmed.trim()),
            };

            let id = id.parse::<usize>().map_err(|_| invalid())?;
            id_to_sym.insert(id, symbol);
        }

        Ok(Self { id_to_sym })
    }

    /// Build a table from pieces indexed by position.
    pub fn from_pieces<I, S>(pieces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let id_to_sym = pieces
            .into_iter()
            .enumerate()
            .map(|(id, piece)| (id, piece.into().into_bytes()))
            .collect();
        Self { id_to_sym }
    }

    /// Decode base64-encoded symbols in place.
    ///
    /// Symbols that are not valid base64 (e.g. `<|endoftext|>`) are left
    /// as-is. Decoded bytes need not be valid UTF-8 on their own.
    pub fn apply_base64_decode(&mut self) {
        for sym in self.id_to_sym.values_mut() {
            if let Ok(bytes) = STANDARD.decode(&sym) {
                *sym = bytes;
            }
        }
    }

    /// Look up a symbol by token id.
    ///
    /// Partial UTF-8 sequences show as replacement characters.
    pub fn get(&self, id: usize) -> Option<Cow<'_, str>> {
        self.id_to_sym
            .get(&id)
            .map(|bytes| String::from_utf8_lossy(bytes))
    }

    /// Raw bytes of a symbol.
    pub fn bytes(&self, id: usize) -> Option<&[u8]> {
        self.id_to_sym.get(&id).map(Vec::as_slice)
    }

    /// Find the id of a symbol.
    pub fn id_of(&self, symbol: &str) -> Option<usize> {
        self.id_to_sym
            .iter()
            .find_map(|(id, sym)| (sym.as_slice() == symbol.as_bytes()).then_some(*id))
    }

    pub fn len(&self) -> usize {
        self.id_to_sym.len()
    }

    pub fn is_empty(&self) -> bool {
        self.id_to_sym.is_empty()
    }
}

impl Detokenizer for SymbolTable {
    fn piece(&self, id: usize) -> Option<String> {
        self.get(id).map(Cow::into_owned)
    }

    fn vocab_size(&self) -> usize {
        self.len()
    }

    fn text(&self, ids: &[usize]) -> String {
        let bytes: Vec<u8> = ids
            .iter()
            .filter_map(|&id| self.bytes(id))
            .flatten()
            .copied()
            .collect();

        self.display_piece(&String::from_utf8_lossy(&bytes))
            .trim()
            .to_string()
    }
}

/// HuggingFace tokenizer (tokenizer.json) as a detokenizer.
impl Detokenizer for Tokenizer {
    fn piece(&self, id: usize) -> Option<String> {
        self.id_to_token(id as u32)
    }

    fn vocab_size(&self) -> usize {
        self.get_vocab_size(true)
    }
}

/// Load a HuggingFace tokenizer.json.
pub fn load_tokenizer(path: impl AsRef<Path>) -> Result<Tokenizer, ConfigError> {
    Tokenizer::from_file(path.as_ref()).map_err(ConfigError::Tokenizer)
}
