//! A module implementing lexical analysis (tokenization) of a command line.

use thiserror::Error;

/// Represents a token resulting from lexical analysis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// A word token with quotes already removed.
    Word(String),
    /// The pipe operator, `|`.
    PipeOp,
    /// The background marker, `&`.
    Background,
}

/// Errors that can occur during the lexical analysis process.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LexingError {
    /// A closing quote (single or double) was not found.
    #[error("unterminated quote")]
    UnfinishedQuote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LexingState {
    Start,
    ReadingWord,
    ReadingSingleQuote,
    ReadingDoubleQuote,
}

struct LexingFSM {
    input: Vec<char>,
    pos: usize,
    state: LexingState,
    buffer: String,
    // Distinguishes `''` (an empty word) from no word at all.
    word_started: bool,
}

impl LexingFSM {
    /// Creates a new instance of the lexical analysis Finite State Machine.
    fn new(line: &str) -> Self {
        LexingFSM {
            input: line.chars().collect(),
            pos: 0,
            state: LexingState::Start,
            buffer: String::new(),
            word_started: false,
        }
    }

    /// Performs lexical analysis on the input string and returns a vector of tokens.
    ///
    /// Whitespace separates words, quotes group characters into one word,
    /// and `|` / `&` are operators wherever they appear unquoted.
    fn make_tokens(&mut self) -> Result<Vec<Token>, LexingError> {
        let mut out = Vec::new();

        while let Some(ch) = self.read_char() {
            match self.state {
                LexingState::Start | LexingState::ReadingWord => self.handle_unquoted(ch, &mut out),
                LexingState::ReadingSingleQuote => self.handle_single_quote(ch),
                LexingState::ReadingDoubleQuote => self.handle_double_quote(ch),
            }
        }

        match self.state {
            LexingState::ReadingSingleQuote | LexingState::ReadingDoubleQuote => {
                return Err(LexingError::UnfinishedQuote);
            }
            _ => {}
        }

        self.finish_word(&mut out);
        Ok(out)
    }

    fn read_char(&mut self) -> Option<char> {
        let ch = self.input.get(self.pos).copied();
        if ch.is_some() {
            self.pos += 1;
        }
        ch
    }

    fn handle_unquoted(&mut self, ch: char, out: &mut Vec<Token>) {
        match ch {
            ' ' | '\t' | '\n' | '\r' => self.finish_word(out),
            '|' => {
                self.finish_word(out);
                out.push(Token::PipeOp);
            }
            '&' => {
                self.finish_word(out);
                out.push(Token::Background);
            }
            '\'' => {
                self.word_started = true;
                self.state = LexingState::ReadingSingleQuote;
            }
            '"' => {
                self.word_started = true;
                self.state = LexingState::ReadingDoubleQuote;
            }
            _ => {
                self.word_started = true;
                self.buffer.push(ch);
                self.state = LexingState::ReadingWord;
            }
        }
    }

    fn handle_single_quote(&mut self, ch: char) {
        match ch {
            '\'' => self.state = LexingState::ReadingWord,
            _ => self.buffer.push(ch),
        }
    }

    fn handle_double_quote(&mut self, ch: char) {
        match ch {
            '"' => self.state = LexingState::ReadingWord,
            '\\' => match self.input.get(self.pos).copied() {
                // Only quote and backslash are escapable inside double quotes.
                Some(next @ ('"' | '\\')) => {
                    self.pos += 1;
                    self.buffer.push(next);
                }
                _ => self.buffer.push(ch),
            },
            _ => self.buffer.push(ch),
        }
    }

    fn finish_word(&mut self, out: &mut Vec<Token>) {
        if self.word_started {
            out.push(Token::Word(std::mem::take(&mut self.buffer)));
            self.word_started = false;
        }
        self.state = LexingState::Start;
    }
}

/// Splits a raw command line into tokens.
pub fn split_into_tokens(line: &str) -> Result<Vec<Token>, LexingError> {
    LexingFSM::new(line).make_tokens()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word(s: &str) -> Token {
        Token::Word(s.to_string())
    }

    #[test]
    fn test_plain_words() {
        let tokens = split_into_tokens("ls   -la\t/tmp").unwrap();
        assert_eq!(tokens, vec![word("ls"), word("-la"), word("/tmp")]);
    }

    #[test]
    fn test_empty_and_blank_lines() {
        assert!(split_into_tokens("").unwrap().is_empty());
        assert!(split_into_tokens("   \t ").unwrap().is_empty());
    }

    #[test]
    fn test_operators_split_words_without_spaces() {
        let tokens = split_into_tokens("ls|wc -l").unwrap();
        assert_eq!(tokens, vec![word("ls"), Token::PipeOp, word("wc"), word("-l")]);

        let tokens = split_into_tokens("sleep 5&").unwrap();
        assert_eq!(tokens, vec![word("sleep"), word("5"), Token::Background]);
    }

    #[test]
    fn test_quotes_group_and_protect_operators() {
        let tokens = split_into_tokens(r#"echo "a | b" 'c & d'"#).unwrap();
        assert_eq!(tokens, vec![word("echo"), word("a | b"), word("c & d")]);
    }

    #[test]
    fn test_adjacent_quoted_parts_form_one_word() {
        let tokens = split_into_tokens(r#"pre"mid"'post'"#).unwrap();
        assert_eq!(tokens, vec![word("premidpost")]);
    }

    #[test]
    fn test_empty_quotes_are_an_empty_word() {
        let tokens = split_into_tokens("printf ''").unwrap();
        assert_eq!(tokens, vec![word("printf"), word("")]);
    }

    #[test]
    fn test_escapes_in_double_quotes() {
        let tokens = split_into_tokens(r#""say \"hi\" \n""#).unwrap();
        assert_eq!(tokens, vec![word(r#"say "hi" \n"#)]);
    }

    #[test]
    fn test_unfinished_quote() {
        assert_eq!(split_into_tokens("echo 'abc"), Err(LexingError::UnfinishedQuote));
        assert_eq!(split_into_tokens("echo \"abc"), Err(LexingError::UnfinishedQuote));
    }
}
