use crate::lexer::Token;
use thiserror::Error;

/// A parsed command line, ready to be handed to the job control engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandLine {
    /// Nothing to do (blank line).
    Empty,
    /// A single command, optionally sent to the background with a trailing `&`.
    Simple { argv: Vec<String>, background: bool },
    /// Exactly two commands joined by `|`.
    Pipe { left: Vec<String>, right: Vec<String> },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParsingError {
    /// One side of `|` has no command.
    #[error("malformed pipe: both sides need a command")]
    MissingPipeSide,
    /// More than one `|` on the line.
    #[error("only two-stage pipelines are supported")]
    TooManyStages,
    /// `&` somewhere other than the end of a simple command.
    #[error("unexpected '&'")]
    MisplacedBackground,
}

struct AstBuilder {
    tokens: Vec<Token>,
    pos: usize,
}

impl AstBuilder {
    fn from(tokens: Vec<Token>) -> Self {
        AstBuilder { tokens, pos: 0 }
    }

    fn build(mut self) -> Result<CommandLine, ParsingError> {
        if self.tokens.is_empty() {
            return Ok(CommandLine::Empty);
        }

        let left = self.parse_words();
        match self.consume() {
            None | Some(Token::Word(_)) => Ok(CommandLine::Simple {
                argv: left,
                background: false,
            }),
            Some(Token::Background) => {
                if self.peek().is_some() || left.is_empty() {
                    return Err(ParsingError::MisplacedBackground);
                }
                Ok(CommandLine::Simple {
                    argv: left,
                    background: true,
                })
            }
            Some(Token::PipeOp) => self.parse_right_stage(left),
        }
    }

    /// Parse what follows `|`: a command and the end of the line.
    fn parse_right_stage(&mut self, left: Vec<String>) -> Result<CommandLine, ParsingError> {
        let right = self.parse_words();
        match self.peek() {
            None | Some(Token::Word(_)) => {}
            Some(Token::PipeOp) => {
                return Err(if left.is_empty() || right.is_empty() {
                    ParsingError::MissingPipeSide
                } else {
                    ParsingError::TooManyStages
                });
            }
            Some(Token::Background) => return Err(ParsingError::MisplacedBackground),
        }
        if left.is_empty() || right.is_empty() {
            return Err(ParsingError::MissingPipeSide);
        }
        Ok(CommandLine::Pipe { left, right })
    }

    fn parse_words(&mut self) -> Vec<String> {
        let mut words = Vec::new();
        while let Some(Token::Word(w)) = self.peek() {
            words.push(w.clone());
            self.pos += 1;
        }
        words
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn consume(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }
}

pub fn construct_command(tokens: Vec<Token>) -> Result<CommandLine, ParsingError> {
    AstBuilder::from(tokens).build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::split_into_tokens;

    fn parse(line: &str) -> Result<CommandLine, ParsingError> {
        construct_command(split_into_tokens(line).unwrap())
    }

    fn argv(words: &[&str]) -> Vec<String> {
        words.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_blank_line_is_empty() {
        assert_eq!(parse("   ").unwrap(), CommandLine::Empty);
    }

    #[test]
    fn test_simple_foreground_command() {
        assert_eq!(
            parse("ls -l /tmp").unwrap(),
            CommandLine::Simple {
                argv: argv(&["ls", "-l", "/tmp"]),
                background: false
            }
        );
    }

    #[test]
    fn test_trailing_ampersand_is_stripped_from_argv() {
        assert_eq!(
            parse("sleep 100 &").unwrap(),
            CommandLine::Simple {
                argv: argv(&["sleep", "100"]),
                background: true
            }
        );
    }

    #[test]
    fn test_quoted_ampersand_is_an_argument() {
        assert_eq!(
            parse("echo '&'").unwrap(),
            CommandLine::Simple {
                argv: argv(&["echo", "&"]),
                background: false
            }
        );
    }

    #[test]
    fn test_misplaced_ampersand() {
        assert_eq!(parse("&"), Err(ParsingError::MisplacedBackground));
        assert_eq!(parse("a & b"), Err(ParsingError::MisplacedBackground));
        assert_eq!(parse("ls | wc &"), Err(ParsingError::MisplacedBackground));
    }

    #[test]
    fn test_two_stage_pipe() {
        assert_eq!(
            parse("ls | wc -l").unwrap(),
            CommandLine::Pipe {
                left: argv(&["ls"]),
                right: argv(&["wc", "-l"])
            }
        );
    }

    #[test]
    fn test_pipe_with_missing_side() {
        assert_eq!(parse("| wc"), Err(ParsingError::MissingPipeSide));
        assert_eq!(parse("ls |"), Err(ParsingError::MissingPipeSide));
        assert_eq!(parse("|"), Err(ParsingError::MissingPipeSide));
        assert_eq!(parse("ls || wc"), Err(ParsingError::MissingPipeSide));
    }

    #[test]
    fn test_three_stages_rejected() {
        assert_eq!(parse("a | b | c"), Err(ParsingError::TooManyStages));
    }

    #[test]
    fn test_every_word_up_to_end_of_line_is_kept() {
        assert_eq!(
            parse("grep -v 'a b' file").unwrap(),
            CommandLine::Simple {
                argv: argv(&["grep", "-v", "a b", "file"]),
                background: false
            }
        );
        assert_eq!(
            parse("cat -n notes.txt | sort -r -k 2").unwrap(),
            CommandLine::Pipe {
                left: argv(&["cat", "-n", "notes.txt"]),
                right: argv(&["sort", "-r", "-k", "2"])
            }
        );
    }
}
