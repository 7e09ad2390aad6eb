//! CLI utilities for Slate.
//!
//! The utilities present in this module are used by the `slate` binary to read
//! commands from a user.
use std::io::{self, BufRead, Write};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("unrecognized command '{0}'")]
    Unrecognized(String),

    #[error("prompt io error: {0}")]
    Io(#[from] io::Error),
}

/// Possible commands from a user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Exit command `.exit`, also sent at end of input.
    Exit,
    /// Checkpoint command `.flush`
    Flush,
    /// Schema command `.schema`
    Schema,
    /// DSL Statements
    Statement(String),
}

/// Prompt user for a valid Slate command.
pub fn prompt<R, W>(mut reader: R, mut writer: W) -> Result<Command, PromptError>
where
    R: BufRead,
    W: Write,
{
    let mut s = String::default();
    write!(&mut writer, "> ")?;

    if reader.read_line(&mut s)? == 0 {
        return Ok(Command::Exit);
    }

    match s.trim() {
        ".exit" => Ok(Command::Exit),
        ".flush" => Ok(Command::Flush),
        ".schema" => Ok(Command::Schema),
        s if !s.starts_with('.') => Ok(Command::Statement(s.to_string())),
        s => Err(PromptError::Unrecognized(s.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_prints_correctly() {
        let input = b".exit\n";
        let mut output = Vec::new();

        prompt(&input[..], &mut output).unwrap();

        let output = String::from_utf8(output).expect("not valid UTF-8");
        assert_eq!("> ", output);
    }

    #[test]
    fn prompt_handles_statements() {
        let input = b"\n";
        let mut output = Vec::new();

        let res = prompt(&input[..], &mut output).unwrap();
        assert_eq!(Command::Statement(String::default()), res);

        let res = prompt(&b"  select id=1 \n"[..], &mut output).unwrap();
        assert_eq!(Command::Statement("select id=1".to_string()), res);
    }

    #[test]
    fn prompt_handles_dot_commands() {
        let mut output = Vec::new();
        assert_eq!(prompt(&b".flush\n"[..], &mut output).unwrap(), Command::Flush);
        assert_eq!(prompt(&b".schema\n"[..], &mut output).unwrap(), Command::Schema);
    }

    #[test]
    fn prompt_end_of_input_exits() {
        let mut output = Vec::new();
        assert_eq!(prompt(&b""[..], &mut output).unwrap(), Command::Exit);
    }

    #[test]
    #[should_panic(expected = "Unrecognized(\".something_wrong\")")]
    fn prompt_unrecognized_command() {
        let input = b".something_wrong\n";
        let mut output = Vec::new();

        prompt(&input[..], &mut output).unwrap();
    }
}
