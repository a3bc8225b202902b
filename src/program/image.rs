//! Program image files.
//!
//! Text images are a simple format:
//! - Words in hex (optional `0x`), separated by whitespace
//! - `#` or `;` starts a comment running to the end of the line
//! - `test <offset> <expected>` records a conformance expectation;
//!   numbers there are decimal unless prefixed with `0x`
//!
//! Binary images are raw big-endian words.

use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use thiserror::Error;

use crate::device::{words_from_bytes, DeviceError};
use super::Program;

/// Parse a text image.
pub fn parse_image(source: &str) -> Result<Program, ImageError> {
    let mut program = Program::new();
    for (line_num, line) in source.lines().enumerate() {
        parse_line(&mut program, line_num + 1, line)?;
    }
    Ok(program)
}

fn parse_line(program: &mut Program, line: usize, text: &str) -> Result<(), ImageError> {
    let code = match text.find(['#', ';']) {
        Some(start) => &text[..start],
        None => text,
    };
    let mut tokens = code.split_whitespace().peekable();

    if tokens.peek().is_some_and(|t| t.eq_ignore_ascii_case("test")) {
        tokens.next();
        let mut number = |what: &str| -> Result<u16, ImageError> {
            let token = tokens.next().ok_or_else(|| ImageError::ParseError {
                line,
                message: format!("test directive is missing its {}", what),
            })?;
            parse_number(token).ok_or_else(|| ImageError::ParseError {
                line,
                message: format!("invalid {} '{}'", what, token),
            })
        };
        let offset = number("offset")?;
        let expected = number("expected value")?;
        if let Some(extra) = tokens.next() {
            return Err(ImageError::ParseError {
                line,
                message: format!("unexpected '{}' after test directive", extra),
            });
        }
        program.tests.insert(offset, expected);
        return Ok(());
    }

    for token in tokens {
        let digits = token.strip_prefix("0x").or_else(|| token.strip_prefix("0X")).unwrap_or(token);
        let word = u16::from_str_radix(digits, 16).map_err(|_| ImageError::ParseError {
            line,
            message: format!("'{}' is not a 16-bit hex word", token),
        })?;
        program.words.push(word);
    }
    Ok(())
}

fn parse_number(token: &str) -> Option<u16> {
    match token.strip_prefix("0x").or_else(|| token.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16).ok(),
        None => token.parse().ok(),
    }
}

/// Load a text image from disk.
pub fn load_image<P: AsRef<Path>>(path: P) -> Result<Program, ImageError> {
    let file = std::fs::File::open(path.as_ref())
        .map_err(|e| ImageError::IoError(e.to_string()))?;
    let reader = BufReader::new(file);

    let mut program = Program::new();
    for (line_num, line_result) in reader.lines().enumerate() {
        let line = line_result.map_err(|e| ImageError::IoError(e.to_string()))?;
        parse_line(&mut program, line_num + 1, &line)?;
    }
    Ok(program)
}

/// Render a program as a text image, two words (one instruction) per line.
pub fn format_image(program: &Program) -> String {
    let mut out = String::new();
    out.push_str("# uCISC image\n");
    out.push_str(&format!("# {} words\n", program.len()));
    for (offset, expected) in &program.tests {
        out.push_str(&format!("test {:#06x} {:#06x}\n", offset, expected));
    }
    out.push('\n');
    for (i, pair) in program.words.chunks(2).enumerate() {
        let words: Vec<String> = pair.iter().map(|w| format!("{:04x}", w)).collect();
        out.push_str(&format!("{} ; {:04x}\n", words.join(" "), i * 2));
    }
    out
}

/// Save a program as a text image.
pub fn save_image<P: AsRef<Path>>(path: P, program: &Program) -> Result<(), ImageError> {
    let mut file = std::fs::File::create(path.as_ref())
        .map_err(|e| ImageError::IoError(e.to_string()))?;
    file.write_all(format_image(program).as_bytes())
        .map_err(|e| ImageError::IoError(e.to_string()))
}

/// Load a binary image: big-endian words, no tests.
pub fn load_binary<P: AsRef<Path>>(path: P) -> Result<Program, ImageError> {
    let bytes = std::fs::read(path.as_ref()).map_err(|e| ImageError::IoError(e.to_string()))?;
    Ok(Program::from_words(words_from_bytes(&bytes)?))
}

/// Load either kind of image: `.bin` files are binary, anything else text.
pub fn load_file<P: AsRef<Path>>(path: P) -> Result<Program, ImageError> {
    let path = path.as_ref();
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("bin") => load_binary(path),
        _ => load_image(path),
    }
}

/// Errors that can occur while reading or writing images.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ImageError {
    #[error("I/O error: {0}")]
    IoError(String),

    #[error("parse error on line {line}: {message}")]
    ParseError { line: usize, message: String },

    #[error("malformed binary image: {0}")]
    Malformed(#[from] DeviceError),
}
