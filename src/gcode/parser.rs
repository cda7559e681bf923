//! Line-oriented G-code parser.
//!
//! One text line becomes one [`ParsedCommand`]: a command letter/number pair
//! plus typed parameter accessors. Parameter letters are case-sensitive
//! single characters. Comments (`;...`) are stripped, `N` line numbers are
//! accepted and their `*checksum` trailer is verified.

use thiserror::Error;

/// The parameter letter reserved for feed rates.
pub const FEEDRATE_LETTER: char = 'F';
/// The parameter letter reserved for extrusion amounts.
pub const EXTRUDE_LETTER: char = 'E';

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("malformed command word {0:?}")]
    BadCommandWord(String),
    #[error("malformed parameter {letter}{text}")]
    BadParameter { letter: char, text: String },
    #[error("unterminated string after {0}")]
    UnterminatedString(char),
    #[error("checksum mismatch (computed {computed}, line says {stated})")]
    ChecksumMismatch { computed: u8, stated: u8 },
    #[error("malformed checksum trailer {0:?}")]
    BadChecksum(String),
    #[error("unexpected character {0:?}")]
    Unexpected(char),
}

#[derive(Debug, Clone, PartialEq)]
enum ParamValue {
    Number(f64),
    Text(String),
    /// Bare letter with no value, e.g. the `X` in `G28 X`.
    Flag,
}

#[derive(Debug, Clone, PartialEq)]
struct Param {
    letter: char,
    value: ParamValue,
}

/// A decoded G-code line: command letter (`G`, `M` or `T`), command number
/// and parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedCommand {
    pub letter: char,
    pub number: i32,
    pub line_number: Option<u32>,
    params: Vec<Param>,
}

impl ParsedCommand {
    /// True if the parameter letter appears at all, with or without a value.
    pub fn has(&self, letter: char) -> bool {
        self.params.iter().any(|p| p.letter == letter)
    }

    /// Numeric value of a parameter, if present and numeric.
    pub fn value(&self, letter: char) -> Option<f64> {
        self.params.iter().find(|p| p.letter == letter).and_then(|p| match p.value {
            ParamValue::Number(n) => Some(n),
            _ => None,
        })
    }

    pub fn int_value(&self, letter: char) -> Option<i32> {
        self.value(letter).map(|v| v as i32)
    }

    /// String value of a parameter (quoted or bare token).
    pub fn text(&self, letter: char) -> Option<&str> {
        self.params.iter().find(|p| p.letter == letter).and_then(|p| match &p.value {
            ParamValue::Text(t) => Some(t.as_str()),
            _ => None,
        })
    }
}

impl std::fmt::Display for ParsedCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.number < 0 {
            write!(f, "{}", self.letter)
        } else {
            write!(f, "{}{}", self.letter, self.number)
        }
    }
}

/// Parse one line of G-code. Returns `Ok(None)` for blank and comment-only
/// lines.
pub fn parse_line(raw: &str) -> Result<Option<ParsedCommand>, ParseError> {
    let line = match raw.find(';') {
        Some(i) => &raw[..i],
        None => raw,
    };

    // Verify and strip a `*nn` checksum trailer. The checksum is the XOR of
    // every byte before the `*`, including the N word.
    let line = match line.find('*') {
        Some(star) => {
            let computed = line[..star].bytes().fold(0u8, |acc, b| acc ^ b);
            let trailer = line[star + 1..].trim();
            let stated: u8 = trailer
                .parse()
                .map_err(|_| ParseError::BadChecksum(trailer.to_string()))?;
            if computed != stated {
                return Err(ParseError::ChecksumMismatch { computed, stated });
            }
            &line[..star]
        }
        None => line,
    };

    let bytes = line.as_bytes();
    let len = bytes.len();
    let mut pos = 0usize;
    let mut command: Option<(char, i32)> = None;
    let mut line_number: Option<u32> = None;
    let mut params: Vec<Param> = Vec::new();

    while pos < len {
        while pos < len && bytes[pos].is_ascii_whitespace() {
            pos += 1;
        }
        if pos >= len {
            break;
        }
        let letter = bytes[pos] as char;
        if !letter.is_ascii_alphabetic() {
            return Err(ParseError::Unexpected(letter));
        }
        pos += 1;

        // Quoted string parameter, e.g. P"macros/start.g"
        if pos < len && bytes[pos] == b'"' {
            pos += 1;
            let start = pos;
            while pos < len && bytes[pos] != b'"' {
                pos += 1;
            }
            if pos >= len {
                return Err(ParseError::UnterminatedString(letter));
            }
            params.push(Param {
                letter,
                value: ParamValue::Text(line[start..pos].to_string()),
            });
            pos += 1;
            continue;
        }

        // Bare filename after P, e.g. M98 Phoming.g
        if letter == 'P'
            && command.is_some()
            && pos < len
            && !matches!(bytes[pos], b'0'..=b'9' | b'-' | b'+' | b'.')
            && !bytes[pos].is_ascii_whitespace()
        {
            let start = pos;
            while pos < len && !bytes[pos].is_ascii_whitespace() {
                pos += 1;
            }
            params.push(Param {
                letter,
                value: ParamValue::Text(line[start..pos].to_string()),
            });
            continue;
        }

        let start = pos;
        while pos < len && matches!(bytes[pos], b'0'..=b'9' | b'.' | b'-' | b'+') {
            pos += 1;
        }
        let token = &line[start..pos];

        if command.is_none() && line_number.is_none() && letter == 'N' {
            line_number = Some(token.parse().map_err(|_| ParseError::BadCommandWord(format!("N{token}")))?);
            continue;
        }

        if command.is_none() {
            let number = if token.is_empty() {
                // A bare T reports the current tool.
                if letter == 'T' {
                    -1
                } else {
                    return Err(ParseError::BadCommandWord(letter.to_string()));
                }
            } else {
                token
                    .parse::<f64>()
                    .map_err(|_| ParseError::BadCommandWord(format!("{letter}{token}")))? as i32
            };
            command = Some((letter, number));
            continue;
        }

        let value = if token.is_empty() {
            ParamValue::Flag
        } else {
            ParamValue::Number(token.parse::<f64>().map_err(|_| ParseError::BadParameter {
                letter,
                text: token.to_string(),
            })?)
        };
        params.push(Param { letter, value });
    }

    Ok(command.map(|(letter, number)| ParsedCommand {
        letter,
        number,
        line_number,
        params,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_move_with_parameters() {
        let cmd = parse_line("G1 X10.5 Y-3 F3000").unwrap().unwrap();
        assert_eq!(cmd.letter, 'G');
        assert_eq!(cmd.number, 1);
        assert_eq!(cmd.value('X'), Some(10.5));
        assert_eq!(cmd.value('Y'), Some(-3.0));
        assert_eq!(cmd.value(FEEDRATE_LETTER), Some(3000.0));
        assert!(!cmd.has('Z'));
    }

    #[test]
    fn parses_packed_words() {
        let cmd = parse_line("G1X10Y5E0.2").unwrap().unwrap();
        assert_eq!(cmd.value('X'), Some(10.0));
        assert_eq!(cmd.value('Y'), Some(5.0));
        assert_eq!(cmd.value(EXTRUDE_LETTER), Some(0.2));
    }

    #[test]
    fn blank_and_comment_lines_yield_nothing() {
        assert_eq!(parse_line("").unwrap(), None);
        assert_eq!(parse_line("   ; just a comment").unwrap(), None);
    }

    #[test]
    fn comment_is_stripped() {
        let cmd = parse_line("G28 X ; home X only").unwrap().unwrap();
        assert_eq!(cmd.number, 28);
        assert!(cmd.has('X'));
        assert_eq!(cmd.value('X'), None);
    }

    #[test]
    fn quoted_and_bare_filenames() {
        let cmd = parse_line("M98 P\"macros/start.g\"").unwrap().unwrap();
        assert_eq!(cmd.text('P'), Some("macros/start.g"));
        let cmd = parse_line("M98 Phomex.g").unwrap().unwrap();
        assert_eq!(cmd.text('P'), Some("homex.g"));
    }

    #[test]
    fn numeric_p_is_still_numeric() {
        let cmd = parse_line("G4 P500").unwrap().unwrap();
        assert_eq!(cmd.value('P'), Some(500.0));
    }

    #[test]
    fn bare_t_reports() {
        let cmd = parse_line("T").unwrap().unwrap();
        assert_eq!(cmd.letter, 'T');
        assert_eq!(cmd.number, -1);
    }

    #[test]
    fn line_number_and_checksum() {
        // XOR of "N4 G1 X5" is 0x27 == 39
        let computed = "N4 G1 X5".bytes().fold(0u8, |a, b| a ^ b);
        let line = format!("N4 G1 X5*{computed}");
        let cmd = parse_line(&line).unwrap().unwrap();
        assert_eq!(cmd.line_number, Some(4));
        assert_eq!(cmd.value('X'), Some(5.0));

        let bad = format!("N4 G1 X5*{}", computed ^ 0x55);
        assert!(matches!(
            parse_line(&bad),
            Err(ParseError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn parameter_letters_are_case_sensitive() {
        let cmd = parse_line("G1 x10 X20").unwrap().unwrap();
        assert_eq!(cmd.value('X'), Some(20.0));
        assert_eq!(cmd.value('x'), Some(10.0));
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(parse_line("G1 X=10").is_err());
        assert!(parse_line("123").is_err());
    }
}
