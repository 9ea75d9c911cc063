//! Flow Facts
//!
//! Loader for the `.ff` text format carrying externally-supplied bounds on
//! program behavior:
//!
//! ```text
//! // cycles counted per loop entry
//! loop 0x1000 10;
//! checksum "task.elf" 0x1A2B3C4D;
//! /* block comments are fine too */
//! ```
//!
//! Loop bounds are attached to loop-header blocks by address after CFG
//! construction; the checksum directive guards against analyzing a binary
//! that no longer matches its annotation file.

use crate::error::{AnalysisError, Result};
use crate::prop::PropId;
use std::collections::HashMap;

/// Maximal iteration count attached to a loop-header block by a flow fact.
pub fn max_iteration() -> PropId<u64> {
    PropId::of("timebound::max_iteration")
}

/// Parsed flow facts.
#[derive(Debug, Clone, Default)]
pub struct FlowFacts {
    /// Loop header address to maximal iteration count per entry.
    pub loops: HashMap<u32, u64>,
    /// (file name, expected CRC-32) pairs.
    pub checksums: Vec<(String, u32)>,
}

impl FlowFacts {
    /// Parse a `.ff` file content.
    pub fn parse(text: &str) -> Result<FlowFacts> {
        let mut facts = FlowFacts::default();
        for (stmt, line) in statements(text)? {
            let tokens: Vec<&str> = stmt.split_whitespace().collect();
            match tokens.as_slice() {
                [] => {}
                ["loop", addr, bound] => {
                    let addr = parse_addr(addr, line)?;
                    let bound = bound.parse::<u64>().map_err(|_| {
                        AnalysisError::Configuration(format!(
                            "line {}: bad loop bound '{}'",
                            line, bound
                        ))
                    })?;
                    facts.loops.insert(addr, bound);
                }
                ["checksum", file, sum] => {
                    let file = file.trim_matches('"').to_string();
                    let sum = parse_addr(sum, line)?;
                    facts.checksums.push((file, sum));
                }
                _ => {
                    return Err(AnalysisError::Configuration(format!(
                        "line {}: unknown flow-fact directive '{}'",
                        line,
                        stmt.trim()
                    )));
                }
            }
        }
        Ok(facts)
    }

    /// Check the recorded checksums against the binary image bytes.
    pub fn verify_checksum(&self, image: &[u8]) -> Result<()> {
        if self.checksums.is_empty() {
            return Ok(());
        }
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(image);
        let actual = hasher.finalize();
        for (file, expected) in &self.checksums {
            if actual != *expected {
                return Err(AnalysisError::Configuration(format!(
                    "checksum mismatch for '{}': expected 0x{:08X}, binary has 0x{:08X}",
                    file, expected, actual
                )));
            }
        }
        Ok(())
    }
}

/// Split the input into `;`-terminated statements with comments stripped,
/// keeping the line number each statement starts on.
fn statements(text: &str) -> Result<Vec<(String, usize)>> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut start_line = 1;
    let mut line = 1;
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\n' => {
                line += 1;
                current.push(' ');
            }
            '/' if chars.peek() == Some(&'/') => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        line += 1;
                        break;
                    }
                }
                current.push(' ');
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut closed = false;
                let mut prev = ' ';
                for c in chars.by_ref() {
                    if c == '\n' {
                        line += 1;
                    }
                    if prev == '*' && c == '/' {
                        closed = true;
                        break;
                    }
                    prev = c;
                }
                if !closed {
                    return Err(AnalysisError::Configuration(format!(
                        "line {}: unterminated block comment",
                        line
                    )));
                }
                current.push(' ');
            }
            ';' => {
                out.push((std::mem::take(&mut current), start_line));
                start_line = line;
            }
            c => {
                if current.trim().is_empty() {
                    start_line = line;
                }
                current.push(c);
            }
        }
    }
    if !current.trim().is_empty() {
        return Err(AnalysisError::Configuration(format!(
            "line {}: missing ';' after '{}'",
            start_line,
            current.trim()
        )));
    }
    Ok(out)
}

fn parse_addr(token: &str, line: usize) -> Result<u32> {
    let parsed = match token.strip_prefix("0x").or_else(|| token.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => token.parse(),
    };
    parsed.map_err(|_| {
        AnalysisError::Configuration(format!("line {}: bad address '{}'", line, token))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_loops_and_checksum() {
        let text = r#"
            // bounds measured on target
            loop 0x1000 10;
            loop 4096 3; /* decimal header address */
            checksum "task.elf" 0xDEADBEEF;
        "#;
        let facts = FlowFacts::parse(text).unwrap();
        assert_eq!(facts.loops.get(&0x1000), Some(&3)); // 4096 == 0x1000, last wins
        assert_eq!(facts.checksums, vec![("task.elf".to_string(), 0xDEADBEEF)]);
    }

    #[test]
    fn test_parse_errors() {
        assert!(FlowFacts::parse("loop 0x10").is_err());
        assert!(FlowFacts::parse("loop 0x10 2").is_err()); // missing ';'
        assert!(FlowFacts::parse("bound 0x10 2;").is_err());
        assert!(FlowFacts::parse("loop 0x10 ?;").is_err());
        assert!(FlowFacts::parse("/* open").is_err());
    }

    #[test]
    fn test_checksum_verify() {
        let image = b"\x01\x02\x03\x04";
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(image);
        let crc = hasher.finalize();
        let facts = FlowFacts::parse(&format!("checksum \"a.bin\" 0x{:08X};", crc)).unwrap();
        assert!(facts.verify_checksum(image).is_ok());
        assert!(facts.verify_checksum(b"\x01\x02\x03\x05").is_err());
    }
}
