//! Serial command surface: a line of ASCII, a single-letter verb, hex
//! arguments. Used to pick the pairing slot and poke at the link.
//!
//! ```text
//! D           print pairing slot
//! D=<0..7>    persist and apply pairing slot
//! L           enter pairing mode
//! P=<bytes>   inject a raw packet payload (hex, space separated)
//! R           reset module
//! V=<0|1>    verbose packet logging
//! H           help
//! ```
//!
//! Parsing is split from execution: `CmdProcessor` turns console bytes into
//! [`Command`] values and the scheduler applies them, so the tokenizer stays
//! a pure function of its input.

use heapless::Vec;

use crate::cfg_storage::MAX_SLOT;
use crate::protocols::bm64::MAX_TX_PAYLOAD;

/// Longest accepted command line, terminator excluded.
const LINE_CAP: usize = 96;

pub const HELP_TEXT: &str = "Commands:\r\n\
  D            print pairing slot\r\n\
  D=<0..7>     set pairing slot\r\n\
  L            enter pairing mode\r\n\
  P=<hex bytes> inject raw packet payload\r\n\
  R            reset module\r\n\
  V=<0|1>      verbose packet logging\r\n\
  H            this help\r\n";

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Command {
    ShowSlot,
    SetSlot(u8),
    EnterPairing,
    Inject(Vec<u8, MAX_TX_PAYLOAD>),
    Reset,
    Verbose(bool),
    Help,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CmdError {
    Illegal,
    /// `P=` payload longer than a frame can carry.
    TooLong,
}

pub struct CmdProcessor {
    line: Vec<u8, LINE_CAP>,
    overrun: bool,
}

impl CmdProcessor {
    pub fn new() -> Self {
        Self {
            line: Vec::new(),
            overrun: false,
        }
    }

    /// Accumulate one console byte; a CR or LF completes the line and yields
    /// its parse.
    pub fn feed(&mut self, byte: u8) -> Option<Result<Command, CmdError>> {
        match byte {
            b'\r' | b'\n' => {
                if self.line.is_empty() && !self.overrun {
                    return None;
                }
                let res = if self.overrun {
                    Err(CmdError::Illegal)
                } else {
                    parse(&self.line)
                };
                self.line.clear();
                self.overrun = false;
                Some(res)
            }
            _ => {
                if self.line.push(byte).is_err() {
                    self.overrun = true;
                }
                None
            }
        }
    }
}

fn parse(line: &[u8]) -> Result<Command, CmdError> {
    let line = trim(line);
    let (&verb, rest) = line.split_first().ok_or(CmdError::Illegal)?;
    match verb {
        b'D' => {
            if rest.is_empty() {
                Ok(Command::ShowSlot)
            } else {
                let slot = hex_byte(trim(eq_arg(rest)?))?;
                if slot <= MAX_SLOT {
                    Ok(Command::SetSlot(slot))
                } else {
                    Err(CmdError::Illegal)
                }
            }
        }
        b'L' if rest.is_empty() => Ok(Command::EnterPairing),
        b'R' if rest.is_empty() => Ok(Command::Reset),
        b'H' if rest.is_empty() => Ok(Command::Help),
        b'V' => match trim(eq_arg(rest)?) {
            b"0" => Ok(Command::Verbose(false)),
            b"1" => Ok(Command::Verbose(true)),
            _ => Err(CmdError::Illegal),
        },
        b'P' => {
            let mut bytes = Vec::new();
            for tok in eq_arg(rest)?.split(|&b| b == b' ').filter(|t| !t.is_empty()) {
                let v = hex_byte(tok)?;
                bytes.push(v).map_err(|_| CmdError::TooLong)?;
            }
            if bytes.is_empty() {
                return Err(CmdError::Illegal);
            }
            Ok(Command::Inject(bytes))
        }
        _ => Err(CmdError::Illegal),
    }
}

fn eq_arg(rest: &[u8]) -> Result<&[u8], CmdError> {
    match rest.split_first() {
        Some((b'=', arg)) => Ok(arg),
        _ => Err(CmdError::Illegal),
    }
}

fn trim(s: &[u8]) -> &[u8] {
    let start = s.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(s.len());
    let end = s.iter().rposition(|b| !b.is_ascii_whitespace()).map_or(start, |i| i + 1);
    &s[start..end]
}

fn hex_byte(tok: &[u8]) -> Result<u8, CmdError> {
    if tok.is_empty() || tok.len() > 2 {
        return Err(CmdError::Illegal);
    }
    let mut v = 0u8;
    for &b in tok {
        let d = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b - b'a' + 10,
            b'A'..=b'F' => b - b'A' + 10,
            _ => return Err(CmdError::Illegal),
        };
        v = (v << 4) | d;
    }
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_line(s: &str) -> Option<Result<Command, CmdError>> {
        let mut p = CmdProcessor::new();
        let mut out = None;
        for &b in s.as_bytes() {
            out = p.feed(b);
        }
        out
    }

    #[test]
    fn bare_verbs_parse() {
        assert_eq!(parse_line("D\n"), Some(Ok(Command::ShowSlot)));
        assert_eq!(parse_line("L\r"), Some(Ok(Command::EnterPairing)));
        assert_eq!(parse_line("R\n"), Some(Ok(Command::Reset)));
        assert_eq!(parse_line("H\n"), Some(Ok(Command::Help)));
    }

    #[test]
    fn slot_argument_is_hex_and_bounded() {
        assert_eq!(parse_line("D=5\n"), Some(Ok(Command::SetSlot(5))));
        assert_eq!(parse_line("D=7\n"), Some(Ok(Command::SetSlot(7))));
        assert_eq!(parse_line("D=8\n"), Some(Err(CmdError::Illegal)));
        assert_eq!(parse_line("D=x\n"), Some(Err(CmdError::Illegal)));
    }

    #[test]
    fn verbose_takes_zero_or_one() {
        assert_eq!(parse_line("V=1\n"), Some(Ok(Command::Verbose(true))));
        assert_eq!(parse_line("V=0\n"), Some(Ok(Command::Verbose(false))));
        assert_eq!(parse_line("V=2\n"), Some(Err(CmdError::Illegal)));
        assert_eq!(parse_line("V\n"), Some(Err(CmdError::Illegal)));
    }

    #[test]
    fn inject_parses_spaced_hex_bytes() {
        let cmd = parse_line("P=02 00 5D\n").unwrap().unwrap();
        match cmd {
            Command::Inject(bytes) => assert_eq!(&bytes[..], &[0x02, 0x00, 0x5D]),
            _ => panic!("wrong command"),
        }
    }

    #[test]
    fn oversize_inject_is_too_long() {
        let mut s = heapless::String::<256>::new();
        s.push_str("P=").unwrap();
        for _ in 0..MAX_TX_PAYLOAD + 1 {
            s.push_str("AA ").unwrap();
        }
        s.push('\n').unwrap();
        assert_eq!(parse_line(&s), Some(Err(CmdError::TooLong)));
    }

    #[test]
    fn unknown_verbs_and_noise_are_illegal() {
        assert_eq!(parse_line("X\n"), Some(Err(CmdError::Illegal)));
        assert_eq!(parse_line("d\n"), Some(Err(CmdError::Illegal)));
        assert_eq!(parse_line("D 3\n"), Some(Err(CmdError::Illegal)));
    }

    #[test]
    fn empty_lines_are_ignored() {
        assert_eq!(parse_line("\n"), None);
        assert_eq!(parse_line("\r"), None);
    }

    #[test]
    fn case_matters() {
        assert_eq!(parse_line("h\n"), Some(Err(CmdError::Illegal)));
    }
}
