//! Line framing for the ELM327 dialect
//!
//! Requests are hex command lines terminated by `\r`. Replies are one or
//! more lines of hex byte pairs, closed by the `>` prompt. Multi-frame
//! replies mark continuation lines with `n:` and are joined before parsing.

use crate::error::{ObdError, ObdStatus};
use crate::pid::PidCatalog;
use serde::{Deserialize, Serialize};

/// Character the adapter sends when it is ready for the next command
pub const PROMPT: char = '>';

/// Terminator appended to every command line
pub const COMMAND_TERMINATOR: &str = "\r";

/// Most data bytes a single reply line can carry
pub const MAX_DATA_BYTES: usize = 20;

/// Modes whose replies carry no PID echo
pub fn mode_has_pid(mode: u8) -> bool {
    !matches!(mode, 0x03 | 0x04)
}

/// A single mode/PID request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObdRequest {
    pub mode: u8,
    pub pid: u8,
    /// Number of reply lines the adapter should wait for. Never used to
    /// validate the reply.
    pub hint_bytes: Option<u8>,
}

impl ObdRequest {
    pub fn new(mode: u8, pid: u8) -> Self {
        Self {
            mode,
            pid,
            hint_bytes: None,
        }
    }

    pub fn with_hint(mut self, hint: Option<u8>) -> Self {
        self.hint_bytes = hint;
        self
    }

    /// The command line, terminator included
    pub fn encode(&self) -> String {
        if !mode_has_pid(self.mode) {
            return format!("{:02X}{}", self.mode, COMMAND_TERMINATOR);
        }
        match self.hint_bytes {
            Some(n @ 1..=0xF) => format!(
                "{:02X}{:02X}{:01X}{}",
                self.mode, self.pid, n, COMMAND_TERMINATOR
            ),
            _ => format!("{:02X}{:02X}{}", self.mode, self.pid, COMMAND_TERMINATOR),
        }
    }
}

/// Decoded reply to an [`ObdRequest`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObdReply {
    pub status: ObdStatus,
    /// Data bytes, empty unless `status` is `Success`
    pub bytes: Vec<u8>,
}

impl ObdReply {
    pub fn success(bytes: Vec<u8>) -> Self {
        Self {
            status: ObdStatus::Success,
            bytes,
        }
    }

    pub fn failure(status: ObdStatus) -> Self {
        Self {
            status,
            bytes: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Data bytes, or the status as an error
    pub fn into_result(self) -> Result<Vec<u8>, ObdError> {
        if self.is_success() {
            Ok(self.bytes)
        } else {
            Err(ObdError::Status(self.status))
        }
    }
}

/// Terminate an AT or raw command
pub fn encode_command(cmd: &str) -> String {
    format!("{}{}", cmd, COMMAND_TERMINATOR)
}

/// True once a buffer holds a complete reply
pub fn is_reply_complete(buf: &[u8]) -> bool {
    buf.last() == Some(&(PROMPT as u8))
}

/// Split a raw reply into logical lines.
///
/// A line holding `:` is a multi-frame segment; its content after the colon
/// is appended to the current logical line. Lines of three characters or
/// fewer are byte-count headers and close the current line.
pub fn join_lines(raw: &str) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();
    let mut open = false;

    for line in raw
        .split(|c: char| c == '\r' || c == '\n' || c == PROMPT)
        .map(str::trim)
        .filter(|l| !l.is_empty())
    {
        if let Some(idx) = line.find(':') {
            let segment: String = line[idx + 1..].split_whitespace().collect();
            match lines.last_mut() {
                Some(last) if open => last.push_str(&segment),
                _ => lines.push(segment),
            }
            open = true;
        } else if line.len() <= 3 {
            open = false;
        } else {
            lines.push(line.to_string());
            open = true;
        }
    }
    lines
}

/// Read hex byte pairs the way `%2x` conversions do: whitespace is
/// skipped, each token is at most two digits, and the first character
/// that is neither ends the scan.
pub fn scan_hex_pairs(line: &str, max: usize) -> Vec<u8> {
    let mut out = Vec::new();
    let mut chars = line.chars().peekable();
    while out.len() < max {
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        let mut value: u8 = 0;
        let mut digits = 0;
        while digits < 2 {
            match chars.peek().and_then(|c| c.to_digit(16)) {
                Some(d) => {
                    value = (value << 4) | d as u8;
                    digits += 1;
                    chars.next();
                }
                None => break,
            }
        }
        if digits == 0 {
            break;
        }
        out.push(value);
    }
    out
}

/// Tokens of a request line as the responder reads them: `mode [pid [extra]]`.
/// The first two tokens are at most two hex digits, the third is unbounded.
pub fn scan_request(line: &str) -> Vec<u32> {
    let mut out = scan_hex_pairs(line, 2)
        .into_iter()
        .map(u32::from)
        .collect::<Vec<_>>();
    if out.len() < 2 {
        return out;
    }

    // Skip what the first two tokens consumed, then read one free-width token
    let mut rest = line.trim_start();
    for _ in 0..2 {
        rest = rest.trim_start();
        let taken = rest
            .char_indices()
            .take(2)
            .take_while(|(_, c)| c.is_ascii_hexdigit())
            .count();
        rest = &rest[taken..];
    }
    let digits: String = rest
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_hexdigit())
        .take(8)
        .collect();
    if let Ok(extra) = u32::from_str_radix(&digits, 16) {
        out.push(extra);
    }
    out
}

/// Decode a complete raw reply for `(mode, pid)`
pub fn decode_response(raw: &str, mode: u8, pid: u8) -> ObdReply {
    let body = raw.trim_end().trim_end_matches(PROMPT);

    if body.contains("NO DATA") {
        return ObdReply::failure(ObdStatus::NoData);
    }
    if body.contains('?') {
        return ObdReply::failure(ObdStatus::Unparsable);
    }
    if body.contains("UNABLE TO CONNECT") {
        return ObdReply::failure(ObdStatus::UnableToConnect);
    }

    let mut last = ObdReply::failure(ObdStatus::Unparsable);
    for line in join_lines(body) {
        let reply = parse_line(&line, mode, pid);
        if reply.is_success() {
            return reply;
        }
        last = reply;
    }
    last
}

fn parse_line(line: &str, mode: u8, pid: u8) -> ObdReply {
    let has_pid = mode_has_pid(mode);
    let prefix = 1 + usize::from(has_pid);
    let max_tokens = prefix + MAX_DATA_BYTES;

    let compact: String = line
        .split_whitespace()
        .collect::<String>()
        .to_ascii_uppercase();
    let expected = if has_pid {
        format!("{:02X}{:02X}", 0x40 + u16::from(mode), pid)
    } else {
        format!("{:02X}", 0x40 + u16::from(mode))
    };

    let tokens = if compact.starts_with(&expected) {
        scan_hex_pairs(line, max_tokens)
    } else {
        strip_header(&compact, &expected, max_tokens)
            .unwrap_or_else(|| scan_hex_pairs(line, max_tokens))
    };

    if tokens.len() <= 2 {
        return ObdReply::failure(ObdStatus::Unparsable);
    }
    if u16::from(tokens[0]) != 0x40 + u16::from(mode) {
        return ObdReply::failure(ObdStatus::InvalidResponse);
    }
    if has_pid && tokens[1] != pid {
        return ObdReply::failure(ObdStatus::InvalidMode);
    }
    let mut data = tokens[prefix..].to_vec();
    if let Some(width) = catalog_width(mode, pid) {
        if data.len() < width {
            return ObdReply::failure(ObdStatus::Unparsable);
        }
        data.truncate(width);
    }
    ObdReply::success(data)
}

/// Data bytes a current-data reply must carry for catalogued PIDs
fn catalog_width(mode: u8, pid: u8) -> Option<usize> {
    if mode != crate::mode::CURRENT_DATA {
        return None;
    }
    PidCatalog::lookup_by_pid(pid).map(|cmd| usize::from(cmd.expected_bytes))
}

/// Recognise an adapter header in front of the response code and return
/// the message tokens behind it, checksum excluded.
fn strip_header(compact: &str, expected: &str, max_tokens: usize) -> Option<Vec<u8>> {
    let at = |offset: usize| compact.get(offset..).is_some_and(|s| s.starts_with(expected));
    let len_at = |start: usize| {
        compact
            .get(start..start + 2)
            .and_then(|s| u8::from_str_radix(s, 16).ok())
    };

    // CAN 11-bit: "7E8" + length [+ dlc digit]
    if compact.starts_with('7') {
        for offset in [5, 6] {
            if at(offset) {
                let len = usize::from(len_at(3)?);
                let tokens = scan_hex_pairs(&compact[offset..], max_tokens);
                return Some(tokens.into_iter().take(len).collect());
            }
        }
    }

    // CAN 29-bit: "18DAF1xx" + length [+ dlc digit]
    if compact.starts_with("18DA") {
        for offset in [10, 11] {
            if at(offset) {
                let len = usize::from(len_at(8)?);
                let tokens = scan_hex_pairs(&compact[offset..], max_tokens);
                return Some(tokens.into_iter().take(len).collect());
            }
        }
    }

    // J1850 and ISO: three header bytes, trailing checksum
    if at(6) {
        let mut tokens = scan_hex_pairs(&compact[6..], max_tokens + 1);
        tokens.pop();
        return Some(tokens);
    }
    None
}
