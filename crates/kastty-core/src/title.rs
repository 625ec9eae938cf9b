//! Incremental window-title scanner.
//!
//! Watches raw terminal output for `ESC ] 0 ;` / `ESC ] 2 ;` title sequences
//! terminated by BEL or ST (`ESC \`). Output arrives in arbitrary chunks, so
//! both multi-byte characters and escape sequences may be split across
//! calls; the scanner carries the unfinished tail over to the next call.

/// Upper bound on the carried-over text, in characters.
pub const MAX_RESIDUAL_CHARS: usize = 8192;

/// Title shown when the terminal has not set one (or set a blank one).
pub const DEFAULT_TITLE: &str = "kastty";

const ESC: char = '\u{1b}';
const BEL: char = '\u{07}';
const INTRODUCERS: [&str; 2] = ["\u{1b}]0;", "\u{1b}]2;"];
const INTRODUCER_LEN: usize = 4;

enum Introducer {
    /// A full `ESC ] 0|2 ;` sits at this position.
    Complete,
    /// The buffer ends in the middle of what may become an introducer.
    Partial,
    NoMatch,
}

/// Streaming scanner that turns terminal output into title-change events.
#[derive(Debug, Default)]
pub struct TitleScanner {
    /// Unterminated title sequence (or partial introducer) from earlier chunks.
    residual: String,
    /// Trailing bytes of an incomplete UTF-8 character.
    pending: Vec<u8>,
}

impl TitleScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of raw output and return the titles it completes, in order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        let text = self.decode(chunk);
        self.feed_str(&text)
    }

    /// Feed already-decoded text.
    pub fn feed_str(&mut self, text: &str) -> Vec<String> {
        let mut titles = Vec::new();
        if self.residual.is_empty() && !text.contains(ESC) {
            return titles;
        }

        self.residual.push_str(text);
        let buf = std::mem::take(&mut self.residual);
        let mut pos = 0;

        while let Some(offset) = buf[pos..].find(ESC) {
            let start = pos + offset;
            match introducer_at(&buf[start..]) {
                Introducer::Complete => {
                    let body = start + INTRODUCER_LEN;
                    match find_terminator(&buf[body..]) {
                        Some((end, term_len)) => {
                            titles.push(buf[body..body + end].to_string());
                            pos = body + end + term_len;
                        }
                        None => {
                            self.retain(&buf[start..]);
                            break;
                        }
                    }
                }
                Introducer::Partial => {
                    self.retain(&buf[start..]);
                    break;
                }
                Introducer::NoMatch => pos = start + ESC.len_utf8(),
            }
        }

        titles
    }

    /// Drop any carried-over state. Call when the output stream restarts.
    pub fn reset(&mut self) {
        self.residual.clear();
        self.pending.clear();
    }

    /// Number of characters currently carried over.
    pub fn residual_len(&self) -> usize {
        self.residual.chars().count()
    }

    fn retain(&mut self, fragment: &str) {
        let count = fragment.chars().count();
        let keep_from = if count > MAX_RESIDUAL_CHARS {
            fragment
                .char_indices()
                .nth(count - MAX_RESIDUAL_CHARS)
                .map(|(i, _)| i)
                .unwrap_or(0)
        } else {
            0
        };
        self.residual = fragment[keep_from..].to_string();
    }

    /// Lossy streaming UTF-8 decode; an incomplete trailing character is
    /// held back until the next chunk.
    fn decode(&mut self, chunk: &[u8]) -> String {
        let mut bytes = std::mem::take(&mut self.pending);
        bytes.extend_from_slice(chunk);

        let mut out = String::with_capacity(bytes.len());
        let mut rest = &bytes[..];
        loop {
            match std::str::from_utf8(rest) {
                Ok(s) => {
                    out.push_str(s);
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&rest[..valid]));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &rest[valid + len..];
                        }
                        None => {
                            self.pending = rest[valid..].to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }
}

fn introducer_at(rest: &str) -> Introducer {
    if INTRODUCERS.iter().any(|intro| rest.starts_with(intro)) {
        Introducer::Complete
    } else if rest.len() < INTRODUCER_LEN && INTRODUCERS.iter().any(|intro| intro.starts_with(rest)) {
        Introducer::Partial
    } else {
        Introducer::NoMatch
    }
}

/// Byte offset and length of the first BEL or ST in `body`.
fn find_terminator(body: &str) -> Option<(usize, usize)> {
    let mut chars = body.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c == BEL {
            return Some((i, 1));
        }
        if c == ESC && matches!(chars.peek(), Some((_, '\\'))) {
            return Some((i, 2));
        }
    }
    None
}

/// Title to display for a terminal-provided title, falling back to
/// [`DEFAULT_TITLE`] when it is blank.
pub fn display_title(title: Option<&str>) -> &str {
    match title.map(str::trim) {
        Some(t) if !t.is_empty() => t,
        _ => DEFAULT_TITLE,
    }
}
