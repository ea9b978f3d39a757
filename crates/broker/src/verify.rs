// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Echo verification: a rolling window of the worker's *visible* output.
//!
//! Terminal apps interleave escape sequences with the text they echo, and the
//! terminal wraps long lines at the column limit. The window therefore holds
//! output with all escape sequences and control characters removed, so the
//! injected message can be found by plain substring containment no matter how
//! the CLI chose to redraw it.

/// Default window capacity: the tail of visible output retained for matching.
pub const DEFAULT_WINDOW_CAP: usize = 16 * 1024;

/// Escape-sequence parser state, carried across chunk boundaries so a
/// sequence split between two PTY reads is still consumed whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterState {
    Ground,
    /// Saw ESC; the next byte selects the sequence family.
    Escape,
    /// Inside ESC-intermediate (0x20..=0x2F); one final byte follows.
    EscapeIntermediate,
    /// Inside CSI (`ESC [`); terminated by a final byte 0x40..=0x7E.
    Csi,
    /// Inside an OSC/DCS/PM/APC string; terminated by BEL or ST (`ESC \`).
    OscString,
    /// Saw ESC inside an OSC string (possible ST terminator).
    OscEscape,
}

/// Streaming filter that strips ANSI escape sequences and control characters,
/// leaving only the bytes a reader would see.
#[derive(Debug)]
pub struct AnsiFilter {
    state: FilterState,
}

impl AnsiFilter {
    pub fn new() -> Self {
        Self { state: FilterState::Ground }
    }

    /// Feed raw PTY bytes, appending the visible remainder to `out`.
    pub fn push(&mut self, data: &[u8], out: &mut Vec<u8>) {
        for &byte in data {
            self.state = match self.state {
                FilterState::Ground => match byte {
                    0x1b => FilterState::Escape,
                    // Control characters (including CR/LF) never reach the
                    // window: wrapped echoes must match as one run of text.
                    0x00..=0x1f | 0x7f => FilterState::Ground,
                    _ => {
                        out.push(byte);
                        FilterState::Ground
                    }
                },
                FilterState::Escape => match byte {
                    b'[' => FilterState::Csi,
                    b']' | b'P' | b'^' | b'_' => FilterState::OscString,
                    0x20..=0x2f => FilterState::EscapeIntermediate,
                    // Two-byte sequence (ESC c, ESC 7, ESC =, …) — consumed.
                    _ => FilterState::Ground,
                },
                FilterState::EscapeIntermediate => match byte {
                    0x20..=0x2f => FilterState::EscapeIntermediate,
                    _ => FilterState::Ground,
                },
                FilterState::Csi => match byte {
                    0x40..=0x7e => FilterState::Ground,
                    _ => FilterState::Csi,
                },
                FilterState::OscString => match byte {
                    0x07 => FilterState::Ground,
                    0x1b => FilterState::OscEscape,
                    _ => FilterState::OscString,
                },
                FilterState::OscEscape => match byte {
                    b'\\' => FilterState::Ground,
                    0x07 => FilterState::Ground,
                    _ => FilterState::OscString,
                },
            };
        }
    }
}

impl Default for AnsiFilter {
    fn default() -> Self {
        Self::new()
    }
}

/// Rolling visible-text window with bounded capacity (tail retained).
#[derive(Debug)]
pub struct VerifyWindow {
    filter: AnsiFilter,
    window: Vec<u8>,
    cap: usize,
}

impl VerifyWindow {
    pub fn new(cap: usize) -> Self {
        Self { filter: AnsiFilter::new(), window: Vec::new(), cap: cap.max(64) }
    }

    /// Feed a raw PTY chunk through the filter into the window.
    pub fn push_chunk(&mut self, data: &[u8]) {
        self.filter.push(data, &mut self.window);
        if self.window.len() > self.cap {
            let excess = self.window.len() - self.cap;
            self.window.drain(..excess);
        }
    }

    /// Test whether the window contains `needle`'s visible form.
    ///
    /// The needle is normalized the same way the window is built: control
    /// characters are elided, so a trailing newline on the formatted text
    /// does not defeat the match.
    pub fn contains(&self, needle: &str) -> bool {
        let normalized = normalize_needle(needle);
        if normalized.is_empty() {
            return false;
        }
        find_subslice(&self.window, &normalized)
    }

    /// Current visible window as lossy UTF-8 (diagnostics only).
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.window).into_owned()
    }

    pub fn clear(&mut self) {
        self.window.clear();
    }
}

/// Strip control characters from an expected-echo needle.
fn normalize_needle(needle: &str) -> Vec<u8> {
    needle.bytes().filter(|b| !(*b < 0x20 || *b == 0x7f)).collect()
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.len() > haystack.len() {
        return false;
    }
    haystack.windows(needle.len()).any(|w| w == needle)
}

#[cfg(test)]
#[path = "verify_tests.rs"]
mod tests;
