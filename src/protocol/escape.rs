//! Escape scheme for binary payloads.
//!
//! The adapter treats unescaped CR and LF as the end of a data line and ESC
//! as the escape character itself, so each of those bytes is prefixed with
//! ESC before it leaves the host.

pub const ESC: u8 = 0x1b;

pub fn needs_escape(byte: u8) -> bool {
    matches!(byte, b'\r' | b'\n' | ESC)
}

pub fn escape(data: &[u8]) -> Vec<u8> {
    let extra = data.iter().filter(|b| needs_escape(**b)).count();
    let mut out = Vec::with_capacity(data.len() + extra);
    for &b in data {
        if needs_escape(b) {
            out.push(ESC);
        }
        out.push(b);
    }
    out
}

/// Reverse of [`escape`]. A dangling ESC at the very end is dropped.
pub fn unescape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut escaped = false;
    for &b in data {
        if escaped {
            out.push(b);
            escaped = false;
        } else if b == ESC {
            escaped = true;
        } else {
            out.push(b);
        }
    }
    out
}

/// Split an escaped buffer before its final logical byte.
///
/// Never cuts an escape pair in two: the tail is either one plain byte or an
/// ESC-prefixed pair.
pub fn split_last_unit(escaped: &[u8]) -> (&[u8], &[u8]) {
    let len = escaped.len();
    if len == 0 {
        return (escaped, &[]);
    }
    // Count the run of ESC bytes ending just before the last byte: an odd run
    // means the last byte is the payload half of a pair.
    let run = escaped[..len - 1]
        .iter()
        .rev()
        .take_while(|b| **b == ESC)
        .count();
    let cut = if run % 2 == 1 { len - 2 } else { len - 1 };
    escaped.split_at(cut)
}
