//! # Channel Naming
//!
//! Channels are plain strings. Typed publish/subscribe derives them from the
//! payload type's canonical [`fullname`](crate::codec::fullname), remote
//! functions derive them from the function's path, and applications are free
//! to pass explicit names everywhere.
//!
//! Some transports restrict the character set of the resources they create
//! (the hub restricts queue names the way cloud queue services do). For
//! those, [`encode_name`]/[`decode_name`] are a pure, inverse pair that maps
//! the characters the canonical scheme uses onto fixed markers, and
//! [`validate_name`] enforces the restricted alphabet and length limits.

use crate::error::TransportError;

/// Length ceiling enforced by [`validate_name`], following the most
/// restrictive common transport.
const NAME_MAX_LEN: usize = 256;

/// Marker substitutions applied by [`encode_name`], in scan order.
const MARKERS: [(char, &str); 4] = [
    ('*', "_WCD_"),
    ('/', "_FWS_"),
    ('.', "_DOT_"),
    (':', "_COL_"),
];

/// Encode a canonical channel or queue name for a transport with a
/// restricted character set.
///
/// The mapping is round-trippable through [`decode_name`] for any input
/// that does not itself contain one of the marker sequences.
pub fn encode_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for ch in name.chars() {
        match MARKERS.iter().find(|(c, _)| *c == ch) {
            Some((_, marker)) => out.push_str(marker),
            None => out.push(ch),
        }
    }
    out
}

/// Invert [`encode_name`].
pub fn decode_name(name: &str) -> String {
    let mut out = name.to_string();
    for (ch, marker) in MARKERS {
        out = out.replace(marker, &ch.to_string());
    }
    out
}

/// Check an encoded name against the restricted alphabet `[A-Za-z0-9_-]`
/// and the length bounds 1..=256.
pub fn validate_name(name: &str) -> Result<(), TransportError> {
    let ok_len = !name.is_empty() && name.len() <= NAME_MAX_LEN;
    let ok_chars = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if ok_len && ok_chars {
        Ok(())
    } else {
        Err(TransportError::InvalidTopicName(name.to_string()))
    }
}

/// Match a channel glob against an exact channel name.
///
/// `*` matches any (possibly empty) run of characters and `?` matches any
/// single character; everything else matches literally. This is the pattern
/// syntax of the in-tree transports; external brokers keep their own.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();

    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut mark = 0usize;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            mark = ti;
            pi += 1;
        } else if let Some(sp) = star {
            pi = sp + 1;
            mark += 1;
            ti = mark;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}
