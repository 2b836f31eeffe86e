//! Span rewrites: full-redaction marker, partial masks and hash previews

use pii_rules::{MaskStyle, PartialMask, RedactionAction};
use sha2::{Digest, Sha256};
use std::ops::Range;

/// Full-redaction marker
pub const REDACTED: &str = "[REDACTED]";

const HASH_PREFIX: &str = "[HASH:";
const HASH_HEX_LEN: usize = 8;

/// Rewrite a matched span according to the rule action
pub fn rewrite(action: RedactionAction, mask: &PartialMask, salt: &str, span: &str) -> String {
    match action {
        RedactionAction::RedactFull => REDACTED.to_string(),
        RedactionAction::RedactPartial => apply_mask(mask, span),
        RedactionAction::HashPreview => hash_preview(salt, span),
    }
}

/// `[HASH:xxxxxxxx]` from the first 8 hex chars of the salted SHA-256
pub fn hash_preview(salt: &str, value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(value.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("{HASH_PREFIX}{}]", &digest[..HASH_HEX_LEN])
}

/// Apply a partial mask.
///
/// Every style is a fixed point: masking an already masked value returns it
/// unchanged, so rescanning redacted output is stable.
pub fn apply_mask(mask: &PartialMask, value: &str) -> String {
    match mask.style {
        MaskStyle::Edges => mask_edges(value, mask.keep_prefix, mask.keep_suffix, mask.mask_char),
        MaskStyle::Email => mask_email(value, mask.keep_prefix, mask.mask_char),
        MaskStyle::Initials => mask_initials(value, mask.mask_char),
        MaskStyle::Ipv4 => mask_ipv4(value, mask.mask_char),
        MaskStyle::Address => mask_address(value, mask.keep_prefix, mask.mask_char),
    }
}

fn mask_edges(value: &str, prefix: usize, suffix: usize, mask_char: char) -> String {
    let len = value.chars().count();
    if len <= prefix + suffix {
        return std::iter::repeat(mask_char).take(len).collect();
    }
    value
        .chars()
        .enumerate()
        .map(|(i, c)| if i < prefix || i >= len - suffix { c } else { mask_char })
        .collect()
}

/// Leading characters up to `keep`, stopping at the first mask character
fn kept_prefix(value: &str, keep: usize, mask_char: char) -> String {
    value.chars().take(keep).take_while(|&c| c != mask_char).collect()
}

fn mask_email(value: &str, keep: usize, mask_char: char) -> String {
    let Some(at) = value.rfind('@') else {
        return mask_edges(value, keep, 0, mask_char);
    };
    let (local, domain) = value.split_at(at);
    let mut out = kept_prefix(local, keep, mask_char);
    out.extend(std::iter::repeat(mask_char).take(3));
    out.push_str(domain);
    out
}

fn mask_initials(value: &str, mask_char: char) -> String {
    let mut at_word_start = true;
    value
        .chars()
        .map(|c| {
            if c.is_whitespace() {
                at_word_start = true;
                c
            } else if at_word_start {
                at_word_start = false;
                c
            } else {
                mask_char
            }
        })
        .collect()
}

fn mask_ipv4(value: &str, mask_char: char) -> String {
    let octets: Vec<&str> = value.split('.').collect();
    if octets.len() != 4 {
        return mask_edges(value, 0, 0, mask_char);
    }
    let hidden: String = std::iter::repeat(mask_char).take(3).collect();
    format!("{}.{hidden}.{hidden}.{}", octets[0], octets[3])
}

fn mask_address(value: &str, keep: usize, mask_char: char) -> String {
    let mut out = kept_prefix(value, keep, mask_char);
    out.extend(std::iter::repeat(mask_char).take(3));
    out.push_str("...");

    let postal = value
        .rsplit(|c: char| c == ',' || c.is_whitespace())
        .find(|token| !token.is_empty())
        .filter(|token| {
            (5..=6).contains(&token.len()) && token.bytes().all(|b| b.is_ascii_digit())
        });
    if let Some(postal) = postal {
        out.push_str(", ");
        out.push_str(postal);
    }
    out
}

/// Byte ranges of existing redaction markers in `text`
pub fn marker_ranges(text: &str) -> Vec<Range<usize>> {
    let mut ranges = Vec::new();
    let mut offset = 0;
    while let Some(pos) = text[offset..].find('[') {
        let start = offset + pos;
        let rest = &text[start..];
        if rest.starts_with(REDACTED) {
            ranges.push(start..start + REDACTED.len());
            offset = start + REDACTED.len();
            continue;
        }
        let hash_len = HASH_PREFIX.len() + HASH_HEX_LEN + 1;
        if rest.starts_with(HASH_PREFIX)
            && rest.len() >= hash_len
            && rest.as_bytes()[hash_len - 1] == b']'
            && rest.as_bytes()[HASH_PREFIX.len()..hash_len - 1]
                .iter()
                .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
        {
            ranges.push(start..start + hash_len);
            offset = start + hash_len;
            continue;
        }
        offset = start + 1;
    }
    ranges
}

/// Complement of [`marker_ranges`]: the parts of `text` patterns may run on
pub fn scannable_segments(text: &str) -> Vec<Range<usize>> {
    let mut segments = Vec::new();
    let mut cursor = 0;
    for marker in marker_ranges(text) {
        if marker.start > cursor {
            segments.push(cursor..marker.start);
        }
        cursor = marker.end;
    }
    if cursor < text.len() {
        segments.push(cursor..text.len());
    }
    segments
}
