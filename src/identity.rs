// =============================================================================
// Identity & Comment Codec — binds a broker position to a session + row
// =============================================================================
//
// Position tag grammar: `^(buy|sell)_[0-9a-f]{8}_idx(0|[1-9][0-9]*)$`
//
// Encoding is pure and infallible. Decoding is total: it either returns the
// parsed `(side, hash, index)` triple or `None` — tags that don't parse are
// "foreign" positions, not managed by the engine (§4.1).
// =============================================================================

use crate::types::Side;

/// A successfully parsed position tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTag {
    pub side: Side,
    pub hash: String,
    pub index: u32,
}

/// Encode a position comment tag for `side`/`hash`/`index`.
pub fn encode(side: Side, hash: &str, index: u32) -> String {
    format!("{side}_{hash}_idx{index}")
}

/// Parse a position comment. Returns `None` for anything that doesn't match
/// the grammar exactly (no partial matches, no surrounding whitespace).
pub fn decode(comment: &str) -> Option<ParsedTag> {
    let (side, rest) = if let Some(rest) = comment.strip_prefix("buy_") {
        (Side::Buy, rest)
    } else if let Some(rest) = comment.strip_prefix("sell_") {
        (Side::Sell, rest)
    } else {
        return None;
    };

    let (hash, idx_part) = rest.split_once("_idx")?;

    if hash.len() != 8 || !hash.bytes().all(is_lower_hex) {
        return None;
    }

    if idx_part.is_empty() || !idx_part.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    // Reject leading zeros, e.g. "01" — grammar is `0|[1-9][0-9]*`.
    if idx_part.len() > 1 && idx_part.as_bytes()[0] == b'0' {
        return None;
    }

    let index: u32 = idx_part.parse().ok()?;

    Some(ParsedTag {
        side,
        hash: hash.to_string(),
        index,
    })
}

fn is_lower_hex(b: u8) -> bool {
    b.is_ascii_digit() || (b'a'..=b'f').contains(&b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_encode_decode() {
        // I7: encode then decode yields exactly the original triple.
        for side in [Side::Buy, Side::Sell] {
            for index in [0u32, 1, 7, 42, 999] {
                let tag = encode(side, "a1b2c3d4", index);
                let parsed = decode(&tag).expect("should parse");
                assert_eq!(parsed.side, side);
                assert_eq!(parsed.hash, "a1b2c3d4");
                assert_eq!(parsed.index, index);
            }
        }
    }

    #[test]
    fn rejects_uppercase_hash() {
        assert!(decode("buy_A1B2C3D4_idx0").is_none());
    }

    #[test]
    fn rejects_wrong_hash_length() {
        assert!(decode("buy_a1b2c3_idx0").is_none());
        assert!(decode("buy_a1b2c3d4ff_idx0").is_none());
    }

    #[test]
    fn rejects_leading_zero_index() {
        assert!(decode("buy_a1b2c3d4_idx01").is_none());
    }

    #[test]
    fn rejects_unknown_side() {
        assert!(decode("hold_a1b2c3d4_idx0").is_none());
    }

    #[test]
    fn rejects_negative_or_non_numeric_index() {
        assert!(decode("buy_a1b2c3d4_idx-1").is_none());
        assert!(decode("buy_a1b2c3d4_idxfoo").is_none());
    }

    #[test]
    fn foreign_comment_is_ignored_not_an_error() {
        assert!(decode("manual trade #4821").is_none());
        assert!(decode("").is_none());
    }

    #[test]
    fn accepts_index_zero() {
        let parsed = decode("sell_0123abcd_idx0").unwrap();
        assert_eq!(parsed.index, 0);
    }
}
