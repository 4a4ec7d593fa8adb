//! Run sequence tokens and run identifiers.
//!
//! A sequence token is a `(num, letter)` pair serialized as
//! `"<num>:<letter>"` in the harness sequence file. The letter advances
//! `A..Z` then `a..z`; past `z` it wraps to `A` and the number
//! increments. Run ids are `<bench>.<num><letter>` and sort by the
//! `(num, letter)` suffix alone.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use drover_error::DroverError;
use serde::{Deserialize, Serialize};

/// Ordinal of a sequence letter in the `A..Z, a..z` cycle.
fn letter_rank(c: char) -> Option<u8> {
    match c {
        'A'..='Z' => Some(c as u8 - b'A'),
        'a'..='z' => Some(c as u8 - b'a' + 26),
        _ => None,
    }
}

/// Inverse of [`letter_rank`].
fn rank_letter(rank: u8) -> char {
    debug_assert!(rank < 52);
    if rank < 26 {
        (b'A' + rank) as char
    } else {
        (b'a' + rank - 26) as char
    }
}

/// The minting cursor for run ids: the *current* token names the next run
/// to be minted, and the file is rewritten with the successor afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SeqToken {
    /// Numeric part, 1-based.
    pub num: u32,
    /// Letter part, `A..Z` then `a..z`.
    pub letter: char,
}

impl SeqToken {
    /// The reset token `(1, 'A')`, used when the sequence file is missing
    /// or corrupt.
    pub const FIRST: Self = Self { num: 1, letter: 'A' };

    /// The next token in the sequence.
    #[must_use]
    pub fn successor(self) -> Self {
        let rank = letter_rank(self.letter).unwrap_or(51);
        if rank == 51 {
            Self {
                num: self.num + 1,
                letter: 'A',
            }
        } else {
            Self {
                num: self.num,
                letter: rank_letter(rank + 1),
            }
        }
    }

    /// The previous token, or `None` from `(1, 'A')`.
    #[must_use]
    pub fn predecessor(self) -> Option<Self> {
        let rank = letter_rank(self.letter)?;
        if rank == 0 {
            if self.num <= 1 {
                return None;
            }
            Some(Self {
                num: self.num - 1,
                letter: 'z',
            })
        } else {
            Some(Self {
                num: self.num,
                letter: rank_letter(rank - 1),
            })
        }
    }

    /// The run-id suffix this token mints, e.g. `"1A"`.
    #[must_use]
    pub fn suffix(self) -> String {
        format!("{}{}", self.num, self.letter)
    }
}

impl fmt::Display for SeqToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.num, self.letter)
    }
}

impl FromStr for SeqToken {
    type Err = DroverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let corrupt = || DroverError::SequenceCorrupt {
            detail: format!("'{}'", s.trim()),
        };
        let (num_str, letter_str) = s.trim().split_once(':').ok_or_else(corrupt)?;
        let num: u32 = num_str.parse().map_err(|_| corrupt())?;
        let mut letters = letter_str.chars();
        let letter = letters.next().ok_or_else(corrupt)?;
        if num == 0 || letters.next().is_some() || letter_rank(letter).is_none() {
            return Err(corrupt());
        }
        Ok(Self { num, letter })
    }
}

/// A fully-qualified run identifier, `<bench>.<num><letter>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId {
    /// Benchmark short name (`[A-Za-z0-9_-]+`).
    pub bench: String,
    /// Sequence number.
    pub num: u32,
    /// Sequence letter.
    pub letter: char,
}

impl RunId {
    /// Compose a run id from a benchmark name and a sequence token.
    #[must_use]
    pub fn new(bench: impl Into<String>, token: SeqToken) -> Self {
        Self {
            bench: bench.into(),
            num: token.num,
            letter: token.letter,
        }
    }

    /// The token that minted this id.
    #[must_use]
    pub fn token(&self) -> SeqToken {
        SeqToken {
            num: self.num,
            letter: self.letter,
        }
    }

    /// The `<num><letter>` suffix.
    #[must_use]
    pub fn suffix(&self) -> String {
        self.token().suffix()
    }

    /// Sort key over the suffix alone: `(num asc, letter asc)` with
    /// `A < ... < Z < a < ... < z`. The bench name never participates.
    #[must_use]
    pub fn suffix_key(&self) -> (u32, u8) {
        (self.num, letter_rank(self.letter).unwrap_or(u8::MAX))
    }

    /// Compare two run-directory names by suffix, the queue pick order.
    /// Names that do not parse sort last, preserving their mutual order.
    pub fn compare_dir_names(a: &str, b: &str) -> Ordering {
        let key = |s: &str| s.parse::<RunId>().map(|id| id.suffix_key()).ok();
        match (key(a), key(b)) {
            (Some(ka), Some(kb)) => ka.cmp(&kb),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}{}", self.bench, self.num, self.letter)
    }
}

impl FromStr for RunId {
    type Err = DroverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || DroverError::InvalidRunId { raw: s.to_owned() };
        let (bench, suffix) = s.rsplit_once('.').ok_or_else(malformed)?;
        if bench.is_empty()
            || !bench
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(malformed());
        }
        // Suffix is all digits followed by exactly one sequence letter.
        let mut chars = suffix.chars();
        let letter = chars.next_back().ok_or_else(malformed)?;
        let digits = chars.as_str();
        if digits.is_empty() || letter_rank(letter).is_none() {
            return Err(malformed());
        }
        let num: u32 = digits.parse().map_err(|_| malformed())?;
        if num == 0 {
            return Err(malformed());
        }
        Ok(Self {
            bench: bench.to_owned(),
            num,
            letter,
        })
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn token_display_roundtrip() {
        let tok = SeqToken { num: 12, letter: 'c' };
        assert_eq!(tok.to_string(), "12:c");
        assert_eq!("12:c".parse::<SeqToken>().unwrap(), tok);
    }

    #[test]
    fn token_parse_rejects_garbage() {
        for raw in ["", "1", "1:", ":A", "0:A", "1:AA", "1:!", "x:A", "1;A"] {
            assert!(raw.parse::<SeqToken>().is_err(), "accepted {raw:?}");
        }
    }

    #[test]
    fn successor_walks_the_letter_cycle() {
        let mut tok = SeqToken::FIRST;
        let mut letters = Vec::new();
        for _ in 0..52 {
            letters.push(tok.letter);
            tok = tok.successor();
        }
        assert_eq!(letters[0], 'A');
        assert_eq!(letters[25], 'Z');
        assert_eq!(letters[26], 'a');
        assert_eq!(letters[51], 'z');
        // Wrapped past 'z': number increments, letter resets.
        assert_eq!(tok, SeqToken { num: 2, letter: 'A' });
    }

    #[test]
    fn predecessor_at_origin_is_none() {
        assert_eq!(SeqToken::FIRST.predecessor(), None);
        assert_eq!(
            SeqToken { num: 2, letter: 'A' }.predecessor(),
            Some(SeqToken { num: 1, letter: 'z' })
        );
        assert_eq!(
            SeqToken { num: 2, letter: 'a' }.predecessor(),
            Some(SeqToken { num: 2, letter: 'Z' })
        );
    }

    #[test]
    fn run_id_format_and_parse() {
        let id = RunId::new("web101", SeqToken { num: 1, letter: 'z' });
        assert_eq!(id.to_string(), "web101.1z");
        assert_eq!("web101.1z".parse::<RunId>().unwrap(), id);
        assert_eq!(id.suffix(), "1z");
    }

    #[test]
    fn run_id_rejects_garbage() {
        for raw in [
            "", "web101", "web101.", ".1A", "web101.A", "web101.1", "web101.1AA",
            "web 101.1A", "web101.01!", "web101.0A",
        ] {
            assert!(raw.parse::<RunId>().is_err(), "accepted {raw:?}");
        }
    }

    #[test]
    fn suffix_ordering_ignores_bench_name() {
        let mut names = vec!["Y.1A", "X.1B", "X.1A"];
        names.sort_by(|a, b| RunId::compare_dir_names(a, b));
        assert_eq!(names, vec!["Y.1A", "X.1A", "X.1B"]);
    }

    #[test]
    fn suffix_ordering_upper_before_lower() {
        let mut names = vec!["b.1a", "b.1Z", "b.2A", "b.1B"];
        names.sort_by(|a, b| RunId::compare_dir_names(a, b));
        assert_eq!(names, vec!["b.1B", "b.1Z", "b.1a", "b.2A"]);
    }

    proptest! {
        #[test]
        fn successor_predecessor_inverse(num in 1u32..10_000, rank in 0u8..52) {
            let tok = SeqToken { num, letter: rank_letter(rank) };
            prop_assert_eq!(tok.successor().predecessor(), Some(tok));
            if tok != SeqToken::FIRST {
                prop_assert_eq!(tok.predecessor().unwrap().successor(), tok);
            }
        }

        #[test]
        fn token_text_roundtrip(num in 1u32..10_000, rank in 0u8..52) {
            let tok = SeqToken { num, letter: rank_letter(rank) };
            prop_assert_eq!(tok.to_string().parse::<SeqToken>().unwrap(), tok);
        }

        #[test]
        fn successor_strictly_increases_suffix_key(num in 1u32..10_000, rank in 0u8..52) {
            let tok = SeqToken { num, letter: rank_letter(rank) };
            let id = RunId::new("b", tok);
            let next = RunId::new("b", tok.successor());
            prop_assert!(next.suffix_key() > id.suffix_key());
        }
    }
}
