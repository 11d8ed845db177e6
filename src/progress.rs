//! Progress stream parsing for the transfer tool
//!
//! `rsync --info=progress2` rewrites a single status line using `\r`:
//!
//! ```text
//!     1,234,567  45%    1.50MB/s    0:00:12 (xfr#3, to-chk=10/20)
//! ```
//!
//! The stream is split into whitespace-delimited tokens and each token is
//! classified on its own, so unknown tokens only cost a log line.

use std::io;

use bytes::{Buf, BytesMut};
use bytesize::ByteSize;
use thiserror::Error;
use tokio_util::codec::Decoder;

/// Longest token kept before it is flushed as-is.
const MAX_TOKEN_LEN: usize = 4096;

/// One parsed progress field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressField {
    /// Percentage complete, not clamped
    Progress(u64),
    /// Bytes per second
    Speed(u64),
    /// Opaque time-remaining literal
    TimeLeft(String),
    /// Bytes transferred so far
    Downloaded(u64),
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("failed to parse progress token {token:?}: {reason}")]
pub struct ProgressParseError {
    pub token: String,
    pub reason: String,
}

impl ProgressParseError {
    fn new(token: &str, reason: impl ToString) -> Self {
        Self {
            token: token.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Classify and parse a single token.
///
/// Rates use the `bytesize` unit convention: `kB`/`MB`/`GB` are decimal,
/// `KiB`/`MiB`/`GiB` binary, unit letters case-insensitive.
pub fn parse_token(token: &str) -> Result<ProgressField, ProgressParseError> {
    if let Some(pct) = token.strip_suffix('%') {
        return pct
            .parse::<u64>()
            .map(ProgressField::Progress)
            .map_err(|e| ProgressParseError::new(token, e));
    }
    if let Some(rate) = token.strip_suffix("/s") {
        return rate
            .parse::<ByteSize>()
            .map(|size| ProgressField::Speed(size.as_u64()))
            .map_err(|e| ProgressParseError::new(token, e));
    }
    if token.contains(':') {
        return Ok(ProgressField::TimeLeft(token.to_string()));
    }
    token
        .replace(',', "")
        .parse::<u64>()
        .map(ProgressField::Downloaded)
        .map_err(|e| ProgressParseError::new(token, e))
}

/// Splits a byte stream into whitespace-delimited tokens.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProgressTokens;

impl ProgressTokens {
    fn take_token(src: &mut BytesMut, len: usize) -> String {
        let raw = src.split_to(len);
        String::from_utf8_lossy(&raw).into_owned()
    }
}

impl Decoder for ProgressTokens {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, io::Error> {
        let start = src.iter().position(|b| !b.is_ascii_whitespace());
        match start {
            Some(n) => src.advance(n),
            None => {
                src.clear();
                return Ok(None);
            }
        }
        match src.iter().position(|b| b.is_ascii_whitespace()) {
            Some(end) => Ok(Some(Self::take_token(src, end))),
            None if src.len() >= MAX_TOKEN_LEN => Ok(Some(Self::take_token(src, src.len()))),
            None => Ok(None),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<String>, io::Error> {
        if let Some(token) = self.decode(src)? {
            return Ok(Some(token));
        }
        if src.is_empty() {
            Ok(None)
        } else {
            Ok(Some(Self::take_token(src, src.len())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use tokio_util::codec::FramedRead;

    #[test]
    fn percent_token_sets_progress() {
        assert_eq!(parse_token("42%"), Ok(ProgressField::Progress(42)));
        assert_eq!(parse_token("100%"), Ok(ProgressField::Progress(100)));
    }

    #[test]
    fn rate_token_uses_decimal_units() {
        assert_eq!(parse_token("1.50MB/s"), Ok(ProgressField::Speed(1_500_000)));
        assert_eq!(parse_token("512.00kB/s"), Ok(ProgressField::Speed(512_000)));
        assert_eq!(parse_token("0.00kB/s"), Ok(ProgressField::Speed(0)));
    }

    #[test]
    fn rate_token_accepts_binary_units() {
        assert_eq!(parse_token("1.5MiB/s"), Ok(ProgressField::Speed(1_572_864)));
    }

    #[test]
    fn time_token_is_kept_verbatim() {
        assert_eq!(
            parse_token("0:00:12"),
            Ok(ProgressField::TimeLeft("0:00:12".to_string()))
        );
    }

    #[test]
    fn grouped_integer_sets_downloaded() {
        assert_eq!(parse_token("1,234"), Ok(ProgressField::Downloaded(1234)));
        assert_eq!(parse_token("1,234,567"), Ok(ProgressField::Downloaded(1_234_567)));
    }

    #[test]
    fn garbage_is_a_contained_error() {
        let err = parse_token("garbage%%").unwrap_err();
        assert_eq!(err.token, "garbage%%");
        assert!(parse_token("(xfr#3,").is_err());
        assert!(parse_token("fast/s").is_err());
    }

    #[tokio::test]
    async fn tokens_split_on_carriage_returns() {
        let input: &[u8] = b"  1,024  10%  1.00MB/s  0:00:09\r  2,048  20%  2.00MB/s  0:00:05\n";
        let tokens: Vec<String> = FramedRead::new(input, ProgressTokens)
            .map(|t| t.unwrap())
            .collect()
            .await;
        assert_eq!(
            tokens,
            vec!["1,024", "10%", "1.00MB/s", "0:00:09", "2,048", "20%", "2.00MB/s", "0:00:05"]
        );
    }

    #[tokio::test]
    async fn trailing_token_without_whitespace_is_flushed() {
        let input: &[u8] = b"5% 0:01:00";
        let tokens: Vec<String> = FramedRead::new(input, ProgressTokens)
            .map(|t| t.unwrap())
            .collect()
            .await;
        assert_eq!(tokens, vec!["5%", "0:01:00"]);
    }
}
