//! Decoding for the `application/x-www-form-urlencoded` bodies the
//! configuration form posts.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FormDecodeError {
    #[error("truncated percent escape")]
    TruncatedEscape,
    #[error("invalid percent escape `%{0}`")]
    InvalidEscape(String),
}

/// Parses a form body into `(key, value)` pairs in document order.
/// Duplicate keys are kept; a key without `=` decodes to an empty value.
pub fn parse_form(body: &str) -> Result<Vec<(String, String)>, FormDecodeError> {
    let mut fields = Vec::new();
    for pair in body.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (raw_key, raw_value) = match pair.split_once('=') {
            Some((key, value)) => (key, value),
            None => (pair, ""),
        };
        fields.push((decode_component(raw_key)?, decode_component(raw_value)?));
    }
    Ok(fields)
}

fn decode_component(raw: &str) -> Result<String, FormDecodeError> {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut index = 0;

    while index < bytes.len() {
        match bytes[index] {
            b'+' => {
                out.push(b' ');
                index += 1;
            }
            b'%' => {
                let escape = bytes
                    .get(index + 1..index + 3)
                    .ok_or(FormDecodeError::TruncatedEscape)?;
                let hex = core::str::from_utf8(escape)
                    .map_err(|_| FormDecodeError::InvalidEscape(raw[index + 1..].to_string()))?;
                let byte = u8::from_str_radix(hex, 16)
                    .map_err(|_| FormDecodeError::InvalidEscape(hex.to_string()))?;
                out.push(byte);
                index += 3;
            }
            other => {
                out.push(other);
                index += 1;
            }
        }
    }

    Ok(String::from_utf8_lossy(&out).into_owned())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn decodes_plus_and_percent_escapes() {
        let fields = parse_form("ssid=my+net&pass=p%40ss%2Fword").unwrap();
        assert_eq!(
            fields,
            vec![
                ("ssid".to_string(), "my net".to_string()),
                ("pass".to_string(), "p@ss/word".to_string()),
            ]
        );
    }

    #[test]
    fn keeps_duplicates_and_valueless_keys() {
        let fields = parse_form("mt=a&mt=b&mu").unwrap();
        assert_eq!(
            fields,
            vec![
                ("mt".to_string(), "a".to_string()),
                ("mt".to_string(), "b".to_string()),
                ("mu".to_string(), String::new()),
            ]
        );
    }

    #[test]
    fn empty_body_yields_no_fields() {
        assert_eq!(parse_form("").unwrap(), Vec::new());
    }

    #[test]
    fn rejects_broken_escapes() {
        assert_eq!(parse_form("a=%4"), Err(FormDecodeError::TruncatedEscape));
        assert_eq!(
            parse_form("a=%zz"),
            Err(FormDecodeError::InvalidEscape("zz".to_string()))
        );
    }
}
