//! Bracketed text codec for embedding vectors.
//!
//! Vectors persist as `[v1,v2,...]`, the text form vector databases use for
//! their vector columns, so the stored data stays portable and greppable.

use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum VectorError {
    #[error("vector text must be bracketed, got: {0}")]
    Unbracketed(String),
    #[error("vector text is empty")]
    Empty,
    #[error("bad vector component at index {index}: {text}")]
    BadComponent { index: usize, text: String },
}

/// Serialize a vector to bracketed comma-separated text.
///
/// Components use the shortest decimal form that parses back to the same
/// f32, so encode/parse round-trips bit-exactly.
pub fn encode_vector(values: &[f32]) -> String {
    let mut out = String::with_capacity(values.len() * 12 + 2);
    out.push('[');
    for (i, v) in values.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&v.to_string());
    }
    out.push(']');
    out
}

/// Parse bracketed comma-separated text back into a vector.
pub fn parse_vector(text: &str) -> Result<Vec<f32>, VectorError> {
    let trimmed = text.trim();
    let inner = trimmed
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .ok_or_else(|| VectorError::Unbracketed(clip(trimmed)))?;
    if inner.trim().is_empty() {
        return Err(VectorError::Empty);
    }
    inner
        .split(',')
        .enumerate()
        .map(|(index, part)| {
            let part = part.trim();
            part.parse::<f32>().map_err(|_| VectorError::BadComponent {
                index,
                text: part.to_string(),
            })
        })
        .collect()
}

fn clip(text: &str) -> String {
    const MAX: usize = 32;
    if text.len() <= MAX {
        text.to_string()
    } else {
        let mut end = MAX;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &text[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_is_exact() {
        let values = vec![0.123_456_79f32, -1.0, 0.0, 1e-7, 3.402_823_5e38];
        let text = encode_vector(&values);
        assert_eq!(parse_vector(&text).unwrap(), values);
    }

    #[test]
    fn test_encode_format() {
        assert_eq!(encode_vector(&[1.0, -2.5, 0.0]), "[1,-2.5,0]");
    }

    #[test]
    fn test_parse_tolerates_whitespace() {
        assert_eq!(parse_vector(" [ 1.0 , 2.0 ] ").unwrap(), vec![1.0, 2.0]);
    }

    #[test]
    fn test_parse_rejects_unbracketed() {
        match parse_vector("1.0,2.0") {
            Err(VectorError::Unbracketed(_)) => {}
            other => panic!("expected Unbracketed, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_rejects_empty() {
        assert_eq!(parse_vector("[]"), Err(VectorError::Empty));
        assert_eq!(parse_vector("[  ]"), Err(VectorError::Empty));
    }

    #[test]
    fn test_parse_rejects_bad_component() {
        match parse_vector("[1.0,banana,3.0]") {
            Err(VectorError::BadComponent { index: 1, text }) => assert_eq!(text, "banana"),
            other => panic!("expected BadComponent, got {other:?}"),
        }
    }

    #[test]
    fn test_clip_long_garbage_in_error() {
        let garbage = "x".repeat(100);
        match parse_vector(&garbage) {
            Err(VectorError::Unbracketed(text)) => assert!(text.len() < 40),
            other => panic!("expected Unbracketed, got {other:?}"),
        }
    }
}
