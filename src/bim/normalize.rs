//! Maps client-supplied payloads to canonical stored form. Pure; the
//! resulting block order becomes the `idx` assignment at insert time.

use thiserror::Error;

use super::{Block, BlockPayload, BlockType};

pub const DEFAULT_TITLE: &str = "BIM Notes";
pub const MAX_TITLE_CHARS: usize = 200;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("unsupported block type '{0}'")]
    UnsupportedBlockType(String),
    #[error("title must be at most {MAX_TITLE_CHARS} characters")]
    TitleTooLong,
}

/// Canonical language for a code block. Unrecognized or empty input
/// falls back to `js`.
fn canonical_language(raw: Option<&str>) -> &'static str {
    let key = raw.map(|s| s.trim().to_lowercase()).unwrap_or_default();
    match key.as_str() {
        "js" | "javascript" => "js",
        "ts" | "typescript" => "ts",
        "py" | "python" => "py",
        "html" => "html",
        "css" => "css",
        _ => "js",
    }
}

pub fn block(payload: &BlockPayload) -> Result<Block, NormalizeError> {
    let block_type = BlockType::from_str(&payload.block_type)
        .ok_or_else(|| NormalizeError::UnsupportedBlockType(payload.block_type.clone()))?;

    let language = match block_type {
        BlockType::Code => Some(canonical_language(payload.language.as_deref()).to_string()),
        _ => None,
    };

    Ok(Block {
        block_type,
        value: payload.value.clone().unwrap_or_default(),
        language,
    })
}

pub fn blocks(payloads: &[BlockPayload]) -> Result<Vec<Block>, NormalizeError> {
    payloads.iter().map(block).collect()
}

/// Trimmed title, defaulting when absent or blank.
pub fn entry_title(raw: Option<&str>) -> Result<String, NormalizeError> {
    let trimmed = raw.unwrap_or("").trim();
    if trimmed.is_empty() {
        return Ok(DEFAULT_TITLE.to_string());
    }
    if trimmed.chars().count() > MAX_TITLE_CHARS {
        return Err(NormalizeError::TitleTooLong);
    }
    Ok(trimmed.to_string())
}

/// Tag set semantics: trimmed, empties dropped, duplicates collapsed to
/// their first occurrence.
pub fn entry_tags(raw: &[String]) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();
    for tag in raw {
        let tag = tag.trim();
        if tag.is_empty() || tags.iter().any(|t| t == tag) {
            continue;
        }
        tags.push(tag.to_string());
    }
    tags
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(block_type: &str, value: Option<&str>, language: Option<&str>) -> BlockPayload {
        BlockPayload {
            block_type: block_type.to_string(),
            value: value.map(String::from),
            language: language.map(String::from),
        }
    }

    #[test]
    fn rejects_unknown_block_type() {
        let err = block(&payload("video", Some("x"), None)).unwrap_err();
        assert_eq!(err, NormalizeError::UnsupportedBlockType("video".to_string()));
    }

    #[test]
    fn accepts_all_five_types() {
        for t in ["text", "image", "code", "h1", "h2"] {
            assert!(block(&payload(t, Some("v"), None)).is_ok(), "type {t}");
        }
    }

    #[test]
    fn code_language_is_canonicalized() {
        let cases = [
            (Some("Python"), "py"),
            (Some("  TYPESCRIPT "), "ts"),
            (Some("javascript"), "js"),
            (Some("html"), "html"),
            (Some("css"), "css"),
            (Some("rust"), "js"), // unrecognized defaults to js
            (Some(""), "js"),
            (None, "js"),
        ];
        for (input, expected) in cases {
            let b = block(&payload("code", Some("x"), input)).unwrap();
            assert_eq!(b.language.as_deref(), Some(expected), "input {input:?}");
        }
    }

    #[test]
    fn non_code_blocks_have_no_language() {
        let b = block(&payload("text", Some("hi"), Some("py"))).unwrap();
        assert_eq!(b.language, None);
    }

    #[test]
    fn value_defaults_to_empty_string() {
        let b = block(&payload("text", None, None)).unwrap();
        assert_eq!(b.value, "");
    }

    #[test]
    fn list_order_is_preserved() {
        let payloads = vec![
            payload("h1", Some("title"), None),
            payload("text", Some("body"), None),
            payload("code", Some("x = 1"), Some("python")),
        ];
        let blocks = blocks(&payloads).unwrap();
        assert_eq!(blocks[0].block_type, BlockType::H1);
        assert_eq!(blocks[1].block_type, BlockType::Text);
        assert_eq!(blocks[2].block_type, BlockType::Code);
        assert_eq!(blocks[2].language.as_deref(), Some("py"));
    }

    #[test]
    fn title_defaults_and_trims() {
        assert_eq!(entry_title(None).unwrap(), DEFAULT_TITLE);
        assert_eq!(entry_title(Some("   ")).unwrap(), DEFAULT_TITLE);
        assert_eq!(entry_title(Some("  Demo ")).unwrap(), "Demo");
    }

    #[test]
    fn title_over_limit_is_rejected() {
        let long = "x".repeat(MAX_TITLE_CHARS + 1);
        assert_eq!(entry_title(Some(&long)).unwrap_err(), NormalizeError::TitleTooLong);
        let exact = "x".repeat(MAX_TITLE_CHARS);
        assert!(entry_title(Some(&exact)).is_ok());
    }

    #[test]
    fn tags_are_deduplicated_in_order() {
        let raw = vec![
            " rust ".to_string(),
            "notes".to_string(),
            "rust".to_string(),
            "".to_string(),
        ];
        assert_eq!(entry_tags(&raw), vec!["rust".to_string(), "notes".to_string()]);
    }
}
