//! HTTP handlers for the BIM document store.

use axum::{
    Json,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};

use super::{Block, BimStore, CreateEntry, Entry, EntryPatch, UpdateEntry, normalize};
use crate::error::ApiError;
use crate::handler::AppState;

pub const METHOD_OVERRIDE_HEADER: &str = "x-http-method-override";

async fn store(state: &AppState) -> Result<BimStore, ApiError> {
    let pool = state.db.acquire_ready(state.acquire_timeout).await?;
    Ok(BimStore::new(&pool)?)
}

fn validation(err: normalize::NormalizeError) -> ApiError {
    ApiError::validation(err.to_string())
}

fn validate_create(payload: CreateEntry) -> Result<(String, Vec<String>, Vec<Block>), ApiError> {
    if payload.blocks.is_empty() {
        return Err(ApiError::validation("At least one block required"));
    }
    let title = normalize::entry_title(payload.title.as_deref()).map_err(validation)?;
    let tags = normalize::entry_tags(&payload.tags);
    let blocks = normalize::blocks(&payload.blocks).map_err(validation)?;
    Ok((title, tags, blocks))
}

fn validate_replace(payload: UpdateEntry) -> Result<(String, Vec<String>, Vec<Block>), ApiError> {
    let (Some(title), Some(blocks)) = (payload.title, payload.blocks) else {
        return Err(ApiError::validation("PUT requires 'title' and 'blocks'"));
    };
    if blocks.is_empty() {
        return Err(ApiError::validation("At least one block required"));
    }
    let title = normalize::entry_title(Some(&title)).map_err(validation)?;
    let tags = normalize::entry_tags(&payload.tags.unwrap_or_default());
    let blocks = normalize::blocks(&blocks).map_err(validation)?;
    Ok((title, tags, blocks))
}

fn validate_patch(payload: UpdateEntry) -> Result<EntryPatch, ApiError> {
    let blocks = match payload.blocks {
        Some(blocks) if blocks.is_empty() => {
            return Err(ApiError::validation("If 'blocks' is provided, it cannot be empty"));
        }
        Some(blocks) => Some(normalize::blocks(&blocks).map_err(validation)?),
        None => None,
    };
    let title = match payload.title.as_deref() {
        Some(title) => Some(normalize::entry_title(Some(title)).map_err(validation)?),
        None => None,
    };
    let tags = payload.tags.as_deref().map(normalize::entry_tags);

    Ok(EntryPatch { title, tags, blocks })
}

pub async fn list_entries(State(state): State<AppState>) -> Result<Response, ApiError> {
    let store = store(&state).await?;
    let entries = store.list_entries().await?;
    Ok((StatusCode::OK, Json(entries)).into_response())
}

pub async fn get_entry(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Response, ApiError> {
    let store = store(&state).await?;
    let entry = store.get_entry(id).await?.ok_or(ApiError::NotFound)?;
    Ok((StatusCode::OK, Json(entry)).into_response())
}

pub async fn create_entry(
    State(state): State<AppState>,
    Json(payload): Json<CreateEntry>,
) -> Result<Response, ApiError> {
    let (title, tags, blocks) = validate_create(payload)?;
    let store = store(&state).await?;
    let entry = store.create_entry(&title, &tags, &blocks).await?;
    tracing::info!(entry_id = entry.id, blocks = entry.blocks.len(), "created entry");
    Ok((StatusCode::CREATED, Json(entry)).into_response())
}

async fn do_replace(state: &AppState, id: i64, payload: UpdateEntry) -> Result<Entry, ApiError> {
    let (title, tags, blocks) = validate_replace(payload)?;
    let store = store(state).await?;
    store
        .replace_entry(id, &title, &tags, &blocks)
        .await?
        .ok_or(ApiError::NotFound)
}

async fn do_patch(state: &AppState, id: i64, payload: UpdateEntry) -> Result<Entry, ApiError> {
    let store = store(state).await?;
    // Existence is decided before the body is validated, and the entry
    // read for that check feeds the patch directly.
    let current = store.get_entry(id).await?.ok_or(ApiError::NotFound)?;
    let patch = validate_patch(payload)?;
    Ok(store.apply_patch(current, patch).await?)
}

async fn do_delete(state: &AppState, id: i64) -> Result<(), ApiError> {
    let store = store(state).await?;
    store.delete_entry(id).await?;
    Ok(())
}

pub async fn update_entry(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(payload): Json<UpdateEntry>,
) -> Result<Response, ApiError> {
    let entry = do_replace(&state, id, payload).await?;
    Ok((StatusCode::OK, Json(entry)).into_response())
}

pub async fn patch_entry(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(payload): Json<UpdateEntry>,
) -> Result<Response, ApiError> {
    let entry = do_patch(&state, id, payload).await?;
    Ok((StatusCode::OK, Json(entry)).into_response())
}

pub async fn delete_entry(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Response, ApiError> {
    do_delete(&state, id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// POST dispatch for clients that cannot issue PUT/PATCH/DELETE. The
/// intended verb arrives in the override header; anything else is 405.
pub async fn method_override(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    body: Option<Json<UpdateEntry>>,
) -> Result<Response, ApiError> {
    let verb = headers
        .get(METHOD_OVERRIDE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_uppercase();

    let payload = body.map(|Json(p)| p).unwrap_or_default();

    match verb.as_str() {
        "PUT" => {
            let entry = do_replace(&state, id, payload).await?;
            Ok((StatusCode::OK, Json(entry)).into_response())
        }
        "PATCH" => {
            let entry = do_patch(&state, id, payload).await?;
            Ok((StatusCode::OK, Json(entry)).into_response())
        }
        "DELETE" => {
            do_delete(&state, id).await?;
            Ok(StatusCode::NO_CONTENT.into_response())
        }
        _ => Err(ApiError::MethodNotAllowed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bim::{BlockPayload, BlockType};

    fn text_payload(value: &str) -> BlockPayload {
        BlockPayload {
            block_type: "text".to_string(),
            value: Some(value.to_string()),
            language: None,
        }
    }

    #[test]
    fn create_requires_at_least_one_block() {
        let err = validate_create(CreateEntry {
            title: Some("x".to_string()),
            blocks: vec![],
            tags: vec![],
        })
        .unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
    }

    #[test]
    fn create_applies_defaults() {
        let (title, tags, blocks) = validate_create(CreateEntry {
            title: None,
            blocks: vec![text_payload("hi")],
            tags: vec![],
        })
        .unwrap();
        assert_eq!(title, normalize::DEFAULT_TITLE);
        assert!(tags.is_empty());
        assert_eq!(blocks[0].block_type, BlockType::Text);
        assert_eq!(blocks[0].value, "hi");
        assert_eq!(blocks[0].language, None);
    }

    #[test]
    fn replace_requires_title_and_blocks() {
        let err = validate_replace(UpdateEntry {
            title: None,
            blocks: Some(vec![text_payload("x")]),
            tags: None,
        })
        .unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));

        let err = validate_replace(UpdateEntry {
            title: Some("x".to_string()),
            blocks: Some(vec![]),
            tags: None,
        })
        .unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
    }

    #[test]
    fn patch_rejects_present_but_empty_blocks() {
        let err = validate_patch(UpdateEntry {
            title: None,
            blocks: Some(vec![]),
            tags: None,
        })
        .unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
    }

    #[test]
    fn patch_without_blocks_keeps_them() {
        let patch = validate_patch(UpdateEntry {
            title: Some("new".to_string()),
            blocks: None,
            tags: None,
        })
        .unwrap();
        assert_eq!(patch.title.as_deref(), Some("new"));
        assert!(patch.blocks.is_none());
        assert!(patch.tags.is_none());
    }

    #[test]
    fn bad_block_type_fails_validation() {
        let err = validate_create(CreateEntry {
            title: None,
            blocks: vec![BlockPayload {
                block_type: "gif".to_string(),
                value: None,
                language: None,
            }],
            tags: vec![],
        })
        .unwrap_err();
        match err {
            ApiError::Validation(msg) => assert!(msg.contains("gif")),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
