//! Batched GraphQL endpoint helpers.
//!
//! The batch endpoint answers with newline-delimited JSON objects, the last
//! of which is a summary (`successful_results`, `error_results`). Bodies may
//! carry the `for (;;);` anti-hijacking prefix.

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use msgr_core::constants;
use msgr_core::error::{MsgrError, MsgrResult};

use crate::client::GraphqlTransport;

const JSON_PREFIX: &str = "for (;;);";

/// Error code the web tier returns for a dead session.
const ERROR_NOT_LOGGED_IN: i64 = 1357001;

#[derive(Serialize)]
struct SeqIdParams {
    limit: u32,
    before: Option<String>,
    tags: [&'static str; 1],
    #[serde(rename = "includeDeliveryReceipts")]
    include_delivery_receipts: bool,
    #[serde(rename = "includeSeqID")]
    include_seq_id: bool,
}

#[derive(Serialize)]
struct BatchQuery<P> {
    doc_id: &'static str,
    query_params: P,
}

/// Form fields for the inbox cursor query.
pub fn seq_id_form(actor_id: &str) -> MsgrResult<Vec<(String, String)>> {
    let query = BatchQuery {
        doc_id: constants::SEQ_ID_DOC_ID,
        query_params: SeqIdParams {
            limit: 1,
            before: None,
            tags: ["INBOX"],
            include_delivery_receipts: false,
            include_seq_id: true,
        },
    };
    let queries = serde_json::to_string(&serde_json::json!({ "o0": query }))?;
    Ok(vec![
        ("av".to_string(), actor_id.to_string()),
        ("queries".to_string(), queries),
    ])
}

/// Split a batch response body into its JSON objects.
pub fn parse_batch(body: &str) -> MsgrResult<Vec<Value>> {
    let body = body.trim_start().trim_start_matches(JSON_PREFIX);
    let mut objects = Vec::new();
    for line in body.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let value: Value = serde_json::from_str(line)
            .map_err(|e| MsgrError::Protocol(format!("unparsable batch line: {e}")))?;
        objects.push(value);
    }
    Ok(objects)
}

/// Fail with `AuthFailed` when the body says the session is gone.
///
/// Bodies that are not JSON pass through; the caller's own parser decides.
pub fn check_login(body: &str) -> MsgrResult<()> {
    let trimmed = body.trim_start().trim_start_matches(JSON_PREFIX);
    for line in trimmed.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        if value.get("error").and_then(Value::as_i64) == Some(ERROR_NOT_LOGGED_IN) {
            return Err(MsgrError::AuthFailed("Not logged in.".into()));
        }
        if let Some(redirect) = value.get("redirect").and_then(Value::as_str) {
            if redirect.contains("/login") || redirect.contains("/checkpoint") {
                return Err(MsgrError::AuthFailed(format!(
                    "Not logged in (redirected to {redirect})"
                )));
            }
        }
        let summary = value.get("errorSummary").and_then(Value::as_str).unwrap_or_default();
        let description = value
            .get("errorDescription")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if description.to_lowercase().contains("blocked the login")
            || summary.to_lowercase().contains("blocked the login")
        {
            return Err(MsgrError::AuthFailed(format!("{summary}: {description}")));
        }
    }
    Ok(())
}

/// Pull the inbox cursor out of a parsed batch response.
pub fn extract_seq_id(objects: &[Value]) -> MsgrResult<i64> {
    let (Some(first), Some(summary)) = (objects.first(), objects.last()) else {
        return Err(MsgrError::AuthFailed("Not logged in: empty batch response".into()));
    };

    if summary.get("error_results").and_then(Value::as_i64).unwrap_or(0) > 0 {
        let errors = first
            .pointer("/o0/errors")
            .map(Value::to_string)
            .unwrap_or_else(|| "unknown error".to_string());
        return Err(MsgrError::Protocol(format!("seq id query failed: {errors}")));
    }

    if summary.get("successful_results").and_then(Value::as_i64) == Some(0) {
        return Err(MsgrError::Protocol("seq id query had no successful_results".into()));
    }

    let raw = first
        .pointer("/o0/data/viewer/message_threads/sync_sequence_id")
        .ok_or_else(|| MsgrError::Protocol("no sync_sequence_id found".into()))?;

    let seq = match raw {
        Value::String(s) => s.parse::<i64>().ok(),
        Value::Number(n) => n.as_i64(),
        _ => None,
    };
    seq.ok_or_else(|| MsgrError::Protocol(format!("sync_sequence_id is not numeric: {raw}")))
}

/// Issue the batched cursor query and return the viewer's current sequence id.
pub async fn fetch_sequence_id(poster: &dyn GraphqlTransport, actor_id: &str) -> MsgrResult<i64> {
    let form = seq_id_form(actor_id)?;
    let body = poster.post_form(constants::GRAPHQL_BATCH_PATH, &form).await?;
    let objects = parse_batch(&body)?;
    let seq = extract_seq_id(&objects)?;
    debug!("fetched sequence id {seq}");
    Ok(seq)
}
