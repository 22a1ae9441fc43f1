use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Structured query against the serving endpoint: free text plus optional
/// entity-type filters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub text: String,
    #[serde(default)]
    pub coarse_types: Vec<String>,
    #[serde(default)]
    pub fine_types: Vec<String>,
    pub max_hits: u64,
}

impl SearchRequest {
    pub fn text_only(text: impl Into<String>, max_hits: u64) -> Self {
        Self {
            text: text.into(),
            coarse_types: Vec::new(),
            fine_types: Vec::new(),
            max_hits,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    pub num_hits: u64,
    #[serde(default)]
    pub hits: Vec<Value>,
}

/// Entity id carried by a hit. Hit shapes differ across serving releases:
/// the document may be inline or nested under a source key.
pub fn hit_id(hit: &Value) -> Option<&str> {
    for key in ["_source", "document", "json"] {
        if let Some(id) = hit.get(key).and_then(|doc| doc.get("id")).and_then(Value::as_str) {
            return Some(id);
        }
    }
    hit.get("id").and_then(Value::as_str)
}

fn is_valid_type_label(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':' | '/'))
}

fn normalize_type_labels(values: &[String], field_name: &str) -> Result<Vec<String>> {
    let mut normalized = Vec::new();
    for raw in values {
        let value = raw.trim();
        if value.is_empty() {
            continue;
        }
        if !is_valid_type_label(value) {
            return Err(PipelineError::parse(format!(
                "invalid value '{raw}' for {field_name}; allowed characters: \
                 letters, digits, '_', '-', '.', ':', '/'"
            )));
        }
        if !normalized.iter().any(|existing| existing == value) {
            normalized.push(value.to_string());
        }
    }
    Ok(normalized)
}

fn type_filter_clause(field: &str, values: &[String]) -> Option<String> {
    match values {
        [] => None,
        [single] => Some(format!("{field}:{single}")),
        many => {
            let joined = many
                .iter()
                .map(|value| format!("{field}:{value}"))
                .collect::<Vec<_>>()
                .join(" OR ");
            Some(format!("({joined})"))
        }
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect()
}

/// Build the serving query string: tokenized text, AND-combined with
/// OR-grouped type filter clauses.
pub fn build_search_query(request: &SearchRequest) -> Result<String> {
    let terms = tokenize(&request.text);
    if terms.is_empty() {
        return Err(PipelineError::parse(
            "query must contain at least one alphanumeric term",
        ));
    }
    let text_clause = terms.join(" ");

    let coarse = normalize_type_labels(&request.coarse_types, "coarse_type")?;
    let fine = normalize_type_labels(&request.fine_types, "fine_type")?;

    let mut clauses = vec![format!("({text_clause})")];
    if let Some(clause) = type_filter_clause("coarse_type", &coarse) {
        clauses.push(clause);
    }
    if let Some(clause) = type_filter_clause("fine_type", &fine) {
        clauses.push(clause);
    }

    if clauses.len() == 1 {
        return Ok(text_clause);
    }
    Ok(clauses.join(" AND "))
}

/// Seam over the serving endpoint, so readiness predicates and the
/// golden-path verifier run against fakes in tests.
#[async_trait]
pub trait ServingBackend: Send + Sync {
    /// `Ok(true)` healthy, `Ok(false)` reachable but unhealthy, `Err`
    /// unreachable.
    async fn health(&self) -> Result<bool>;

    /// Aggregate document count; `None` when the index does not exist yet.
    async fn doc_count(&self, index_id: &str) -> Result<Option<u64>>;

    async fn search(&self, index_id: &str, request: &SearchRequest) -> Result<SearchResponse>;
}

/// HTTP client for the serving endpoint.
pub struct ServingClient {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Serialize)]
struct SearchPayload<'a> {
    query: &'a str,
    max_hits: u64,
}

impl ServingClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(PipelineError::http)?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn search_url(&self, index_id: &str) -> String {
        format!("{}/api/v1/{}/search", self.base_url, index_id)
    }

    async fn post_search(&self, index_id: &str, query: &str, max_hits: u64) -> Result<reqwest::Response> {
        self.client
            .post(self.search_url(index_id))
            .json(&SearchPayload { query, max_hits })
            .send()
            .await
            .map_err(PipelineError::http)
    }
}

#[async_trait]
impl ServingBackend for ServingClient {
    async fn health(&self) -> Result<bool> {
        let response = self
            .client
            .get(format!("{}/api/v1/indexes", self.base_url))
            .send()
            .await
            .map_err(PipelineError::http)?;
        Ok(response.status().is_success())
    }

    async fn doc_count(&self, index_id: &str) -> Result<Option<u64>> {
        // A match-all search with max_hits=0: num_hits is the aggregate
        // count, and a 404 distinguishes "index not created yet".
        let response = self.post_search(index_id, "*", 0).await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::Http(format!(
                "doc count query returned {status}: {}",
                truncate(&body, 400)
            )));
        }
        let parsed: SearchResponse = response.json().await.map_err(PipelineError::http)?;
        Ok(Some(parsed.num_hits))
    }

    async fn search(&self, index_id: &str, request: &SearchRequest) -> Result<SearchResponse> {
        let query = build_search_query(request)?;
        let response = self.post_search(index_id, &query, request.max_hits).await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::Http(format!(
                "search against '{index_id}' returned {status}: {}",
                truncate(&body, 400)
            )));
        }
        response.json().await.map_err(PipelineError::http)
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_text_only_query() {
        let request = SearchRequest::text_only("Apple Inc.", 20);
        assert_eq!(build_search_query(&request).unwrap(), "apple inc");
    }

    #[test]
    fn test_filtered_query_joins_clauses_with_and() {
        let request = SearchRequest {
            text: "apple".to_string(),
            coarse_types: vec!["ORGANIZATION".to_string()],
            fine_types: vec!["COMPANY".to_string()],
            max_hits: 20,
        };
        assert_eq!(
            build_search_query(&request).unwrap(),
            "(apple) AND coarse_type:ORGANIZATION AND fine_type:COMPANY"
        );
    }

    #[test]
    fn test_multiple_filter_values_are_or_grouped() {
        let request = SearchRequest {
            text: "apple".to_string(),
            coarse_types: vec!["ORGANIZATION".to_string(), "LOCATION".to_string()],
            fine_types: vec![],
            max_hits: 10,
        };
        assert_eq!(
            build_search_query(&request).unwrap(),
            "(apple) AND (coarse_type:ORGANIZATION OR coarse_type:LOCATION)"
        );
    }

    #[test]
    fn test_duplicate_and_blank_filter_values_collapse() {
        let request = SearchRequest {
            text: "apple".to_string(),
            coarse_types: vec![
                "ORGANIZATION".to_string(),
                " ".to_string(),
                "ORGANIZATION".to_string(),
            ],
            fine_types: vec![],
            max_hits: 10,
        };
        assert_eq!(
            build_search_query(&request).unwrap(),
            "(apple) AND coarse_type:ORGANIZATION"
        );
    }

    #[test]
    fn test_empty_query_text_rejected() {
        let request = SearchRequest::text_only("  ...  ", 20);
        assert!(matches!(
            build_search_query(&request),
            Err(PipelineError::Parse(_))
        ));
    }

    #[test]
    fn test_invalid_filter_label_rejected() {
        let request = SearchRequest {
            text: "apple".to_string(),
            coarse_types: vec!["ORG ANIZATION".to_string()],
            fine_types: vec![],
            max_hits: 20,
        };
        assert!(matches!(
            build_search_query(&request),
            Err(PipelineError::Parse(_))
        ));
    }

    #[test]
    fn test_hit_id_handles_inline_and_nested_shapes() {
        assert_eq!(hit_id(&json!({"id": "Q312"})), Some("Q312"));
        assert_eq!(hit_id(&json!({"_source": {"id": "Q312"}})), Some("Q312"));
        assert_eq!(hit_id(&json!({"document": {"id": "Q89"}})), Some("Q89"));
        assert_eq!(hit_id(&json!({"json": {"id": "Q89"}})), Some("Q89"));
        assert_eq!(hit_id(&json!({"score": 1.0})), None);
    }

    #[test]
    fn test_search_response_parses_without_hits_field() {
        let parsed: SearchResponse = serde_json::from_value(json!({"num_hits": 42})).unwrap();
        assert_eq!(parsed.num_hits, 42);
        assert!(parsed.hits.is_empty());
    }

    #[test]
    fn test_tokenize_lowercases_and_splits() {
        assert_eq!(tokenize("Apple, Inc. 2024"), vec!["apple", "inc", "2024"]);
        assert!(tokenize(" .,;- ").is_empty());
    }
}
