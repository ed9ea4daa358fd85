//! Record source contract + the OData export adapter.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use rpt_storage::{HttpClientConfig, HttpFetcher};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::info;
use uuid::Uuid;

pub use rpt_storage::FetchError;

pub const CRATE_NAME: &str = "rpt-adapters";

/// Headers the report export requires on every request.
pub const ODATA_HEADERS: [(&str, &str); 3] = [
    ("Accept", "application/json;odata=verbose"),
    ("OData-MaxVersion", "4.0"),
    ("OData-Version", "4.0"),
];

pub const DEFAULT_MAX_PAGES: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchContext {
    pub run_id: Uuid,
}

#[async_trait]
pub trait RecordSource: Send + Sync {
    fn source_id(&self) -> &str;

    /// Entity type names exposed by the source catalog, in catalog order.
    async fn list_entity_types(&self, ctx: &FetchContext) -> Result<Vec<String>, FetchError>;

    /// Every record of one entity type, in page order. Never a partial set.
    async fn fetch_records(
        &self,
        ctx: &FetchContext,
        entity_type: &str,
    ) -> Result<Vec<JsonValue>, FetchError>;
}

#[derive(Debug, Deserialize)]
struct ODataPage {
    value: Option<Vec<JsonValue>>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    name: String,
}

pub fn odata_http_config(timeout: Duration, user_agent: Option<String>) -> HttpClientConfig {
    HttpClientConfig {
        timeout,
        user_agent,
        default_headers: ODATA_HEADERS
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    }
}

#[derive(Debug, Clone)]
pub struct ODataSource {
    http: HttpFetcher,
    base_url: Url,
    max_pages: usize,
}

impl ODataSource {
    pub fn new(http: HttpFetcher, base_url: &str, max_pages: usize) -> Result<Self, FetchError> {
        let base_url = Url::parse(base_url).map_err(|err| FetchError::InvalidUrl {
            url: base_url.to_string(),
            reason: err.to_string(),
        })?;
        if base_url.cannot_be_a_base() {
            return Err(FetchError::InvalidUrl {
                url: base_url.to_string(),
                reason: "not a hierarchical url".into(),
            });
        }
        Ok(Self {
            http,
            base_url,
            max_pages: max_pages.max(1),
        })
    }

    pub fn catalog_url(&self) -> Url {
        let mut url = self.base_url.clone();
        url.set_query(Some("$format=json"));
        url
    }

    pub fn entity_url(&self, entity_type: &str) -> Result<Url, FetchError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| FetchError::InvalidUrl {
                url: self.base_url.to_string(),
                reason: "not a hierarchical url".into(),
            })?
            .pop_if_empty()
            .push(entity_type);
        url.set_query(Some("$format=json"));
        Ok(url)
    }

    async fn collect_pages(
        &self,
        ctx: &FetchContext,
        label: &str,
        first: Url,
    ) -> Result<Vec<JsonValue>, FetchError> {
        let mut url = first.clone();
        let mut records = Vec::new();
        let mut pages = 0usize;

        loop {
            if pages >= self.max_pages {
                return Err(FetchError::TooManyPages {
                    pages,
                    url: first.to_string(),
                });
            }
            let page: ODataPage = self.http.fetch_json(ctx.run_id, label, url.as_str()).await?;
            pages += 1;

            let value = page.value.ok_or_else(|| FetchError::Malformed {
                url: url.to_string(),
                reason: "missing `value` array".into(),
            })?;
            records.extend(value);

            let next = page.next_link.filter(|link| !link.trim().is_empty());
            info!(
                entity_type = label,
                pages,
                records = records.len(),
                has_more = next.is_some(),
                "page received"
            );

            match next {
                None => break,
                Some(link) => {
                    url = url.join(&link).map_err(|err| FetchError::InvalidUrl {
                        url: link.clone(),
                        reason: err.to_string(),
                    })?;
                }
            }
        }

        Ok(records)
    }
}

#[async_trait]
impl RecordSource for ODataSource {
    fn source_id(&self) -> &str {
        self.base_url.as_str()
    }

    async fn list_entity_types(&self, ctx: &FetchContext) -> Result<Vec<String>, FetchError> {
        let url = self.catalog_url();
        let entries = self.collect_pages(ctx, "$catalog", url.clone()).await?;

        let mut names: Vec<String> = Vec::with_capacity(entries.len());
        for entry in entries {
            let entry: CatalogEntry =
                serde_json::from_value(entry).map_err(|err| FetchError::Malformed {
                    url: url.to_string(),
                    reason: format!("catalog entry: {err}"),
                })?;
            if !names.contains(&entry.name) {
                names.push(entry.name);
            }
        }
        info!(entity_types = ?names, "catalog discovered");
        Ok(names)
    }

    async fn fetch_records(
        &self,
        ctx: &FetchContext,
        entity_type: &str,
    ) -> Result<Vec<JsonValue>, FetchError> {
        let url = self.entity_url(entity_type)?;
        let records = self.collect_pages(ctx, entity_type, url).await?;
        info!(entity_type, records = records.len(), "all pages received");
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn source_for(server: &MockServer, max_pages: usize) -> ODataSource {
        let http = HttpFetcher::new(odata_http_config(Duration::from_secs(5), None)).unwrap();
        ODataSource::new(http, &format!("{}/export/abc", server.uri()), max_pages).unwrap()
    }

    fn ctx() -> FetchContext {
        FetchContext { run_id: Uuid::new_v4() }
    }

    fn page(start: usize, count: usize, next: Option<String>) -> JsonValue {
        let value = (start..start + count)
            .map(|i| json!({ "Clave": format!("PRJ-{i}") }))
            .collect::<Vec<_>>();
        match next {
            Some(link) => json!({ "value": value, "@odata.nextLink": link }),
            None => json!({ "value": value }),
        }
    }

    #[tokio::test]
    async fn follows_next_links_until_exhausted() {
        let server = MockServer::start().await;
        let base = format!("{}/export/abc", server.uri());
        Mock::given(method("GET"))
            .and(path("/export/abc/Issues"))
            .and(query_param("$format", "json"))
            .and(header("OData-Version", "4.0"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(page(0, 10, Some(format!("{base}/Issues/p2")))),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/export/abc/Issues/p2"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(page(10, 10, Some(format!("{base}/Issues/p3")))),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/export/abc/Issues/p3"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page(20, 5, None)))
            .expect(1)
            .mount(&server)
            .await;

        let records = source_for(&server, 100)
            .fetch_records(&ctx(), "Issues")
            .await
            .unwrap();

        assert_eq!(records.len(), 25);
        let keys = records
            .iter()
            .map(|r| r["Clave"].as_str().unwrap().to_string())
            .collect::<Vec<_>>();
        let expected = (0..25).map(|i| format!("PRJ-{i}")).collect::<Vec<_>>();
        assert_eq!(keys, expected);
    }

    #[tokio::test]
    async fn relative_next_links_resolve_against_current_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/export/abc/Sprints"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(page(0, 2, Some("Sprints/more".into()))),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/export/abc/Sprints/more"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page(2, 1, None)))
            .mount(&server)
            .await;

        let records = source_for(&server, 100)
            .fetch_records(&ctx(), "Sprints")
            .await
            .unwrap();
        assert_eq!(records.len(), 3);
    }

    #[tokio::test]
    async fn failing_page_discards_partial_result() {
        let server = MockServer::start().await;
        let base = format!("{}/export/abc", server.uri());
        Mock::given(method("GET"))
            .and(path("/export/abc/Worklogs"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(page(0, 10, Some(format!("{base}/Worklogs/p2")))),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/export/abc/Worklogs/p2"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let err = source_for(&server, 100)
            .fetch_records(&ctx(), "Worklogs")
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus { status: 502, .. }));
    }

    #[tokio::test]
    async fn page_without_value_array_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/export/abc/History"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "error": "nope" })))
            .mount(&server)
            .await;

        let err = source_for(&server, 100)
            .fetch_records(&ctx(), "History")
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Malformed { .. }));
    }

    #[tokio::test]
    async fn self_referencing_cursor_hits_page_cap() {
        let server = MockServer::start().await;
        let base = format!("{}/export/abc", server.uri());
        Mock::given(method("GET"))
            .and(path("/export/abc/Etiquetas"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(page(0, 1, Some(format!("{base}/Etiquetas?$format=json")))),
            )
            .mount(&server)
            .await;

        let err = source_for(&server, 3)
            .fetch_records(&ctx(), "Etiquetas")
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::TooManyPages { pages: 3, .. }));
    }

    #[tokio::test]
    async fn catalog_lists_names_in_order_without_duplicates() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/export/abc"))
            .and(query_param("$format", "json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [
                    { "name": "Issues", "kind": "EntitySet" },
                    { "name": "Sprints", "kind": "EntitySet" },
                    { "name": "Issues", "kind": "EntitySet" }
                ]
            })))
            .mount(&server)
            .await;

        let names = source_for(&server, 100).list_entity_types(&ctx()).await.unwrap();
        assert_eq!(names, vec!["Issues".to_string(), "Sprints".to_string()]);
    }

    #[test]
    fn entity_names_are_path_encoded() {
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let source = ODataSource::new(http, "https://reports.example.com/export/abc/", 10).unwrap();
        assert_eq!(
            source.entity_url("Linked Issues").unwrap().as_str(),
            "https://reports.example.com/export/abc/Linked%20Issues?$format=json"
        );
        assert_eq!(
            source.catalog_url().as_str(),
            "https://reports.example.com/export/abc/?$format=json"
        );
    }
}
