//! Generic CSS-selector listing scraper.
//!
//! Fetches one page and turns every element matching `item_selector` into a
//! record, reading title, link, description and close date from child
//! selectors. Relative links resolve against the page URL.

use async_trait::async_trait;
use oppscout_shared::{RawOpportunity, Result, ScoutError};
use reqwest::Client;
use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;
use tracing::{debug, instrument};
use url::Url;

use super::{FetchCapability, FetchPayload, SourceParams};

#[derive(Debug, Clone, Deserialize)]
struct HtmlListingParams {
    url: String,
    #[serde(flatten)]
    selectors: ListingSelectors,
    #[serde(default)]
    max_items: Option<usize>,
}

/// Selectors describing one listing page layout.
#[derive(Debug, Clone, Deserialize)]
pub struct ListingSelectors {
    pub item_selector: String,
    #[serde(default = "default_title_selector")]
    pub title_selector: String,
    #[serde(default = "default_link_selector")]
    pub link_selector: String,
    #[serde(default)]
    pub description_selector: Option<String>,
    #[serde(default)]
    pub close_date_selector: Option<String>,
}

fn default_title_selector() -> String {
    "a".into()
}
fn default_link_selector() -> String {
    "a[href]".into()
}

struct Compiled {
    item: Selector,
    title: Selector,
    link: Selector,
    description: Option<Selector>,
    close_date: Option<Selector>,
}

fn compile(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| ScoutError::validation(format!("bad selector '{css}': {e}")))
}

impl ListingSelectors {
    fn compile(&self) -> Result<Compiled> {
        Ok(Compiled {
            item: compile(&self.item_selector)?,
            title: compile(&self.title_selector)?,
            link: compile(&self.link_selector)?,
            description: self.description_selector.as_deref().map(compile).transpose()?,
            close_date: self.close_date_selector.as_deref().map(compile).transpose()?,
        })
    }
}

fn element_text(el: ElementRef<'_>) -> String {
    el.text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

fn first_text(item: ElementRef<'_>, sel: &Selector) -> Option<String> {
    item.select(sel)
        .next()
        .map(element_text)
        .filter(|t| !t.is_empty())
}

/// Extract listing records from an HTML document.
///
/// Items without a title are skipped.
pub fn parse_listing(
    html: &str,
    page_url: &Url,
    selectors: &ListingSelectors,
    max_items: Option<usize>,
) -> Result<Vec<RawOpportunity>> {
    let compiled = selectors.compile()?;
    let doc = Html::parse_document(html);
    let limit = max_items.unwrap_or(usize::MAX);

    let mut out = Vec::new();
    for item in doc.select(&compiled.item) {
        if out.len() >= limit {
            break;
        }

        let Some(title) = first_text(item, &compiled.title) else {
            debug!("listing item without title, skipping");
            continue;
        };

        let href = item
            .select(&compiled.link)
            .next()
            .and_then(|a| a.value().attr("href"))
            .or_else(|| item.value().attr("href"));
        let url = href
            .filter(|h| !h.starts_with('#') && !h.starts_with("javascript:"))
            .and_then(|h| page_url.join(h).ok())
            .map(|mut u| {
                u.set_fragment(None);
                u.to_string()
            });

        out.push(RawOpportunity {
            title: Some(title),
            url,
            description: compiled
                .description
                .as_ref()
                .and_then(|sel| first_text(item, sel)),
            close_date: compiled
                .close_date
                .as_ref()
                .and_then(|sel| first_text(item, sel)),
            ..Default::default()
        });
    }

    Ok(out)
}

/// Fetch capability wrapping [`parse_listing`].
pub struct HtmlListingCapability {
    client: Client,
}

impl HtmlListingCapability {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl FetchCapability for HtmlListingCapability {
    fn id(&self) -> &'static str {
        "html_listing"
    }

    fn accepted_params(&self) -> &'static [&'static str] {
        &[
            "url",
            "item_selector",
            "title_selector",
            "link_selector",
            "description_selector",
            "close_date_selector",
            "max_items",
        ]
    }

    fn validate(&self, params: &SourceParams) -> Result<()> {
        let p: HtmlListingParams = params.parse()?;
        Url::parse(&p.url).map_err(|e| ScoutError::validation(format!("bad url '{}': {e}", p.url)))?;
        p.selectors.compile().map(|_| ())
    }

    #[instrument(skip_all, fields(capability = "html_listing"))]
    async fn fetch(&self, params: &SourceParams) -> Result<FetchPayload> {
        let p: HtmlListingParams = params.parse()?;
        let page_url =
            Url::parse(&p.url).map_err(|e| ScoutError::validation(format!("bad url: {e}")))?;

        let response = self
            .client
            .get(page_url.as_str())
            .send()
            .await
            .map_err(|e| ScoutError::Network(format!("{page_url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ScoutError::Network(format!("{page_url}: HTTP {status}")));
        }

        let body = response
            .text()
            .await
            .map_err(|e| ScoutError::Network(format!("{page_url}: body read failed: {e}")))?;

        let records = parse_listing(&body, &page_url, &p.selectors, p.max_items)?;
        debug!(url = %page_url, count = records.len(), "parsed listing");
        Ok(FetchPayload::Records(records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn load_fixture(name: &str) -> String {
        let path = format!("../../../fixtures/html/{name}");
        std::fs::read_to_string(&path).unwrap_or_else(|_| panic!("missing fixture: {path}"))
    }

    fn selectors() -> ListingSelectors {
        ListingSelectors {
            item_selector: "div.opportunity".into(),
            title_selector: "h3".into(),
            link_selector: "a[href]".into(),
            description_selector: Some("p.summary".into()),
            close_date_selector: Some("span.close-date".into()),
        }
    }

    #[test]
    fn parses_fixture_listing() {
        let html = load_fixture("listing.html");
        let base = Url::parse("https://funding.example.gov/opportunities/").expect("url");
        let items = parse_listing(&html, &base, &selectors(), None).expect("parse");

        // The fourth card has no title and is skipped.
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].title.as_deref(), Some("Autonomous Underwater Sensing"));
        assert_eq!(
            items[0].url.as_deref(),
            Some("https://funding.example.gov/opportunities/topic-101")
        );
        assert_eq!(items[0].close_date.as_deref(), Some("2025-11-30"));
        assert_eq!(
            items[1].url.as_deref(),
            Some("https://other.example.org/baa/2025-07")
        );
        assert!(items[2].description.is_none());
    }

    #[test]
    fn max_items_limits_output() {
        let html = load_fixture("listing.html");
        let base = Url::parse("https://funding.example.gov/").expect("url");
        let items = parse_listing(&html, &base, &selectors(), Some(1)).expect("parse");
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn invalid_selector_is_rejected() {
        let cap = HtmlListingCapability::new(Client::new());
        let params = SourceParams::new(
            json!({"url": "https://x.example", "item_selector": "div[["})
                .as_object()
                .cloned()
                .unwrap_or_default(),
        );
        assert!(cap.validate(&params).is_err());
    }

    #[tokio::test]
    async fn fetches_listing_from_server() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/open"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<html><body><ul>
                    <li class="opp"><a href="/opp/1">First call</a></li>
                    <li class="opp"><a href="/opp/2">Second call</a></li>
                </ul></body></html>"#,
            ))
            .mount(&server)
            .await;

        let cap = HtmlListingCapability::new(Client::new());
        let params = SourceParams::new(
            json!({"url": format!("{}/open", server.uri()), "item_selector": "li.opp"})
                .as_object()
                .cloned()
                .unwrap_or_default(),
        );
        let payload = cap.fetch(&params).await.expect("fetch");
        let FetchPayload::Records(items) = payload else {
            panic!("expected records");
        };
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].title.as_deref(), Some("Second call"));
        assert_eq!(
            items[1].url.as_deref(),
            Some(format!("{}/opp/2", server.uri()).as_str())
        );
    }
}
