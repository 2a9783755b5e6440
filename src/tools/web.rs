//! Web retrieval tools: crawling, scraping, link discovery and the UNESCO API.

use std::collections::HashSet;
use std::sync::OnceLock;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use regex::Regex;
use serde_json::{json, Map, Value};
use url::Url;

use super::pdf::{pdf_to_text, Pages};
use super::{fetch_bytes, truncate_output, Tool};

/// Subpages fetched by one crawl.
const MAX_SUBPAGES: usize = 50;
/// Linked documents inspected by one relevance search.
const MAX_LINKS_CHECKED: usize = 30;
/// Texts kept per element type by the scraper.
const MAX_TEXTS_PER_ELEMENT: usize = 7;
const CONCURRENT_FETCHES: usize = 4;
/// Elements whose text counts as page content.
const CONTENT_ELEMENTS: [&str; 8] = ["p", "h1", "h2", "h3", "h4", "h5", "h6", "li"];

fn href_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?is)<a\s[^>]*?href\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s>]+))"#)
            .expect("valid href regex")
    })
}

fn title_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title\s*>").expect("valid title regex"))
}

fn attribute_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"([a-zA-Z_:][-a-zA-Z0-9_:.]*)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s>]+))"#)
            .expect("valid attribute regex")
    })
}

/// `<script>` and `<style>` elements, any case.
fn non_content_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?is)<script\b.*?</script\s*>|<style\b.*?</style\s*>")
            .expect("valid script/style regex")
    })
}

fn first_group(caps: &regex::Captures<'_>) -> String {
    caps.iter()
        .skip(1)
        .flatten()
        .next()
        .map(|m| m.as_str().to_string())
        .unwrap_or_default()
}

/// Absolute `http(s)` targets of every anchor, in document order, deduplicated.
fn extract_links(html: &str, base: &Url) -> Vec<Url> {
    let mut seen = HashSet::new();
    href_regex()
        .captures_iter(html)
        .filter_map(|caps| base.join(html_decode(first_group(&caps).trim()).as_str()).ok())
        .filter(|url| matches!(url.scheme(), "http" | "https"))
        .filter(|url| seen.insert(url.to_string()))
        .collect()
}

fn extract_title(html: &str) -> Option<String> {
    title_regex()
        .captures(html)
        .map(|caps| extract_text_from_html(&caps[1]))
        .filter(|title| !title.is_empty())
}

fn parse_attributes(raw: &str) -> Vec<(String, String)> {
    attribute_regex()
        .captures_iter(raw)
        .map(|caps| {
            let name = caps[1].to_ascii_lowercase();
            let value = caps
                .iter()
                .skip(2)
                .flatten()
                .next()
                .map(|m| html_decode(m.as_str()))
                .unwrap_or_default();
            (name, value)
        })
        .collect()
}

/// An element matches when every filter attribute is present with that value.
/// `class` matches any one of the element's classes.
fn attributes_match(element: &[(String, String)], filters: &Map<String, Value>) -> bool {
    filters.iter().all(|(name, wanted)| {
        let name = name.trim_end_matches('_').to_ascii_lowercase();
        let wanted = match wanted {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        element.iter().any(|(attr, value)| {
            attr == &name
                && if name == "class" {
                    value.split_whitespace().any(|class| class == wanted)
                } else {
                    value == &wanted
                }
        })
    })
}

fn is_tag_name(tag: &str) -> bool {
    let mut chars = tag.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric())
}

/// Text of every `<tag>` element matching the attribute filters.
///
/// An element ends at its closing tag or, when left unclosed, at the next
/// opening of the same tag.
fn element_texts(html: &str, tag: &str, filters: &Map<String, Value>) -> anyhow::Result<Vec<String>> {
    if !is_tag_name(tag) {
        return Err(anyhow::anyhow!("Invalid element name '{}'", tag));
    }
    let open = Regex::new(&format!(r"(?is)<{tag}(\s[^>]*)?>"))?;
    let boundary = Regex::new(&format!(r"(?is)</{tag}\s*>|<{tag}(?:\s[^>]*)?>"))?;

    Ok(open
        .captures_iter(html)
        .filter(|caps| {
            let attrs = caps.get(1).map_or(Vec::new(), |m| parse_attributes(m.as_str()));
            attributes_match(&attrs, filters)
        })
        .filter_map(|caps| {
            let start = caps.get(0)?.end();
            let end = boundary
                .find(&html[start..])
                .map_or(html.len(), |m| start + m.start());
            Some(extract_text_from_html(&html[start..end]))
        })
        .collect())
}

/// Text of the headings, paragraphs and list items of a page.
fn content_text(html: &str) -> String {
    let no_filters = Map::new();
    CONTENT_ELEMENTS
        .iter()
        .filter_map(|tag| element_texts(html, tag, &no_filters).ok())
        .flatten()
        .collect::<Vec<_>>()
        .join(" ")
}

async fn fetch_html(client: &reqwest::Client, url: &str) -> anyhow::Result<String> {
    let bytes = fetch_bytes(client, url).await?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn parse_url(args: &Value) -> anyhow::Result<Url> {
    let raw = args["url"]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("Missing 'url' argument"))?;
    Url::parse(raw).map_err(|e| anyhow::anyhow!("Invalid URL '{}': {}", raw, e))
}

/// List same-site subpages of a URL with their titles.
pub struct CrawlSubpages {
    client: reqwest::Client,
}

impl CrawlSubpages {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Tool for CrawlSubpages {
    fn name(&self) -> &str {
        "crawl_subpages"
    }

    fn description(&self) -> &str {
        "List the subpages linked from a page that live under the same URL prefix, with their page titles (depth 1). Use to navigate sites such as pirls2021.org before scraping."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "The starting URL"
                }
            },
            "required": ["url"]
        })
    }

    async fn execute(&self, args: Value) -> anyhow::Result<String> {
        let start = parse_url(&args)?;
        let html = fetch_html(&self.client, start.as_str()).await?;

        let prefix = start.as_str();
        let subpages: Vec<Url> = extract_links(&html, &start)
            .into_iter()
            .filter(|link| link.as_str().starts_with(prefix) && link.as_str() != prefix)
            .take(MAX_SUBPAGES)
            .collect();

        tracing::info!("Crawling {} subpages of {}", subpages.len(), start);

        let client = &self.client;
        let pages: Vec<Value> = stream::iter(subpages)
            .map(|link| async move {
                let title = match fetch_html(client, link.as_str()).await {
                    Ok(page) => extract_title(&page).unwrap_or_else(|| "No title".to_string()),
                    Err(e) => {
                        tracing::debug!("Could not fetch {}: {}", link, e);
                        "No title".to_string()
                    }
                };
                json!({"url": link.as_str(), "title": title})
            })
            .buffered(CONCURRENT_FETCHES)
            .collect()
            .await;

        Ok(Value::Array(pages).to_string())
    }
}

/// Text of selected elements of a page.
pub struct ScrapeText {
    client: reqwest::Client,
}

impl ScrapeText {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Tool for ScrapeText {
    fn name(&self) -> &str {
        "scrape_text"
    }

    fn description(&self) -> &str {
        "Scrape the text of chosen HTML elements (default: paragraphs) from a page, optionally filtered by attributes such as class or id. Returns {element: [texts]} with the first 7 sentence-like texts per element."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "The page to scrape"
                },
                "target_elements": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "HTML tags to collect (default: [\"p\"])"
                },
                "attributes": {
                    "type": "object",
                    "description": "Attribute filters, e.g. {\"class\": \"highlight\", \"id\": \"main\"}"
                }
            },
            "required": ["url"]
        })
    }

    async fn execute(&self, args: Value) -> anyhow::Result<String> {
        let url = parse_url(&args)?;
        let targets: Vec<String> = match &args["target_elements"] {
            Value::Null => vec!["p".to_string()],
            Value::String(tag) => vec![tag.clone()],
            Value::Array(tags) => tags
                .iter()
                .map(|t| {
                    t.as_str()
                        .map(String::from)
                        .ok_or_else(|| anyhow::anyhow!("target_elements must be strings"))
                })
                .collect::<anyhow::Result<_>>()?,
            _ => return Err(anyhow::anyhow!("target_elements must be a list of tags")),
        };
        let filters = match &args["attributes"] {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };

        let html = fetch_html(&self.client, url.as_str()).await?;

        let mut result = Map::new();
        for tag in targets {
            let texts: Vec<Value> = element_texts(&html, &tag, &filters)?
                .into_iter()
                .filter(|text| text.contains('.'))
                .take(MAX_TEXTS_PER_ELEMENT)
                .map(Value::String)
                .collect();
            result.insert(tag, Value::Array(texts));
        }
        Ok(Value::Object(result).to_string())
    }
}

/// Pages and PDFs linked from a page whose text mentions a query.
pub struct FindRelevantLinks {
    client: reqwest::Client,
}

impl FindRelevantLinks {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn linked_text(&self, link: &Url) -> anyhow::Result<String> {
        if link.path().to_ascii_lowercase().ends_with(".pdf") {
            let bytes = fetch_bytes(&self.client, link.as_str()).await?;
            pdf_to_text(&bytes, false, Pages::All).await
        } else {
            let html = fetch_html(&self.client, link.as_str()).await?;
            Ok(content_text(&html))
        }
    }
}

#[async_trait]
impl Tool for FindRelevantLinks {
    fn name(&self) -> &str {
        "find_relevant_links"
    }

    fn description(&self) -> &str {
        "Find the page itself and the pages or PDF files it links to whose text mentions a query (case-insensitive). Returns a JSON list of URLs."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "The page whose links to search"
                },
                "query": {
                    "type": "string",
                    "description": "Phrase that relevant documents must contain"
                }
            },
            "required": ["url", "query"]
        })
    }

    async fn execute(&self, args: Value) -> anyhow::Result<String> {
        let start = parse_url(&args)?;
        let query = args["query"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'query' argument"))?
            .to_lowercase();
        if query.trim().is_empty() {
            return Err(anyhow::anyhow!("query cannot be empty"));
        }

        let html = fetch_html(&self.client, start.as_str()).await?;
        let mut relevant = Vec::new();
        if content_text(&html).to_lowercase().contains(&query) {
            relevant.push(start.to_string());
        }

        let links: Vec<Url> = extract_links(&html, &start)
            .into_iter()
            .filter(|link| link != &start)
            .take(MAX_LINKS_CHECKED)
            .collect();

        let query = query.as_str();
        let matches: Vec<Option<String>> = stream::iter(links)
            .map(|link| async move {
                match self.linked_text(&link).await {
                    Ok(text) if text.to_lowercase().contains(query) => Some(link.to_string()),
                    Ok(_) => None,
                    Err(e) => {
                        tracing::debug!("Skipping {}: {}", link, e);
                        None
                    }
                }
            })
            .buffered(CONCURRENT_FETCHES)
            .collect()
            .await;

        relevant.extend(matches.into_iter().flatten());
        Ok(serde_json::to_string(&relevant)?)
    }
}

/// Indicator data from the UNESCO Institute for Statistics API.
pub struct UnescoData {
    client: reqwest::Client,
    api_url: String,
}

impl UnescoData {
    pub fn new(client: reqwest::Client, api_url: impl Into<String>) -> Self {
        Self {
            client,
            api_url: api_url.into(),
        }
    }
}

fn string_list(value: &Value, name: &str) -> anyhow::Result<Vec<String>> {
    match value {
        Value::String(s) => Ok(s
            .split(',')
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect()),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(String::from)
                    .ok_or_else(|| anyhow::anyhow!("{} must contain strings", name))
            })
            .collect(),
        Value::Null => Err(anyhow::anyhow!("Missing '{}' argument", name)),
        _ => Err(anyhow::anyhow!("{} must be a list of strings", name)),
    }
}

fn year_arg(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => "2021".to_string(),
    }
}

#[async_trait]
impl Tool for UnescoData {
    fn name(&self) -> &str {
        "get_unesco_data"
    }

    fn description(&self) -> &str {
        "Query the UNESCO UIS API for indicator values (e.g. XGDP.FSGOV for government education spending as % of GDP) for a list of countries (ISO3 codes such as BRA, USA, DEU) and a year range (default 2021)."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "indicators": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Indicator codes"
                },
                "geo_units": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Country codes (ISO 3166-1 alpha-3)"
                },
                "start": {
                    "type": "string",
                    "description": "First year (default: 2021)"
                },
                "end": {
                    "type": "string",
                    "description": "Last year (default: 2021)"
                },
                "indicator_metadata": {
                    "type": "boolean",
                    "description": "Include indicator metadata (default: false)"
                }
            },
            "required": ["indicators", "geo_units"]
        })
    }

    async fn execute(&self, args: Value) -> anyhow::Result<String> {
        let indicators = string_list(&args["indicators"], "indicators")?;
        let geo_units = string_list(&args["geo_units"], "geo_units")?;
        let metadata = args["indicator_metadata"].as_bool().unwrap_or(false);

        let mut params: Vec<(&str, String)> = vec![
            ("start", year_arg(&args["start"])),
            ("end", year_arg(&args["end"])),
            ("indicatorMetadata", metadata.to_string()),
        ];
        params.extend(indicators.into_iter().map(|i| ("indicator", i)));
        params.extend(geo_units.into_iter().map(|g| ("geoUnit", g)));

        let body: Value = async {
            self.client
                .get(&self.api_url)
                .query(&params)
                .send()
                .await?
                .error_for_status()?
                .json::<Value>()
                .await
        }
        .await
        .map_err(|e: reqwest::Error| anyhow::anyhow!("Request to UNESCO API failed: {}", e))?;

        Ok(truncate_output(&body.to_string(), 20_000))
    }
}

/// Basic HTML entity decoding.
fn html_decode(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
}

/// Extract readable text from HTML (simple approach).
fn extract_text_from_html(html: &str) -> String {
    let text = non_content_regex().replace_all(html, " ");

    let mut result = String::new();
    let mut in_tag = false;
    for c in text.chars() {
        match c {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                result.push(' ');
            }
            _ if !in_tag => result.push(c),
            _ => {}
        }
    }

    let result = result.split_whitespace().collect::<Vec<_>>().join(" ");
    html_decode(&result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn serve_html(server: &MockServer, route: &str, body: &str) {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/html")
                    .set_body_string(body),
            )
            .mount(server)
            .await;
    }

    #[test]
    fn html_text_extraction() {
        let html = "<div><script>var x = 1;</script><p>Fish &amp; chips</p>\n<style>p {}</style><b>now</b></div>";
        assert_eq!(extract_text_from_html(html), "Fish & chips now");
    }

    #[test]
    fn uppercase_script_and_style_are_dropped() {
        let html = "<SCRIPT type=\"text/javascript\">var secret = 1;</SCRIPT><p>Hi.</p><Style>p { color: red }</STYLE>";
        assert_eq!(extract_text_from_html(html), "Hi.");
    }

    #[test]
    fn unclosed_elements_end_at_the_next_opening() {
        let html = "<p>First.<p class=\"note\">Second.</p><p>Third.";
        let texts = element_texts(html, "p", &Map::new()).unwrap();
        assert_eq!(texts, vec!["First.", "Second.", "Third."]);
    }

    #[test]
    fn links_are_resolved_and_deduplicated() {
        let base = Url::parse("https://pirls2021.org/results/").unwrap();
        let html = r#"<a href="/results/a">A</a> <a class="x" href='b'>B</a>
            <a href="/results/a">again</a> <a href="mailto:x@y.z">mail</a>
            <a href=https://other.org/>ext</a>"#;
        let links: Vec<String> = extract_links(html, &base)
            .into_iter()
            .map(|u| u.to_string())
            .collect();
        assert_eq!(
            links,
            vec![
                "https://pirls2021.org/results/a",
                "https://pirls2021.org/results/b",
                "https://other.org/"
            ]
        );
    }

    #[test]
    fn element_texts_honour_attribute_filters() {
        let html = r#"<p class="lead intro">First. <em>Bold.</em></p><p id="x">Second.</p><P>Third.</P>"#;
        let all = element_texts(html, "p", &Map::new()).unwrap();
        assert_eq!(all, vec!["First. Bold.", "Second.", "Third."]);

        let filters = json!({"class_": "lead"});
        let lead = element_texts(html, "p", filters.as_object().unwrap()).unwrap();
        assert_eq!(lead, vec!["First. Bold."]);

        let filters = json!({"id": "x"});
        let by_id = element_texts(html, "p", filters.as_object().unwrap()).unwrap();
        assert_eq!(by_id, vec!["Second."]);

        assert!(element_texts(html, "p><script", &Map::new()).is_err());
    }

    #[tokio::test]
    async fn crawl_lists_same_prefix_subpages_with_titles() {
        let server = MockServer::start().await;
        serve_html(
            &server,
            "/site/",
            r#"<a href="/site/a">a</a><a href="b">b</a><a href="/other">o</a><a href="/site/">self</a>"#,
        )
        .await;
        serve_html(&server, "/site/a", "<html><head><title> Page A </title></head></html>").await;
        serve_html(&server, "/site/b", "<html><body>untitled</body></html>").await;

        let tool = CrawlSubpages::new(reqwest::Client::new());
        let out = tool
            .execute(json!({"url": format!("{}/site/", server.uri())}))
            .await
            .unwrap();
        let pages: Vec<Value> = serde_json::from_str(&out).unwrap();
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0]["url"], format!("{}/site/a", server.uri()));
        assert_eq!(pages[0]["title"], "Page A");
        assert_eq!(pages[1]["title"], "No title");
    }

    #[tokio::test]
    async fn scrape_keeps_sentence_like_texts() {
        let server = MockServer::start().await;
        let mut body = String::from("<h1>Heading</h1><p>No period here</p>");
        for i in 0..10 {
            body.push_str(&format!("<p>Sentence {i}.</p>"));
        }
        serve_html(&server, "/page", &body).await;

        let tool = ScrapeText::new(reqwest::Client::new());
        let out = tool
            .execute(json!({
                "url": format!("{}/page", server.uri()),
                "target_elements": ["p", "h1"]
            }))
            .await
            .unwrap();
        let parsed: Value = serde_json::from_str(&out).unwrap();
        let paragraphs = parsed["p"].as_array().unwrap();
        assert_eq!(paragraphs.len(), 7);
        assert_eq!(paragraphs[0], "Sentence 0.");
        assert_eq!(parsed["h1"], json!([]));
    }

    #[tokio::test]
    async fn relevant_links_match_case_insensitively() {
        let server = MockServer::start().await;
        serve_html(
            &server,
            "/",
            r#"<p>Index</p><a href="/p1">one</a><a href="/p2">two</a><a href="/missing.pdf">pdf</a>"#,
        )
        .await;
        serve_html(&server, "/p1", "<p>About reading literacy in 2021.</p>").await;
        serve_html(&server, "/p2", "<p>Mathematics.</p>").await;
        Mock::given(method("GET"))
            .and(path("/missing.pdf"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let tool = FindRelevantLinks::new(reqwest::Client::new());
        let out = tool
            .execute(json!({"url": format!("{}/", server.uri()), "query": "Reading Literacy"}))
            .await
            .unwrap();
        let links: Vec<String> = serde_json::from_str(&out).unwrap();
        assert_eq!(links, vec![format!("{}/p1", server.uri())]);
    }

    #[tokio::test]
    async fn unesco_query_repeats_list_parameters() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/public/data/indicators"))
            .and(query_param("start", "2019"))
            .and(query_param("end", "2021"))
            .and(query_param("indicatorMetadata", "false"))
            .and(query_param("geoUnit", "DEU"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "records": [{"indicatorId": "XGDP.FSGOV", "geoUnit": "DEU", "year": 2020, "value": 4.6}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let tool = UnescoData::new(
            reqwest::Client::new(),
            format!("{}/api/public/data/indicators", server.uri()),
        );
        let out = tool
            .execute(json!({
                "indicators": ["XGDP.FSGOV", "XGDP.EDU"],
                "geo_units": ["BRA", "DEU"],
                "start": "2019",
                "end": 2021
            }))
            .await
            .unwrap();
        assert!(out.contains("4.6"));

        let requests = server.received_requests().await.unwrap();
        let query = requests[0].url.query().unwrap_or_default().to_string();
        assert_eq!(query.matches("indicator=").count(), 2);
        assert_eq!(query.matches("geoUnit=").count(), 2);
    }

    #[tokio::test]
    async fn unesco_failures_are_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let tool = UnescoData::new(reqwest::Client::new(), server.uri());
        let err = tool
            .execute(json!({"indicators": "XGDP.FSGOV", "geo_units": ["BRA"]}))
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("Request to UNESCO API failed"));
    }
}
