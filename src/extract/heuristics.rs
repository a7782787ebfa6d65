use regex::Regex;
use scraper::{Html, Selector};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, warn};
use url::Url;

use crate::error::{LinkBotError, Result};
use crate::extract::record::{Confidence, PageCapture, Price, ProductFields};
use crate::profiles::SiteProfile;

/// Recommendation blocks whose prices belong to other products.
const SECONDARY_SECTION_MARKERS: &[&str] = &[
    "best sellers",
    "customers also bought",
    "customers also viewed",
    "related items",
    "recommended for you",
    "people also bought",
    "similar items you might like",
    "sponsored products",
    "other items",
    "more deals",
    "deals our customers love best",
];

/// Markers only need to be ignored near the top of the page.
const SECONDARY_MARKER_MIN_OFFSET: usize = 200;

const BLOCKED_MARKERS: &[&str] = &[
    "captcha",
    "access denied",
    "robot check",
    "are you a robot",
    "verify you are human",
    "unusual traffic",
    "request blocked",
];

const BAD_TITLES: &[&str] = &[
    "access denied",
    "denied",
    "blocked",
    "error",
    "forbidden",
    "robot check",
    "just a moment",
    "attention required",
    "page not found",
];

const CURRENCY_CODES: &[&str] = &["USD", "EUR", "GBP", "JPY", "CAD", "AUD"];

const IMAGE_SELECTORS: &[&str] = &[
    "img[itemprop='image']",
    "img.product-image",
    "img#product-image",
    "img[data-testid*='product-image']",
    "img[class*='ProductImage']",
    "div.product-gallery img",
    "div[class*='product-image'] img",
];

/// Result of running every layer over one document.
#[derive(Debug, Clone)]
pub struct PageAnalysis {
    pub fields: ProductFields,
    /// Weakest evidence level among the resolved required fields.
    pub confidence: Confidence,
    pub blocked: bool,
    pub capture: PageCapture,
}

/// Product page analyzer shared by the browser and HTTP stages.
pub struct PageAnalyzer {
    title_selector: Selector,
    h1_selector: Selector,
    json_ld_selector: Selector,
    meta_selector: Selector,
    itemprop_price_selector: Selector,
    image_selectors: Vec<Selector>,
    price_regex: Regex,
    was_now_regex: Regex,
}

impl PageAnalyzer {
    pub fn new() -> Result<Self> {
        let image_selectors = IMAGE_SELECTORS
            .iter()
            .map(|s| parse_selector(s))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            title_selector: parse_selector("title")?,
            h1_selector: parse_selector("h1")?,
            json_ld_selector: parse_selector("script[type='application/ld+json']")?,
            meta_selector: parse_selector("meta")?,
            itemprop_price_selector: parse_selector("[itemprop='price']")?,
            image_selectors,
            price_regex: Regex::new(r"(?i)(?:[$€£¥]|\b(?:USD|EUR|GBP|JPY|CAD|AUD))\s?\d[\d.,]*")
                .map_err(|e| LinkBotError::ParseError(format!("Invalid price pattern: {}", e)))?,
            was_now_regex: Regex::new(
                r"(?i)\bwas\s*:?\s*([$€£¥]?\s?\d[\d.,]*)[^$€£¥\d]{0,40}\b(?:now|today)\s*:?\s*([$€£¥]?\s?\d[\d.,]*)",
            )
            .map_err(|e| LinkBotError::ParseError(format!("Invalid was/now pattern: {}", e)))?,
        })
    }

    /// Runs profile, JSON-LD, meta and DOM layers; each only fills empty fields.
    pub fn analyze(&self, html: &str, page_url: &Url, profile: Option<&SiteProfile>) -> PageAnalysis {
        let document = Html::parse_document(html);

        let page_title = document
            .select(&self.title_selector)
            .next()
            .map(|e| collapse_whitespace(&e.text().collect::<String>()))
            .filter(|t| !t.is_empty());
        let meta = self.collect_meta(&document);
        let text = visible_text(&document);
        let blocked = is_blocked(page_title.as_deref(), &text);
        if blocked {
            warn!("Page {} looks blocked (title: {:?})", page_url, page_title);
        }

        let mut layers = Layered::default();

        if let Some(profile) = profile {
            self.apply_profile(&document, profile, &mut layers);
        }
        self.apply_json_ld(&document, page_url, &mut layers);
        self.apply_meta(&document, &meta, page_url, &mut layers);
        self.apply_dom(&document, page_title.as_deref(), &text, page_url, &mut layers);
        layers.settle_currency();

        if layers.fields.currency.is_none() && layers.fields.has_price() {
            let candidates: Vec<&str> = self.price_regex.find_iter(trim_secondary_sections(&text)).map(|m| m.as_str()).collect();
            layers.fields.currency = infer_currency(candidates);
        }

        let confidence = layers.confidence();
        debug!(
            "Analyzed {}: title={:?} sale={:?} original={:?} confidence={:?}",
            page_url, layers.fields.title, layers.fields.sale_price, layers.fields.original_price, confidence
        );

        PageAnalysis {
            fields: layers.fields,
            confidence,
            blocked,
            capture: PageCapture {
                final_url: page_url.to_string(),
                title: page_title,
                meta,
                text,
                blocked,
            },
        }
    }

    fn apply_profile(&self, document: &Html, profile: &SiteProfile, layers: &mut Layered) {
        let title = query_first(document, &profile.title);
        let sale = query_first(document, &profile.sale_price).and_then(|v| Price::parse(&v));
        let original = query_first(document, &profile.original_price).and_then(|v| Price::parse(&v));
        layers.offer(Confidence::High, title, sale, original, profile.currency.clone(), None);
    }

    fn apply_json_ld(&self, document: &Html, page_url: &Url, layers: &mut Layered) {
        for script in document.select(&self.json_ld_selector) {
            let raw = script.text().collect::<String>();
            let value: Value = match serde_json::from_str(raw.trim()) {
                Ok(value) => value,
                Err(e) => {
                    debug!("Skipping malformed JSON-LD block: {}", e);
                    continue;
                }
            };

            if let Some(product) = json_ld_products(&value).into_iter().next() {
                let title = product.get("name").and_then(Value::as_str).map(collapse_whitespace);
                let offer = match product.get("offers") {
                    Some(Value::Array(offers)) => offers.first(),
                    other => other,
                };

                let mut sale = None;
                let mut original = None;
                let mut currency = None;
                if let Some(offer) = offer {
                    sale = ["price", "salePrice", "lowPrice"]
                        .iter()
                        .find_map(|key| offer.get(*key).and_then(json_price));
                    original = offer.get("highPrice").and_then(json_price).filter(|p| Some(*p) != sale);
                    currency = ["priceCurrency", "priceCurrencyCode"]
                        .iter()
                        .find_map(|key| offer.get(*key).and_then(Value::as_str))
                        .map(|c| c.trim().to_uppercase());
                }

                let image = product
                    .get("image")
                    .and_then(json_image)
                    .and_then(|src| resolve_url(page_url, &src));

                layers.offer(Confidence::High, title, sale, original, currency, image);
                return;
            }
        }
    }

    fn apply_meta(&self, document: &Html, meta: &BTreeMap<String, String>, page_url: &Url, layers: &mut Layered) {
        let title = meta.get("og:title").map(|t| collapse_whitespace(t));
        let sale = meta
            .get("product:price:amount")
            .or_else(|| meta.get("og:price:amount"))
            .and_then(|v| Price::parse(v))
            .or_else(|| {
                document.select(&self.itemprop_price_selector).find_map(|e| {
                    let value = e.value().attr("content").map(str::to_string).unwrap_or_else(|| e.text().collect());
                    Price::parse(&value)
                })
            });
        let currency = meta
            .get("product:price:currency")
            .or_else(|| meta.get("og:price:currency"))
            .map(|c| c.trim().to_uppercase());
        let image = meta.get("og:image").and_then(|src| resolve_url(page_url, src));

        layers.offer(Confidence::Medium, title, sale, None, currency, image);
    }

    fn apply_dom(&self, document: &Html, page_title: Option<&str>, text: &str, page_url: &Url, layers: &mut Layered) {
        let title = document
            .select(&self.h1_selector)
            .map(|e| collapse_whitespace(&e.text().collect::<String>()))
            .find(|t| !t.is_empty())
            .or_else(|| page_title.map(str::to_string));

        let primary = trim_secondary_sections(text);

        let mut sale = None;
        let mut original = None;
        if let Some(captures) = self.was_now_regex.captures(primary) {
            original = captures.get(1).and_then(|m| Price::parse(m.as_str()));
            sale = captures.get(2).and_then(|m| Price::parse(m.as_str()));
        }

        let candidates: Vec<&str> = self.price_regex.find_iter(primary).map(|m| m.as_str()).collect();
        if sale.is_none() && original.is_none() {
            let (low, high) = pick_prices(candidates.iter().filter_map(|c| Price::parse(c)));
            sale = low;
            original = high;
        }
        let currency = infer_currency(candidates);

        let image = self.image_selectors.iter().find_map(|selector| {
            document.select(selector).find_map(|img| {
                let value = img.value();
                value
                    .attr("src")
                    .or_else(|| value.attr("data-src"))
                    .and_then(|src| resolve_url(page_url, src))
            })
        });

        layers.offer(Confidence::Medium, title, sale, original, currency, image);
    }

    fn collect_meta(&self, document: &Html) -> BTreeMap<String, String> {
        let mut meta = BTreeMap::new();
        for element in document.select(&self.meta_selector) {
            let value = element.value();
            let key = value
                .attr("property")
                .or_else(|| value.attr("name"))
                .or_else(|| value.attr("itemprop"));
            if let (Some(key), Some(content)) = (key, value.attr("content")) {
                let content = content.trim();
                if !content.is_empty() {
                    meta.entry(key.to_lowercase()).or_insert_with(|| content.to_string());
                }
            }
        }
        meta
    }
}

/// Accumulates fields across layers with the evidence level of each.
#[derive(Default)]
struct Layered {
    fields: ProductFields,
    title_level: Option<Confidence>,
    sale_level: Option<Confidence>,
    original_level: Option<Confidence>,
    currency_hint: Option<String>,
}

impl Layered {
    fn offer(
        &mut self,
        level: Confidence,
        title: Option<String>,
        sale: Option<Price>,
        original: Option<Price>,
        currency: Option<String>,
        image: Option<String>,
    ) {
        if self.fields.title.is_none() {
            if let Some(title) = title.filter(|t| is_acceptable_title(t)) {
                self.fields.title = Some(title);
                self.title_level = Some(level);
            }
        }

        // Prices from a later layer are only taken when their currency is compatible.
        let compatible = match (&self.fields.currency, &currency) {
            (Some(existing), Some(offered)) => existing.eq_ignore_ascii_case(offered),
            _ => true,
        };
        let had_price = self.fields.has_price();
        let mut priced = false;
        if compatible || !had_price {
            if self.fields.sale_price.is_none() {
                if let Some(sale) = sale {
                    self.fields.sale_price = Some(sale);
                    self.sale_level = Some(level);
                    priced = true;
                }
            }
            if self.fields.original_price.is_none() {
                if let Some(original) = original.filter(|o| Some(*o) != self.fields.sale_price) {
                    self.fields.original_price = Some(original);
                    self.original_level = Some(level);
                    priced = true;
                }
            }
        }

        // Currency travels with the layer that supplied a price; price-less
        // layers only leave a hint for later.
        if priced {
            if self.fields.currency.is_none() {
                self.fields.currency = currency;
            }
        } else if self.currency_hint.is_none() {
            self.currency_hint = currency;
        }

        if self.fields.image_url.is_none() {
            self.fields.image_url = image;
        }
    }

    /// Falls back to the hinted currency when the priced layer had none.
    fn settle_currency(&mut self) {
        if self.fields.has_price() {
            if self.fields.currency.is_none() {
                self.fields.currency = self.currency_hint.take();
            }
        } else {
            self.fields.currency = None;
        }
    }

    fn confidence(&self) -> Confidence {
        [self.title_level, self.sale_level, self.original_level]
            .into_iter()
            .flatten()
            .min()
            .unwrap_or(Confidence::Low)
    }
}

fn parse_selector(selector: &str) -> Result<Selector> {
    Selector::parse(selector).map_err(|e| LinkBotError::ParseError(format!("Invalid selector '{}': {}", selector, e)))
}

/// First non-empty value among profile selectors, `content` attribute preferred.
fn query_first(document: &Html, selectors: &[String]) -> Option<String> {
    for raw in selectors {
        let selector = match Selector::parse(raw) {
            Ok(selector) => selector,
            Err(e) => {
                warn!("Ignoring invalid profile selector '{}': {}", raw, e);
                continue;
            }
        };
        for element in document.select(&selector) {
            if let Some(content) = element.value().attr("content") {
                let content = content.trim();
                if !content.is_empty() {
                    return Some(content.to_string());
                }
            }
            let text = collapse_whitespace(&element.text().collect::<String>());
            if !text.is_empty() {
                return Some(text);
            }
        }
    }
    None
}

fn json_ld_products(value: &Value) -> Vec<&Value> {
    match value {
        Value::Array(items) => items.iter().flat_map(json_ld_products).collect(),
        Value::Object(map) => {
            if let Some(graph) = map.get("@graph") {
                return json_ld_products(graph);
            }
            let is_product = match map.get("@type") {
                Some(Value::String(kind)) => kind == "Product",
                Some(Value::Array(kinds)) => kinds.iter().any(|k| k.as_str() == Some("Product")),
                _ => false,
            };
            if is_product {
                vec![value]
            } else {
                Vec::new()
            }
        }
        _ => Vec::new(),
    }
}

fn json_price(value: &Value) -> Option<Price> {
    match value {
        Value::String(raw) => Price::parse(raw),
        Value::Number(number) => Price::parse(&number.to_string()),
        _ => None,
    }
}

fn json_image(value: &Value) -> Option<String> {
    match value {
        Value::String(src) => Some(src.clone()),
        Value::Array(items) => items.first().and_then(json_image),
        Value::Object(map) => map.get("url").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

fn resolve_url(base: &Url, src: &str) -> Option<String> {
    let src = src.trim();
    if src.is_empty() || src.starts_with("data:") {
        return None;
    }
    base.join(src)
        .ok()
        .filter(|u| u.scheme() == "http" || u.scheme() == "https")
        .map(|u| u.to_string())
}

/// Text a reader would see: script, style and template contents skipped.
pub fn visible_text(document: &Html) -> String {
    let mut parts = Vec::new();
    for node in document.root_element().descendants() {
        if let Some(text) = node.value().as_text() {
            let hidden = node.ancestors().any(|ancestor| {
                ancestor
                    .value()
                    .as_element()
                    .map(|e| matches!(e.name(), "script" | "style" | "noscript" | "template" | "head"))
                    .unwrap_or(false)
            });
            let trimmed = text.trim();
            if !hidden && !trimmed.is_empty() {
                parts.push(trimmed);
            }
        }
    }
    collapse_whitespace(&parts.join(" "))
}

/// Cuts text at the earliest recommendation-section marker past the page header.
pub fn trim_secondary_sections(text: &str) -> &str {
    let lowered = text.to_ascii_lowercase();
    let cutoff = SECONDARY_SECTION_MARKERS
        .iter()
        .filter_map(|marker| {
            lowered
                .match_indices(marker)
                .map(|(idx, _)| idx)
                .find(|idx| *idx > SECONDARY_MARKER_MIN_OFFSET)
        })
        .min();
    match cutoff {
        Some(idx) => &text[..idx],
        None => text,
    }
}

/// Lowest price as sale, highest distinct price as original.
pub fn pick_prices(candidates: impl IntoIterator<Item = Price>) -> (Option<Price>, Option<Price>) {
    let mut prices: Vec<Price> = candidates.into_iter().collect();
    prices.sort();
    prices.dedup();
    let lowest = prices.first().copied();
    let highest = prices.last().copied().filter(|h| Some(*h) != lowest);
    (lowest, highest)
}

/// Currency code from ISO codes or symbols in price strings.
pub fn infer_currency<'a>(candidates: impl IntoIterator<Item = &'a str>) -> Option<String> {
    for candidate in candidates {
        let upper = candidate.to_uppercase();
        if let Some(code) = CURRENCY_CODES.iter().find(|code| upper.contains(*code)) {
            return Some(code.to_string());
        }
        let symbol = [('$', "USD"), ('€', "EUR"), ('£', "GBP"), ('¥', "JPY")]
            .iter()
            .find(|(symbol, _)| candidate.contains(*symbol))
            .map(|(_, code)| code.to_string());
        if symbol.is_some() {
            return symbol;
        }
    }
    None
}

pub fn is_blocked(title: Option<&str>, text: &str) -> bool {
    let head: String = text.chars().take(2000).collect::<String>().to_lowercase();
    let title = title.unwrap_or_default().to_lowercase();
    BLOCKED_MARKERS
        .iter()
        .any(|marker| title.contains(marker) || head.contains(marker))
}

pub fn is_acceptable_title(title: &str) -> bool {
    let lowered = title.trim().to_lowercase();
    !lowered.is_empty() && !BAD_TITLES.iter().any(|bad| lowered == *bad || lowered.starts_with(&format!("{} ", bad)))
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyzer() -> PageAnalyzer {
        PageAnalyzer::new().unwrap()
    }

    fn url() -> Url {
        Url::parse("https://shop.example.com/p/lamp").unwrap()
    }

    #[test]
    fn test_profile_layer_yields_high_confidence() {
        let html = r#"<html><head><title>Lamp | Shop</title></head><body>
            <h1 class="name">Brass Desk Lamp</h1>
            <span class="now">$39.99</span><span class="was">$59.99</span>
        </body></html>"#;
        let profile = SiteProfile {
            title: vec!["h1.name".into()],
            sale_price: vec![".now".into()],
            original_price: vec![".was".into()],
            currency: Some("USD".into()),
        };

        let analysis = analyzer().analyze(html, &url(), Some(&profile));

        assert_eq!(analysis.fields.title.as_deref(), Some("Brass Desk Lamp"));
        assert_eq!(analysis.fields.sale_price, Price::parse("39.99"));
        assert_eq!(analysis.fields.original_price, Price::parse("59.99"));
        assert_eq!(analysis.fields.currency.as_deref(), Some("USD"));
        assert_eq!(analysis.confidence, Confidence::High);
    }

    #[test]
    fn test_currency_follows_the_layer_that_found_the_price() {
        let html = r#"<html><head>
            <script type="application/ld+json">{"@type":"Product","name":"Rain Jacket",
                "offers":{"price":"89.00","priceCurrency":"EUR"}}</script>
            </head><body><h1 class="name">Rain Jacket</h1></body></html>"#;
        let profile = SiteProfile {
            title: vec!["h1.name".into()],
            sale_price: vec![".missing".into()],
            currency: Some("USD".into()),
            ..Default::default()
        };

        let analysis = analyzer().analyze(html, &url(), Some(&profile));

        assert_eq!(analysis.fields.sale_price, Price::parse("89.00"));
        assert_eq!(analysis.fields.currency.as_deref(), Some("EUR"));
    }

    #[test]
    fn test_profile_currency_fills_in_for_unlabelled_price() {
        let html = r#"<html><head>
            <script type="application/ld+json">{"@type":"Product","name":"Rain Jacket",
                "offers":{"price":"89.00"}}</script>
            </head><body><p>In stock</p></body></html>"#;
        let profile = SiteProfile {
            sale_price: vec![".missing".into()],
            currency: Some("CAD".into()),
            ..Default::default()
        };

        let analysis = analyzer().analyze(html, &url(), Some(&profile));
        assert_eq!(analysis.fields.currency.as_deref(), Some("CAD"));

        let title_only = r#"<html><body><h1>Rain Jacket</h1></body></html>"#;
        let analysis = analyzer().analyze(title_only, &url(), Some(&profile));
        assert!(analysis.fields.currency.is_none());
    }

    #[test]
    fn test_json_ld_graph_and_offer_array() {
        let html = r#"<html><head>
            <script type="application/ld+json">{"@context":"https://schema.org","@graph":[
                {"@type":"BreadcrumbList"},
                {"@type":["Product"],"name":"Trail Shoe","image":["/img/shoe.jpg"],
                 "offers":[{"@type":"AggregateOffer","lowPrice":"89.00","highPrice":120,"priceCurrency":"eur"}]}
            ]}</script></head><body><p>Nothing else</p></body></html>"#;

        let analysis = analyzer().analyze(html, &url(), None);

        assert_eq!(analysis.fields.title.as_deref(), Some("Trail Shoe"));
        assert_eq!(analysis.fields.sale_price, Price::parse("89"));
        assert_eq!(analysis.fields.original_price, Price::parse("120"));
        assert_eq!(analysis.fields.currency.as_deref(), Some("EUR"));
        assert_eq!(analysis.fields.image_url.as_deref(), Some("https://shop.example.com/img/shoe.jpg"));
        assert_eq!(analysis.confidence, Confidence::High);
    }

    #[test]
    fn test_meta_and_dom_layers_are_medium() {
        let html = r#"<html><head>
            <meta property="og:title" content="Cotton Throw Blanket">
            <meta property="product:price:amount" content="24.50">
            <meta property="product:price:currency" content="USD">
            </head><body><h1>Throw</h1><p>Was $35.00 now $24.50</p></body></html>"#;

        let analysis = analyzer().analyze(html, &url(), None);

        assert_eq!(analysis.fields.title.as_deref(), Some("Cotton Throw Blanket"));
        assert_eq!(analysis.fields.sale_price, Price::parse("24.50"));
        assert_eq!(analysis.fields.original_price, Price::parse("35.00"));
        assert_eq!(analysis.confidence, Confidence::Medium);
        assert_eq!(analysis.capture.meta.get("og:title").map(String::as_str), Some("Cotton Throw Blanket"));
    }

    #[test]
    fn test_blocked_page_rejects_bad_title() {
        let html = "<html><head><title>Access Denied</title></head><body><h1>Access Denied</h1>\
                    <p>You don't have permission to access this server.</p></body></html>";

        let analysis = analyzer().analyze(html, &url(), None);

        assert!(analysis.blocked);
        assert!(analysis.fields.title.is_none());
        assert!(!analysis.fields.has_any_required());
        assert!(analysis.capture.blocked);
    }

    #[test]
    fn test_visible_text_skips_scripts() {
        let document = Html::parse_document(
            "<html><head><style>.x{}</style></head><body><p>Hello</p><script>var price = '$1';</script><p>world</p></body></html>",
        );
        assert_eq!(visible_text(&document), "Hello world");
    }

    #[test]
    fn test_trim_secondary_sections_ignores_early_markers() {
        let header = format!("Best sellers nav {}", "x".repeat(250));
        let text = format!("{} Lamp $10 Customers also bought Vase $99", header);
        let trimmed = trim_secondary_sections(&text);
        assert!(trimmed.contains("$10"));
        assert!(!trimmed.contains("$99"));
        assert!(trimmed.starts_with("Best sellers"));
    }

    #[test]
    fn test_pick_prices_and_currency() {
        let prices = ["$5.00", "$12.00", "$5.00", "$8.00"].iter().filter_map(|p| Price::parse(p));
        let (sale, original) = pick_prices(prices);
        assert_eq!(sale, Price::parse("5"));
        assert_eq!(original, Price::parse("12"));

        let (sale, original) = pick_prices(Price::parse("7"));
        assert_eq!(sale, Price::parse("7"));
        assert!(original.is_none());

        assert_eq!(infer_currency(["£20"]).as_deref(), Some("GBP"));
        assert_eq!(infer_currency(["CAD $20"]).as_deref(), Some("CAD"));
        assert_eq!(infer_currency(["20"]), None);
    }

    #[test]
    fn test_acceptable_titles() {
        assert!(is_acceptable_title("Errorless Pen Set"));
        assert!(!is_acceptable_title("Forbidden"));
        assert!(!is_acceptable_title("  access denied  "));
        assert!(!is_acceptable_title(""));
    }
}
