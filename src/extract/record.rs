use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// How much a record's fields can be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

/// Extraction strategies, in fallback order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    BrowserScrape,
    HttpFetch,
    LlmFallback,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::BrowserScrape => "browser_scrape",
            Stage::HttpFetch => "http_fetch",
            Stage::LlmFallback => "llm_fallback",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Success,
    Partial,
    Failed,
}

/// Positive monetary amount in minor units (cents).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Price {
    cents: u64,
}

impl Price {
    pub fn from_cents(cents: u64) -> Option<Self> {
        (cents > 0).then_some(Self { cents })
    }

    pub fn cents(&self) -> u64 {
        self.cents
    }

    /// Normalizes a scraped price string such as `"$1,299.995"` to cents.
    ///
    /// Everything except digits, `.` and `,` is discarded, commas are treated
    /// as thousands separators (unless the amount is written `24,99`) and the
    /// amount is rounded half-up to cents.
    /// Zero and unparseable amounts yield `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        let kept: String = raw
            .chars()
            .filter(|c| c.is_ascii_digit() || *c == '.' || *c == ',')
            .collect();
        let cleaned = if is_decimal_comma(&kept) {
            kept.replace(',', ".")
        } else {
            kept.replace(',', "")
        };
        if cleaned.is_empty() {
            return None;
        }

        let (whole, fraction) = match cleaned.split_once('.') {
            Some((whole, fraction)) => {
                if fraction.contains('.') {
                    return None;
                }
                (whole, fraction)
            }
            None => (cleaned.as_str(), ""),
        };
        if whole.is_empty() && fraction.is_empty() {
            return None;
        }

        let whole_value: u64 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
        let digits: Vec<u64> = fraction.bytes().map(|b| u64::from(b - b'0')).collect();
        let tenths = digits.first().copied().unwrap_or(0);
        let hundredths = digits.get(1).copied().unwrap_or(0);
        let round_up = digits.get(2).map(|d| *d >= 5).unwrap_or(false);

        let cents = whole_value
            .checked_mul(100)?
            .checked_add(tenths * 10 + hundredths)?
            .checked_add(u64::from(round_up))?;
        Self::from_cents(cents)
    }
}

/// `24,99` style amounts: a single comma followed by exactly two digits.
fn is_decimal_comma(amount: &str) -> bool {
    if amount.contains('.') || amount.matches(',').count() != 1 {
        return false;
    }
    amount
        .rsplit_once(',')
        .map(|(_, fraction)| fraction.len() == 2)
        .unwrap_or(false)
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.cents / 100, self.cents % 100)
    }
}

impl From<Price> for String {
    fn from(price: Price) -> Self {
        price.to_string()
    }
}

impl TryFrom<String> for Price {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Price::parse(&value).ok_or_else(|| format!("invalid price '{}'", value))
    }
}

/// Field set any stage may resolve. Absent means "not positively found".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductFields {
    pub title: Option<String>,
    pub original_price: Option<Price>,
    pub sale_price: Option<Price>,
    pub currency: Option<String>,
    pub image_url: Option<String>,
}

impl ProductFields {
    pub fn has_price(&self) -> bool {
        self.original_price.is_some() || self.sale_price.is_some()
    }

    /// Title plus at least one price.
    pub fn has_required(&self) -> bool {
        self.title.is_some() && self.has_price()
    }

    pub fn has_any_required(&self) -> bool {
        self.title.is_some() || self.has_price()
    }
}

/// What the first stage to load the page saw, handed to later stages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageCapture {
    pub final_url: String,
    pub title: Option<String>,
    pub meta: BTreeMap<String, String>,
    pub text: String,
    pub blocked: bool,
}

/// Outcome of one stage invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionAttempt {
    pub stage: Stage,
    pub status: AttemptStatus,
    pub fields: ProductFields,
    /// Evidence level of the fields this stage resolved.
    pub confidence: Confidence,
    pub error: Option<String>,
    pub blocked: bool,
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capture: Option<PageCapture>,
}

impl ExtractionAttempt {
    /// Classifies resolved fields into success, partial or failed.
    pub fn from_fields(stage: Stage, fields: ProductFields, confidence: Confidence, blocked: bool) -> Self {
        let (status, error) = if fields.has_required() {
            (AttemptStatus::Success, None)
        } else if fields.has_any_required() {
            (AttemptStatus::Partial, None)
        } else if blocked {
            (AttemptStatus::Failed, Some("page blocked by bot protection".to_string()))
        } else {
            (AttemptStatus::Failed, Some("no product fields found".to_string()))
        };

        Self {
            stage,
            status,
            fields,
            confidence,
            error,
            blocked,
            elapsed: Duration::ZERO,
            capture: None,
        }
    }

    pub fn failed(stage: Stage, error: impl Into<String>) -> Self {
        Self {
            stage,
            status: AttemptStatus::Failed,
            fields: ProductFields::default(),
            confidence: Confidence::Low,
            error: Some(error.into()),
            blocked: false,
            elapsed: Duration::ZERO,
            capture: None,
        }
    }

    pub fn with_capture(mut self, capture: PageCapture) -> Self {
        self.capture = Some(capture);
        self
    }

    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = elapsed;
        self
    }

    pub fn is_failed(&self) -> bool {
        self.status == AttemptStatus::Failed
    }

    /// One-line summary used in `ExtractionFailed`.
    pub fn summary(&self) -> String {
        match &self.error {
            Some(error) => format!("{}: {}", self.stage, error),
            None => format!("{}: {:?}", self.stage, self.status),
        }
    }
}

/// Normalized product data merged across stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductRecord {
    pub url: String,
    pub title: Option<String>,
    pub original_price: Option<Price>,
    pub sale_price: Option<Price>,
    pub currency: Option<String>,
    pub image_url: Option<String>,
    pub confidence: Confidence,
    pub source_stage: Stage,
    pub extracted_at: DateTime<Utc>,
}

impl ProductRecord {
    pub fn has_required(&self) -> bool {
        self.title.is_some() && (self.original_price.is_some() || self.sale_price.is_some())
    }

    /// Discount as a whole percentage when both prices are known.
    pub fn discount_percent(&self) -> Option<u64> {
        let original = self.original_price?.cents();
        let sale = self.sale_price?.cents();
        if sale >= original {
            return None;
        }
        Some(((original - sale) * 100 + original / 2) / original)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_price_parse_normalizes_and_rounds_half_up() {
        assert_eq!(Price::parse("$1,299.99").unwrap().cents(), 129_999);
        assert_eq!(Price::parse("USD 19.995").unwrap().cents(), 2000);
        assert_eq!(Price::parse("19.994").unwrap().cents(), 1999);
        assert_eq!(Price::parse("€5").unwrap().cents(), 500);
        assert_eq!(Price::parse(".5").unwrap().cents(), 50);
        assert_eq!(Price::parse("79.9").unwrap().to_string(), "79.90");
        assert_eq!(Price::parse("24,99 €").unwrap().cents(), 2499);
        assert_eq!(Price::parse("1,299").unwrap().cents(), 129_900);
    }

    #[test]
    fn test_price_parse_rejects_garbage_and_zero() {
        assert!(Price::parse("").is_none());
        assert!(Price::parse("free").is_none());
        assert!(Price::parse("$0.00").is_none());
        assert!(Price::parse("1.2.3").is_none());
        assert!(Price::parse(".").is_none());
    }

    #[test]
    fn test_price_serializes_as_decimal_string() {
        let price = Price::parse("12.5").unwrap();
        assert_eq!(serde_json::to_string(&price).unwrap(), "\"12.50\"");
        let back: Price = serde_json::from_str("\"12.50\"").unwrap();
        assert_eq!(back, price);
    }

    #[test]
    fn test_attempt_status_from_fields() {
        let title_only = ProductFields {
            title: Some("Lamp".into()),
            ..Default::default()
        };
        let attempt = ExtractionAttempt::from_fields(Stage::BrowserScrape, title_only, Confidence::Medium, false);
        assert_eq!(attempt.status, AttemptStatus::Partial);

        let blocked = ExtractionAttempt::from_fields(Stage::HttpFetch, ProductFields::default(), Confidence::Low, true);
        assert!(blocked.is_failed());
        assert!(blocked.summary().contains("blocked"));
    }

    #[test]
    fn test_confidence_ordering() {
        assert!(Confidence::Low < Confidence::Medium);
        assert!(Confidence::Medium < Confidence::High);
        assert_eq!(serde_json::to_string(&Stage::LlmFallback).unwrap(), "\"llm_fallback\"");
    }
}
