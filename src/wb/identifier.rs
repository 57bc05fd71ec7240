use once_cell::sync::Lazy;
use regex::Regex;

static CATALOG_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^https?://(?:[a-z0-9-]+\.)*(?:wildberries\.[a-z]{2,3}|wb\.ru)(?::\d+)?/catalog/(\d+)(?:[/?#]|$)",
    )
    .expect("catalog url pattern")
});

/// What the caller handed us: free-form product copy or a product page link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProductReference {
    RawText(String),
    ProductUrl { url: String, product_id: u64 },
}

impl ProductReference {
    pub fn classify(input: &str) -> Self {
        let trimmed = input.trim();
        match extract_product_id(trimmed) {
            Some(product_id) => ProductReference::ProductUrl {
                url: trimmed.to_string(),
                product_id,
            },
            None => ProductReference::RawText(trimmed.to_string()),
        }
    }

    pub fn is_url(&self) -> bool {
        matches!(self, ProductReference::ProductUrl { .. })
    }
}

/// Numeric catalog id from a marketplace product page URL, `None` for anything else.
pub fn extract_product_id(input: &str) -> Option<u64> {
    CATALOG_URL
        .captures(input.trim())
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<u64>().ok())
}
