use crate::metrics;
use crate::wb::config::{FetchConfig, MirrorFamily, ProviderKind};
use crate::wb::normalize::{char_len, html_to_text};
use crate::wb::source::{ContentSource, ProviderError, SourceReply};
use futures_util::stream::{FuturesUnordered, StreamExt};
use once_cell::sync::Lazy;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Description fields in preference order, richest first.
const DESCRIPTION_FIELDS: &[&str] = &[
    "descriptionHtml",
    "descriptionFull",
    "description",
    "descriptionShort",
];
const NAME_FIELDS: &[&str] = &["name", "imt_name", "object"];
const DESCRIPTOR_ID_FIELDS: &[&str] = &["nm_id", "nmId", "id"];
const LD_JSON_ID_FIELDS: &[&str] = &["sku", "productID"];
const CHALLENGE_MARKERS: &[&str] = &[
    "ddos-guard",
    "captcha",
    "__ddginit",
    "проверка безопасности",
];

static NEXT_DATA: Lazy<Selector> =
    Lazy::new(|| Selector::parse("script#__NEXT_DATA__").expect("next data selector"));
static LD_JSON: Lazy<Selector> = Lazy::new(|| {
    Selector::parse(r#"script[type="application/ld+json"]"#).expect("ld+json selector")
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardContent {
    pub name: String,
    pub description_html: String,
    pub description_text: String,
}

impl CardContent {
    /// Text handed to the generator: product name, blank line, plain description.
    pub fn generation_input(&self) -> String {
        format!("{}\n\n{}", self.name, self.description_text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderAttempt {
    pub provider: ProviderKind,
    pub endpoint: String,
    pub succeeded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FetchReport {
    pub product_id: u64,
    pub card: CardContent,
    pub provider: ProviderKind,
    pub endpoint: String,
    pub attempts: Vec<ProviderAttempt>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("no provider produced a usable description for product {product_id}")]
    Exhausted {
        product_id: u64,
        attempts: Vec<ProviderAttempt>,
    },
}

#[derive(Debug, Clone)]
struct Candidate {
    name: String,
    description_html: String,
}

pub struct CardFetcher {
    source: Arc<dyn ContentSource>,
    config: Arc<FetchConfig>,
}

impl CardFetcher {
    pub fn new(source: Arc<dyn ContentSource>, config: FetchConfig) -> Self {
        Self {
            source,
            config: Arc::new(config),
        }
    }

    /// Walks the provider tiers in order and returns the first card whose
    /// normalized description clears the acceptance threshold.
    pub async fn fetch(&self, product_id: u64, page_url: &str) -> Result<FetchReport, FetchError> {
        let mut attempts = Vec::new();

        for family in &self.config.mirror_families {
            let accepted = if self.config.race_mirrors {
                self.race_family(family, product_id, &mut attempts).await
            } else {
                self.probe_family(family, product_id, &mut attempts).await
            };
            if let Some((endpoint, card)) = accepted {
                return Ok(self.report(product_id, card, family.kind, endpoint, attempts));
            }
            debug!(
                target: "wb.fetch",
                product_id,
                provider = family.kind.as_str(),
                "mirror_family_exhausted"
            );
        }

        let endpoint = self.config.detail_api_url(product_id);
        let outcome = self.probe_detail_api(&endpoint, product_id).await;
        if let Some(card) = self.settle(ProviderKind::DetailApi, &endpoint, outcome, &mut attempts) {
            return Ok(self.report(product_id, card, ProviderKind::DetailApi, endpoint, attempts));
        }

        if let Some((kind, card)) = self.probe_page(page_url, product_id, &mut attempts).await {
            return Ok(self.report(product_id, card, kind, page_url.to_string(), attempts));
        }

        warn!(
            target: "wb.fetch",
            product_id,
            attempts = attempts.len(),
            "card_fetch_exhausted"
        );
        Err(FetchError::Exhausted {
            product_id,
            attempts,
        })
    }

    async fn probe_family(
        &self,
        family: &MirrorFamily,
        product_id: u64,
        attempts: &mut Vec<ProviderAttempt>,
    ) -> Option<(String, CardContent)> {
        for host_number in 1..=self.config.mirror_count {
            let endpoint = family.url(host_number, product_id);
            let outcome = self.probe_descriptor(&endpoint, product_id).await;
            if let Some(card) = self.settle(family.kind, &endpoint, outcome, attempts) {
                return Some((endpoint, card));
            }
        }
        None
    }

    /// Same as `probe_family` but all hosts of the family are probed at once;
    /// the first accepted card wins and the remaining probes are dropped.
    async fn race_family(
        &self,
        family: &MirrorFamily,
        product_id: u64,
        attempts: &mut Vec<ProviderAttempt>,
    ) -> Option<(String, CardContent)> {
        let mut pending = (1..=self.config.mirror_count)
            .map(|host_number| {
                let endpoint = family.url(host_number, product_id);
                async move {
                    let outcome = self.probe_descriptor(&endpoint, product_id).await;
                    (endpoint, outcome)
                }
            })
            .collect::<FuturesUnordered<_>>();

        while let Some((endpoint, outcome)) = pending.next().await {
            if let Some(card) = self.settle(family.kind, &endpoint, outcome, attempts) {
                return Some((endpoint, card));
            }
        }
        None
    }

    /// The source is trusted to honour `timeout`, but a stalled one still
    /// counts as a timed-out probe.
    async fn get(&self, url: &str, timeout: Duration) -> Result<SourceReply, ProviderError> {
        match tokio::time::timeout(timeout, self.source.get(url, timeout)).await {
            Ok(reply) => reply,
            Err(_) => Err(ProviderError::Timeout(timeout.as_millis() as u64)),
        }
    }

    async fn probe_descriptor(
        &self,
        endpoint: &str,
        product_id: u64,
    ) -> Result<Candidate, ProviderError> {
        let reply = self.get(endpoint, self.config.probe_timeout).await?;
        if !reply.is_json() {
            return Err(ProviderError::NotJson(
                reply.content_type.unwrap_or_else(|| "none".into()),
            ));
        }
        let value: Value = serde_json::from_str(&reply.body)
            .map_err(|err| ProviderError::Malformed(err.to_string()))?;
        ensure_identity(&value, product_id, DESCRIPTOR_ID_FIELDS)?;
        let description_html = pick_string(&value, DESCRIPTION_FIELDS).ok_or(ProviderError::NoDescription)?;
        Ok(Candidate {
            name: pick_string(&value, NAME_FIELDS).unwrap_or_default(),
            description_html,
        })
    }

    async fn probe_detail_api(
        &self,
        endpoint: &str,
        product_id: u64,
    ) -> Result<Candidate, ProviderError> {
        let reply = self.get(endpoint, self.config.probe_timeout).await?;
        if !reply.is_json() {
            return Err(ProviderError::NotJson(
                reply.content_type.unwrap_or_else(|| "none".into()),
            ));
        }
        let value: Value = serde_json::from_str(&reply.body)
            .map_err(|err| ProviderError::Malformed(err.to_string()))?;
        let products = value
            .pointer("/data/products")
            .and_then(Value::as_array)
            .ok_or_else(|| ProviderError::Malformed("missing data.products".into()))?;
        select_detail_record(products, product_id)
    }

    async fn probe_page(
        &self,
        page_url: &str,
        product_id: u64,
        attempts: &mut Vec<ProviderAttempt>,
    ) -> Option<(ProviderKind, CardContent)> {
        let body = match self.load_page(page_url).await {
            Ok(body) => body,
            Err(err) => {
                self.settle(ProviderKind::PageState, page_url, Err(err), attempts);
                return None;
            }
        };

        let outcome = page_state_candidate(&body, product_id);
        if let Some(card) = self.settle(ProviderKind::PageState, page_url, outcome, attempts) {
            return Some((ProviderKind::PageState, card));
        }
        let outcome = ld_json_candidate(&body, product_id);
        self.settle(ProviderKind::PageLdJson, page_url, outcome, attempts)
            .map(|card| (ProviderKind::PageLdJson, card))
    }

    async fn load_page(&self, page_url: &str) -> Result<String, ProviderError> {
        let mut reply = self.get(page_url, self.config.page_timeout).await?;
        let mut retries = self.config.challenge_retries;
        while retries > 0 && looks_challenge(&reply.body) {
            debug!(target: "wb.fetch", url = page_url, retries, "challenge_page_retry");
            sleep(self.config.challenge_pause).await;
            reply = self.get(page_url, self.config.page_timeout).await?;
            retries -= 1;
        }
        if looks_challenge(&reply.body) {
            return Err(ProviderError::Challenge);
        }
        Ok(reply.body)
    }

    /// Records the probe outcome and turns an accepted candidate into card content.
    fn settle(
        &self,
        kind: ProviderKind,
        endpoint: &str,
        outcome: Result<Candidate, ProviderError>,
        attempts: &mut Vec<ProviderAttempt>,
    ) -> Option<CardContent> {
        let result = outcome.and_then(|candidate| self.finish(candidate));
        metrics::provider_probe(kind.as_str(), result.is_ok());
        match result {
            Ok(card) => {
                debug!(target: "wb.fetch", provider = kind.as_str(), endpoint, "provider_accepted");
                attempts.push(ProviderAttempt {
                    provider: kind,
                    endpoint: endpoint.to_string(),
                    succeeded: true,
                    error: None,
                });
                Some(card)
            }
            Err(err) => {
                debug!(
                    target: "wb.fetch",
                    provider = kind.as_str(),
                    endpoint,
                    error = %err,
                    "provider_skipped"
                );
                attempts.push(ProviderAttempt {
                    provider: kind,
                    endpoint: endpoint.to_string(),
                    succeeded: false,
                    error: Some(err.to_string()),
                });
                None
            }
        }
    }

    fn finish(&self, candidate: Candidate) -> Result<CardContent, ProviderError> {
        let description_text = html_to_text(&candidate.description_html);
        let found = char_len(&description_text);
        if found < self.config.min_text_chars {
            return Err(ProviderError::TooShort {
                found,
                required: self.config.min_text_chars,
            });
        }
        Ok(CardContent {
            name: candidate.name,
            description_html: candidate.description_html,
            description_text,
        })
    }

    fn report(
        &self,
        product_id: u64,
        mut card: CardContent,
        provider: ProviderKind,
        endpoint: String,
        attempts: Vec<ProviderAttempt>,
    ) -> FetchReport {
        if card.name.trim().is_empty() {
            card.name = product_id.to_string();
        }
        info!(
            target: "wb.fetch",
            product_id,
            provider = provider.as_str(),
            probes = attempts.len(),
            chars = char_len(&card.description_text),
            "card_fetched"
        );
        FetchReport {
            product_id,
            card,
            provider,
            endpoint,
            attempts,
        }
    }
}

/// A record qualifies when its `id` or `root` equals the requested identifier and
/// it carries a description. An exact `id` match wins; several `root`-only matches
/// with differing descriptions are rejected as ambiguous.
fn select_detail_record(products: &[Value], product_id: u64) -> Result<Candidate, ProviderError> {
    let matching = products
        .iter()
        .filter(|record| {
            embedded_id(record, &["id"]) == Some(product_id)
                || embedded_id(record, &["root"]) == Some(product_id)
        })
        .filter_map(|record| {
            pick_string(record, DESCRIPTION_FIELDS).map(|description| (record, description))
        })
        .collect::<Vec<_>>();

    let chosen = if let Some(exact) = matching
        .iter()
        .find(|(record, _)| embedded_id(record, &["id"]) == Some(product_id))
    {
        exact
    } else {
        match matching.as_slice() {
            [] => return Err(ProviderError::NoMatchingRecord),
            [only] => only,
            [first, rest @ ..] => {
                if rest.iter().all(|(_, description)| *description == first.1) {
                    first
                } else {
                    return Err(ProviderError::Ambiguous(matching.len()));
                }
            }
        }
    };

    Ok(Candidate {
        name: pick_string(chosen.0, NAME_FIELDS).unwrap_or_default(),
        description_html: chosen.1.clone(),
    })
}

fn page_state_candidate(body: &str, product_id: u64) -> Result<Candidate, ProviderError> {
    let raw = {
        let document = Html::parse_document(body);
        document
            .select(&NEXT_DATA)
            .next()
            .map(|node| node.text().collect::<String>())
    }
    .ok_or(ProviderError::NoDescription)?;

    let state: Value =
        serde_json::from_str(raw.trim()).map_err(|err| ProviderError::Malformed(err.to_string()))?;
    let products = state
        .pointer("/props/pageProps/initialState/products")
        .ok_or(ProviderError::NoDescription)?;

    let product = match products {
        Value::Array(items) => items
            .iter()
            .find(|item| embedded_id(item, DESCRIPTOR_ID_FIELDS) == Some(product_id))
            .ok_or(ProviderError::NoMatchingRecord)?,
        other => {
            ensure_identity(other, product_id, DESCRIPTOR_ID_FIELDS)?;
            other
        }
    };

    let description_html =
        pick_string(product, DESCRIPTION_FIELDS).ok_or(ProviderError::NoDescription)?;
    Ok(Candidate {
        name: pick_string(product, NAME_FIELDS).unwrap_or_default(),
        description_html,
    })
}

fn ld_json_candidate(body: &str, product_id: u64) -> Result<Candidate, ProviderError> {
    let blocks = {
        let document = Html::parse_document(body);
        document
            .select(&LD_JSON)
            .map(|node| node.text().collect::<String>())
            .collect::<Vec<_>>()
    };

    let mut last_error = ProviderError::NoDescription;
    for block in blocks {
        let Ok(data) = serde_json::from_str::<Value>(block.trim()) else {
            continue;
        };
        let items: Vec<&Value> = match &data {
            Value::Array(items) => items.iter().collect(),
            Value::Object(map) => match map.get("@graph").and_then(Value::as_array) {
                Some(graph) => graph.iter().collect(),
                None => vec![&data],
            },
            _ => continue,
        };
        for item in items {
            if !is_product_schema(item) {
                continue;
            }
            let Some(description) = pick_string(item, &["description"]) else {
                continue;
            };
            if let Err(err) = ensure_identity(item, product_id, LD_JSON_ID_FIELDS) {
                last_error = err;
                continue;
            }
            return Ok(Candidate {
                name: pick_string(item, &["name"]).unwrap_or_default(),
                description_html: description,
            });
        }
    }
    Err(last_error)
}

fn is_product_schema(item: &Value) -> bool {
    match item.get("@type") {
        Some(Value::String(kind)) => kind == "Product",
        Some(Value::Array(kinds)) => kinds.iter().any(|k| k.as_str() == Some("Product")),
        _ => false,
    }
}

fn looks_challenge(body: &str) -> bool {
    let lowered = body.to_lowercase();
    CHALLENGE_MARKERS.iter().any(|marker| lowered.contains(marker))
}

fn pick_string(value: &Value, fields: &[&str]) -> Option<String> {
    fields.iter().find_map(|field| {
        value
            .get(*field)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    })
}

fn embedded_id(value: &Value, fields: &[&str]) -> Option<u64> {
    fields.iter().find_map(|field| match value.get(*field)? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    })
}

/// A descriptor that names a different product is never accepted. Descriptors
/// without an embedded identifier pass.
fn ensure_identity(value: &Value, product_id: u64, fields: &[&str]) -> Result<(), ProviderError> {
    match embedded_id(value, fields) {
        Some(found) if found != product_id => Err(ProviderError::IdMismatch {
            expected: product_id,
            found,
        }),
        _ => Ok(()),
    }
}
