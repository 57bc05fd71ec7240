use crate::http::{env_bool, env_u64};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";
pub const DEFAULT_ACCEPT_LANGUAGE: &str = "ru-RU,ru;q=0.9,en-US;q=0.8";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    BasketMirror,
    StaticMirror,
    DetailApi,
    PageState,
    PageLdJson,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::BasketMirror => "basket_mirror",
            ProviderKind::StaticMirror => "static_mirror",
            ProviderKind::DetailApi => "detail_api",
            ProviderKind::PageState => "page_state",
            ProviderKind::PageLdJson => "page_ld_json",
        }
    }
}

/// A family of numbered, interchangeable hosts serving the per-product card
/// descriptor. `{n}` is the two-digit host number, `{vol}`/`{part}` the shard.
#[derive(Debug, Clone)]
pub struct MirrorFamily {
    pub kind: ProviderKind,
    pub template: String,
}

impl MirrorFamily {
    pub fn url(&self, host_number: u8, product_id: u64) -> String {
        let shard = Shard::of(product_id);
        self.template
            .replace("{n}", &format!("{host_number:02}"))
            .replace("{vol}", &shard.volume.to_string())
            .replace("{part}", &shard.partition.to_string())
            .replace("{id}", &product_id.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shard {
    pub volume: u64,
    pub partition: u64,
}

impl Shard {
    pub fn of(product_id: u64) -> Self {
        Self {
            volume: product_id / 100_000,
            partition: product_id / 1_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub user_agent: String,
    pub accept_language: String,
    pub cookies: Option<String>,
    pub probe_timeout: Duration,
    pub page_timeout: Duration,
    pub mirror_count: u8,
    pub mirror_families: Vec<MirrorFamily>,
    pub detail_api_template: String,
    pub min_text_chars: usize,
    pub race_mirrors: bool,
    pub challenge_retries: u32,
    pub challenge_pause: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            accept_language: DEFAULT_ACCEPT_LANGUAGE.to_string(),
            cookies: None,
            probe_timeout: Duration::from_secs(6),
            page_timeout: Duration::from_secs(8),
            mirror_count: 12,
            mirror_families: vec![
                MirrorFamily {
                    kind: ProviderKind::BasketMirror,
                    template: "https://basket-{n}.wbbasket.ru/vol{vol}/part{part}/{id}/info/ru/card.json"
                        .to_string(),
                },
                MirrorFamily {
                    kind: ProviderKind::StaticMirror,
                    template:
                        "https://static-basket-{n}.wb.ru/vol{vol}/part{part}/{id}/info/ru/card.json"
                            .to_string(),
                },
            ],
            detail_api_template: "https://card.wb.ru/cards/detail?appType=1&curr=rub&nm={id}"
                .to_string(),
            min_text_chars: 60,
            race_mirrors: false,
            challenge_retries: 2,
            challenge_pause: Duration::from_millis(1000),
        }
    }
}

impl FetchConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            user_agent: std::env::var("WB_UA").unwrap_or(defaults.user_agent),
            accept_language: std::env::var("WB_LANG").unwrap_or(defaults.accept_language),
            cookies: std::env::var("WB_COOKIES")
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
            probe_timeout: Duration::from_secs(env_u64("WB_PROBE_TIMEOUT_SECS", 6).max(1)),
            page_timeout: Duration::from_secs(env_u64("WB_PAGE_TIMEOUT_SECS", 8).max(1)),
            mirror_count: env_u64("WB_MIRROR_COUNT", 12).clamp(1, 32) as u8,
            min_text_chars: env_u64("WB_MIN_TEXT_CHARS", 60) as usize,
            race_mirrors: env_bool("WB_RACE_MIRRORS", false),
            challenge_retries: env_u64("WB_CHALLENGE_RETRIES", 2) as u32,
            ..defaults
        }
    }

    pub fn detail_api_url(&self, product_id: u64) -> String {
        self.detail_api_template
            .replace("{id}", &product_id.to_string())
    }
}
