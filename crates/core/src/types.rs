use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::GuardError;

/// Ad platforms a connector can bid on. Each connector owns its own guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    GoogleAds,
    MetaAds,
    #[serde(rename = "tiktok")]
    TikTok,
    #[serde(rename = "linkedin")]
    LinkedIn,
    AmazonAds,
    MicrosoftAds,
    Snapchat,
    Pinterest,
    Reddit,
    XAds,
}

impl Platform {
    pub const ALL: [Platform; 10] = [
        Platform::GoogleAds,
        Platform::MetaAds,
        Platform::TikTok,
        Platform::LinkedIn,
        Platform::AmazonAds,
        Platform::MicrosoftAds,
        Platform::Snapchat,
        Platform::Pinterest,
        Platform::Reddit,
        Platform::XAds,
    ];

    pub fn display_name(&self) -> &'static str {
        match self {
            Platform::GoogleAds => "Google Ads",
            Platform::MetaAds => "Meta Ads",
            Platform::TikTok => "TikTok Ads",
            Platform::LinkedIn => "LinkedIn Ads",
            Platform::AmazonAds => "Amazon Ads",
            Platform::MicrosoftAds => "Microsoft Advertising",
            Platform::Snapchat => "Snapchat Ads",
            Platform::Pinterest => "Pinterest Ads",
            Platform::Reddit => "Reddit Ads",
            Platform::XAds => "X Ads",
        }
    }

    /// Stable slug: config key, metric label and fallback history key.
    pub fn slug(&self) -> &'static str {
        match self {
            Platform::GoogleAds => "google_ads",
            Platform::MetaAds => "meta_ads",
            Platform::TikTok => "tiktok",
            Platform::LinkedIn => "linkedin",
            Platform::AmazonAds => "amazon_ads",
            Platform::MicrosoftAds => "microsoft_ads",
            Platform::Snapchat => "snapchat",
            Platform::Pinterest => "pinterest",
            Platform::Reddit => "reddit",
            Platform::XAds => "x_ads",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

impl FromStr for Platform {
    type Err = GuardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Platform::ALL
            .iter()
            .copied()
            .find(|p| p.slug().eq_ignore_ascii_case(s))
            .ok_or_else(|| GuardError::UnknownPlatform(s.to_string()))
    }
}

/// Where the value behind a bid decision came from. Carried on every
/// decision so audits can separate degraded-mode bids from normal ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    /// Primary predictor answered in time.
    Ai,
    /// Breaker was open; heuristic fallback used without calling the predictor.
    Fallback,
    /// Predictor failed and that failure opened the breaker.
    FallbackAfterCircuitOpen,
}

impl DecisionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionSource::Ai => "ai",
            DecisionSource::Fallback => "fallback",
            DecisionSource::FallbackAfterCircuitOpen => "fallback_after_circuit_open",
        }
    }

    pub fn is_fallback(&self) -> bool {
        !matches!(self, DecisionSource::Ai)
    }
}

impl fmt::Display for DecisionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
