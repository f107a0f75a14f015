//! Core domain model for PRH: participants, scan windows, run records and
//! the URL conventions of the results site.

use std::fmt;

use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "prh-core";

/// Days re-scanned before the last successful watermark.
pub const DEFAULT_LOOKBACK_DAYS: u32 = 15;

pub const DEFAULT_RESULTS_BASE_URL: &str = "https://www.parkrun.com";
pub const DEFAULT_PROFILE_BASE_URL: &str = "https://www.parkrun.org.uk";

/// Opaque site-wide participant token taken from a profile link.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ParticipantId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Club whose members are harvested from the consolidated results page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Club {
    pub club_num: u32,
    /// Matched as a case-sensitive substring of a results row.
    pub name: String,
}

impl Default for Club {
    fn default() -> Self {
        Self {
            club_num: 1832,
            name: "Bellahouston Harriers".to_string(),
        }
    }
}

/// Inclusive range of event dates scanned by one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeWindow {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

impl ScrapeWindow {
    /// Window from `watermark - lookback` through `today`.
    ///
    /// Without a watermark the run bootstraps as if the watermark were today.
    /// The start never passes the end, so a watermark in the future still
    /// scans `today`.
    pub fn compute(
        watermark: Option<DateTime<Utc>>,
        today: NaiveDate,
        lookback_days: u32,
    ) -> Self {
        let anchor = watermark.map(|ts| ts.date_naive()).unwrap_or(today);
        let start = anchor
            .checked_sub_days(Days::new(u64::from(lookback_days)))
            .unwrap_or(NaiveDate::MIN);
        Self {
            start_date: start.min(today),
            end_date: today,
        }
    }

    pub fn days(&self) -> impl Iterator<Item = NaiveDate> {
        let end = self.end_date;
        self.start_date.iter_days().take_while(move |d| *d <= end)
    }

    pub fn len_days(&self) -> usize {
        ((self.end_date - self.start_date).num_days() + 1).max(0) as usize
    }
}

impl fmt::Display for ScrapeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}..={}",
            self.start_date.format("%Y-%m-%d"),
            self.end_date.format("%Y-%m-%d")
        )
    }
}

/// One row of scrape bookkeeping; successful rows are watermarks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeRunRecord {
    pub timestamp: DateTime<Utc>,
    pub new_participant_count: usize,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantProfile {
    pub id: ParticipantId,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FetchStatus {
    Success,
    /// Network failure, exhausted retries or a non-retryable HTTP status.
    TransientFailure,
    /// Bot protection survived the browser tier, or the browser tier failed.
    Blocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FetchTier {
    Plain,
    Rendered,
}

/// Result of a single adaptive fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchOutcome {
    pub html: Option<String>,
    pub status: FetchStatus,
    pub tier: FetchTier,
}

impl FetchOutcome {
    pub fn success(html: String, tier: FetchTier) -> Self {
        Self {
            html: Some(html),
            status: FetchStatus::Success,
            tier,
        }
    }

    pub fn transient_failure(tier: FetchTier) -> Self {
        Self {
            html: None,
            status: FetchStatus::TransientFailure,
            tier,
        }
    }

    pub fn blocked() -> Self {
        Self {
            html: None,
            status: FetchStatus::Blocked,
            tier: FetchTier::Rendered,
        }
    }

    pub fn ok(&self) -> bool {
        self.status == FetchStatus::Success
    }
}

/// Host bases for the two page families; paths are fixed by the site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteUrls {
    pub results_base: String,
    pub profile_base: String,
}

impl Default for SiteUrls {
    fn default() -> Self {
        Self {
            results_base: DEFAULT_RESULTS_BASE_URL.to_string(),
            profile_base: DEFAULT_PROFILE_BASE_URL.to_string(),
        }
    }
}

impl SiteUrls {
    pub fn results_url(&self, club_num: u32, date: NaiveDate) -> String {
        format!(
            "{}/results/consolidatedclub/?clubNum={}&eventdate={}",
            self.results_base.trim_end_matches('/'),
            club_num,
            date.format("%Y-%m-%d")
        )
    }

    pub fn profile_url(&self, id: &ParticipantId) -> String {
        format!(
            "{}/parkrunner/{}/",
            self.profile_base.trim_end_matches('/'),
            id
        )
    }
}
