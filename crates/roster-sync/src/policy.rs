//! Re-ingest triggers for sources whose content hash did not change.

use chrono::{Duration, NaiveDateTime};
use roster_core::SourceDocument;

/// Decides whether an unchanged source should be ingested again anyway.
///
/// `kickoffs` are the stored upcoming match times of the document's team (empty for
/// ranking tables) and `now` is local wall-clock time, the clock league schedules use.
pub trait RescrapePolicy: Send + Sync {
    /// Whether the coordinator must load `kickoffs` before asking.
    fn wants_schedule(&self) -> bool {
        true
    }

    fn should_rescrape(&self, document: &SourceDocument, kickoffs: &[NaiveDateTime], now: NaiveDateTime) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoRescrape;

impl RescrapePolicy for NoRescrape {
    fn wants_schedule(&self) -> bool {
        false
    }

    fn should_rescrape(&self, _document: &SourceDocument, _kickoffs: &[NaiveDateTime], _now: NaiveDateTime) -> bool {
        false
    }
}

/// Re-ingests a team roster while `now` falls inside `[kickoff - before, kickoff + after]`
/// of any of its upcoming matches, so results land even if the page hash is stale.
#[derive(Debug, Clone, Copy)]
pub struct UpcomingMatchWindow {
    pub before: Duration,
    pub after: Duration,
}

impl Default for UpcomingMatchWindow {
    fn default() -> Self {
        Self {
            before: Duration::hours(2),
            after: Duration::hours(6),
        }
    }
}

impl RescrapePolicy for UpcomingMatchWindow {
    fn should_rescrape(&self, document: &SourceDocument, kickoffs: &[NaiveDateTime], now: NaiveDateTime) -> bool {
        document.team_name().is_some()
            && kickoffs
                .iter()
                .any(|kickoff| *kickoff - self.before <= now && now <= *kickoff + self.after)
    }
}
