//! Staged-approval promotion tracking.
//!
//! ```text
//! InTesting ──(delay elapsed + success criteria)──▶ ReadyForPromotion ──▶ Promoted
//!     │
//!     └──(failures > allowed, abort_on_failures)──▶ Blocked
//!
//! any status except Promoted ──(manual)──▶ Skipped
//! ```
//!
//! The tracker only applies policy. Installation counts come from outside
//! and the actual production approval is performed by the task handler.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use wsusctl_core::error::{Result, WsusError};
use wsusctl_core::types::{InstallationCounts, UpdateInfo};

use crate::tasks::StagedApprovalConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackingStatus {
    InTesting,
    ReadyForPromotion,
    Promoted,
    Blocked,
    Skipped,
}

impl TrackingStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TrackingStatus::Promoted | TrackingStatus::Blocked | TrackingStatus::Skipped
        )
    }
}

impl std::fmt::Display for TrackingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackingStatus::InTesting => write!(f, "in testing"),
            TrackingStatus::ReadyForPromotion => write!(f, "ready for promotion"),
            TrackingStatus::Promoted => write!(f, "promoted"),
            TrackingStatus::Blocked => write!(f, "blocked"),
            TrackingStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// One update under test, owned by a staged-approval task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingEntry {
    pub update_id: String,
    pub update_title: String,
    #[serde(default)]
    pub kb_article: String,
    pub task_id: String,
    pub status: TrackingStatus,
    pub approved_for_test_at: DateTime<Utc>,
    pub eligible_for_promotion_at: DateTime<Utc>,
    #[serde(default)]
    pub promoted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub successful_installations: u32,
    #[serde(default)]
    pub failed_installations: u32,
    #[serde(default)]
    pub pending_installations: u32,
    #[serde(default)]
    pub status_message: String,
}

impl TrackingEntry {
    /// Start tracking an update that was just approved for the test groups.
    pub fn new(
        task_id: &str,
        update: &UpdateInfo,
        approved_at: DateTime<Utc>,
        config: &StagedApprovalConfig,
    ) -> Self {
        Self {
            update_id: update.id.clone(),
            update_title: update.title.clone(),
            kb_article: update.kb_article.clone(),
            task_id: task_id.to_string(),
            status: TrackingStatus::InTesting,
            approved_for_test_at: approved_at,
            eligible_for_promotion_at: approved_at
                + Duration::days(config.promotion_delay_days as i64),
            promoted_at: None,
            successful_installations: 0,
            failed_installations: 0,
            pending_installations: 0,
            status_message: format!("Approved for {}", config.test_groups.join(", ")),
        }
    }

    pub fn counts(&self) -> InstallationCounts {
        InstallationCounts {
            successful: self.successful_installations,
            failed: self.failed_installations,
            pending: self.pending_installations,
        }
    }

    /// Manual override. Allowed from every status except Promoted.
    pub fn skip(&mut self) -> Result<()> {
        match self.status {
            TrackingStatus::Promoted => Err(WsusError::Validation(format!(
                "Update {} was already promoted",
                self.update_id
            ))),
            TrackingStatus::Skipped => Err(WsusError::AlreadyInState(format!(
                "Update {} is already skipped",
                self.update_id
            ))),
            _ => {
                self.status = TrackingStatus::Skipped;
                self.status_message = "Skipped by operator".into();
                Ok(())
            }
        }
    }

    /// Record a successful production approval.
    pub fn mark_promoted(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.status != TrackingStatus::ReadyForPromotion {
            return Err(WsusError::Validation(format!(
                "Update {} is {}, not ready for promotion",
                self.update_id, self.status
            )));
        }
        self.status = TrackingStatus::Promoted;
        self.promoted_at = Some(now);
        self.status_message = format!("Promoted at {}", now.format("%Y-%m-%d %H:%M UTC"));
        Ok(())
    }
}

/// Applies a task's staged-approval policy to its tracking entries.
pub struct PromotionTracker<'a> {
    config: &'a StagedApprovalConfig,
}

impl<'a> PromotionTracker<'a> {
    pub fn new(config: &'a StagedApprovalConfig) -> Self {
        Self { config }
    }

    /// Refresh counters and move the entry forward if the policy allows.
    /// Returns the resulting status. Terminal entries are left untouched.
    pub fn evaluate(
        &self,
        entry: &mut TrackingEntry,
        counts: InstallationCounts,
        now: DateTime<Utc>,
    ) -> TrackingStatus {
        if entry.status.is_terminal() {
            return entry.status;
        }

        entry.successful_installations = counts.successful;
        entry.failed_installations = counts.failed;
        entry.pending_installations = counts.pending;

        if entry.status != TrackingStatus::InTesting {
            return entry.status;
        }

        // Failures short-circuit promotion.
        if self.config.abort_on_failures && counts.failed > self.config.max_allowed_failures {
            entry.status = TrackingStatus::Blocked;
            entry.status_message = format!(
                "Blocked: {} failed installations (max {})",
                counts.failed, self.config.max_allowed_failures
            );
            return entry.status;
        }

        if now < entry.eligible_for_promotion_at {
            let remaining = entry.eligible_for_promotion_at - now;
            entry.status_message = format!(
                "Testing: {} succeeded, {} pending, eligible in {}h",
                counts.successful,
                counts.pending,
                remaining.num_hours().max(0)
            );
            return entry.status;
        }

        if self.config.require_successful_installations
            && counts.successful < self.config.minimum_successful_installations
        {
            entry.status_message = format!(
                "Waiting for installations: {} of {} required",
                counts.successful, self.config.minimum_successful_installations
            );
            return entry.status;
        }

        entry.status = TrackingStatus::ReadyForPromotion;
        entry.status_message = format!(
            "Ready: {} succeeded, {} failed",
            counts.successful, counts.failed
        );
        entry.status
    }

    /// Updates to propose for decline because a newer revision replaces them.
    /// Independent of promotion status.
    pub fn superseded_to_decline<'u>(&self, updates: &'u [UpdateInfo]) -> Vec<&'u UpdateInfo> {
        if !self.config.decline_superseded_updates {
            return Vec::new();
        }
        updates
            .iter()
            .filter(|u| u.is_superseded && !u.is_declined)
            .collect()
    }

    /// Whether an unapproved update should enter testing.
    pub fn accepts(&self, update: &UpdateInfo) -> bool {
        if update.is_declined || update.is_superseded || update.is_approved {
            return false;
        }
        self.config.classifications.is_empty()
            || self
                .config
                .classifications
                .iter()
                .any(|c| c.eq_ignore_ascii_case(&update.classification))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(id: &str) -> UpdateInfo {
        UpdateInfo {
            id: id.into(),
            title: format!("Update {id}"),
            kb_article: "KB5001".into(),
            classification: "Security Updates".into(),
            release_date: None,
            is_superseded: false,
            is_declined: false,
            is_approved: false,
        }
    }

    fn config() -> StagedApprovalConfig {
        StagedApprovalConfig {
            promotion_delay_days: 3,
            require_successful_installations: true,
            minimum_successful_installations: 5,
            abort_on_failures: true,
            max_allowed_failures: 2,
            ..StagedApprovalConfig::default()
        }
    }

    fn counts(successful: u32, failed: u32) -> InstallationCounts {
        InstallationCounts {
            successful,
            failed,
            pending: 0,
        }
    }

    #[test]
    fn test_eligibility_needs_delay_and_successes() {
        let cfg = config();
        let tracker = PromotionTracker::new(&cfg);
        let t0 = Utc::now();
        let mut entry = TrackingEntry::new("task", &update("u1"), t0, &cfg);
        assert_eq!(entry.eligible_for_promotion_at, t0 + Duration::days(3));

        let early = t0 + Duration::days(1);
        assert_eq!(tracker.evaluate(&mut entry, counts(50, 0), early), TrackingStatus::InTesting);

        let later = t0 + Duration::days(3);
        assert_eq!(tracker.evaluate(&mut entry, counts(4, 0), later), TrackingStatus::InTesting);
        assert!(entry.status_message.contains("4 of 5"));

        assert_eq!(
            tracker.evaluate(&mut entry, counts(5, 0), later),
            TrackingStatus::ReadyForPromotion
        );
        assert_eq!(entry.successful_installations, 5);
    }

    #[test]
    fn test_blocking_takes_precedence() {
        let cfg = config();
        let tracker = PromotionTracker::new(&cfg);
        let t0 = Utc::now();
        let mut entry = TrackingEntry::new("task", &update("u1"), t0, &cfg);

        let status = tracker.evaluate(&mut entry, counts(100, 3), t0 + Duration::days(30));
        assert_eq!(status, TrackingStatus::Blocked);

        // Terminal: further evaluation changes nothing.
        tracker.evaluate(&mut entry, counts(100, 0), t0 + Duration::days(31));
        assert_eq!(entry.status, TrackingStatus::Blocked);
        assert_eq!(entry.failed_installations, 3);
    }

    #[test]
    fn test_failures_ignored_without_abort() {
        let cfg = StagedApprovalConfig {
            abort_on_failures: false,
            ..config()
        };
        let tracker = PromotionTracker::new(&cfg);
        let t0 = Utc::now();
        let mut entry = TrackingEntry::new("task", &update("u1"), t0, &cfg);
        let status = tracker.evaluate(&mut entry, counts(5, 40), t0 + Duration::days(3));
        assert_eq!(status, TrackingStatus::ReadyForPromotion);
    }

    #[test]
    fn test_promotion_and_skip_transitions() {
        let cfg = config();
        let t0 = Utc::now();
        let mut entry = TrackingEntry::new("task", &update("u1"), t0, &cfg);
        assert!(entry.mark_promoted(t0).is_err());

        entry.status = TrackingStatus::ReadyForPromotion;
        entry.mark_promoted(t0).unwrap();
        assert_eq!(entry.promoted_at, Some(t0));
        assert!(entry.skip().is_err());

        let mut blocked = TrackingEntry::new("task", &update("u2"), t0, &cfg);
        blocked.status = TrackingStatus::Blocked;
        blocked.skip().unwrap();
        assert!(matches!(blocked.skip(), Err(WsusError::AlreadyInState(_))));
    }

    #[test]
    fn test_superseded_uses_superseded_flag() {
        let mut cfg = config();
        let mut declined_only = update("declined");
        declined_only.is_declined = true;
        let mut superseded = update("superseded");
        superseded.is_superseded = true;
        let updates = vec![update("plain"), declined_only, superseded];

        assert!(PromotionTracker::new(&cfg).superseded_to_decline(&updates).is_empty());

        cfg.decline_superseded_updates = true;
        let tracker = PromotionTracker::new(&cfg);
        let ids: Vec<_> = tracker
            .superseded_to_decline(&updates)
            .iter()
            .map(|u| u.id.as_str())
            .collect();
        assert_eq!(ids, vec!["superseded"]);
    }

    #[test]
    fn test_accepts_filters_classification() {
        let mut cfg = config();
        cfg.classifications = vec!["critical updates".into()];
        let tracker = PromotionTracker::new(&cfg);
        assert!(!tracker.accepts(&update("u1")));

        let mut critical = update("u2");
        critical.classification = "Critical Updates".into();
        assert!(tracker.accepts(&critical));
        critical.is_approved = true;
        assert!(!tracker.accepts(&critical));
    }
}
