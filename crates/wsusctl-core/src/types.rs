//! Domain types passed between the executor, the scheduler and the CLI.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Result, WsusError};

/// Named parameters handed to a scripted operation.
pub type OperationParams = BTreeMap<String, serde_json::Value>;

/// Structured result of a scripted operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperationOutput {
    /// Parsed stdout (JSON when the script emitted JSON, a string otherwise).
    pub data: serde_json::Value,
    /// Informational lines the script wrote besides its payload.
    #[serde(default)]
    pub messages: Vec<String>,
}

impl OperationOutput {
    pub fn new(data: serde_json::Value) -> Self {
        Self {
            data,
            messages: Vec::new(),
        }
    }

    /// Decode the payload into a typed value.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.data.clone()).map_err(|e| {
            WsusError::Validation(format!("Unexpected operation output: {e}"))
        })
    }
}

/// One update as reported by the listing scripts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateInfo {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub kb_article: String,
    #[serde(default)]
    pub classification: String,
    #[serde(default)]
    pub release_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_superseded: bool,
    #[serde(default)]
    pub is_declined: bool,
    #[serde(default)]
    pub is_approved: bool,
}

/// Installation telemetry for one update across a set of groups.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallationCounts {
    #[serde(default)]
    pub successful: u32,
    #[serde(default)]
    pub failed: u32,
    #[serde(default)]
    pub pending: u32,
}

/// Columns an update list can be sorted by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateSortField {
    Title,
    KbArticle,
    Classification,
    ReleaseDate,
}

impl UpdateSortField {
    pub fn compare(&self, a: &UpdateInfo, b: &UpdateInfo) -> Ordering {
        match self {
            UpdateSortField::Title => a.title.to_lowercase().cmp(&b.title.to_lowercase()),
            UpdateSortField::KbArticle => a.kb_article.cmp(&b.kb_article),
            UpdateSortField::Classification => a.classification.cmp(&b.classification),
            // Undated updates sort first.
            UpdateSortField::ReleaseDate => a.release_date.cmp(&b.release_date),
        }
    }
}

impl std::str::FromStr for UpdateSortField {
    type Err = WsusError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "title" => Ok(UpdateSortField::Title),
            "kb" | "kb_article" => Ok(UpdateSortField::KbArticle),
            "classification" => Ok(UpdateSortField::Classification),
            "release_date" | "date" => Ok(UpdateSortField::ReleaseDate),
            other => Err(WsusError::Validation(format!("Unknown sort field: {other}"))),
        }
    }
}

/// Stable sort, ties keep their listing order.
pub fn sort_updates(updates: &mut [UpdateInfo], field: UpdateSortField, descending: bool) {
    updates.sort_by(|a, b| {
        let ord = field.compare(a, b);
        if descending { ord.reverse() } else { ord }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn update(id: &str, title: &str, kb: &str, day: Option<u32>) -> UpdateInfo {
        UpdateInfo {
            id: id.into(),
            title: title.into(),
            kb_article: kb.into(),
            classification: "Security Updates".into(),
            release_date: day.map(|d| Utc.with_ymd_and_hms(2026, 3, d, 0, 0, 0).unwrap()),
            is_superseded: false,
            is_declined: false,
            is_approved: false,
        }
    }

    #[test]
    fn test_sort_by_title_case_insensitive() {
        let mut list = vec![
            update("1", "windows update", "KB2", None),
            update("2", "Office update", "KB1", None),
        ];
        sort_updates(&mut list, UpdateSortField::Title, false);
        assert_eq!(list[0].id, "2");
    }

    #[test]
    fn test_sort_by_release_date_descending() {
        let mut list = vec![
            update("a", "A", "KB1", Some(1)),
            update("b", "B", "KB2", Some(20)),
            update("c", "C", "KB3", None),
        ];
        sort_updates(&mut list, UpdateSortField::ReleaseDate, true);
        let ids: Vec<_> = list.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
    }

    #[test]
    fn test_sort_field_from_str() {
        assert_eq!("kb".parse::<UpdateSortField>().unwrap(), UpdateSortField::KbArticle);
        assert_eq!(
            "release-date".parse::<UpdateSortField>().unwrap(),
            UpdateSortField::ReleaseDate
        );
        assert!("size".parse::<UpdateSortField>().is_err());
    }

    #[test]
    fn test_update_info_from_script_json() {
        let output = OperationOutput::new(serde_json::json!([
            {"id": "u1", "title": "2026-03 Cumulative Update", "kbArticle": "KB5030000", "isSuperseded": true}
        ]));
        let updates: Vec<UpdateInfo> = output.parse().unwrap();
        assert_eq!(updates[0].kb_article, "KB5030000");
        assert!(updates[0].is_superseded);
        assert!(!updates[0].is_declined);
    }
}
