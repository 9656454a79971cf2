use chrono::{DateTime, Duration, Local, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CATEGORY: &str = "Allgemein";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Block {
    #[serde(default, alias = "_id", skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub title: String,
    pub start_iso: DateTime<Utc>,
    pub end_iso: DateTime<Utc>,
    pub duration_minutes: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default)]
    pub fixed: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Step {
    pub title: String,
    pub duration_minutes: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Preview {
    pub steps: Vec<Step>,
    pub suggested_blocks: Vec<Block>,
    #[serde(default)]
    pub conflicts: Vec<String>,
}

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct AdjustRequest {
    pub block_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_start_iso: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_end_iso: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extend_minutes: Option<i64>,
}

impl Block {
    /// Move both endpoints by `minutes`; duration stays unchanged.
    pub fn shifted(&self, minutes: i64) -> AdjustRequest {
        let delta = Duration::minutes(minutes);
        AdjustRequest {
            block_id: self.id.clone(),
            new_start_iso: Some(format_iso(&(self.start_iso + delta))),
            new_end_iso: Some(format_iso(&(self.end_iso + delta))),
            extend_minutes: None,
        }
    }

    /// Grow the block by `minutes`; the backend recomputes the end itself.
    pub fn extended(&self, minutes: i64) -> AdjustRequest {
        AdjustRequest {
            block_id: self.id.clone(),
            new_start_iso: None,
            new_end_iso: None,
            extend_minutes: Some(minutes),
        }
    }

    pub fn category_label(&self) -> &str {
        self.category.as_deref().unwrap_or(DEFAULT_CATEGORY)
    }
}

impl Preview {
    /// Category sent on confirm: whatever the first suggested block carries.
    /// Backend-defined convention, passed through untouched.
    pub fn confirm_category(&self) -> Option<String> {
        self.suggested_blocks
            .first()
            .and_then(|block| block.category.clone())
    }
}

fn format_iso(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn format_local_time(ts: &DateTime<Utc>) -> String {
    ts.with_timezone(&Local).format("%H:%M").to_string()
}

pub fn parse_priority(input: &str) -> Option<u32> {
    match input.trim().parse::<u32>() {
        Ok(0) | Err(_) => None,
        Ok(value) => Some(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn block(start: &str, end: &str) -> Block {
        Block {
            id: "b-1".into(),
            title: "Lernen".into(),
            start_iso: start.parse().unwrap(),
            end_iso: end.parse().unwrap(),
            duration_minutes: 60,
            category: None,
            fixed: false,
        }
    }

    #[test]
    fn shift_moves_both_endpoints_and_omits_extend() {
        let request = block("2024-01-01T09:00:00Z", "2024-01-01T10:00:00Z").shifted(15);
        assert_eq!(request.new_start_iso.as_deref(), Some("2024-01-01T09:15:00Z"));
        assert_eq!(request.new_end_iso.as_deref(), Some("2024-01-01T10:15:00Z"));
        assert_eq!(request.extend_minutes, None);

        let body = serde_json::to_value(&request).unwrap();
        assert!(body.get("extend_minutes").is_none());
    }

    #[test]
    fn negative_shift_moves_backwards() {
        let request = block("2024-01-01T09:00:00Z", "2024-01-01T10:00:00Z").shifted(-15);
        assert_eq!(request.new_start_iso.as_deref(), Some("2024-01-01T08:45:00Z"));
        assert_eq!(request.new_end_iso.as_deref(), Some("2024-01-01T09:45:00Z"));
    }

    #[test]
    fn extend_sends_minutes_only() {
        let request = block("2024-01-01T09:00:00Z", "2024-01-01T10:00:00Z").extended(15);
        assert_eq!(request.extend_minutes, Some(15));

        let body = serde_json::to_value(&request).unwrap();
        assert!(body.get("new_start_iso").is_none());
        assert!(body.get("new_end_iso").is_none());
        assert_eq!(body.get("extend_minutes"), Some(&serde_json::json!(15)));
    }

    #[test]
    fn block_accepts_mongo_style_id_alias() {
        let parsed: Block = serde_json::from_value(serde_json::json!({
            "_id": "abc123",
            "title": "Sport",
            "start_iso": "2024-01-01T18:00:00Z",
            "end_iso": "2024-01-01T19:00:00Z",
            "duration_minutes": 60
        }))
        .unwrap();
        assert_eq!(parsed.id, "abc123");
        assert_eq!(parsed.category, None);
        assert!(!parsed.fixed);
        assert_eq!(parsed.category_label(), DEFAULT_CATEGORY);
    }

    #[test]
    fn suggested_block_without_id_parses_to_empty_id() {
        let parsed: Block = serde_json::from_value(serde_json::json!({
            "title": "Ads erstellen",
            "start_iso": "2024-01-01T09:00:00Z",
            "end_iso": "2024-01-01T09:45:00Z",
            "duration_minutes": 45,
            "category": "Arbeit"
        }))
        .unwrap();
        assert_eq!(parsed.id, "");
        assert_eq!(parsed.category_label(), "Arbeit");
    }

    #[test]
    fn empty_id_is_left_out_when_a_block_is_sent_back() {
        let suggested: Block = serde_json::from_value(serde_json::json!({
            "title": "Recherche",
            "start_iso": "2024-01-01T09:00:00Z",
            "end_iso": "2024-01-01T09:30:00Z",
            "duration_minutes": 30
        }))
        .unwrap();
        let body = serde_json::to_value(&suggested).unwrap();
        assert!(body.get("id").is_none());

        let stored = block("2024-01-01T09:00:00Z", "2024-01-01T10:00:00Z");
        let body = serde_json::to_value(&stored).unwrap();
        assert_eq!(body.get("id"), Some(&serde_json::json!("b-1")));
    }

    #[test]
    fn preview_defaults_conflicts_to_empty() {
        let parsed: Preview = serde_json::from_value(serde_json::json!({
            "steps": [{"title": "Recherche", "duration_minutes": 30}],
            "suggested_blocks": []
        }))
        .unwrap();
        assert!(parsed.conflicts.is_empty());
        assert_eq!(parsed.steps[0].priority, None);
        assert_eq!(parsed.confirm_category(), None);
    }

    #[test]
    fn preview_without_steps_is_rejected() {
        let result: Result<Preview, _> = serde_json::from_value(serde_json::json!({
            "suggested_blocks": []
        }));
        assert!(result.is_err());
    }

    #[test]
    fn confirm_category_comes_from_first_suggested_block() {
        let mut first = block("2024-01-01T09:00:00Z", "2024-01-01T10:00:00Z");
        first.category = Some("Arbeit".into());
        let second = block("2024-01-01T10:00:00Z", "2024-01-01T11:00:00Z");
        let preview = Preview {
            steps: vec![],
            suggested_blocks: vec![first, second],
            conflicts: vec![],
        };
        assert_eq!(preview.confirm_category().as_deref(), Some("Arbeit"));
    }

    #[test]
    fn priority_parses_positive_numbers_only() {
        assert_eq!(parse_priority("3"), Some(3));
        assert_eq!(parse_priority(" 5 "), Some(5));
        assert_eq!(parse_priority("0"), None);
        assert_eq!(parse_priority(""), None);
        assert_eq!(parse_priority("hoch"), None);
    }

    #[test]
    fn local_time_renders_hour_and_minute() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 9, 5, 0).unwrap();
        let rendered = format_local_time(&ts);
        assert_eq!(rendered.len(), 5);
        assert_eq!(rendered.as_bytes()[2], b':');
    }
}
