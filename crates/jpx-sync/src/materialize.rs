use chrono::{DateTime, Duration, Utc};
use jpx_core::{
    format_utc, normalize_timestamp, parse_timestamp, FlatViewPosting, SourcePosting,
    DEFAULT_STATUS,
};
use serde_json::Value;

const UNKNOWN: &str = "Unknown";

/// Builds flat-view rows against a fixed run clock.
#[derive(Debug, Clone, Copy)]
pub struct Materializer {
    as_of: DateTime<Utc>,
    status_window: Duration,
}

impl Materializer {
    /// Windows too large for a duration saturate, so every posting in the
    /// past counts as recent.
    pub fn new(as_of: DateTime<Utc>, status_window_days: i64) -> Self {
        Self {
            as_of,
            status_window: Duration::try_days(status_window_days).unwrap_or(Duration::MAX),
        }
    }

    /// Default-fills absent fields and infers `status` from recency.
    ///
    /// Defaults apply only when a field is missing; a field that is present,
    /// even as `null`, is carried through unchanged.
    pub fn materialize(&self, posting: &SourcePosting, job_id: &str) -> FlatViewPosting {
        let text_or = |field: &str, default: &str| {
            posting
                .field(field)
                .cloned()
                .unwrap_or_else(|| Value::String(default.to_string()))
        };

        FlatViewPosting {
            id: job_id.to_string(),
            job_title: text_or("job_title", UNKNOWN),
            job_description: text_or("job_description", ""),
            normalized: true,
            normalized_at: format_utc(self.as_of),
            processed_date: normalize_timestamp(posting.processed_date(), self.as_of),
            company_name: text_or("company_name", UNKNOWN),
            company_size: text_or("company_size", UNKNOWN),
            location: text_or("location", UNKNOWN),
            remote_status: text_or("remote_status", UNKNOWN),
            salary_mentioned: posting
                .field("salary_mentioned")
                .cloned()
                .unwrap_or(Value::Bool(false)),
            salary_range: text_or("salary_range", UNKNOWN),
            seniority_level: text_or("seniority_level", UNKNOWN),
            status: self.status(posting),
        }
    }

    /// A present status is kept verbatim. An absent one becomes `Active` only
    /// when the processed time parses and lies within the window of the run clock.
    fn status(&self, posting: &SourcePosting) -> Option<Value> {
        if let Some(status) = posting.status() {
            return Some(status.clone());
        }
        let processed = parse_timestamp(posting.processed_date())?;
        (self.as_of - processed <= self.status_window)
            .then(|| Value::String(DEFAULT_STATUS.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn as_of() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap()
    }

    fn posting(value: Value) -> SourcePosting {
        match value {
            Value::Object(map) => SourcePosting::new(map),
            _ => panic!("posting fixture must be an object"),
        }
    }

    fn days_ago(days: i64) -> String {
        format_utc(as_of() - Duration::days(days))
    }

    #[test]
    fn absent_fields_take_defaults() {
        let flat = Materializer::new(as_of(), 30).materialize(&posting(json!({"id": "j1"})), "j1");
        let value = serde_json::to_value(&flat).unwrap();
        assert_eq!(
            value,
            json!({
                "Id": "j1",
                "job_title": "Unknown",
                "job_description": "",
                "normalized": true,
                "normalized_at": "2026-03-01T12:00:00+00:00",
                "processed_date": "2026-03-01T12:00:00+00:00",
                "company_name": "Unknown",
                "company_size": "Unknown",
                "location": "Unknown",
                "remote_status": "Unknown",
                "salary_mentioned": false,
                "salary_range": "Unknown",
                "seniority_level": "Unknown",
            })
        );
    }

    #[test]
    fn present_fields_are_kept_even_when_null() {
        let p = posting(json!({
            "id": "j1",
            "company_name": null,
            "salary_mentioned": true,
            "location": "Remote",
            "status": null,
            "technologies": ["Rust"],
        }));
        let flat = Materializer::new(as_of(), 30).materialize(&p, "j1");
        assert_eq!(flat.company_name, Value::Null);
        assert_eq!(flat.salary_mentioned, json!(true));
        assert_eq!(flat.location, json!("Remote"));
        assert_eq!(flat.status, Some(Value::Null));
        let value = serde_json::to_value(&flat).unwrap();
        assert!(value.get("technologies").is_none());
    }

    #[test]
    fn recent_postings_are_inferred_active() {
        let materializer = Materializer::new(as_of(), 30);
        let recent = posting(json!({"id": "j1", "processed_date": days_ago(10)}));
        assert_eq!(materializer.materialize(&recent, "j1").status, Some(json!("Active")));

        let edge = posting(json!({"id": "j2", "processed_date": days_ago(30)}));
        assert_eq!(materializer.materialize(&edge, "j2").status, Some(json!("Active")));

        let stale = posting(json!({"id": "j3", "processed_date": days_ago(40)}));
        assert_eq!(materializer.materialize(&stale, "j3").status, None);
    }

    #[test]
    fn unparseable_times_infer_nothing() {
        let materializer = Materializer::new(as_of(), 30);
        let p = posting(json!({"id": "j1", "processed_date": "last tuesday"}));
        let flat = materializer.materialize(&p, "j1");
        assert_eq!(flat.status, None);
        assert_eq!(flat.processed_date, "2026-03-01T12:00:00+00:00");

        let missing = posting(json!({"id": "j2"}));
        assert_eq!(materializer.materialize(&missing, "j2").status, None);
    }

    #[test]
    fn oversized_windows_saturate() {
        let materializer = Materializer::new(as_of(), i64::MAX);
        let old = posting(json!({"id": "j1", "processed_date": "1990-01-01T00:00:00Z"}));
        assert_eq!(materializer.materialize(&old, "j1").status, Some(json!("Active")));
    }

    #[test]
    fn explicit_status_wins_over_inference() {
        let p = posting(json!({"id": "j1", "status": "Closed", "processed_date": days_ago(1)}));
        let flat = Materializer::new(as_of(), 30).materialize(&p, "j1");
        assert_eq!(flat.status, Some(json!("Closed")));
    }
}
