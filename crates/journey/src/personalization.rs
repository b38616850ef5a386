//! Builds the cached personalization snapshot a sequence renders from.

use chrono::{DateTime, Utc};

use nurture_core::config::LinksConfig;
use nurture_core::types::{PersonalizationSnapshot, SessionRecord};

const FALLBACK_FIRST_NAME: &str = "there";
const FALLBACK_CATEGORY: &str = "your results";
const FALLBACK_HEADLINE: &str = "Analysis complete";

/// Flattens the session's assessment summary into primitives. Missing
/// fields fall back to neutral copy so templates never render blanks.
pub fn build_snapshot(
    session: &SessionRecord,
    links: &LinksConfig,
    now: DateTime<Utc>,
) -> PersonalizationSnapshot {
    let assessment = &session.assessment;

    let first_name = assessment
        .display_name
        .as_deref()
        .and_then(|name| name.split_whitespace().next())
        .unwrap_or(FALLBACK_FIRST_NAME)
        .to_string();

    let non_blank = |v: &Option<String>, fallback: &str| {
        v.as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(fallback)
            .to_string()
    };

    PersonalizationSnapshot {
        first_name,
        dominant_category: non_blank(&assessment.dominant_category, FALLBACK_CATEGORY),
        headline: non_blank(&assessment.headline, FALLBACK_HEADLINE),
        questions_answered: assessment.questions_answered,
        answer_labels: assessment.answer_labels.clone(),
        flags: assessment.flags.clone(),
        scores: assessment
            .scores
            .iter()
            .filter(|(_, v)| v.is_finite())
            .map(|(k, v)| (k.clone(), v.round() as i64))
            .collect(),
        app_url: links.app_url.trim_end_matches('/').to_string(),
        unsubscribe_url: links.unsubscribe_url(&session.id),
        built_at: now,
    }
}

/// Returns the session's cached snapshot, building and caching it first if
/// needed. Later sends of the same sequence reuse the cached copy.
pub fn ensure_snapshot(
    session: &mut SessionRecord,
    links: &LinksConfig,
    now: DateTime<Utc>,
) -> PersonalizationSnapshot {
    if let Some(existing) = &session.personalization {
        return existing.clone();
    }
    let snapshot = build_snapshot(session, links, now);
    session.personalization = Some(snapshot.clone());
    snapshot
}

#[cfg(test)]
mod tests {
    use super::*;
    use nurture_core::types::AssessmentSummary;
    use uuid::Uuid;

    #[test]
    fn test_fallbacks_for_empty_assessment() {
        let session = SessionRecord::new(Uuid::new_v4(), Some("a@b.co".into()), Utc::now());
        let snap = build_snapshot(&session, &LinksConfig::default(), Utc::now());
        assert_eq!(snap.first_name, "there");
        assert_eq!(snap.dominant_category, "your results");
        assert!(snap.unsubscribe_url.ends_with(&session.id.to_string()));
    }

    #[test]
    fn test_snapshot_uses_assessment_fields() {
        let mut session = SessionRecord::new(Uuid::new_v4(), Some("a@b.co".into()), Utc::now());
        session.assessment = AssessmentSummary {
            display_name: Some("Jordan Lee".into()),
            dominant_category: Some("conflict avoidance".into()),
            headline: Some("You keep the peace at a cost".into()),
            questions_answered: 18,
            scores: [("empathy".to_string(), 71.6), ("bad".to_string(), f64::NAN)]
                .into_iter()
                .collect(),
            ..Default::default()
        };
        let snap = build_snapshot(&session, &LinksConfig::default(), Utc::now());
        assert_eq!(snap.first_name, "Jordan");
        assert_eq!(snap.dominant_category, "conflict avoidance");
        assert_eq!(snap.questions_answered, 18);
        assert_eq!(snap.scores.get("empathy"), Some(&72));
        assert!(!snap.scores.contains_key("bad"));
    }

    #[test]
    fn test_snapshot_is_cached_once() {
        let mut session = SessionRecord::new(Uuid::new_v4(), Some("a@b.co".into()), Utc::now());
        let first = ensure_snapshot(&mut session, &LinksConfig::default(), Utc::now());
        session.assessment.display_name = Some("Changed".into());
        let second = ensure_snapshot(&mut session, &LinksConfig::default(), Utc::now());
        assert_eq!(first, second);
    }
}
