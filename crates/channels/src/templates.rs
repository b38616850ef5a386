//! Built-in sequence copy: one template per (scenario, stage) plus the
//! payment confirmation. Copywriting lives here; the engine only sees the
//! `ContentBinder` contract.

use std::collections::BTreeMap;

use nurture_core::error::{NurtureError, NurtureResult};
use nurture_core::templates::{substitute, ContentBinder, RenderedMessage, TemplateKey};
use nurture_core::types::{PersonalizationSnapshot, Scenario};

struct Template {
    subject: &'static str,
    /// Paragraphs separated by blank lines; the last one is the call to action.
    body: &'static str,
    cta_label: &'static str,
    cta_path: &'static str,
}

const FUNNEL: [Template; 3] = [
    Template {
        subject: "Your assessment is saved at question {{questions_answered}}",
        body: "Hi {{first_name}},\n\nYou started the assessment but didn't finish. Your answers are saved and you can pick up exactly where you left off.",
        cta_label: "Continue where you left off",
        cta_path: "/test",
    },
    Template {
        subject: "We looked at your first {{questions_answered}} answers",
        body: "Hi {{first_name}},\n\nEven a partial set of answers already shows a pattern. Finish the remaining questions to see the whole picture.",
        cta_label: "Finish the assessment",
        cta_path: "/test",
    },
    Template {
        subject: "Your saved answers expire tonight",
        body: "Hi {{first_name}},\n\nSaved progress is cleared after a few days. This is the last reminder before yours is removed.",
        cta_label: "Finish now",
        cta_path: "/test",
    },
];

const TEASER: [Template; 9] = [
    Template {
        subject: "Your results are ready, {{first_name}}",
        body: "Hi {{first_name}},\n\n{{headline}}\n\nYour strongest signal is {{dominant_category}}. The full report explains what drives it.",
        cta_label: "See your results",
        cta_path: "/results",
    },
    Template {
        subject: "One of your answers stood out",
        body: "Hi {{first_name}},\n\nOne answer in the {{dominant_category}} section changes how the rest of your results read.",
        cta_label: "See why it matters",
        cta_path: "/results",
    },
    Template {
        subject: "The strength hidden in your results",
        body: "Hi {{first_name}},\n\nMost reports focus on problems. Yours also shows a strength you can build on.",
        cta_label: "Read about it",
        cta_path: "/results",
    },
    Template {
        subject: "Your conflict style and your personality disagree",
        body: "Hi {{first_name}},\n\nHow you react under pressure doesn't match how you describe yourself. That gap is where most friction starts.",
        cta_label: "Close the gap",
        cta_path: "/results",
    },
    Template {
        subject: "Few people answer the way you did",
        body: "Hi {{first_name}},\n\nYour combination of answers is uncommon. The full report shows what it predicts.",
        cta_label: "Unlock the report",
        cta_path: "/results",
    },
    Template {
        subject: "This isn't a personality quiz",
        body: "Hi {{first_name}},\n\nThe assessment measures patterns, not labels. Patterns can change once you can see them.",
        cta_label: "See your pattern",
        cta_path: "/results",
    },
    Template {
        subject: "Nothing is broken",
        body: "Hi {{first_name}},\n\nA repeating loop is not a flaw. It is a map, and maps can be redrawn.",
        cta_label: "Get the map",
        cta_path: "/results",
    },
    Template {
        subject: "Your needs can be met once they're visible",
        body: "Hi {{first_name}},\n\nThe report turns your {{dominant_category}} results into concrete next steps.",
        cta_label: "Unlock your next steps",
        cta_path: "/results",
    },
    Template {
        subject: "Your report expires in 48 hours",
        body: "Hi {{first_name}},\n\nUnpaid results are removed after a week. This is the last message in this series.",
        cta_label: "Keep your report",
        cta_path: "/results",
    },
];

const CHECKOUT: [Template; 3] = [
    Template {
        subject: "You left something at checkout",
        body: "Hi {{first_name}},\n\nYour full report is one step away. Checkout is saved for you.",
        cta_label: "Complete checkout",
        cta_path: "/checkout",
    },
    Template {
        subject: "A quick question about your checkout",
        body: "Hi {{first_name}},\n\nIf something got in the way, reply to this email and we'll help.",
        cta_label: "Return to checkout",
        cta_path: "/checkout",
    },
    Template {
        subject: "Last chance: your analysis expires at midnight",
        body: "Hi {{first_name}},\n\nAfter tonight your results are no longer held.",
        cta_label: "Unlock it now",
        cta_path: "/checkout",
    },
];

const CONFIRMATION: Template = Template {
    subject: "Payment confirmed - your report is ready",
    body: "Thank you for your purchase. Your payment went through and your full report is unlocked.\n\nIf you have any questions, just reply to this email.",
    cta_label: "View your report",
    cta_path: "/results",
};

fn stage_template(scenario: Scenario, stage: u32) -> Option<&'static Template> {
    let index = usize::try_from(stage.checked_sub(1)?).ok()?;
    match scenario {
        Scenario::AbandonedFunnel => FUNNEL.get(index),
        Scenario::ViewedTeaserResult => TEASER.get(index),
        Scenario::AbandonedCheckout => CHECKOUT.get(index),
    }
}

fn escape_html(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

/// Default `ContentBinder` backed by the compiled-in sequence copy.
#[derive(Debug, Clone, Default)]
pub struct SequenceTemplates;

impl SequenceTemplates {
    pub fn new() -> Self {
        Self
    }

    fn render(template: &Template, snapshot: &PersonalizationSnapshot) -> RenderedMessage {
        let vars = snapshot.variables();
        let cta_url = format!("{}{}", snapshot.app_url.trim_end_matches('/'), template.cta_path);

        let subject = substitute(template.subject, &vars);
        let body = substitute(template.body, &vars);
        let text = format!(
            "{body}\n\n{}: {cta_url}\n\nUnsubscribe: {}",
            template.cta_label, snapshot.unsubscribe_url
        );

        let escaped: BTreeMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.clone(), escape_html(v)))
            .collect();
        let paragraphs: String = template
            .body
            .split("\n\n")
            .map(|p| format!("<p>{}</p>", substitute(p, &escaped)))
            .collect();
        let html = format!(
            "<!DOCTYPE html><html><body>{paragraphs}<p><a href=\"{}\" class=\"button\">{}</a></p>\
             <hr><p style=\"font-size:12px\"><a href=\"{}\">Unsubscribe from these emails</a></p></body></html>",
            escape_html(&cta_url),
            template.cta_label,
            escape_html(&snapshot.unsubscribe_url),
        );

        RenderedMessage { subject, html, text }
    }
}

impl ContentBinder for SequenceTemplates {
    fn bind(
        &self,
        key: TemplateKey,
        snapshot: &PersonalizationSnapshot,
    ) -> NurtureResult<RenderedMessage> {
        let template = match key {
            TemplateKey::Stage { scenario, stage } => stage_template(scenario, stage)
                .ok_or(NurtureError::UnmappedTemplate { scenario, stage })?,
            TemplateKey::PaymentConfirmation => &CONFIRMATION,
        };
        Ok(Self::render(template, snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn snapshot() -> PersonalizationSnapshot {
        PersonalizationSnapshot {
            first_name: "Sam <b>".into(),
            dominant_category: "communication".into(),
            headline: "Analysis complete".into(),
            questions_answered: 12,
            answer_labels: BTreeMap::new(),
            flags: BTreeMap::new(),
            scores: BTreeMap::new(),
            app_url: "https://app.example".into(),
            unsubscribe_url: "https://api.example/v1/unsubscribe?token=abc".into(),
            built_at: Utc::now(),
        }
    }

    #[test]
    fn test_every_sequence_stage_is_bound() {
        let binder = SequenceTemplates::new();
        for (scenario, len) in [
            (Scenario::AbandonedFunnel, 3),
            (Scenario::ViewedTeaserResult, 9),
            (Scenario::AbandonedCheckout, 3),
        ] {
            for stage in 1..=len {
                let key = TemplateKey::Stage { scenario, stage };
                assert!(binder.bind(key, &snapshot()).is_ok(), "{scenario} {stage}");
            }
            let past_end = TemplateKey::Stage { scenario, stage: len + 1 };
            assert!(matches!(
                binder.bind(past_end, &snapshot()),
                Err(NurtureError::UnmappedTemplate { .. })
            ));
        }
    }

    #[test]
    fn test_stage_zero_is_unmapped() {
        let key = TemplateKey::Stage {
            scenario: Scenario::AbandonedCheckout,
            stage: 0,
        };
        assert!(SequenceTemplates::new().bind(key, &snapshot()).is_err());
    }

    #[test]
    fn test_render_personalizes_and_escapes() {
        let rendered = SequenceTemplates::new()
            .bind(
                TemplateKey::Stage {
                    scenario: Scenario::AbandonedFunnel,
                    stage: 1,
                },
                &snapshot(),
            )
            .unwrap();
        assert_eq!(rendered.subject, "Your assessment is saved at question 12");
        assert!(rendered.text.contains("Hi Sam <b>,"));
        assert!(rendered.html.contains("Hi Sam &lt;b&gt;,"));
        assert!(rendered.text.contains("https://app.example/test"));
        assert!(rendered.html.contains("unsubscribe?token=abc"));
    }

    #[test]
    fn test_confirmation_binds() {
        let rendered = SequenceTemplates::new()
            .bind(TemplateKey::PaymentConfirmation, &snapshot())
            .unwrap();
        assert!(rendered.subject.starts_with("Payment confirmed"));
        assert!(rendered.text.contains("https://app.example/results"));
    }
}
