//! Content binding contract and `{{variable}}` substitution.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::NurtureResult;
use crate::types::{PersonalizationSnapshot, Scenario};

/// Closed key space of bindable messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum TemplateKey {
    Stage { scenario: Scenario, stage: u32 },
    PaymentConfirmation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedMessage {
    pub subject: String,
    pub html: String,
    pub text: String,
}

/// Pure function (key, snapshot) → rendered content. An unmapped key is a
/// configuration error (`NurtureError::UnmappedTemplate`), never a panic.
pub trait ContentBinder: Send + Sync {
    fn bind(
        &self,
        key: TemplateKey,
        snapshot: &PersonalizationSnapshot,
    ) -> NurtureResult<RenderedMessage>;
}

/// Replaces every `{{name}}` found in `variables`. Unknown placeholders are
/// left in place so a missing variable is visible in review.
pub fn substitute(template_str: &str, variables: &BTreeMap<String, String>) -> String {
    let mut result = template_str.to_string();
    for (name, value) in variables {
        let placeholder = format!("{{{{{}}}}}", name);
        result = result.replace(&placeholder, value);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_substitute_known_and_unknown() {
        let mut vars = BTreeMap::new();
        vars.insert("first_name".to_string(), "Dana".to_string());
        let out = substitute("Hi {{first_name}}, see {{app_url}}", &vars);
        assert_eq!(out, "Hi Dana, see {{app_url}}");
    }
}
