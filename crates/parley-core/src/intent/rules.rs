use parley_protocol::Attachment;
use regex::Regex;

use super::IntentClassifier;

/// Pattern-based classifier: reports a fixed probability when the
/// utterance matches its regex, 0 otherwise.
///
/// This is the shape built-in intents take; neural classifiers cover
/// everything the rules cannot express.
pub struct RuleClassifier {
    name: String,
    description: String,
    pattern: Option<Regex>,
    probability: f64,
}

impl RuleClassifier {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        pattern: &str,
        probability: f64,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            name: name.into(),
            description: description.into(),
            pattern: Some(Regex::new(pattern)?),
            probability,
        })
    }

    /// A classifier that scores every utterance the same; test scaffolding.
    pub fn fixed(name: impl Into<String>, description: impl Into<String>, probability: f64) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            pattern: None,
            probability,
        }
    }
}

impl IntentClassifier for RuleClassifier {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn score(&self, content: &str, _attachments: &[Attachment]) -> f64 {
        match &self.pattern {
            Some(re) if !re.is_match(content) => 0.0,
            _ => self.probability,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_content_scores_the_configured_probability() {
        let rule = RuleClassifier::new("checkStatus", "build status", "查看.*状态", 0.95).unwrap();
        assert_eq!(rule.score("查看自动构建状态", &[]), 0.95);
        assert_eq!(rule.score("今天天气怎么样", &[]), 0.0);
    }

    #[test]
    fn fixed_rule_ignores_content() {
        let rule = RuleClassifier::fixed("always", "", 0.3);
        assert_eq!(rule.score("anything", &[]), 0.3);
        assert_eq!(rule.score("", &[]), 0.3);
    }

    #[test]
    fn invalid_pattern_is_an_error() {
        assert!(RuleClassifier::new("bad", "", "(unclosed", 0.9).is_err());
    }
}
