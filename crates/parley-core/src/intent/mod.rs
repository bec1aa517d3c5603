mod cache;
pub mod neural;
mod rules;

pub use cache::IntentCache;
pub use rules::RuleClassifier;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use futures::future::join_all;
use parley_protocol::{Attachment, IntentScore};

/// One classifier in the ensemble.
///
/// `score` returns the probability in `[0, 1]` that the utterance
/// belongs to this classifier's intent. Implementations are evaluated
/// on blocking threads and must be cheap per call; expensive ones
/// amortize internally (the neural classifiers share a loaded plan).
pub trait IntentClassifier: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn score(&self, content: &str, attachments: &[Attachment]) -> f64;
}

/// Builds a fresh classifier handle per evaluation.
pub type ClassifierFactory = Arc<dyn Fn() -> Arc<dyn IntentClassifier> + Send + Sync>;

/// Pure content normalization applied before cache lookup and scoring,
/// e.g. stripping volatile URLs or tags. Identity by default.
pub type NormalizeFn = Box<dyn Fn(&str) -> String + Send + Sync>;

/// Registry plus memoization for intent classification.
pub struct IntentMatcher {
    classifiers: RwLock<HashMap<String, ClassifierFactory>>,
    cache: IntentCache,
    valid_min_score: f64,
    normalize: NormalizeFn,
}

impl IntentMatcher {
    pub fn new(cache_path: impl Into<std::path::PathBuf>, valid_min_score: f64) -> Self {
        Self {
            classifiers: RwLock::new(HashMap::new()),
            cache: IntentCache::new(cache_path),
            valid_min_score,
            normalize: Box::new(|s| s.to_string()),
        }
    }

    pub fn with_normalizer(mut self, normalize: NormalizeFn) -> Self {
        self.normalize = normalize;
        self
    }

    pub fn cache(&self) -> &IntentCache {
        &self.cache
    }

    /// Register a classifier factory under an intent name. First wins:
    /// re-registering an existing name is a no-op.
    pub fn register(&self, name: &str, factory: ClassifierFactory) {
        let mut classifiers = self.classifiers.write().unwrap();
        if classifiers.contains_key(name) {
            tracing::debug!(intent = name, "already registered, keeping first");
            return;
        }
        classifiers.insert(name.to_string(), factory);
    }

    pub fn unregister(&self, name: &str) {
        self.classifiers.write().unwrap().remove(name);
    }

    pub fn intent_names(&self) -> Vec<String> {
        self.classifiers.read().unwrap().keys().cloned().collect()
    }

    /// Associate normalized content with an intent, bypassing scoring.
    /// Used for clarifier-resolved intents.
    pub fn cache_content_intent(&self, content: &str, intent: &str) {
        let key = (self.normalize)(content);
        self.cache.insert(key, intent.to_string());
    }

    /// Classify an utterance.
    ///
    /// Returns the best intent name ("" when nothing reached
    /// `valid_min_score`) and every candidate with its score. A cache
    /// hit returns the cached name with an empty candidate list.
    /// `allow_cache_write` gates storing a fresh strong match.
    pub async fn find_best(
        &self,
        raw_content: &str,
        attachments: &[Attachment],
        allow_cache_write: bool,
    ) -> (String, Vec<IntentScore>) {
        let content = (self.normalize)(raw_content);

        if let Some(cached) = self.cache.get(&content) {
            tracing::debug!(intent = %cached, "intent cache hit");
            return (cached, Vec::new());
        }

        let factories: Vec<ClassifierFactory> = {
            let classifiers = self.classifiers.read().unwrap();
            classifiers.values().cloned().collect()
        };
        if factories.is_empty() {
            tracing::warn!("no classifiers registered");
            return (String::new(), Vec::new());
        }

        let tasks = factories.into_iter().map(|factory| {
            let content = content.clone();
            let attachments = attachments.to_vec();
            tokio::task::spawn_blocking(move || {
                let classifier = factory();
                let probability = classifier.score(&content, &attachments);
                IntentScore {
                    name: classifier.name().to_string(),
                    description: classifier.description().to_string(),
                    probability,
                }
            })
        });

        let mut candidates = Vec::new();
        for joined in join_all(tasks).await {
            match joined {
                Ok(score) => candidates.push(score),
                Err(e) => tracing::error!("classifier task failed: {e}"),
            }
        }

        let best = candidates
            .iter()
            .max_by(|a, b| a.probability.total_cmp(&b.probability));
        let (best_name, best_score) = match best {
            Some(s) => (s.name.clone(), s.probability),
            None => (String::new(), 0.0),
        };

        if best_score >= self.valid_min_score {
            tracing::debug!(intent = %best_name, score = best_score, "matched intent");
            if allow_cache_write {
                self.cache.insert(content, best_name.clone());
            }
            (best_name, candidates)
        } else {
            tracing::debug!(top = best_score, "no intent above threshold");
            (String::new(), candidates)
        }
    }
}
