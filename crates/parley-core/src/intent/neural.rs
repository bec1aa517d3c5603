//! On-disk neural classifiers.
//!
//! Each sub-directory `<neural_root>/<intent>/` holds:
//! - `model_rnn.onnx`: one dynamic-length i64 sequence input named
//!   `input`, one `[1, 2]` f32 output named `output` (index 1 =
//!   positive-class probability),
//! - `vocab_rnn.json`: token to index map containing `<UNK>`,
//! - `README.md`: optional, becomes the classifier description,
//! - `weight.json`: optional `{"weight": f}` multiplier, default 1.0.
//!
//! The reported probability is `clip(output[1] * weight, 0, 1)`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use jieba_rs::Jieba;
use parley_protocol::Attachment;
use serde::Deserialize;
use tract_onnx::prelude::*;

use super::{ClassifierFactory, IntentClassifier, IntentMatcher};

pub const MODEL_FILE: &str = "model_rnn.onnx";
pub const VOCAB_FILE: &str = "vocab_rnn.json";
pub const README_FILE: &str = "README.md";
pub const WEIGHT_FILE: &str = "weight.json";

const UNK_TOKEN: &str = "<UNK>";

type NeuralPlan = TypedRunnableModel<TypedModel>;

/// Token → index map with the mandatory out-of-vocabulary fallback.
#[derive(Debug)]
pub struct Vocab {
    map: HashMap<String, i64>,
    unk: i64,
}

impl Vocab {
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, String> {
        let map: HashMap<String, i64> =
            serde_json::from_slice(bytes).map_err(|e| format!("invalid vocab json: {e}"))?;
        let unk = *map
            .get(UNK_TOKEN)
            .ok_or_else(|| format!("vocab is missing the {UNK_TOKEN} entry"))?;
        Ok(Self { map, unk })
    }

    pub fn index_of(&self, token: &str) -> i64 {
        self.map.get(token).copied().unwrap_or(self.unk)
    }
}

/// Segment `text` and map each token to its vocab index; unknown tokens
/// fall back to `<UNK>`.
pub fn text_to_indices(text: &str, vocab: &Vocab, jieba: &Jieba) -> Vec<i64> {
    jieba
        .cut(text, true)
        .into_iter()
        .filter(|t| !t.trim().is_empty())
        .map(|t| vocab.index_of(t))
        .collect()
}

#[derive(Deserialize)]
struct WeightFile {
    weight: f32,
}

/// A classifier backed by a loaded ONNX plan. The plan is shared by all
/// evaluations via the registered factory, so per-call cost is a single
/// forward pass.
pub struct NeuralClassifier {
    name: String,
    description: String,
    weight: f32,
    vocab: Vocab,
    jieba: Arc<Jieba>,
    plan: NeuralPlan,
}

impl NeuralClassifier {
    /// Load one classifier directory.
    pub fn load(dir: &Path, jieba: Arc<Jieba>) -> Result<Self, String> {
        let name = dir
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| format!("bad classifier directory name: {}", dir.display()))?
            .to_string();

        let vocab_bytes = std::fs::read(dir.join(VOCAB_FILE))
            .map_err(|e| format!("cannot read {VOCAB_FILE}: {e}"))?;
        let vocab = Vocab::from_json_bytes(&vocab_bytes)?;

        let description = std::fs::read_to_string(dir.join(README_FILE)).unwrap_or_default();
        let weight = read_weight(&dir.join(WEIGHT_FILE));

        let plan = load_plan(&dir.join(MODEL_FILE))
            .map_err(|e| format!("cannot load {MODEL_FILE}: {e}"))?;

        Ok(Self {
            name,
            description,
            weight,
            vocab,
            jieba,
            plan,
        })
    }

    fn infer(&self, indices: Vec<i64>) -> TractResult<f32> {
        let len = indices.len();
        let input: Tensor = tract_ndarray::Array2::from_shape_vec((1, len), indices)?.into();
        let outputs = self.plan.run(tvec!(input.into_tvalue()))?;
        let view = outputs[0].to_array_view::<f32>()?;
        Ok(view[[0, 1]])
    }
}

impl IntentClassifier for NeuralClassifier {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn score(&self, content: &str, _attachments: &[Attachment]) -> f64 {
        let indices = text_to_indices(content, &self.vocab, &self.jieba);
        if indices.is_empty() {
            return 0.0;
        }
        match self.infer(indices) {
            Ok(positive) => (f64::from(positive) * f64::from(self.weight)).clamp(0.0, 1.0),
            Err(e) => {
                tracing::warn!(intent = %self.name, "inference failed: {e}");
                0.0
            }
        }
    }
}

fn read_weight(path: &Path) -> f32 {
    match std::fs::read(path) {
        Ok(bytes) => match serde_json::from_slice::<WeightFile>(&bytes) {
            Ok(w) => w.weight,
            Err(e) => {
                tracing::warn!("invalid {WEIGHT_FILE}, using 1.0: {e}");
                1.0
            }
        },
        Err(_) => 1.0,
    }
}

fn load_plan(path: &Path) -> TractResult<NeuralPlan> {
    let mut model = tract_onnx::onnx().model_for_path(path)?;
    let seq = model.symbols.sym("S");
    model.set_input_fact(
        0,
        InferenceFact::dt_shape(i64::datum_type(), tvec!(TDim::from(1), TDim::from(seq))),
    )?;
    model.into_optimized()?.into_runnable()
}

/// Intent names double as directory names; reject anything that could
/// escape the neural root.
pub fn valid_intent_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains("..")
}

/// Discovery and lifecycle for classifiers under `neural_root`.
///
/// Loaded classifiers are registered with the matcher under their
/// directory name; the registered factory hands out the shared
/// instance. Unloading drops the plan and the model files.
pub struct NeuralIndex {
    root: PathBuf,
    jieba: Arc<Jieba>,
    loaded: Mutex<HashMap<String, Arc<NeuralClassifier>>>,
}

impl NeuralIndex {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            jieba: Arc::new(Jieba::new()),
            loaded: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn loaded_names(&self) -> Vec<String> {
        self.loaded.lock().unwrap().keys().cloned().collect()
    }

    /// Scan the root and register every loadable classifier directory.
    pub fn discover(&self, matcher: &IntentMatcher) {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(root = %self.root.display(), "neural root absent, skipping scan");
                return;
            }
            Err(e) => {
                tracing::error!(root = %self.root.display(), "cannot scan neural root: {e}");
                return;
            }
        };

        let mut count = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            match self.load_dir(&path, matcher) {
                Ok(name) => {
                    count += 1;
                    tracing::info!(intent = %name, "loaded neural classifier");
                }
                Err(e) => tracing::warn!(dir = %path.display(), "skipping classifier: {e}"),
            }
        }
        tracing::info!(count, "neural classifier scan complete");
    }

    /// Unregister every loaded classifier and re-run discovery.
    pub fn update_from_path(&self, matcher: &IntentMatcher) {
        let previous: Vec<String> = {
            let mut loaded = self.loaded.lock().unwrap();
            loaded.drain().map(|(name, _)| name).collect()
        };
        for name in previous {
            matcher.unregister(&name);
        }
        self.discover(matcher);
    }

    /// Write a classifier directory delivered at runtime, then load and
    /// register it.
    pub fn install(
        &self,
        matcher: &IntentMatcher,
        name: &str,
        model: &[u8],
        vocab: &[u8],
        description: &str,
        weight: f32,
    ) -> Result<(), String> {
        if !valid_intent_name(name) {
            return Err(format!("invalid intent name: {name:?}"));
        }
        // Validate the vocab before touching the disk.
        Vocab::from_json_bytes(vocab)?;

        let dir = self.root.join(name);
        std::fs::create_dir_all(&dir).map_err(|e| format!("cannot create {}: {e}", dir.display()))?;
        std::fs::write(dir.join(MODEL_FILE), model).map_err(|e| format!("cannot save model: {e}"))?;
        std::fs::write(dir.join(VOCAB_FILE), vocab).map_err(|e| format!("cannot save vocab: {e}"))?;
        if !description.is_empty() {
            let _ = std::fs::write(dir.join(README_FILE), description);
        }
        let weight_bytes = serde_json::to_vec(&serde_json::json!({ "weight": weight }))
            .expect("weight object serializes");
        std::fs::write(dir.join(WEIGHT_FILE), weight_bytes)
            .map_err(|e| format!("cannot save weight: {e}"))?;

        self.load_dir(&dir, matcher).map(|_| ())
    }

    /// Unregister a classifier, release its plan and delete its files.
    pub fn remove(&self, matcher: &IntentMatcher, name: &str) -> Result<(), String> {
        if !valid_intent_name(name) {
            return Err(format!("invalid intent name: {name:?}"));
        }
        let present = self.loaded.lock().unwrap().remove(name).is_some();
        if !present {
            return Err(format!("intent '{name}' is not loaded"));
        }
        matcher.unregister(name);
        let dir = self.root.join(name);
        if let Err(e) = std::fs::remove_dir_all(&dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::error!(dir = %dir.display(), "cannot delete classifier files: {e}");
            }
        }
        Ok(())
    }

    fn load_dir(&self, dir: &Path, matcher: &IntentMatcher) -> Result<String, String> {
        let classifier = Arc::new(NeuralClassifier::load(dir, self.jieba.clone())?);
        let name = classifier.name.clone();
        self.loaded
            .lock()
            .unwrap()
            .insert(name.clone(), classifier.clone());
        let shared = classifier;
        let factory: ClassifierFactory =
            Arc::new(move || shared.clone() as Arc<dyn IntentClassifier>);
        matcher.register(&name, factory);
        Ok(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vocab() -> Vocab {
        Vocab::from_json_bytes(r#"{"<UNK>": 0, "查看": 7, "状态": 9}"#.as_bytes()).unwrap()
    }

    #[test]
    fn unknown_tokens_map_to_unk() {
        let jieba = Jieba::new();
        let indices = text_to_indices("查看 编译 状态", &vocab(), &jieba);
        assert!(indices.contains(&7));
        assert!(indices.contains(&9));
        assert!(indices.contains(&0), "out-of-vocab token uses <UNK>");
    }

    #[test]
    fn empty_text_tokenizes_to_nothing() {
        let jieba = Jieba::new();
        assert!(text_to_indices("", &vocab(), &jieba).is_empty());
        assert!(text_to_indices("   ", &vocab(), &jieba).is_empty());
    }

    #[test]
    fn vocab_without_unk_is_rejected() {
        let err = Vocab::from_json_bytes(br#"{"only": 1}"#).unwrap_err();
        assert!(err.contains("<UNK>"));
    }

    #[test]
    fn weight_file_defaults_and_parses() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_weight(&dir.path().join("absent.json")), 1.0);

        let path = dir.path().join("weight.json");
        std::fs::write(&path, br#"{"weight": 1.4}"#).unwrap();
        assert_eq!(read_weight(&path), 1.4);

        std::fs::write(&path, b"not json").unwrap();
        assert_eq!(read_weight(&path), 1.0);
    }

    #[test]
    fn intent_name_validation() {
        assert!(valid_intent_name("checkStatus"));
        assert!(valid_intent_name("check_status-2"));
        assert!(!valid_intent_name(""));
        assert!(!valid_intent_name("../escape"));
        assert!(!valid_intent_name("a/b"));
        assert!(!valid_intent_name(".."));
    }

    #[test]
    fn discovery_skips_incomplete_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("broken")).unwrap();
        std::fs::write(dir.path().join("broken").join(VOCAB_FILE), b"{}").unwrap();

        let index = NeuralIndex::new(dir.path());
        let matcher = IntentMatcher::new(dir.path().join("cache.json"), 0.9);
        index.discover(&matcher);
        assert!(index.loaded_names().is_empty());
        assert!(matcher.intent_names().is_empty());
    }

    #[test]
    fn discovery_of_absent_root_is_quiet() {
        let dir = tempfile::tempdir().unwrap();
        let index = NeuralIndex::new(dir.path().join("nowhere"));
        let matcher = IntentMatcher::new(dir.path().join("cache.json"), 0.9);
        index.discover(&matcher);
        assert!(index.loaded_names().is_empty());
    }

    #[test]
    fn removing_an_unloaded_intent_fails() {
        let dir = tempfile::tempdir().unwrap();
        let index = NeuralIndex::new(dir.path());
        let matcher = IntentMatcher::new(dir.path().join("cache.json"), 0.9);
        assert!(index.remove(&matcher, "ghost").is_err());
    }
}
