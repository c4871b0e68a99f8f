use semrel_core::{Concept, ConceptId, Error, FeatureSource, FeatureVector, Result, StaticFeatureSource};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use tracing::info;

/// One line of a feature file
///
/// `{"id": 12, "label": "Jazz", "features": {"4": 0.5, "97": 1.0}}`; a missing
/// or null `features` field marks a corpus member without a vector.
#[derive(Debug, Deserialize)]
struct FeatureLine {
    id: u32,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    features: Option<BTreeMap<u32, f32>>,
}

/// Feature source read eagerly from a JSON-lines file
#[derive(Debug, Clone)]
pub struct JsonlFeatureSource {
    path: Option<PathBuf>,
    inner: StaticFeatureSource,
}

impl JsonlFeatureSource {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|e| Error::Io(std::io::Error::new(e.kind(), format!("{:?}: {}", path, e))))?;
        let mut source = Self::from_reader(BufReader::new(file))?;
        info!("Loaded {} concepts from {:?}", source.len(), path);
        source.path = Some(path.to_path_buf());
        Ok(source)
    }

    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self> {
        let mut inner = StaticFeatureSource::new();
        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let parsed: FeatureLine = serde_json::from_str(&line)
                .map_err(|e| Error::Serialization(format!("line {}: {}", lineno + 1, e)))?;
            let concept = Concept {
                id: ConceptId(parsed.id),
                label: parsed.label,
            };
            match parsed.features {
                Some(features) => inner.insert(concept, FeatureVector::new(features)),
                None => inner.insert_missing(concept),
            }
        }
        Ok(Self { path: None, inner })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl FeatureSource for JsonlFeatureSource {
    fn concepts(&self) -> Result<Vec<Concept>> {
        self.inner.concepts()
    }

    fn contribution(&self, id: ConceptId) -> Result<Option<FeatureVector>> {
        self.inner.contribution(id)
    }
}
