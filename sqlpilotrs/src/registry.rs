use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use glob::glob;

use crate::error::{Result, SqlPilotError};
use crate::models::Dataset;

/// Datasets keyed by name, loaded from YAML definitions.
#[derive(Debug, Default, Clone)]
pub struct DatasetRegistry {
    pub datasets: HashMap<String, Dataset>,
}

impl DatasetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_datasets(datasets: Vec<Dataset>) -> Result<Self> {
        let mut registry = DatasetRegistry::new();
        for dataset in datasets {
            registry.insert(dataset)?;
        }
        Ok(registry)
    }

    /// Load every `*.yml` / `*.yaml` file under `<root>/datasets`.
    pub fn load_from_dir<P: AsRef<Path>>(root: P) -> Result<Self> {
        let mut registry = DatasetRegistry::new();
        registry.load_datasets(root.as_ref().join("datasets"))?;
        tracing::info!(datasets = registry.datasets.len(), "dataset registry loaded");
        Ok(registry)
    }

    fn load_datasets(&mut self, dir: PathBuf) -> Result<()> {
        if !dir.exists() {
            return Err(SqlPilotError::Validation(format!(
                "datasets directory not found: {}",
                dir.display()
            )));
        }
        for pattern in ["*.yml", "*.yaml"] {
            for entry in glob(&format!("{}/{pattern}", dir.display()))
                .map_err(|e| SqlPilotError::Other(e.into()))?
                .flatten()
            {
                self.load_dataset_file(&entry)?;
            }
        }
        Ok(())
    }

    fn load_dataset_file(&mut self, path: &Path) -> Result<()> {
        let contents = fs::read_to_string(path)?;
        let dataset: Dataset = serde_yaml::from_str(&contents).map_err(|e| {
            SqlPilotError::Validation(format!("{}: {e}", path.display()))
        })?;
        tracing::debug!(dataset = %dataset.name, path = %path.display(), "loaded dataset");
        self.insert(dataset)
    }

    /// Register a dataset after its structural checks pass.
    pub fn insert(&mut self, dataset: Dataset) -> Result<()> {
        dataset.validate()?;
        if self.datasets.contains_key(&dataset.name) {
            return Err(SqlPilotError::Validation(format!(
                "duplicate dataset {}",
                dataset.name
            )));
        }
        self.datasets.insert(dataset.name.clone(), dataset);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Dataset> {
        self.datasets.get(name)
    }

    pub fn require(&self, name: &str) -> Result<&Dataset> {
        self.get(name)
            .ok_or_else(|| SqlPilotError::NotFound(format!("dataset {name}")))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.datasets.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
