use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use tokio::fs;
use tracing::debug;

use super::SourceCatalog;
use crate::error::{PipelineError, Result};
use crate::model::ContentItem;

/// Catalog backed by a YAML file of content items. The file is re-read on
/// every call so edits show up at the next reconciliation.
#[derive(Debug, Clone)]
pub struct YamlCatalog {
    path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    items: Vec<ContentItem>,
}

impl YamlCatalog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn load(&self) -> Result<Vec<ContentItem>> {
        let content = fs::read_to_string(&self.path).await.map_err(|e| {
            PipelineError::Source(format!("read catalog {}: {e}", self.path.display()))
        })?;
        let file: CatalogFile = serde_yaml::from_str(&content).map_err(|e| {
            PipelineError::Source(format!("parse catalog {}: {e}", self.path.display()))
        })?;
        debug!(items = file.items.len(), "catalog loaded");
        Ok(file.items)
    }
}

#[async_trait]
impl SourceCatalog for YamlCatalog {
    async fn list_eligible_items(&self, brand: &str) -> Result<Vec<ContentItem>> {
        Ok(self
            .load()
            .await?
            .into_iter()
            .filter(|i| i.brand == brand && i.eligible)
            .collect())
    }

    async fn get_item(&self, id: &str) -> Result<Option<ContentItem>> {
        Ok(self.load().await?.into_iter().find(|i| i.id == id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const CATALOG: &str = r#"items:
  - id: p1
    label: "123 Main St"
    brand: ownerfi
    attributes: { city: Houston }
  - id: p2
    label: "9 Elm Ave"
    brand: ownerfi
    eligible: false
  - id: c1
    label: "2019 Civic"
    brand: carz
"#;

    #[tokio::test]
    async fn filters_by_brand_and_eligibility() {
        let td = tempdir().unwrap();
        let path = td.path().join("catalog.yaml");
        std::fs::write(&path, CATALOG).unwrap();
        let catalog = YamlCatalog::new(&path);

        let items = catalog.list_eligible_items("ownerfi").await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].attributes["city"], "Houston");

        let p2 = catalog.get_item("p2").await.unwrap().unwrap();
        assert!(!p2.eligible);
        assert!(catalog.get_item("zzz").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_file_is_a_source_error() {
        let catalog = YamlCatalog::new("/nonexistent/catalog.yaml");
        let err = catalog.list_eligible_items("ownerfi").await.unwrap_err();
        assert!(matches!(err, PipelineError::Source(_)));
    }
}
