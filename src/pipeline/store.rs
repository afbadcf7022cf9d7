//! Storage collaborator for extracted coordinates, page images and cached
//! renders.
//!
//! The orchestrator writes through [`CoordinateStore`]; the application
//! decides where records live. [`InMemoryStore`] backs tests and the CLI.

use crate::error::StoreError;
use crate::geometry::{sanitize_for_manual_edit, CoordinateMetadata, DiagramCoordinates, ModifiedBy};
use crate::render::RenderedDiagram;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

/// Key under which page `page_number` of test `test_id` is stored.
pub fn page_image_key(test_id: &str, page_number: usize) -> String {
    format!("{}_page_{}", test_id, page_number)
}

/// CRUD over coordinate metadata (by question id), page images (by
/// [`page_image_key`]) and rendered diagrams (by render cache key).
#[async_trait]
pub trait CoordinateStore: Send + Sync {
    async fn save_coordinates(&self, metadata: &CoordinateMetadata) -> Result<(), StoreError>;

    async fn get_coordinates(&self, question_id: &str)
        -> Result<Option<CoordinateMetadata>, StoreError>;

    /// Returns `true` if something was deleted.
    async fn delete_coordinates(&self, question_id: &str) -> Result<bool, StoreError>;

    /// `png` is an encoded PNG.
    async fn save_page_image(&self, key: &str, png: Vec<u8>) -> Result<(), StoreError>;

    async fn get_page_image(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Returns `true` if something was deleted.
    async fn delete_page_image(&self, key: &str) -> Result<bool, StoreError>;

    async fn save_render(&self, key: &str, render: &RenderedDiagram) -> Result<(), StoreError>;

    async fn get_render(&self, key: &str) -> Result<Option<RenderedDiagram>, StoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    coordinates: RwLock<HashMap<String, CoordinateMetadata>>,
    page_images: RwLock<HashMap<String, Vec<u8>>>,
    renders: RwLock<HashMap<String, RenderedDiagram>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids of every stored question, sorted.
    pub async fn question_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.coordinates.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn page_image_count(&self) -> usize {
        self.page_images.read().await.len()
    }
}

#[async_trait]
impl CoordinateStore for InMemoryStore {
    async fn save_coordinates(&self, metadata: &CoordinateMetadata) -> Result<(), StoreError> {
        self.coordinates
            .write()
            .await
            .insert(metadata.question_id.clone(), metadata.clone());
        Ok(())
    }

    async fn get_coordinates(
        &self,
        question_id: &str,
    ) -> Result<Option<CoordinateMetadata>, StoreError> {
        Ok(self.coordinates.read().await.get(question_id).cloned())
    }

    async fn delete_coordinates(&self, question_id: &str) -> Result<bool, StoreError> {
        Ok(self.coordinates.write().await.remove(question_id).is_some())
    }

    async fn save_page_image(&self, key: &str, png: Vec<u8>) -> Result<(), StoreError> {
        self.page_images.write().await.insert(key.to_string(), png);
        Ok(())
    }

    async fn get_page_image(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.page_images.read().await.get(key).cloned())
    }

    async fn delete_page_image(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.page_images.write().await.remove(key).is_some())
    }

    async fn save_render(&self, key: &str, render: &RenderedDiagram) -> Result<(), StoreError> {
        self.renders
            .write()
            .await
            .insert(key.to_string(), render.clone());
        Ok(())
    }

    async fn get_render(&self, key: &str) -> Result<Option<RenderedDiagram>, StoreError> {
        Ok(self.renders.read().await.get(key).cloned())
    }
}

/// Persist a user's correction to one stored diagram.
///
/// The box goes through the manual-edit sanitizer profile against the
/// question's original page dimensions and is recorded as `modifiedBy = user`.
pub async fn apply_user_edit(
    store: &dyn CoordinateStore,
    question_id: &str,
    diagram_id: &str,
    coordinates: &DiagramCoordinates,
) -> Result<CoordinateMetadata, StoreError> {
    let mut metadata = store
        .get_coordinates(question_id)
        .await?
        .ok_or_else(|| StoreError::NotFound(question_id.to_string()))?;

    let result = sanitize_for_manual_edit(coordinates, &metadata.original_image_dimensions);
    if !result.changes.is_empty() {
        debug!(
            "{}: user edit adjusted ({:?})",
            diagram_id, result.changes
        );
    }
    if !metadata.update_diagram(diagram_id, result.sanitized, ModifiedBy::User) {
        return Err(StoreError::NotFound(diagram_id.to_string()));
    }

    store.save_coordinates(&metadata).await?;
    Ok(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{DiagramType, ImageDimensions};

    fn metadata() -> CoordinateMetadata {
        CoordinateMetadata::from_detection(
            "t_p1_q1",
            1,
            ImageDimensions::new(800, 600).unwrap(),
            &[DiagramCoordinates::new(100.0, 150.0, 300.0, 250.0).with_type(DiagramType::Graph)],
        )
    }

    #[test]
    fn page_key_format() {
        assert_eq!(page_image_key("test42", 3), "test42_page_3");
    }

    #[tokio::test]
    async fn coordinates_crud() {
        let store = InMemoryStore::new();
        store.save_coordinates(&metadata()).await.unwrap();
        let got = store.get_coordinates("t_p1_q1").await.unwrap().unwrap();
        assert_eq!(got.diagrams.len(), 1);
        assert!(store.delete_coordinates("t_p1_q1").await.unwrap());
        assert!(!store.delete_coordinates("t_p1_q1").await.unwrap());
        assert!(store.get_coordinates("t_p1_q1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn page_images_roundtrip() {
        let store = InMemoryStore::new();
        store
            .save_page_image(&page_image_key("t", 1), vec![1, 2, 3])
            .await
            .unwrap();
        assert_eq!(store.get_page_image("t_page_1").await.unwrap(), Some(vec![1, 2, 3]));
        assert!(store.delete_page_image("t_page_1").await.unwrap());
        assert!(store.get_page_image("t_page_1").await.unwrap().is_none());
        assert_eq!(store.page_image_count().await, 1);
    }

    #[tokio::test]
    async fn user_edit_is_sanitized_and_attributed() {
        let store = InMemoryStore::new();
        store.save_coordinates(&metadata()).await.unwrap();

        let edited = DiagramCoordinates::new(101.0, 152.0, 900.0, 252.0)
            .with_type(DiagramType::Graph)
            .with_confidence(0.5);
        let meta = apply_user_edit(&store, "t_p1_q1", "t_p1_q1_diagram_1", &edited)
            .await
            .unwrap();
        let record = &meta.diagrams[0];
        assert_eq!(record.modified_by, ModifiedBy::User);
        assert!(record.coordinates.x2 <= 800.0);
        assert_eq!(record.coordinates.x1 % 5.0, 0.0);
        assert!(record.confidence > 0.5);

        let stored = store.get_coordinates("t_p1_q1").await.unwrap().unwrap();
        assert_eq!(stored, meta);
    }

    #[tokio::test]
    async fn user_edit_unknown_ids() {
        let store = InMemoryStore::new();
        let c = DiagramCoordinates::new(0.0, 0.0, 50.0, 50.0);
        assert!(matches!(
            apply_user_edit(&store, "missing", "d", &c).await,
            Err(StoreError::NotFound(_))
        ));
        store.save_coordinates(&metadata()).await.unwrap();
        assert!(matches!(
            apply_user_edit(&store, "t_p1_q1", "nope", &c).await,
            Err(StoreError::NotFound(id)) if id == "nope"
        ));
    }
}
