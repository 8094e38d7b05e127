use std::collections::BTreeMap;
use std::sync::Arc;

use super::config::TestDefinition;
use crate::error::{AbTestError, Result};

/// Test definitions known to a controller, fixed once the controller is built.
#[derive(Default, Clone)]
pub struct TestRegistry {
    definitions: BTreeMap<String, Arc<TestDefinition>>,
}

impl TestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, definition: TestDefinition) -> Result<()> {
        definition.validate()?;
        if self.definitions.contains_key(&definition.id) {
            return Err(AbTestError::InvalidConfig(format!(
                "test '{}' is already registered",
                definition.id
            )));
        }
        tracing::debug!("[abtest] Registered test {}", definition.id);
        self.definitions
            .insert(definition.id.clone(), Arc::new(definition));
        Ok(())
    }

    pub fn get(&self, test_id: &str) -> Result<Arc<TestDefinition>> {
        self.definitions
            .get(test_id)
            .cloned()
            .ok_or_else(|| AbTestError::NotFound(test_id.to_string()))
    }

    /// Registered ids in sorted order.
    pub fn ids(&self) -> Vec<String> {
        self.definitions.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_get() {
        let mut registry = TestRegistry::new();
        registry
            .register(TestDefinition::new("titles").with_label("Titles"))
            .unwrap();
        assert_eq!(registry.get("titles").unwrap().label, "Titles");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut registry = TestRegistry::new();
        registry.register(TestDefinition::new("titles")).unwrap();
        assert!(matches!(
            registry.register(TestDefinition::new("titles")),
            Err(AbTestError::InvalidConfig(_))
        ));
    }

    #[test]
    fn unknown_test_is_not_found() {
        let registry = TestRegistry::new();
        assert!(registry.is_empty());
        assert!(matches!(
            registry.get("titles"),
            Err(AbTestError::NotFound(_))
        ));
    }

    #[test]
    fn invalid_definition_is_rejected() {
        let mut registry = TestRegistry::new();
        assert!(registry.register(TestDefinition::new("has space")).is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn ids_are_sorted() {
        let mut registry = TestRegistry::new();
        registry.register(TestDefinition::new("titles")).unwrap();
        registry.register(TestDefinition::new("excerpts")).unwrap();
        assert_eq!(registry.ids(), vec!["excerpts", "titles"]);
    }
}
