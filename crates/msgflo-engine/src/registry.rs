//! Participant registry: the list of normalized `Definition`s an engine has
//! accepted, used for id-uniqueness checks and discovery announcement.

use msgflo_common::Definition;
use tokio::sync::RwLock;

#[derive(Default)]
pub struct Registry {
    definitions: RwLock<Vec<Definition>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn contains_id(&self, id: &str) -> bool {
        self.definitions.read().await.iter().any(|d| d.id == id)
    }

    pub async fn insert(&self, definition: Definition) {
        self.definitions.write().await.push(definition);
    }

    pub async fn snapshot(&self) -> Vec<Definition> {
        self.definitions.read().await.clone()
    }
}
