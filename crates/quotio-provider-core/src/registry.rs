use std::collections::HashMap;
use std::sync::Arc;

use crate::credential::normalize_provider;
use crate::executor::ProviderExecutor;

/// Executors keyed by their provider tag.
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn ProviderExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, executor: Arc<dyn ProviderExecutor>) {
        self.executors
            .insert(normalize_provider(executor.identifier()), executor);
    }

    pub fn get(&self, provider: &str) -> Option<Arc<dyn ProviderExecutor>> {
        self.executors.get(&normalize_provider(provider)).cloned()
    }

    pub fn providers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.executors.keys().cloned().collect();
        names.sort();
        names
    }
}
