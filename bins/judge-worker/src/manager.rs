/// Pool Manager - one Language Container Pool per configured language
///
/// Constructed once by `main` and shared with the workers behind an `Arc`.
use crate::config::LanguageConfigManager;
use crate::error::SandboxError;
use crate::pool::{LanguagePool, PoolSettings, PoolStats};
use crate::sandbox::SandboxRuntime;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info};

pub struct PoolManager {
    pools: HashMap<String, Arc<LanguagePool>>,
}

impl PoolManager {
    pub fn new(
        languages: &LanguageConfigManager,
        runtime: Arc<dyn SandboxRuntime>,
        settings: PoolSettings,
    ) -> Self {
        let pools = languages
            .iter()
            .map(|(name, config)| {
                let pool = LanguagePool::new(
                    name.clone(),
                    config.clone(),
                    Arc::clone(&runtime),
                    settings.clone(),
                );
                (name.clone(), Arc::new(pool))
            })
            .collect();

        Self { pools }
    }

    /// Warm every pool. Any failure is fatal for the process; pools that
    /// already warmed up are torn down before returning the error.
    pub async fn initialize(&self) -> Result<(), SandboxError> {
        let mut languages: Vec<&String> = self.pools.keys().collect();
        languages.sort();

        for language in languages {
            let pool = &self.pools[language];
            if let Err(e) = pool.initialize().await {
                error!(language = %language, error = %e, "Pool initialization failed");
                self.shutdown().await;
                return Err(e);
            }
        }

        info!(languages = ?self.languages(), "All pools initialized");
        Ok(())
    }

    /// Language names match case-insensitively, like the registry keys
    pub fn get_pool(&self, language: &str) -> Option<Arc<LanguagePool>> {
        self.pools.get(&language.trim().to_lowercase()).cloned()
    }

    pub fn languages(&self) -> Vec<String> {
        let mut languages: Vec<String> = self.pools.keys().cloned().collect();
        languages.sort();
        languages
    }

    pub async fn stats(&self) -> Vec<PoolStats> {
        let mut stats = Vec::with_capacity(self.pools.len());
        for language in self.languages() {
            stats.push(self.pools[&language].stats().await);
        }
        stats
    }

    pub async fn shutdown(&self) {
        futures_util::future::join_all(self.pools.values().map(|pool| pool.shutdown())).await;
        info!("All pools shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeRuntime;

    const LANGUAGES: &str = r#"{
        "languages": {
            "python": {
                "image": "python:3.11-slim",
                "poolSize": 2,
                "command": "run {source}",
                "timeout": 1000,
                "fileExtension": ".py"
            },
            "cpp": {
                "image": "gcc:13",
                "poolSize": 1,
                "command": "run {source}",
                "timeout": 1000,
                "fileExtension": ".cpp"
            }
        }
    }"#;

    fn manager(runtime: &Arc<FakeRuntime>) -> PoolManager {
        let languages = LanguageConfigManager::from_json(LANGUAGES).unwrap();
        PoolManager::new(&languages, runtime.clone(), PoolSettings::default())
    }

    #[tokio::test]
    async fn test_one_pool_per_language() {
        let runtime = Arc::new(FakeRuntime::new());
        let manager = manager(&runtime);
        manager.initialize().await.unwrap();

        assert_eq!(manager.languages(), vec!["cpp", "python"]);
        assert_eq!(manager.get_pool("python").unwrap().language(), "python");
        assert_eq!(runtime.live(), 3);

        let stats = manager.stats().await;
        assert_eq!(stats[0].language, "cpp");
        assert_eq!(stats[1].available, 2);
    }

    #[tokio::test]
    async fn test_unknown_language_has_no_pool() {
        let runtime = Arc::new(FakeRuntime::new());
        let manager = manager(&runtime);

        assert!(manager.get_pool("brainfuck").is_none());
        assert!(manager.get_pool("").is_none());
    }

    #[tokio::test]
    async fn test_language_lookup_ignores_case() {
        let runtime = Arc::new(FakeRuntime::new());
        let manager = manager(&runtime);

        assert_eq!(manager.get_pool("Python").unwrap().language(), "python");
        assert_eq!(manager.get_pool("CPP").unwrap().language(), "cpp");
    }

    #[tokio::test]
    async fn test_failed_initialization_tears_down_warm_pools() {
        let runtime = Arc::new(FakeRuntime::new());
        // cpp warms first, python then fails
        runtime.remove_image("python:3.11-slim");
        let manager = manager(&runtime);

        let err = manager.initialize().await.unwrap_err();
        assert!(matches!(err, SandboxError::Engine(_)));
        assert_eq!(runtime.live(), 0);
        assert_eq!(runtime.destroyed().len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_closes_every_pool() {
        let runtime = Arc::new(FakeRuntime::new());
        let manager = manager(&runtime);
        manager.initialize().await.unwrap();

        manager.shutdown().await;
        assert_eq!(runtime.live(), 0);

        let pool = manager.get_pool("cpp").unwrap();
        assert!(matches!(
            pool.process_run_code("echo", "", 0).await.unwrap_err(),
            SandboxError::PoolClosed(_)
        ));
    }
}
