// Language configuration management for the judge worker
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

fn default_memory_limit_mb() -> u32 {
    512
}

fn default_cpu_limit() -> f32 {
    0.5
}

fn default_fail_on_stderr() -> bool {
    true
}

/// Pool configuration for one language runtime.
///
/// `command` is run through `sh -c` inside the sandbox; `{source}` and
/// `{class}` are replaced with the source path and its file stem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LanguageConfig {
    pub image: String,
    pub pool_size: usize,
    pub command: String,
    /// Per-exec timeout in milliseconds
    pub timeout: u64,
    pub file_extension: String,
    #[serde(default = "default_memory_limit_mb")]
    pub memory_limit_mb: u32,
    #[serde(default = "default_cpu_limit")]
    pub cpu_limit: f32,
    /// Treat any stderr output as a failed run
    #[serde(default = "default_fail_on_stderr")]
    pub fail_on_stderr: bool,
}

impl LanguageConfig {
    fn validate(&self, name: &str) -> Result<()> {
        if self.image.trim().is_empty() {
            bail!("Language '{}' has an empty image", name);
        }
        if self.pool_size == 0 {
            bail!("Language '{}' must have a poolSize of at least 1", name);
        }
        if self.command.trim().is_empty() {
            bail!("Language '{}' has an empty command", name);
        }
        if self.timeout == 0 {
            bail!("Language '{}' must have a non-zero timeout", name);
        }
        if self.cpu_limit.is_nan() || self.cpu_limit <= 0.0 {
            bail!("Language '{}' must have a positive cpuLimit", name);
        }
        Ok(())
    }

    pub fn memory_limit_bytes(&self) -> i64 {
        i64::from(self.memory_limit_mb) * 1024 * 1024
    }

    pub fn nano_cpus(&self) -> i64 {
        (f64::from(self.cpu_limit) * 1_000_000_000.0) as i64
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LanguagesJson {
    languages: BTreeMap<String, LanguageConfig>,
}

/// Language configuration manager
#[derive(Debug, Clone)]
pub struct LanguageConfigManager {
    configs: BTreeMap<String, LanguageConfig>,
}

impl LanguageConfigManager {
    /// Load language configurations from a languages.json file
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Language config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;

        Self::from_json(&content)
            .with_context(|| format!("Invalid language config in {}", config_path.display()))
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let languages_json: LanguagesJson =
            serde_json::from_str(content).context("Failed to parse languages.json")?;

        if languages_json.languages.is_empty() {
            bail!("No languages configured");
        }

        let mut configs = BTreeMap::new();
        for (name, config) in languages_json.languages {
            let name = name.to_lowercase();
            config.validate(&name)?;
            configs.insert(name, config);
        }

        Ok(Self { configs })
    }

    /// Get configuration for a specific language
    pub fn get_config(&self, language: &str) -> Option<&LanguageConfig> {
        self.configs.get(language)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &LanguageConfig)> {
        self.configs.iter()
    }

    /// List all supported languages
    pub fn list_languages(&self) -> Vec<String> {
        self.configs.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"{
        "languages": {
            "python": {
                "image": "python:3.11-slim",
                "poolSize": 2,
                "command": "python3 {source} < /app/input.txt",
                "timeout": 5000,
                "fileExtension": ".py"
            },
            "Java": {
                "image": "eclipse-temurin:17",
                "poolSize": 1,
                "command": "cd /app && javac {class}.java && java {class} < input.txt",
                "timeout": 10000,
                "fileExtension": ".java",
                "memoryLimitMb": 1024,
                "failOnStderr": false
            }
        }
    }"#;

    #[test]
    fn test_parse_languages() {
        let manager = LanguageConfigManager::from_json(SAMPLE).unwrap();

        assert_eq!(manager.list_languages(), vec!["java", "python"]);

        let python = manager.get_config("python").unwrap();
        assert_eq!(python.pool_size, 2);
        assert_eq!(python.memory_limit_mb, 512);
        assert_eq!(python.nano_cpus(), 500_000_000);
        assert!(python.fail_on_stderr);

        let java = manager.get_config("java").unwrap();
        assert_eq!(java.memory_limit_bytes(), 1024 * 1024 * 1024);
        assert!(!java.fail_on_stderr);

        assert!(manager.get_config("cobol").is_none());
    }

    #[test]
    fn test_rejects_zero_pool_size() {
        let raw = SAMPLE.replace("\"poolSize\": 2", "\"poolSize\": 0");
        let err = LanguageConfigManager::from_json(&raw).unwrap_err();
        assert!(err.to_string().contains("poolSize"));
    }

    #[test]
    fn test_rejects_empty_registry() {
        assert!(LanguageConfigManager::from_json(r#"{"languages": {}}"#).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let manager = LanguageConfigManager::load(file.path()).unwrap();
        assert_eq!(manager.iter().count(), 2);
    }

    #[test]
    fn test_missing_file() {
        let err = LanguageConfigManager::load(Path::new("/nonexistent/languages.json")).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_shipped_config_is_valid() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../config/languages.json");
        let manager = LanguageConfigManager::load(&path).unwrap();
        assert!(manager.get_config("python").is_some());
    }
}
