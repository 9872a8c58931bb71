//! Settings for the CLI and the server. Layered: built-in defaults, then an
//! optional `tagledger.toml`, then `TAGLEDGER_` environment variables
//! (`TAGLEDGER_DATABASE__PATH`, `TAGLEDGER_QUERY__MAX_PAGE_SIZE`, ...).
use crate::query::PageLimits;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct Database {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Rules {
    /// Classifier rule file (`{"rule text": ["tag", ...]}`)
    pub file: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Log {
    pub level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Server {
    pub bind: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Query {
    pub default_page_size: u32,
    pub max_page_size: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub database: Database,
    pub rules: Rules,
    pub log: Log,
    pub server: Server,
    pub query: Query,
}

impl Settings {
    pub fn load(config_file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .set_default("database.path", "tagledger.db")?
            .set_default("rules.file", "rules.json")?
            .set_default("log.level", "info")?
            .set_default("server.bind", "127.0.0.1")?
            .set_default("server.port", 4000)?
            .set_default("query.default_page_size", 1000)?
            .set_default("query.max_page_size", 10000)?;

        if let Some(path) = config_file {
            builder = builder.add_source(File::from(path).required(true));
        }

        let settings: Settings = builder
            .add_source(
                Environment::with_prefix("TAGLEDGER")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let query = &self.query;
        if query.max_page_size == 0 || query.default_page_size == 0 {
            return Err(ConfigError::Message("page sizes must be positive".to_string()));
        }
        if query.default_page_size > query.max_page_size {
            return Err(ConfigError::Message(format!(
                "query.default_page_size ({}) exceeds query.max_page_size ({})",
                query.default_page_size, query.max_page_size
            )));
        }
        Ok(())
    }

    pub fn page_limits(&self) -> PageLimits {
        PageLimits {
            default_page_size: self.query.default_page_size,
            max_page_size: self.query.max_page_size,
        }
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.bind, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn toml_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_file_overrides_defaults() {
        let file = toml_file(
            "[database]\npath = \"/tmp/ledger.db\"\n\n[query]\ndefault_page_size = 50\nmax_page_size = 500\n",
        );
        let settings = Settings::load(Some(file.path())).unwrap();

        assert_eq!(settings.database.path, PathBuf::from("/tmp/ledger.db"));
        assert_eq!(settings.rules.file, PathBuf::from("rules.json"));
        assert_eq!(
            settings.page_limits(),
            PageLimits {
                default_page_size: 50,
                max_page_size: 500
            }
        );
        assert_eq!(settings.server.port, 4000);
    }

    #[test]
    fn test_inconsistent_page_sizes_are_rejected() {
        let file = toml_file("[query]\ndefault_page_size = 100\nmax_page_size = 10\n");
        assert!(Settings::load(Some(file.path())).is_err());
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        assert!(Settings::load(Some(Path::new("/nonexistent/tagledger.toml"))).is_err());
    }
}
