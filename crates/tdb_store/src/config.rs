use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use tdb_core::{TdbError, TdbResult};

const DEFAULT_CONFIG_NAME: &str = "tdb.json";
pub const DEFAULT_ENGINE: &str = "main";
pub const DB_REQUIRED_ENV: &str = "TDB_DB_REQUIRED";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum DatabaseConfig {
    Sqlite { path: Option<String> },
    Postgres { url: String },
    Mysql { url: String },
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PoolConfig {
    pub max_connections: Option<u32>,
    pub min_connections: Option<u32>,
    pub connect_timeout_ms: Option<u64>,
    pub acquire_timeout_ms: Option<u64>,
    pub idle_timeout_ms: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    pub database: DatabaseConfig,
    pub pool: Option<PoolConfig>,
}

impl EngineConfig {
    pub fn sqlite(path: impl Into<String>) -> Self {
        Self {
            database: DatabaseConfig::Sqlite {
                path: Some(path.into()),
            },
            pool: None,
        }
    }

    pub fn backend_name(&self) -> &'static str {
        match self.database {
            DatabaseConfig::Sqlite { .. } => "sqlite",
            DatabaseConfig::Postgres { .. } => "postgres",
            DatabaseConfig::Mysql { .. } => "mysql",
        }
    }

    pub fn sqlite_path(&self, base_dir: &Path) -> TdbResult<PathBuf> {
        match &self.database {
            DatabaseConfig::Sqlite { path } => {
                let path = path.clone().unwrap_or_else(|| "tdb.sqlite".to_string());
                let candidate = PathBuf::from(path);
                if candidate.is_absolute() {
                    Ok(candidate)
                } else {
                    Ok(base_dir.join(candidate))
                }
            }
            _ => Err(TdbError::configuration("engine is not sqlite backend")),
        }
    }

    pub fn connection_url(&self, base_dir: &Path) -> TdbResult<String> {
        match &self.database {
            DatabaseConfig::Sqlite { .. } => {
                let path = self.sqlite_path(base_dir)?;
                Ok(format!("sqlite://{}?mode=rwc", path.display()))
            }
            DatabaseConfig::Postgres { url } | DatabaseConfig::Mysql { url } => Ok(url.clone()),
        }
    }
}

/// A thing type and the engines holding its tables. The first engine is
/// the master; the rest are read replicas.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ThingTypeConfig {
    pub name: String,
    pub engines: Vec<String>,
    #[serde(default)]
    pub avoid_master_reads: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelationTypeConfig {
    pub name: String,
    pub type1: String,
    pub type2: String,
    pub engines: Vec<String>,
    #[serde(default)]
    pub avoid_master_reads: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HardCacheConfig {
    /// Entries of the form `category:engine[:engine...][:!profile]`.
    pub categories: Vec<String>,
}

/// One parsed hard cache category line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CategorySpec {
    pub category: String,
    pub engines: Vec<String>,
    pub profile: bool,
}

impl HardCacheConfig {
    pub fn parse(&self) -> TdbResult<Vec<CategorySpec>> {
        let mut specs = Vec::with_capacity(self.categories.len());
        for line in &self.categories {
            let mut parts = line.split(':').map(str::trim);
            let category = parts.next().unwrap_or_default();
            if category.is_empty() {
                return Err(TdbError::configuration(format!(
                    "hardcache category line '{line}' has no category"
                )));
            }
            let mut engines = Vec::new();
            let mut profile = false;
            for part in parts {
                if part == "!profile" {
                    profile = true;
                } else if let Some(flag) = part.strip_prefix('!') {
                    return Err(TdbError::configuration(format!(
                        "unknown hardcache flag '!{flag}'"
                    )));
                } else if !part.is_empty() {
                    engines.push(part.to_string());
                }
            }
            if engines.is_empty() {
                return Err(TdbError::configuration(format!(
                    "hardcache category '{category}' has no engines"
                )));
            }
            specs.push(CategorySpec {
                category: category.to_string(),
                engines,
                profile,
            });
        }
        if !specs.iter().any(|spec| spec.category == "*") {
            return Err(TdbError::configuration(
                "hardcache categories need a '*' default",
            ));
        }
        Ok(specs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TdbConfig {
    #[serde(default = "default_app_name")]
    pub app_name: String,
    pub engines: BTreeMap<String, EngineConfig>,
    pub type_db: String,
    pub rel_type_db: String,
    #[serde(default)]
    pub things: Vec<ThingTypeConfig>,
    #[serde(default)]
    pub relations: Vec<RelationTypeConfig>,
    #[serde(default)]
    pub predefined_type_ids: BTreeMap<String, i64>,
    #[serde(default = "default_true")]
    pub create_tables: bool,
    #[serde(default)]
    pub require_db: bool,
    #[serde(default)]
    pub disallow_writes: bool,
    #[serde(default = "default_max_val_len")]
    pub max_val_len: usize,
    #[serde(default)]
    pub read_seed: Option<u64>,
    #[serde(default)]
    pub hardcache: Option<HardCacheConfig>,
}

fn default_app_name() -> String {
    "tdb".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_val_len() -> usize {
    1000
}

impl TdbConfig {
    /// Single SQLite engine hosting everything, including the hard cache.
    pub fn default_sqlite(path: impl Into<String>) -> Self {
        let mut engines = BTreeMap::new();
        engines.insert(DEFAULT_ENGINE.to_string(), EngineConfig::sqlite(path));
        Self {
            app_name: default_app_name(),
            engines,
            type_db: DEFAULT_ENGINE.to_string(),
            rel_type_db: DEFAULT_ENGINE.to_string(),
            things: Vec::new(),
            relations: Vec::new(),
            predefined_type_ids: BTreeMap::new(),
            create_tables: true,
            require_db: false,
            disallow_writes: false,
            max_val_len: default_max_val_len(),
            read_seed: None,
            hardcache: Some(HardCacheConfig {
                categories: vec![format!("*:{DEFAULT_ENGINE}")],
            }),
        }
    }

    pub fn load_or_init(base_dir: &Path, default_sqlite_path: &Path) -> TdbResult<Self> {
        fs::create_dir_all(base_dir)
            .map_err(|err| TdbError::configuration(format!("create config dir: {err}")))?;
        let config_path = base_dir.join(DEFAULT_CONFIG_NAME);
        let mut config = if config_path.exists() {
            let raw = fs::read_to_string(&config_path)
                .map_err(|err| TdbError::configuration(format!("read config: {err}")))?;
            serde_json::from_str::<TdbConfig>(&raw)
                .map_err(|err| TdbError::configuration(err.to_string()))?
        } else {
            let default = TdbConfig::default_sqlite(default_sqlite_path.to_string_lossy());
            let payload = serde_json::to_string_pretty(&default)
                .map_err(|err| TdbError::configuration(format!("serialize config: {err}")))?;
            fs::write(&config_path, payload)
                .map_err(|err| TdbError::configuration(format!("write config: {err}")))?;
            default
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> TdbResult<()> {
        if let Ok(raw) = std::env::var(DB_REQUIRED_ENV) {
            self.require_db = parse_flag(&raw).ok_or_else(|| {
                TdbError::configuration(format!("{DB_REQUIRED_ENV}='{raw}' is not a boolean"))
            })?;
        }
        Ok(())
    }

    pub fn engine(&self, name: &str) -> TdbResult<&EngineConfig> {
        self.engines
            .get(name)
            .ok_or_else(|| TdbError::configuration(format!("unknown engine '{name}'")))
    }

    pub fn hardcache_categories(&self) -> TdbResult<Option<Vec<CategorySpec>>> {
        self.hardcache.as_ref().map(HardCacheConfig::parse).transpose()
    }

    pub fn validate(&self) -> TdbResult<()> {
        if self.app_name.is_empty() {
            return Err(TdbError::configuration("app_name must not be empty"));
        }
        if self.max_val_len == 0 {
            return Err(TdbError::configuration("max_val_len must be positive"));
        }
        self.engine(&self.type_db)?;
        self.engine(&self.rel_type_db)?;

        let mut thing_names = BTreeSet::new();
        for thing in &self.things {
            if !thing_names.insert(thing.name.as_str()) {
                return Err(TdbError::configuration(format!(
                    "thing type '{}' declared twice",
                    thing.name
                )));
            }
            self.check_engines(&thing.name, &thing.engines)?;
        }
        let mut rel_names = BTreeSet::new();
        for rel in &self.relations {
            if !rel_names.insert(rel.name.as_str()) {
                return Err(TdbError::configuration(format!(
                    "relation type '{}' declared twice",
                    rel.name
                )));
            }
            for endpoint in [&rel.type1, &rel.type2] {
                if !thing_names.contains(endpoint.as_str()) {
                    return Err(TdbError::configuration(format!(
                        "relation '{}' references undeclared thing type '{endpoint}'",
                        rel.name
                    )));
                }
            }
            self.check_engines(&rel.name, &rel.engines)?;
        }
        if let Some(categories) = self.hardcache_categories()? {
            for spec in categories {
                self.check_engines(&spec.category, &spec.engines)?;
            }
        }
        Ok(())
    }

    fn check_engines(&self, owner: &str, engines: &[String]) -> TdbResult<()> {
        if engines.is_empty() {
            return Err(TdbError::configuration(format!("'{owner}' has no engines")));
        }
        for engine in engines {
            self.engine(engine)?;
        }
        Ok(())
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::{CategorySpec, HardCacheConfig, TdbConfig, ThingTypeConfig, parse_flag};
    use tdb_core::ErrorKind;

    #[test]
    fn parses_category_lines() {
        let config = HardCacheConfig {
            categories: vec![
                "*:main".to_string(),
                "sessions:main:replica:!profile".to_string(),
            ],
        };
        let specs = config.parse().expect("categories");
        assert_eq!(
            specs[1],
            CategorySpec {
                category: "sessions".to_string(),
                engines: vec!["main".to_string(), "replica".to_string()],
                profile: true,
            }
        );
    }

    #[test]
    fn categories_require_default() {
        let config = HardCacheConfig {
            categories: vec!["sessions:main".to_string()],
        };
        let err = config.parse().expect_err("missing default");
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn validate_rejects_dangling_engines() {
        let mut config = TdbConfig::default_sqlite("tdb.sqlite");
        config.things.push(ThingTypeConfig {
            name: "link".to_string(),
            engines: vec!["nowhere".to_string()],
            avoid_master_reads: false,
        });
        assert_eq!(
            config.validate().expect_err("dangling").kind(),
            ErrorKind::Configuration
        );
    }

    #[test]
    fn flags_parse_loosely() {
        assert_eq!(parse_flag("TRUE"), Some(true));
        assert_eq!(parse_flag("0"), Some(false));
        assert_eq!(parse_flag("maybe"), None);
    }
}
