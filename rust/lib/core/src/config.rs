use std::path::PathBuf;

/// Common CLI configuration shared by services embedding the ORM core.
///
/// Each service binary parses these from command-line arguments or
/// environment variables, then passes them to storage initialization.
#[derive(Debug, Clone, Default)]
pub struct ServiceConfig {
    /// Base data directory. Other paths default to subdirectories of it.
    pub data_dir: Option<PathBuf>,

    /// Path to the redb row-store database file.
    /// Defaults to `{data_dir}/data.redb` if not specified.
    pub db_path: Option<PathBuf>,

    /// Root directory of the content-addressed filestore.
    /// Defaults to `{data_dir}/filestore/` if not specified.
    pub filestore_dir: Option<PathBuf>,
}

impl ServiceConfig {
    /// Parse configuration from command-line arguments.
    ///
    /// Supported flags:
    /// - `--data-dir=PATH`
    /// - `--db=PATH`
    /// - `--filestore=PATH`
    pub fn from_args(args: &[String]) -> Self {
        let mut config = ServiceConfig::default();

        for arg in args {
            if let Some(val) = arg.strip_prefix("--data-dir=") {
                config.data_dir = Some(PathBuf::from(val));
            } else if let Some(val) = arg.strip_prefix("--db=") {
                config.db_path = Some(PathBuf::from(val));
            } else if let Some(val) = arg.strip_prefix("--filestore=") {
                config.filestore_dir = Some(PathBuf::from(val));
            }
        }

        config
    }

    /// Resolve the row-store database path, falling back to `{data_dir}/data.redb`.
    pub fn resolve_db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| self.resolve_data_subpath("data.redb"))
    }

    /// Resolve the filestore root, falling back to `{data_dir}/filestore`.
    pub fn resolve_filestore_dir(&self) -> PathBuf {
        self.filestore_dir
            .clone()
            .unwrap_or_else(|| self.resolve_data_subpath("filestore"))
    }

    fn resolve_data_subpath(&self, name: &str) -> PathBuf {
        self.data_dir
            .as_ref()
            .map(|d| d.join(name))
            .unwrap_or_else(|| PathBuf::from(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_args() {
        let args = vec![
            "--data-dir=/var/lib/terp".to_string(),
            "--filestore=/srv/filestore".to_string(),
        ];
        let config = ServiceConfig::from_args(&args);
        assert_eq!(config.data_dir, Some(PathBuf::from("/var/lib/terp")));
        assert_eq!(config.filestore_dir, Some(PathBuf::from("/srv/filestore")));
    }

    #[test]
    fn test_resolve_defaults() {
        let config = ServiceConfig {
            data_dir: Some(PathBuf::from("/data")),
            ..Default::default()
        };
        assert_eq!(config.resolve_db_path(), PathBuf::from("/data/data.redb"));
        assert_eq!(
            config.resolve_filestore_dir(),
            PathBuf::from("/data/filestore")
        );
    }
}
