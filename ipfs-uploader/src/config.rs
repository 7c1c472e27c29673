//! Application configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable overrides. The configuration
//! file path defaults to `config.yaml` but can be specified via `-f` flag or `IPFS_UPLOADER_CONFIG`
//! environment variable.
//!
//! ## Loading Priority
//!
//! 1. **YAML config file** - Base configuration (default: `config.yaml`)
//! 2. **Environment variables** - Variables prefixed with `IPFS_UPLOADER_` override YAML values
//!
//! For nested config values, use double underscores in environment variables. For example,
//! `IPFS_UPLOADER_SHUTDOWN_GRACE_PERIOD=30s` sets `shutdown_grace_period`.
//!
//! ## Example
//!
//! ```yaml
//! port: 4000
//! request_deadline: 2m
//! backends:
//!   - name: local
//!     url: http://127.0.0.1:5001
//!   - name: pinning-service
//!     url: https://ipfs.example.com
//!     credential:
//!       value: my-api-key
//!     timeout: 30s
//!     max_concurrency: 4
//!     tree_uploads: false
//! ```

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize, Serializer};
use url::Url;

use crate::backends::BackendEndpoint;
use crate::errors::{Error, UploadError};
use crate::fanout::IdentifierPolicy;

/// CLI arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "IPFS_UPLOADER_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit without starting the server.
    #[arg(long)]
    pub validate: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run the HTTP upload server (the default)
    Serve,
    /// Upload content to every configured node
    Upload {
        /// Give up on nodes that have not answered within this long (e.g. `30s`)
        #[arg(long, value_parser = humantime::parse_duration)]
        deadline: Option<Duration>,

        #[command(subcommand)]
        target: UploadTarget,
    },
    /// Write a configuration file with a single node
    Init {
        /// RPC address of the node (e.g. `http://127.0.0.1:5001`)
        #[arg(long)]
        url: Url,
        /// API key sent as `X-API-Key`
        #[arg(long)]
        api_key: Option<String>,
        /// Overwrite an existing configuration file
        #[arg(long)]
        force: bool,
    },
    /// Remove the configuration file and `.env`
    Reset {
        /// Actually delete; without this only a warning is printed
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum UploadTarget {
    /// One or more files, each reported separately
    File {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// A string, uploaded as text/plain
    Text { text: String },
    /// A JSON document, validated before upload
    Json { path: PathBuf },
    /// A directory, uploaded as a single tree
    Dir { path: PathBuf },
}

/// Main application configuration.
///
/// All fields have defaults; only `backends` must be provided.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// HTTP server host to bind to (e.g., "0.0.0.0" for all interfaces)
    pub host: String,
    /// HTTP server port to bind to
    pub port: u16,
    /// Nodes to fan uploads out to, in priority order
    pub backends: Vec<BackendEndpoint>,
    /// How long shutdown waits for in-flight uploads before cancelling them
    #[serde(with = "humantime_serde")]
    pub shutdown_grace_period: Duration,
    /// Deadline applied to every upload call made through the HTTP server
    #[serde(with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub request_deadline: Option<Duration>,
    /// Maximum request body size in bytes
    pub max_upload_size: usize,
    pub identifier_policy: IdentifierPolicy,
    pub cors_allowed_origins: Vec<CorsOrigin>,
    /// Serve Prometheus metrics at `/internal/metrics`
    pub enable_metrics: bool,
    /// Export traces over OTLP (configured through the standard `OTEL_*` variables)
    pub enable_otel_export: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 4000,
            backends: Vec::new(),
            shutdown_grace_period: Duration::from_secs(10),
            request_deadline: None,
            max_upload_size: 100 * 1024 * 1024,
            identifier_policy: IdentifierPolicy::default(),
            cors_allowed_origins: vec![CorsOrigin::Wildcard],
            enable_metrics: false,
            enable_otel_export: false,
        }
    }
}

/// CORS origin specification.
///
/// Can be either a wildcard (`*`) to allow all origins, or a specific URL.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum CorsOrigin {
    /// Allow all origins (`*`)
    #[serde(deserialize_with = "parse_wildcard")]
    Wildcard,
    /// Specific origin URL (e.g., `https://app.example.com`)
    #[serde(deserialize_with = "parse_url")]
    Url(Url),
}

impl Serialize for CorsOrigin {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            CorsOrigin::Wildcard => serializer.serialize_str("*"),
            CorsOrigin::Url(url) => serializer.serialize_str(url.as_str()),
        }
    }
}

fn parse_wildcard<'de, D>(deserializer: D) -> Result<(), D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    if s == "*" {
        Ok(())
    } else {
        Err(serde::de::Error::custom("Expected '*'"))
    }
}

fn parse_url<'de, D>(deserializer: D) -> Result<Url, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    Url::parse(&s).map_err(serde::de::Error::custom)
}

impl Config {
    #[allow(clippy::result_large_err)]
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        let config: Self = Self::figment(args).extract()?;
        config.validate().map_err(|e| figment::Error::from(e.to_string()))?;
        Ok(config)
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            .merge(Yaml::file(&args.config))
            // IPFS_UPLOADER_CONFIG names the file itself
            .merge(Env::prefixed("IPFS_UPLOADER_").ignore(&["config"]).split("__"))
    }

    /// Validate the configuration for consistency and required fields
    pub fn validate(&self) -> Result<(), Error> {
        if self.backends.is_empty() {
            return Err(Error::Upload(UploadError::NoBackendsConfigured));
        }

        let mut names = HashSet::new();
        for backend in &self.backends {
            if !names.insert(backend.name.as_str()) {
                return Err(Error::Upload(UploadError::DuplicateBackendName {
                    name: backend.name.clone(),
                }));
            }
            backend.validate()?;
        }

        if self.max_upload_size == 0 {
            return Err(invalid("max_upload_size must be greater than zero".to_string()));
        }
        if self.request_deadline.is_some_and(|d| d.is_zero()) {
            return Err(invalid("request_deadline must be greater than zero".to_string()));
        }

        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn invalid(message: String) -> Error {
    Error::Other(anyhow::anyhow!("Config validation: {message}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    fn args(path: &str) -> Args {
        Args {
            config: path.to_string(),
            validate: false,
            command: None,
        }
    }

    #[test]
    fn test_backends_from_yaml() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "test.yaml",
                r#"
backends:
  - name: local
    url: http://127.0.0.1:5001
  - name: remote
    url: https://ipfs.example.com
    credential:
      value: sk-test
    timeout: 30s
    max_concurrency: 2
    tree_uploads: false
"#,
            )?;

            let config = Config::load(&args("test.yaml"))?;

            assert_eq!(config.backends.len(), 2);

            let local = &config.backends[0];
            assert_eq!(local.name, "local");
            assert_eq!(local.url.as_str(), "http://127.0.0.1:5001/");
            assert_eq!(local.credential, None);
            assert_eq!(local.timeout, Duration::from_secs(60));
            assert_eq!(local.max_concurrency, 8);
            assert!(local.tree_uploads);
            assert_eq!(local.cid_version, 1);

            let remote = &config.backends[1];
            let credential = remote.credential.as_ref().unwrap();
            assert_eq!(credential.header, "X-API-Key");
            assert_eq!(credential.value, "sk-test");
            assert_eq!(remote.timeout, Duration::from_secs(30));
            assert_eq!(remote.max_concurrency, 2);
            assert!(!remote.tree_uploads);

            Ok(())
        });
    }

    #[test]
    fn test_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file("test.yaml", "backends:\n  - name: local\n    url: http://127.0.0.1:5001\n")?;

            let config = Config::load(&args("test.yaml"))?;

            assert_eq!(config.bind_address(), "0.0.0.0:4000");
            assert_eq!(config.shutdown_grace_period, Duration::from_secs(10));
            assert_eq!(config.request_deadline, None);
            assert_eq!(config.max_upload_size, 100 * 1024 * 1024);
            assert_eq!(config.identifier_policy, IdentifierPolicy::Majority);
            assert_eq!(config.cors_allowed_origins, vec![CorsOrigin::Wildcard]);
            assert!(!config.enable_metrics);

            Ok(())
        });
    }

    #[test]
    fn test_env_overrides_yaml() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "test.yaml",
                r#"
port: 5000
identifier_policy: first_success
backends:
  - name: local
    url: http://127.0.0.1:5001
"#,
            )?;

            jail.set_env("IPFS_UPLOADER_HOST", "127.0.0.1");
            jail.set_env("IPFS_UPLOADER_PORT", "8080");
            jail.set_env("IPFS_UPLOADER_REQUEST_DEADLINE", "45s");

            let config = Config::load(&args("test.yaml"))?;

            assert_eq!(config.host, "127.0.0.1");
            assert_eq!(config.port, 8080);
            assert_eq!(config.request_deadline, Some(Duration::from_secs(45)));
            assert_eq!(config.identifier_policy, IdentifierPolicy::FirstSuccess);

            Ok(())
        });
    }

    #[test]
    fn test_config_path_variable_is_not_a_field() {
        Jail::expect_with(|jail| {
            jail.create_file("test.yaml", "backends:\n  - name: local\n    url: http://127.0.0.1:5001\n")?;
            jail.set_env("IPFS_UPLOADER_CONFIG", "test.yaml");

            let config = Config::load(&args("test.yaml"))?;
            assert_eq!(config.backends.len(), 1);

            Ok(())
        });
    }

    #[test]
    fn test_cors_origins() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "test.yaml",
                r#"
cors_allowed_origins:
  - "*"
  - https://app.example.com
backends:
  - name: local
    url: http://127.0.0.1:5001
"#,
            )?;

            let config = Config::load(&args("test.yaml"))?;
            assert_eq!(config.cors_allowed_origins[0], CorsOrigin::Wildcard);
            assert!(matches!(&config.cors_allowed_origins[1], CorsOrigin::Url(url) if url.host_str() == Some("app.example.com")));

            Ok(())
        });
    }

    #[test]
    fn test_unknown_fields_rejected() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "test.yaml",
                "backends:\n  - name: local\n    url: http://127.0.0.1:5001\n    colour: blue\n",
            )?;

            assert!(Config::load(&args("test.yaml")).is_err());
            Ok(())
        });
    }

    #[test]
    fn test_validation() {
        let config = Config::default();
        assert!(matches!(
            config.validate(),
            Err(Error::Upload(UploadError::NoBackendsConfigured))
        ));

        let endpoint = BackendEndpoint::new("local", "http://127.0.0.1:5001".parse().unwrap());

        let config = Config {
            backends: vec![endpoint.clone(), endpoint.clone()],
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(Error::Upload(UploadError::DuplicateBackendName { .. }))
        ));

        let config = Config {
            backends: vec![endpoint.clone().with_max_concurrency(0)],
            ..Default::default()
        };
        assert!(config.validate().unwrap_err().to_string().contains("max_concurrency"));

        let config = Config {
            backends: vec![endpoint.clone().with_max_concurrency(usize::MAX)],
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(Error::Upload(UploadError::InvalidBackendSetting { name, .. })) if name == "local"
        ));

        let config = Config {
            backends: vec![endpoint.clone().with_timeout(Duration::ZERO)],
            ..Default::default()
        };
        assert!(config.validate().unwrap_err().to_string().contains("timeout"));

        let config = Config {
            backends: vec![endpoint.clone()],
            max_upload_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            backends: vec![endpoint],
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_serialized_config_loads_back() {
        Jail::expect_with(|jail| {
            let config = Config {
                backends: vec![BackendEndpoint::new("local", "http://127.0.0.1:5001".parse().unwrap())],
                ..Default::default()
            };
            jail.create_file("written.yaml", &serde_yaml::to_string(&config).unwrap())?;

            assert_eq!(Config::load(&args("written.yaml"))?, config);
            Ok(())
        });
    }

    #[test]
    fn test_upload_subcommand_parses() {
        let args = Args::parse_from(["ipfs-uploader", "upload", "--deadline", "30s", "text", "Hello, IPFS!"]);
        assert_eq!(
            args.command,
            Some(Command::Upload {
                deadline: Some(Duration::from_secs(30)),
                target: UploadTarget::Text {
                    text: "Hello, IPFS!".to_string()
                },
            })
        );
    }
}
