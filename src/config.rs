//! Centralized daemon configuration.
//! Combines environment variables and CLI arguments.

use anyhow::{Context, Result};
use clap::Parser;
use std::env;
use std::path::PathBuf;

use crate::models::Credential;

const DEFAULT_HOSTNAME: &str = "s3.amazonaws.com";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub data_root: PathBuf,
    pub credentials: Vec<Credential>,
    pub hostnames: Vec<String>,
    pub host_id: String,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "S3-compatible object storage daemon")]
pub struct Args {
    /// Host to bind to (overrides S3D_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides S3D_PORT)
    #[arg(long, short)]
    pub port: Option<u16>,

    /// Directory holding blobs and the metadata store (overrides S3D_DATA_ROOT)
    #[arg(long, short)]
    pub data_root: Option<PathBuf>,

    /// AWS access key id accepted by the daemon
    #[arg(long, short)]
    pub access_key: Option<String>,

    /// AWS secret access key paired with --access-key
    #[arg(long, short)]
    pub secret_key: Option<String>,

    /// Display name reported for the credential
    #[arg(long, short = 'n')]
    pub display_name: Option<String>,

    /// Additional hostname suffixes for virtual-hosted-style buckets
    #[arg(long = "hostname", value_delimiter = ',')]
    pub hostnames: Vec<String>,

    /// Value echoed as x-amz-id-2 (generated when absent)
    #[arg(long)]
    pub host_id: Option<String>,
}

impl AppConfig {
    /// Parse environment variables + CLI args into an AppConfig.
    pub fn from_env_and_args() -> Result<Self> {
        Self::build(Args::parse())
    }

    fn build(args: Args) -> Result<Self> {
        let env_host = env::var("S3D_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = match env::var("S3D_PORT") {
            Ok(value) => Some(
                value
                    .parse::<u16>()
                    .with_context(|| format!("parsing S3D_PORT value `{value}`"))?,
            ),
            Err(_) => None,
        };
        let env_data_root = env::var("S3D_DATA_ROOT").unwrap_or_else(|_| "./data".into());

        let access_key = args.access_key.or_else(|| env::var("S3D_ACCESS_KEY").ok());
        let secret_key = args.secret_key.or_else(|| env::var("S3D_SECRET_KEY").ok());
        let display_name = args
            .display_name
            .or_else(|| env::var("S3D_DISPLAY_NAME").ok())
            .unwrap_or_else(|| "Example Account".into());

        let mut credentials = Vec::new();
        if let (Some(access_key_id), Some(secret_key)) = (access_key, secret_key) {
            credentials.push(Credential {
                access_key_id,
                secret_key,
                display_name,
            });
        }

        let mut hostnames = vec![DEFAULT_HOSTNAME.to_string()];
        hostnames.extend(args.hostnames);

        Ok(Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.or(env_port).unwrap_or(8080),
            data_root: args
                .data_root
                .unwrap_or_else(|| PathBuf::from(env_data_root)),
            credentials,
            hostnames,
            host_id: args
                .host_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string()),
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn buckets_dir(&self) -> PathBuf {
        self.data_root.join("buckets")
    }

    pub fn meta_path(&self) -> PathBuf {
        self.data_root.join("meta.db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_args() -> Args {
        Args {
            host: None,
            port: None,
            data_root: None,
            access_key: None,
            secret_key: None,
            display_name: None,
            hostnames: Vec::new(),
            host_id: None,
        }
    }

    #[test]
    fn credential_requires_both_halves() {
        let cfg = AppConfig::build(Args {
            access_key: Some("AKID".into()),
            ..bare_args()
        })
        .unwrap();
        assert!(cfg.credentials.is_empty());

        let cfg = AppConfig::build(Args {
            access_key: Some("AKID".into()),
            secret_key: Some("secret".into()),
            ..bare_args()
        })
        .unwrap();
        assert_eq!(cfg.credentials.len(), 1);
        assert_eq!(cfg.credentials[0].display_name, "Example Account");
    }

    #[test]
    fn default_hostname_is_always_present() {
        let cfg = AppConfig::build(Args {
            hostnames: vec!["s3.local".into()],
            ..bare_args()
        })
        .unwrap();
        assert!(cfg.hostnames.contains(&DEFAULT_HOSTNAME.to_string()));
        assert!(cfg.hostnames.contains(&"s3.local".to_string()));
    }

    #[test]
    fn data_paths_hang_off_the_root() {
        let cfg = AppConfig::build(Args {
            data_root: Some(PathBuf::from("/tmp/s3d")),
            ..bare_args()
        })
        .unwrap();
        assert_eq!(cfg.buckets_dir(), PathBuf::from("/tmp/s3d/buckets"));
        assert_eq!(cfg.meta_path(), PathBuf::from("/tmp/s3d/meta.db"));
    }
}
