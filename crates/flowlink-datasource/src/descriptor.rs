//! Connection descriptors handed over by the datasource service
//!
//! A [`ConnectionDescriptor`] carries everything needed to provision
//! connectivity for one configured data source: the database type, the
//! connection URL, credentials (secret pre-encoded by the service layer),
//! an optional explicit driver artifact, free-form driver properties and,
//! for credential-gated backends, a [`SecurityConfig`].

use std::collections::HashMap;
use std::path::PathBuf;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// The fixed set of supported database backends
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum DbType {
    /// MySQL / MariaDB
    MySql,
    /// PostgreSQL
    PostgreSql,
    /// Hive (session-oriented)
    Hive,
    /// Spark SQL (session-oriented)
    Spark,
    /// ClickHouse
    ClickHouse,
    /// Oracle
    Oracle,
    /// SQL Server
    SqlServer,
    /// IBM DB2
    Db2,
}

impl DbType {
    /// All supported types, in catalog order
    pub const ALL: [DbType; 8] = [
        DbType::MySql,
        DbType::PostgreSql,
        DbType::Hive,
        DbType::Spark,
        DbType::ClickHouse,
        DbType::Oracle,
        DbType::SqlServer,
        DbType::Db2,
    ];

    /// Whether this backend requires a capacity-1 session pool.
    ///
    /// Session engines keep per-connection server state (temporary views,
    /// session configuration) that makes multiplexed pooling unsafe.
    pub const fn is_session_engine(self) -> bool {
        matches!(self, Self::Hive | Self::Spark)
    }

    /// Lowercase identifier, also the catalog subdirectory name
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MySql => "mysql",
            Self::PostgreSql => "postgresql",
            Self::Hive => "hive",
            Self::Spark => "spark",
            Self::ClickHouse => "clickhouse",
            Self::Oracle => "oracle",
            Self::SqlServer => "sqlserver",
            Self::Db2 => "db2",
        }
    }
}

impl std::fmt::Display for DbType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DbType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        DbType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::config(format!("unknown database type '{s}'")))
    }
}

/// Kerberos-style security configuration for credential-gated backends
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Path to the realm configuration file (krb5.conf style)
    pub realm_conf_path: PathBuf,
    /// Principal to authenticate as
    pub principal: String,
    /// Path to the keytab holding the principal's key
    pub keytab_path: PathBuf,
}

/// Connection descriptor for one configured data source.
///
/// Owned by the caller and passed by value into the subsystem. The `secret`
/// field is pre-encoded by the service layer (see [`encode_secret`]) and is
/// decoded exactly once, inside pool construction.
#[derive(Clone, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    /// Backend type
    pub db_type: DbType,
    /// Connection URL, e.g. `postgres://host:5432/db`
    pub url: String,
    /// Username
    pub user: String,
    /// Pre-encoded secret
    pub secret: String,
    /// Explicit driver artifact; filled from the catalog when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_artifact_path: Option<PathBuf>,
    /// Additional driver properties
    #[serde(default)]
    pub properties: HashMap<String, String>,
    /// Security configuration for credential-gated backends
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security: Option<SecurityConfig>,
}

impl std::fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Redact credentials so descriptors are safe to log.
        let redacted_url = match url::Url::parse(&self.url) {
            Ok(mut parsed) => {
                if parsed.password().is_some() {
                    let _ = parsed.set_password(Some("***"));
                }
                parsed.to_string()
            }
            Err(_) => self.url.clone(),
        };

        f.debug_struct("ConnectionDescriptor")
            .field("db_type", &self.db_type)
            .field("url", &redacted_url)
            .field("user", &self.user)
            .field("secret", &"***")
            .field("driver_artifact_path", &self.driver_artifact_path)
            .field("properties", &self.properties)
            .field("security", &self.security)
            .finish()
    }
}

impl ConnectionDescriptor {
    /// Create a descriptor with the required fields
    pub fn new(db_type: DbType, url: impl Into<String>) -> Self {
        Self {
            db_type,
            url: url.into(),
            user: String::new(),
            secret: String::new(),
            driver_artifact_path: None,
            properties: HashMap::new(),
            security: None,
        }
    }

    /// Set the username
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    /// Set the secret from plain text, encoding it
    pub fn with_secret(mut self, plain: impl AsRef<str>) -> Self {
        self.secret = encode_secret(plain.as_ref());
        self
    }

    /// Set an explicit driver artifact path
    pub fn with_driver_artifact(mut self, path: impl Into<PathBuf>) -> Self {
        self.driver_artifact_path = Some(path.into());
        self
    }

    /// Add a driver property
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Attach a security configuration
    pub fn with_security(mut self, security: SecurityConfig) -> Self {
        self.security = Some(security);
        self
    }

    /// Parse a descriptor from the service layer's JSON representation
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serialize to the service layer's JSON representation
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Assemble a descriptor from loose service-layer properties.
    ///
    /// Recognized keys: `url`, `user`, `password` (encoded on the way in),
    /// `driverArtifactPath`. Remaining keys become driver properties.
    pub fn from_service_props(db_type: DbType, props: &HashMap<String, String>) -> Result<Self> {
        let url = props
            .get("url")
            .ok_or_else(|| Error::config("service properties missing 'url'"))?;
        let user = props
            .get("user")
            .ok_or_else(|| Error::config("service properties missing 'user'"))?;
        let password = props
            .get("password")
            .ok_or_else(|| Error::config("service properties missing 'password'"))?;

        let mut descriptor = ConnectionDescriptor::new(db_type, url.clone())
            .with_user(user.clone())
            .with_secret(password);

        if let Some(path) = props.get("driverArtifactPath") {
            if !path.is_empty() {
                descriptor.driver_artifact_path = Some(PathBuf::from(path));
            }
        }

        for (key, value) in props {
            if !matches!(key.as_str(), "url" | "user" | "password" | "driverArtifactPath") {
                descriptor.properties.insert(key.clone(), value.clone());
            }
        }

        Ok(descriptor)
    }
}

/// Encode a plain-text secret for storage in a descriptor
pub fn encode_secret(plain: &str) -> String {
    STANDARD.encode(plain.as_bytes())
}

/// Decode a descriptor secret back to plain text
pub fn decode_secret(encoded: &str) -> Result<String> {
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| Error::config(format!("secret is not valid base64: {e}")))?;
    String::from_utf8(bytes).map_err(|e| Error::config(format!("secret is not valid utf-8: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_type_roundtrip() {
        for db_type in DbType::ALL {
            let parsed: DbType = db_type.as_str().parse().unwrap();
            assert_eq!(parsed, db_type);
        }
        assert!("mongodb".parse::<DbType>().is_err());
    }

    #[test]
    fn test_session_engine_types() {
        assert!(DbType::Hive.is_session_engine());
        assert!(DbType::Spark.is_session_engine());
        assert!(!DbType::PostgreSql.is_session_engine());
        assert!(!DbType::MySql.is_session_engine());
    }

    #[test]
    fn test_secret_roundtrip() {
        let encoded = encode_secret("s3cr3t!");
        assert_ne!(encoded, "s3cr3t!");
        assert_eq!(decode_secret(&encoded).unwrap(), "s3cr3t!");

        assert!(decode_secret("not//valid--base64!!").is_err());
    }

    #[test]
    fn test_descriptor_json_roundtrip() {
        let descriptor = ConnectionDescriptor::new(DbType::PostgreSql, "postgres://h:5432/db")
            .with_user("etl")
            .with_secret("pw")
            .with_property("sslmode", "require");

        let json = descriptor.to_json().unwrap();
        let parsed = ConnectionDescriptor::from_json(&json).unwrap();

        assert_eq!(parsed.db_type, DbType::PostgreSql);
        assert_eq!(parsed.url, "postgres://h:5432/db");
        assert_eq!(parsed.user, "etl");
        assert_eq!(decode_secret(&parsed.secret).unwrap(), "pw");
        assert_eq!(parsed.properties.get("sslmode"), Some(&"require".into()));
        assert!(parsed.driver_artifact_path.is_none());
    }

    #[test]
    fn test_debug_redacts_credentials() {
        let descriptor =
            ConnectionDescriptor::new(DbType::MySql, "mysql://etl:hunter2@h:3306/db")
                .with_user("etl")
                .with_secret("hunter2");

        let debug = format!("{descriptor:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("***"));
    }

    #[test]
    fn test_from_service_props() {
        let mut props = HashMap::new();
        props.insert("url".to_string(), "hive2://h:10000/default".to_string());
        props.insert("user".to_string(), "etl".to_string());
        props.insert("password".to_string(), "pw".to_string());
        props.insert("hive.exec.engine".to_string(), "tez".to_string());

        let descriptor = ConnectionDescriptor::from_service_props(DbType::Hive, &props).unwrap();
        assert_eq!(descriptor.user, "etl");
        assert_eq!(decode_secret(&descriptor.secret).unwrap(), "pw");
        assert_eq!(
            descriptor.properties.get("hive.exec.engine"),
            Some(&"tez".to_string())
        );

        props.remove("url");
        assert!(ConnectionDescriptor::from_service_props(DbType::Hive, &props).is_err());
    }
}
