// src/config.rs
// Runtime configuration for a FerroDB instance

use crate::error::{DbError, Result};

/// A bootstrap administrator account (`user:password`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admin {
    pub username: String,
    pub password: String,
}

/// Parse an administrator list of the form `user:password[,user:password...]`.
pub fn parse_admins(input: &str) -> Result<Vec<Admin>> {
    let mut admins = Vec::new();
    for entry in input.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (username, password) = entry
            .split_once(':')
            .ok_or_else(|| DbError::BadRequest(format!("invalid admin entry {:?}", entry)))?;
        if username.is_empty() {
            return Err(DbError::BadRequest(format!("invalid admin entry {:?}", entry)));
        }
        admins.push(Admin {
            username: username.to_string(),
            password: password.to_string(),
        });
    }
    Ok(admins)
}

/// Instance configuration.
///
/// The HTTP collaborator consumes `public_dir`, `enable_public_dir`,
/// `listen_address` and `cookie_secret`; the core only needs
/// `database_dir` and the bootstrap admins.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory where the databases and attachments are stored
    pub database_dir: String,
    /// Public directory served by the default server implementation
    pub public_dir: String,
    /// Enable/disable the public directory serving
    pub enable_public_dir: bool,
    /// Default address to listen to
    pub listen_address: String,
    /// Secret used to verify session cookie integrity (hex bytes,
    /// usually generated with `openssl rand -hex 32`)
    pub cookie_secret: String,
    /// Bootstrap administrators, `user:password` comma separated
    pub administrators: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            database_dir: "./dbs".to_string(),
            public_dir: "./public".to_string(),
            enable_public_dir: true,
            listen_address: ":7070".to_string(),
            cookie_secret: String::new(),
            administrators: "admin:secret".to_string(),
        }
    }
}

impl Config {
    /// Build a configuration from defaults overridden by
    /// `FERRODB_*` environment variables.
    pub fn from_env() -> Self {
        let mut cfg = Config::default();
        if let Ok(v) = std::env::var("FERRODB_DB_DIR") {
            cfg.database_dir = v;
        }
        if let Ok(v) = std::env::var("FERRODB_PUBLIC") {
            cfg.public_dir = v;
        }
        if let Ok(v) = std::env::var("FERRODB_ENABLE_PUBLIC") {
            cfg.enable_public_dir = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("FERRODB_LISTEN") {
            cfg.listen_address = v;
        }
        if let Ok(v) = std::env::var("FERRODB_SECRET") {
            cfg.cookie_secret = v;
        }
        if let Ok(v) = std::env::var("FERRODB_ADMINS") {
            cfg.administrators = v;
        }
        cfg
    }

    /// Decode the cookie secret from hex.
    pub fn cookie_secret_bytes(&self) -> Result<Vec<u8>> {
        let s = self.cookie_secret.as_str();
        if s.len() % 2 != 0 {
            return Err(DbError::BadRequest("invalid cookie secret".to_string()));
        }
        (0..s.len())
            .step_by(2)
            .map(|i| {
                u8::from_str_radix(&s[i..i + 2], 16)
                    .map_err(|_| DbError::BadRequest("invalid cookie secret".to_string()))
            })
            .collect()
    }

    /// Parse the administrator list.
    pub fn admins(&self) -> Result<Vec<Admin>> {
        parse_admins(&self.administrators)
    }

    /// Verify bootstrap admin credentials. Password hashing of regular
    /// users is delegated to the session layer; only the configured
    /// admin entries are checked here.
    pub fn is_admin(&self, username: &str, password: &str) -> bool {
        match self.admins() {
            Ok(admins) => admins
                .iter()
                .any(|a| a.username == username && a.password == password),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_admins() {
        let admins = parse_admins("admin:secret,ops:hunter2").unwrap();
        assert_eq!(admins.len(), 2);
        assert_eq!(admins[0].username, "admin");
        assert_eq!(admins[0].password, "secret");
        assert_eq!(admins[1].username, "ops");
    }

    #[test]
    fn test_parse_admins_rejects_garbage() {
        assert!(parse_admins("no-colon-here").is_err());
        assert!(parse_admins(":nouser").is_err());
    }

    #[test]
    fn test_cookie_secret_roundtrip() {
        let cfg = Config {
            cookie_secret: "00ff10".to_string(),
            ..Config::default()
        };
        assert_eq!(cfg.cookie_secret_bytes().unwrap(), vec![0x00, 0xff, 0x10]);
    }
}
