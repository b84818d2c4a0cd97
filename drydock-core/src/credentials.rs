//! Credential and certificate stores for remote access.
//!
//! Credentials resolve to a bearer token handed to the HTTP remote;
//! certificates pin an extra root CA for it. Local directory remotes
//! use neither.

use crate::Error;
use std::path::PathBuf;

/// Unloaded credential configuration.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    /// Token value given directly (takes precedence).
    pub token: Option<String>,
    /// File to read the token from, e.g. a mounted secret.
    pub token_path: Option<PathBuf>,
}

impl Credentials {
    /// Resolve the configuration into a usable store.
    pub fn load(&self) -> Result<CredentialStore, Error> {
        if let Some(token) = &self.token {
            return Ok(CredentialStore {
                token: Some(token.trim().to_string()),
            });
        }
        if let Some(path) = &self.token_path {
            let raw = std::fs::read_to_string(path).map_err(|e| {
                Error::InvalidInput(format!("cannot read token file {}: {}", path.display(), e))
            })?;
            return Ok(CredentialStore {
                token: Some(raw.trim().to_string()),
            });
        }
        Ok(CredentialStore { token: None })
    }
}

/// Loaded credentials.
#[derive(Debug, Clone, Default)]
pub struct CredentialStore {
    token: Option<String>,
}

impl CredentialStore {
    /// Value for the `Authorization` header, if a token is configured.
    pub fn authorization(&self) -> Option<String> {
        self.token.as_ref().map(|t| format!("Bearer {}", t))
    }
}

/// Unloaded certificate configuration.
#[derive(Debug, Clone, Default)]
pub struct Certificates {
    /// PEM file with an additional trusted root CA.
    pub ca_pem_path: Option<PathBuf>,
}

impl Certificates {
    pub fn load(&self) -> Result<CertificateStore, Error> {
        let root_ca = match &self.ca_pem_path {
            None => None,
            Some(path) => {
                let pem = std::fs::read(path).map_err(|e| {
                    Error::InvalidInput(format!("cannot read CA file {}: {}", path.display(), e))
                })?;
                let cert = reqwest::Certificate::from_pem(&pem).map_err(|e| {
                    Error::InvalidInput(format!("invalid CA certificate {}: {}", path.display(), e))
                })?;
                Some(cert)
            }
        };
        Ok(CertificateStore { root_ca })
    }
}

/// Loaded certificate material.
#[derive(Debug, Clone, Default)]
pub struct CertificateStore {
    root_ca: Option<reqwest::Certificate>,
}

impl CertificateStore {
    /// Apply the pinned root CA, if any, to an HTTP client builder.
    pub fn apply(&self, builder: reqwest::ClientBuilder) -> reqwest::ClientBuilder {
        match &self.root_ca {
            Some(cert) => builder.add_root_certificate(cert.clone()),
            None => builder,
        }
    }
}
