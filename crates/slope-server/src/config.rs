use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;

const DEV_SECRET: &str = "dev-secret-change-me";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub db_path: PathBuf,
    pub host: String,
    pub port: u16,
    pub jwt_secret: String,
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let jwt_secret = std::env::var("SLOPE_JWT_SECRET").unwrap_or_else(|_| {
            tracing::warn!("SLOPE_JWT_SECRET not set, using the development secret");
            DEV_SECRET.into()
        });
        let db_path = std::env::var("SLOPE_DB_PATH").unwrap_or_else(|_| "slope.db".into());
        let host = std::env::var("SLOPE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port = std::env::var("SLOPE_PORT")
            .unwrap_or_else(|_| "3000".into())
            .parse()
            .context("SLOPE_PORT must be a port number")?;

        Ok(Self {
            db_path: PathBuf::from(db_path),
            host,
            port,
            jwt_secret,
        })
    }

    pub fn addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", self.host, self.port))
    }
}
