//! Tiberius client setup and bb8 pooling.

use std::time::Duration;

use async_trait::async_trait;
use bb8::Pool;
use tiberius::{AuthMethod, Client, Config, EncryptionLevel};
use tokio::net::TcpStream;
use tokio_util::compat::TokioAsyncWriteCompatExt;
use tracing::{info, warn};

use crate::config::ConnectionConfig;
use crate::core::traits::BulkConnection;
use crate::error::{BulkError, Result};

use super::writer::MssqlClient;
use super::MssqlConnection;

/// Maximum TDS packet size.
const TDS_MAX_PACKET_SIZE: u32 = 32767;

/// Connection pool timeouts.
const POOL_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(300);
const POOL_MAX_LIFETIME: Duration = Duration::from_secs(1800);
const TCP_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Build the Tiberius client configuration.
pub fn build_config(config: &ConnectionConfig) -> Config {
    let mut tds = Config::new();
    tds.host(&config.host);
    tds.port(config.port);
    tds.database(&config.database);
    tds.authentication(AuthMethod::sql_server(&config.user, &config.password));

    match config.ssl_mode.to_lowercase().as_str() {
        "disable" => {
            tds.encryption(EncryptionLevel::NotSupported);
        }
        _ => {
            if config.trust_server_cert {
                tds.trust_cert();
            }
            tds.encryption(EncryptionLevel::Required);
        }
    }

    tds.packet_size(TDS_MAX_PACKET_SIZE);
    tds
}

fn io_error(e: std::io::Error, context: &str) -> tiberius::error::Error {
    tiberius::error::Error::Io {
        kind: e.kind(),
        message: format!("{}: {}", context, e),
    }
}

/// Open a TCP connection with keepalives and log in.
pub(crate) async fn connect(config: &ConnectionConfig) -> Result<MssqlClient> {
    let tds = build_config(config);
    let tcp = TcpStream::connect(tds.get_addr())
        .await
        .map_err(|e| io_error(e, "connect"))?;
    tcp.set_nodelay(true).ok();

    let std_tcp = tcp.into_std().map_err(|e| io_error(e, "detach socket"))?;
    let socket = socket2::Socket::from(std_tcp);
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(TCP_KEEPALIVE_INTERVAL)
        .with_interval(TCP_KEEPALIVE_INTERVAL);
    if let Err(e) = socket.set_tcp_keepalive(&keepalive) {
        warn!("Failed to set TCP keepalive on MSSQL connection: {}", e);
    }

    let std_tcp: std::net::TcpStream = socket.into();
    std_tcp.set_nonblocking(true).ok();
    let tcp = TcpStream::from_std(std_tcp).map_err(|e| io_error(e, "convert socket"))?;

    let client = Client::connect(tds, tcp.compat_write()).await?;
    info!(
        "Connected to MSSQL: {}:{}/{}",
        config.host, config.port, config.database
    );
    Ok(client)
}

/// bb8 connection manager handing out [`MssqlConnection`]s.
#[derive(Debug, Clone)]
pub struct MssqlConnectionManager {
    config: ConnectionConfig,
}

impl MssqlConnectionManager {
    pub fn new(config: ConnectionConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl bb8::ManageConnection for MssqlConnectionManager {
    type Connection = MssqlConnection;
    type Error = BulkError;

    async fn connect(&self) -> std::result::Result<Self::Connection, Self::Error> {
        MssqlConnection::connect(self.config.clone()).await
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> std::result::Result<(), Self::Error> {
        conn.execute("SELECT 1").await
    }

    fn has_broken(&self, conn: &mut Self::Connection) -> bool {
        !conn.is_open()
    }
}

/// Build a connection pool; one pooled connection serves one commit at a time.
pub async fn build_pool(config: ConnectionConfig, max_size: u32) -> Result<Pool<MssqlConnectionManager>> {
    let pool = Pool::builder()
        .max_size(max_size)
        .connection_timeout(POOL_CONNECTION_TIMEOUT)
        .idle_timeout(Some(POOL_IDLE_TIMEOUT))
        .max_lifetime(Some(POOL_MAX_LIFETIME))
        .test_on_check_out(true)
        .build(MssqlConnectionManager::new(config))
        .await
        .map_err(|e| BulkError::pool(e, "creating MSSQL pool"))?;
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(ssl_mode: &str) -> ConnectionConfig {
        ConnectionConfig {
            host: "db.internal".to_string(),
            port: 14330,
            database: "sales".to_string(),
            user: "loader".to_string(),
            password: "pw".to_string(),
            ssl_mode: ssl_mode.to_string(),
            trust_server_cert: true,
        }
    }

    #[test]
    fn test_build_config_address() {
        let tds = build_config(&config("require"));
        assert_eq!(tds.get_addr(), "db.internal:14330");
    }

    #[test]
    fn test_manager_debug_redacts_password() {
        let manager = MssqlConnectionManager::new(config("disable"));
        let debug = format!("{:?}", manager);
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("\"pw\""));
    }
}
