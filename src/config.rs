use anyhow::{bail, Context};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::RngCore;

const DEFAULT_MAX_CONNECTIONS: u32 = 5;
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_TOKEN_TTL_MINUTES: i64 = 24 * 60;

#[derive(Clone)]
pub struct Config {
    pub database_url: String,
    pub max_connections: u32,
    pub port: u16,
    pub secret_key: String,
    pub bcrypt_work_factor: u32,
    pub token_ttl: chrono::Duration,
}

impl Config {
    /// Reads configuration from the environment (after loading `.env` if present).
    pub fn from_env() -> anyhow::Result<Self> {
        let _ = dotenvy::dotenv();

        let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| default_database_url());

        let max_connections = parse_var("DATABASE_MAX_CONNECTIONS", DEFAULT_MAX_CONNECTIONS)?;
        let port = parse_var("PORT", DEFAULT_PORT)?;

        let bcrypt_work_factor = parse_var("BCRYPT_WORK_FACTOR", bcrypt::DEFAULT_COST)?;
        if !(4..=31).contains(&bcrypt_work_factor) {
            bail!("BCRYPT_WORK_FACTOR must be between 4 and 31, got {}", bcrypt_work_factor);
        }

        let ttl_minutes = parse_var("TOKEN_TTL_MINUTES", DEFAULT_TOKEN_TTL_MINUTES)?;
        if ttl_minutes <= 0 {
            bail!("TOKEN_TTL_MINUTES must be positive, got {}", ttl_minutes);
        }

        let secret_key = match std::env::var("SECRET_KEY") {
            Ok(key) if !key.is_empty() => key,
            _ => {
                tracing::warn!("SECRET_KEY not set; using a random key, tokens will not survive a restart");
                random_secret()
            }
        };

        Ok(Self {
            database_url,
            max_connections,
            port,
            secret_key,
            bcrypt_work_factor,
            token_ttl: chrono::Duration::minutes(ttl_minutes),
        })
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("database_url", &self.database_url)
            .field("max_connections", &self.max_connections)
            .field("port", &self.port)
            .field("secret_key", &"<redacted>")
            .field("bcrypt_work_factor", &self.bcrypt_work_factor)
            .field("token_ttl", &self.token_ttl)
            .finish()
    }
}

fn parse_var<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("invalid value for {}: {:?}", name, raw)),
        Err(_) => Ok(default),
    }
}

fn default_database_url() -> String {
    if std::path::Path::new("/data").exists() {
        // Mounted volume in production
        "sqlite:/data/messagely.db".to_string()
    } else {
        std::fs::create_dir_all("./data").ok();
        "sqlite:./data/messagely.db".to_string()
    }
}

fn random_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
