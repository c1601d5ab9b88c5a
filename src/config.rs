use secrecy::Secret;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// PostgreSQL connection string; the in-memory store is used when unset
    pub database_url: Option<String>,
    pub base_url: String,
    pub host: String,
    pub port: u16,

    // Wallet pass identity
    pub pass_type_id: String,
    pub team_id: String,
    pub organization_name: String,

    // Signing credentials
    pub pass_certificate_path: String,
    pub pass_certificate_password: Secret<String>,
    pub wwdr_certificate_path: String,

    // Static pass artwork (icon.png, logo.png)
    pub assets_dir: String,

    // Collaborator API bearer token
    pub service_token: Secret<String>,

    // Cron expression for the expiration sweep
    pub expiration_sweep_schedule: String,
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        // Load .env file if it exists (for local development)
        let _ = dotenvy::dotenv();

        let config = config::Config::builder()
            .add_source(config::Environment::default().separator("__"))
            .build()?;

        Ok(Self {
            database_url: config.get("database_url").ok(),
            base_url: config.get("base_url")?,
            host: config.get("host").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: config.get("port")?,

            pass_type_id: config.get("pass_type_id")?,
            team_id: config.get("team_id")?,
            organization_name: config
                .get("organization_name")
                .unwrap_or_else(|_| "Punchpass".to_string()),

            pass_certificate_path: config.get("pass_certificate_path")?,
            pass_certificate_password: Secret::new(config.get("pass_certificate_password")?),
            wwdr_certificate_path: config.get("wwdr_certificate_path")?,

            assets_dir: config
                .get("assets_dir")
                .unwrap_or_else(|_| "assets".to_string()),

            service_token: Secret::new(config.get("service_token")?),

            expiration_sweep_schedule: config
                .get("expiration_sweep_schedule")
                .unwrap_or_else(|_| "0 0 * * * *".to_string()),
        })
    }
}
