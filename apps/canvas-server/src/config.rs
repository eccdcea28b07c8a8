use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub log_filter: String,
    pub canvas_width: u32,
    pub canvas_height: u32,
    pub redis_url: Option<String>,
    pub database_url: Option<String>,
    pub object_store_url: Option<String>,
    pub object_store_prefix: String,
    pub object_store_token: Option<String>,
    pub archive_dir: Option<PathBuf>,
    pub cooldown_ms: u64,
    pub snapshot_debounce_ms: u64,
    pub snapshot_hour_utc: u32,
    pub snapshot_cycle_secs: u64,
    pub reset_on_snapshot: bool,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let bind_addr: SocketAddr = std::env::var("CANVAS_ADDR")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 8080)));
        let log_filter =
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,canvas_server=debug".into());
        let canvas_width = env_parse("CANVAS_WIDTH").unwrap_or(100).max(1);
        let canvas_height = env_parse("CANVAS_HEIGHT").unwrap_or(100).max(1);
        let redis_url = env_opt("REDIS_URL");
        let database_url = env_opt("DATABASE_URL");
        let object_store_url = env_opt("OBJECT_STORE_URL");
        let object_store_prefix =
            env_opt("OBJECT_STORE_PREFIX").unwrap_or_else(|| "archives/".into());
        let object_store_token = env_opt("OBJECT_STORE_TOKEN");
        // An explicitly empty CANVAS_ARCHIVE_DIR disables the local file backend.
        let archive_dir = match std::env::var("CANVAS_ARCHIVE_DIR") {
            Ok(v) if v.trim().is_empty() => None,
            Ok(v) => Some(PathBuf::from(v.trim())),
            Err(_) => Some(PathBuf::from("data/archives")),
        };
        let cooldown_ms = env_parse("CANVAS_COOLDOWN_MS").unwrap_or(5_000);
        let snapshot_debounce_ms = env_parse("CANVAS_SNAPSHOT_DEBOUNCE_MS").unwrap_or(5_000);
        let snapshot_hour_utc = env_parse::<u32>("CANVAS_SNAPSHOT_HOUR_UTC")
            .filter(|h| *h < 24)
            .unwrap_or(0);
        let snapshot_cycle_secs = env_parse("CANVAS_SNAPSHOT_CYCLE_SECS")
            .filter(|s| *s > 0)
            .unwrap_or(86_400);
        let reset_on_snapshot = std::env::var("CANVAS_RESET_ON_SNAPSHOT")
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "yes" | "on"))
            .unwrap_or(true);
        Self {
            bind_addr,
            log_filter,
            canvas_width,
            canvas_height,
            redis_url,
            database_url,
            object_store_url,
            object_store_prefix,
            object_store_token,
            archive_dir,
            cooldown_ms,
            snapshot_debounce_ms,
            snapshot_hour_utc,
            snapshot_cycle_secs,
            reset_on_snapshot,
        }
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn snapshot_debounce(&self) -> Duration {
        Duration::from_millis(self.snapshot_debounce_ms)
    }

    pub fn snapshot_cycle(&self) -> Duration {
        Duration::from_secs(self.snapshot_cycle_secs)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            log_filter: "info".into(),
            canvas_width: 100,
            canvas_height: 100,
            redis_url: None,
            database_url: None,
            object_store_url: None,
            object_store_prefix: "archives/".into(),
            object_store_token: None,
            archive_dir: None,
            cooldown_ms: 5_000,
            snapshot_debounce_ms: 5_000,
            snapshot_hour_utc: 0,
            snapshot_cycle_secs: 86_400,
            reset_on_snapshot: true,
        }
    }
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_opt(key).and_then(|v| v.parse().ok())
}
