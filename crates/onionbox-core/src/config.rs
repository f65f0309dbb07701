use serde::{Deserialize, Serialize};

/// Top-level daemon configuration (loaded from onionbox.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OnionboxConfig {
    pub daemon: DaemonConfig,
    pub upload: UploadConfig,
    pub store: StoreConfig,
    pub crypto: CryptoConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// HTTP listen address the overlay transport forwards to (default: 127.0.0.1:8080)
    pub listen: String,
    /// Prefix for share links handed back to uploaders
    pub public_url: String,
    /// Prometheus metrics endpoint (optional)
    pub metrics_addr: Option<String>,
    /// Log level (default: info)
    pub log_level: String,
    /// Log format: "json" or "text"
    pub log_format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Maximum multipart body size in MiB
    pub max_form_mb: u64,
    /// Working-set size for chunked I/O, in bytes
    pub chunk_size: usize,
    /// Depth of the bounded file-source queue
    pub queue_depth: usize,
    /// Wall-clock bound on processing a single upload
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Interval between expiry sweeps
    pub sweep_interval_secs: u64,
    /// How long a sweep waits on a busy buffer before skipping it
    pub sweep_lock_wait_ms: u64,
    /// Name generation attempts before giving up on a collision
    pub name_attempts: u32,
    /// Treat a failed mlock as fatal (default: true)
    pub require_pinning: bool,
}

/// Passphrase KDF configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// Argon2id memory cost in KiB (default: 65536 = 64 MiB)
    pub argon2_mem_cost_kib: u32,
    /// Argon2id time cost (iterations, default: 3)
    pub argon2_time_cost: u32,
    /// Argon2id parallelism (default: 4)
    pub argon2_parallelism: u32,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".into(),
            public_url: "http://localhost:8080".into(),
            metrics_addr: None,
            log_level: "info".into(),
            log_format: "text".into(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_form_mb: 512,
            chunk_size: 1024,
            queue_depth: 100,
            timeout_secs: 600,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 5,
            sweep_lock_wait_ms: 50,
            name_attempts: 16,
            require_pinning: true,
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            argon2_mem_cost_kib: 65536,
            argon2_time_cost: 3,
            argon2_parallelism: 4,
        }
    }
}

impl OnionboxConfig {
    /// Reject values that would make the daemon misbehave at runtime.
    pub fn validate(&self) -> crate::BoxResult<()> {
        if self.upload.chunk_size == 0 {
            return Err(crate::BoxError::Config("upload.chunk_size must be > 0".into()));
        }
        if self.upload.queue_depth == 0 {
            return Err(crate::BoxError::Config("upload.queue_depth must be > 0".into()));
        }
        if self.store.sweep_interval_secs == 0 {
            return Err(crate::BoxError::Config(
                "store.sweep_interval_secs must be > 0".into(),
            ));
        }
        if self.store.name_attempts == 0 {
            return Err(crate::BoxError::Config("store.name_attempts must be > 0".into()));
        }
        Ok(())
    }
}
