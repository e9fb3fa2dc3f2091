use std::path::PathBuf;
use std::time::Duration;

use wallet_bg_core::{
    ChainFamily, ConnectionConfig, HandlerConfig, NotificationMode, API_AUTO_CONNECT_MS,
    API_MAX_RETRY, MAX_CONSECUTIVE_RETRIES,
};

use crate::password::KdfParams;

const ENV_PREFIX: &str = "WALLET_BG_";

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub substrate_probe_timeout_ms: u64,
    pub evm_probe_timeout_ms: u64,
    /// Delay between reconnect attempts of a dropped WebSocket.
    pub api_auto_connect_ms: u64,
    pub max_consecutive_retries: u32,
    pub recover_delay_ms: u64,
    pub max_recover_rounds: u32,
    pub request_timeout_ms: u64,
    pub notification_mode: NotificationMode,
    pub store_dir: PathBuf,
    pub chain_list_path: Option<PathBuf>,
    pub kdf_memory_kib: u32,
    pub kdf_iterations: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            substrate_probe_timeout_ms: 30_000,
            evm_probe_timeout_ms: 60_000,
            api_auto_connect_ms: API_AUTO_CONNECT_MS,
            max_consecutive_retries: MAX_CONSECUTIVE_RETRIES,
            recover_delay_ms: API_AUTO_CONNECT_MS,
            max_recover_rounds: API_MAX_RETRY,
            request_timeout_ms: 30_000,
            notification_mode: NotificationMode::Popup,
            store_dir: PathBuf::from(".wallet-bg"),
            chain_list_path: None,
            kdf_memory_kib: 65_536,
            kdf_iterations: 3,
        }
    }
}

impl RuntimeConfig {
    /// Defaults overridden by `WALLET_BG_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_vars(std::env::vars())
    }

    /// Values that fail to parse are logged and leave the default in place.
    pub fn from_vars<I>(vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut cfg = Self::default();
        for (key, value) in vars {
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let value = value.trim();
            let applied = match name {
                "SUBSTRATE_PROBE_TIMEOUT_MS" => set(&mut cfg.substrate_probe_timeout_ms, value),
                "EVM_PROBE_TIMEOUT_MS" => set(&mut cfg.evm_probe_timeout_ms, value),
                "API_AUTO_CONNECT_MS" => set(&mut cfg.api_auto_connect_ms, value),
                "MAX_CONSECUTIVE_RETRIES" => set(&mut cfg.max_consecutive_retries, value),
                "RECOVER_DELAY_MS" => set(&mut cfg.recover_delay_ms, value),
                "MAX_RECOVER_ROUNDS" => set(&mut cfg.max_recover_rounds, value),
                "REQUEST_TIMEOUT_MS" => set(&mut cfg.request_timeout_ms, value),
                "NOTIFICATION_MODE" => set(&mut cfg.notification_mode, value),
                "KDF_MEMORY_KIB" => set(&mut cfg.kdf_memory_kib, value),
                "KDF_ITERATIONS" => set(&mut cfg.kdf_iterations, value),
                "STORE_DIR" => {
                    cfg.store_dir = PathBuf::from(value);
                    true
                }
                "CHAIN_LIST" => {
                    cfg.chain_list_path = (!value.is_empty()).then(|| PathBuf::from(value));
                    true
                }
                _ => {
                    tracing::debug!(key = %key, "ignoring unknown setting");
                    true
                }
            };
            if !applied {
                tracing::warn!(key = %key, value, "invalid setting, keeping default");
            }
        }
        cfg
    }

    pub fn probe_timeout(&self, family: ChainFamily) -> Duration {
        Duration::from_millis(match family {
            ChainFamily::Substrate => self.substrate_probe_timeout_ms,
            ChainFamily::Evm => self.evm_probe_timeout_ms,
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn auto_connect_delay(&self) -> Duration {
        Duration::from_millis(self.api_auto_connect_ms)
    }

    pub fn handler_config(&self, family: ChainFamily) -> HandlerConfig {
        HandlerConfig {
            connection: ConnectionConfig {
                connect_timeout: self.probe_timeout(family),
                max_consecutive_retries: self.max_consecutive_retries,
            },
            recover_delay: Duration::from_millis(self.recover_delay_ms),
            max_recover_rounds: self.max_recover_rounds,
        }
    }

    pub fn kdf_params(&self) -> KdfParams {
        KdfParams {
            memory_kib: self.kdf_memory_kib,
            iterations: self.kdf_iterations,
        }
    }

    pub fn password_path(&self) -> PathBuf {
        self.store_dir.join("password.json")
    }
}

fn set<T: std::str::FromStr>(slot: &mut T, raw: &str) -> bool {
    match raw.parse() {
        Ok(value) => {
            *slot = value;
            true
        }
        Err(_) => false,
    }
}
