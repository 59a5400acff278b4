use crate::error::TpmError;
use crate::structures::PersistentHandle;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_AK_HANDLE: PersistentHandle = PersistentHandle::new(0x8101_000A);
pub const DEFAULT_APP_HANDLE: PersistentHandle = PersistentHandle::new(0x8101_000B);
pub const DEFAULT_TPM_HOST: &str = "127.0.0.1";
pub const DEFAULT_TPM_PORT: u16 = 2321;
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub ak_handle: PersistentHandle,
    pub app_handle: PersistentHandle,
    pub tpm_host: String,
    pub tpm_port: u16,
    /// Explicit TCTI string. Skips discovery when set.
    pub tcti: Option<String>,
    pub probe_timeout: Duration,
    /// Device nodes tried in order once no emulator answers.
    pub device_paths: Vec<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            ak_handle: DEFAULT_AK_HANDLE,
            app_handle: DEFAULT_APP_HANDLE,
            tpm_host: DEFAULT_TPM_HOST.to_string(),
            tpm_port: DEFAULT_TPM_PORT,
            tcti: None,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            device_paths: vec![PathBuf::from("/dev/tpmrm0"), PathBuf::from("/dev/tpm0")],
        }
    }
}

/// Parse a slot as given in the environment or on the command line: `0x`
/// prefixed or containing hex letters is hex, all digits is decimal. The
/// value must lie in the persistent handle range.
pub fn parse_slot(value: &str) -> Result<PersistentHandle, TpmError> {
    let trimmed = value.trim();
    let slot = if trimmed.starts_with("0x")
        || trimmed.starts_with("0X")
        || trimmed.bytes().any(|b| b.is_ascii_alphabetic())
    {
        PersistentHandle::parse_hex(trimmed)?
    } else {
        trimmed.parse()?
    };

    if !slot.in_persistent_range() {
        return Err(TpmError::PersistentHandleInvalid(value.to_string()));
    }
    Ok(slot)
}

fn config_slot(key: &'static str, value: &str) -> Result<PersistentHandle, TpmError> {
    parse_slot(value).map_err(|_| TpmError::ConfigInvalid {
        key,
        value: value.to_string(),
    })
}

impl Config {
    pub fn from_env() -> Result<Self, TpmError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source. Unset or empty variables keep
    /// their defaults; present but invalid ones are an error.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, TpmError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let mut config = Config::default();

        if let Some(value) = get("AK_HANDLE") {
            config.ak_handle = config_slot("AK_HANDLE", &value)?;
        }
        if let Some(value) = get("APP_HANDLE") {
            config.app_handle = config_slot("APP_HANDLE", &value)?;
        }
        if let Some(value) = get("TPM_HOST") {
            config.tpm_host = value;
        }
        if let Some(value) = get("TPM_PORT") {
            config.tpm_port = value
                .trim()
                .parse()
                .map_err(|_| TpmError::ConfigInvalid {
                    key: "TPM_PORT",
                    value,
                })?;
        }
        config.tcti = get("TCTI").or_else(|| get("TPM2TOOLS_TCTI"));

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_slot, Config, DEFAULT_APP_HANDLE};
    use crate::error::{ErrorKind, TpmError};
    use crate::structures::PersistentHandle;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_without_environment() {
        let config = Config::from_lookup(lookup(&[])).expect("Unable to build config");
        assert_eq!(config, Config::default());
        assert_eq!(config.app_handle, DEFAULT_APP_HANDLE);
        assert_eq!(config.ak_handle, PersistentHandle::new(0x8101_000A));
        assert_eq!(config.tpm_port, 2321);
    }

    #[test]
    fn environment_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("AK_HANDLE", "0x81010001"),
            ("APP_HANDLE", "8101000C"),
            ("TPM_HOST", "swtpm.local"),
            ("TPM_PORT", "2331"),
            ("TPM2TOOLS_TCTI", "device:/dev/tpm0"),
        ]))
        .expect("Unable to build config");

        assert_eq!(config.ak_handle, PersistentHandle::new(0x8101_0001));
        assert_eq!(config.app_handle, PersistentHandle::new(0x8101_000C));
        assert_eq!(config.tpm_host, "swtpm.local");
        assert_eq!(config.tpm_port, 2331);
        assert_eq!(config.tcti.as_deref(), Some("device:/dev/tpm0"));

        // TCTI wins over TPM2TOOLS_TCTI.
        let config = Config::from_lookup(lookup(&[
            ("TCTI", "swtpm:host=10.0.0.1,port=2321"),
            ("TPM2TOOLS_TCTI", "device:/dev/tpm0"),
        ]))
        .expect("Unable to build config");
        assert_eq!(
            config.tcti.as_deref(),
            Some("swtpm:host=10.0.0.1,port=2321")
        );
    }

    #[test]
    fn invalid_values_are_errors() {
        let err = Config::from_lookup(lookup(&[("TPM_PORT", "not-a-port")]))
            .expect_err("Invalid port accepted");
        assert_eq!(err.kind(), ErrorKind::Config);

        let err = Config::from_lookup(lookup(&[("APP_HANDLE", "0xnope")]))
            .expect_err("Invalid handle accepted");
        assert_eq!(
            err,
            TpmError::ConfigInvalid {
                key: "APP_HANDLE",
                value: "0xnope".to_string()
            }
        );
    }

    #[test]
    fn slots_outside_persistent_range_are_rejected() {
        assert_eq!(
            parse_slot("0x8101000B").expect("Unable to parse slot"),
            PersistentHandle::new(0x8101_000B)
        );
        assert_eq!(
            parse_slot("0x80000001"),
            Err(TpmError::PersistentHandleInvalid("0x80000001".to_string()))
        );
        assert!(parse_slot("1").is_err());

        let err = Config::from_lookup(lookup(&[("AK_HANDLE", "0x01000001")]))
            .expect_err("Non persistent handle accepted");
        assert_eq!(
            err,
            TpmError::ConfigInvalid {
                key: "AK_HANDLE",
                value: "0x01000001".to_string()
            }
        );
    }
}
