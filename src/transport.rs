use crate::config::Config;
use crate::error::TpmError;
use std::fmt;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, error, info};

/// How to reach a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportDescriptor {
    /// A software TPM listening on TCP.
    Swtpm { host: String, port: u16 },
    /// A character device such as `/dev/tpmrm0`.
    Device(PathBuf),
    /// A TCTI configuration string passed through untouched.
    Tcti(String),
    /// The in-process software device.
    Soft,
}

impl TransportDescriptor {
    pub fn to_tcti_name(&self) -> String {
        match self {
            TransportDescriptor::Swtpm { host, port } => format!("swtpm:host={host},port={port}"),
            TransportDescriptor::Device(path) => format!("device:{}", path.display()),
            TransportDescriptor::Tcti(tcti) => tcti.clone(),
            TransportDescriptor::Soft => "soft".to_string(),
        }
    }
}

impl fmt::Display for TransportDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_tcti_name())
    }
}

impl FromStr for TransportDescriptor {
    type Err = TpmError;

    /// Parses the `swtpm:` and `device:` forms this crate emits, and passes any
    /// other `driver:conf` string through as [`TransportDescriptor::Tcti`].
    fn from_str(tcti: &str) -> Result<Self, Self::Err> {
        let (driver, conf) = tcti.split_once(':').unwrap_or((tcti, ""));
        if driver.is_empty() {
            return Err(TpmError::TctiNameInvalid);
        }

        match driver {
            "device" if !conf.is_empty() => Ok(TransportDescriptor::Device(PathBuf::from(conf))),
            "swtpm" => {
                let mut host = None;
                let mut port = None;
                for option in conf.split(',').filter(|option| !option.is_empty()) {
                    match option.split_once('=') {
                        Some(("host", value)) => host = Some(value.to_string()),
                        Some(("port", value)) => {
                            port = Some(value.parse().map_err(|_| TpmError::TctiNameInvalid)?)
                        }
                        _ => return Ok(TransportDescriptor::Tcti(tcti.to_string())),
                    }
                }
                Ok(TransportDescriptor::Swtpm {
                    host: host.unwrap_or_else(|| crate::config::DEFAULT_TPM_HOST.to_string()),
                    port: port.unwrap_or(crate::config::DEFAULT_TPM_PORT),
                })
            }
            _ => Ok(TransportDescriptor::Tcti(tcti.to_string())),
        }
    }
}

fn emulator_listening(host: &str, port: u16, timeout: Duration) -> bool {
    let addrs: Vec<SocketAddr> = match (host, port).to_socket_addrs() {
        Ok(addrs) => addrs.collect(),
        Err(io_err) => {
            debug!(?io_err, host, "unable to resolve emulator host");
            return false;
        }
    };

    addrs
        .iter()
        .any(|addr| match TcpStream::connect_timeout(addr, timeout) {
            Ok(_stream) => true,
            Err(io_err) => {
                debug!(?io_err, %addr, "no emulator at address");
                false
            }
        })
}

fn device_present(path: &Path) -> bool {
    path.exists()
}

/// Pick a transport: an explicit TCTI string, else an emulator answering on
/// the configured host and port, else the first device node that exists.
pub fn discover(config: &Config) -> Result<TransportDescriptor, TpmError> {
    if let Some(tcti) = &config.tcti {
        let descriptor = tcti.parse()?;
        info!(%descriptor, "using configured TCTI");
        return Ok(descriptor);
    }

    if emulator_listening(&config.tpm_host, config.tpm_port, config.probe_timeout) {
        let descriptor = TransportDescriptor::Swtpm {
            host: config.tpm_host.clone(),
            port: config.tpm_port,
        };
        info!(%descriptor, "software TPM detected");
        return Ok(descriptor);
    }

    if let Some(path) = config.device_paths.iter().find(|path| device_present(path)) {
        let descriptor = TransportDescriptor::Device(path.clone());
        info!(%descriptor, "TPM device detected");
        return Ok(descriptor);
    }

    error!(
        host = %config.tpm_host,
        port = config.tpm_port,
        "no software TPM listening and no TPM device node present"
    );
    Err(TpmError::TransportUnavailable)
}

#[cfg(test)]
mod tests {
    use super::{discover, TransportDescriptor};
    use crate::config::Config;
    use crate::error::TpmError;
    use std::net::TcpListener;
    use std::path::PathBuf;

    #[test]
    fn tcti_names() {
        let swtpm = TransportDescriptor::Swtpm {
            host: "127.0.0.1".to_string(),
            port: 2321,
        };
        assert_eq!(swtpm.to_tcti_name(), "swtpm:host=127.0.0.1,port=2321");
        assert_eq!(
            "swtpm:host=127.0.0.1,port=2321"
                .parse::<TransportDescriptor>()
                .unwrap(),
            swtpm
        );

        let device = TransportDescriptor::Device(PathBuf::from("/dev/tpmrm0"));
        assert_eq!(device.to_tcti_name(), "device:/dev/tpmrm0");
        assert_eq!(
            "device:/dev/tpmrm0".parse::<TransportDescriptor>().unwrap(),
            device
        );

        assert_eq!(
            "mssim:host=localhost,port=2321"
                .parse::<TransportDescriptor>()
                .unwrap(),
            TransportDescriptor::Tcti("mssim:host=localhost,port=2321".to_string())
        );

        assert_eq!(
            ":nothing".parse::<TransportDescriptor>(),
            Err(TpmError::TctiNameInvalid)
        );
        assert_eq!(
            "swtpm:port=notaport".parse::<TransportDescriptor>(),
            Err(TpmError::TctiNameInvalid)
        );
    }

    #[test]
    fn explicit_tcti_wins() {
        let config = Config {
            tcti: Some("device:/dev/tpm0".to_string()),
            ..Default::default()
        };
        assert_eq!(
            discover(&config).unwrap(),
            TransportDescriptor::Device(PathBuf::from("/dev/tpm0"))
        );
    }

    #[test]
    fn listening_emulator_is_found() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("Unable to bind");
        let port = listener.local_addr().expect("No local addr").port();

        let config = Config {
            tpm_host: "127.0.0.1".to_string(),
            tpm_port: port,
            device_paths: Vec::new(),
            ..Default::default()
        };
        assert_eq!(
            discover(&config).unwrap(),
            TransportDescriptor::Swtpm {
                host: "127.0.0.1".to_string(),
                port
            }
        );
    }

    #[test]
    fn device_fallback_and_unavailable() {
        // Grab a free port and release it so nothing is listening there.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").expect("Unable to bind");
            listener.local_addr().expect("No local addr").port()
        };

        let present = std::env::temp_dir();
        let config = Config {
            tpm_host: "127.0.0.1".to_string(),
            tpm_port: port,
            device_paths: vec![PathBuf::from("/nonexistent/tpmrm0"), present.clone()],
            ..Default::default()
        };
        assert_eq!(
            discover(&config).unwrap(),
            TransportDescriptor::Device(present)
        );

        let config = Config {
            device_paths: vec![PathBuf::from("/nonexistent/tpmrm0")],
            ..config
        };
        assert_eq!(discover(&config), Err(TpmError::TransportUnavailable));
    }
}
