use std::fmt;

/// A raw TPM (or TSS layer) response code as returned by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResponseCode(u32);

impl ResponseCode {
    pub const SUCCESS: Self = Self(0x000);

    // Format zero (version 1) codes.
    pub const INITIALIZE: Self = Self(0x100);
    pub const FAILURE: Self = Self(0x101);
    pub const SEQUENCE: Self = Self(0x103);
    pub const NV_RANGE: Self = Self(0x146);
    pub const NV_SPACE: Self = Self(0x14B);
    pub const NV_DEFINED: Self = Self(0x14C);

    // Warnings.
    pub const OBJECT_MEMORY: Self = Self(0x902);
    pub const SESSION_MEMORY: Self = Self(0x903);
    pub const RETRY: Self = Self(0x922);

    // Format one codes, with the parameter/handle/session number masked out.
    pub const ATTRIBUTES: Self = Self(0x082);
    pub const HASH: Self = Self(0x083);
    pub const VALUE: Self = Self(0x084);
    pub const HIERARCHY: Self = Self(0x085);
    pub const KEY_SIZE: Self = Self(0x087);
    pub const TYPE: Self = Self(0x08A);
    pub const HANDLE: Self = Self(0x08B);
    pub const SCHEME: Self = Self(0x092);
    pub const SIZE: Self = Self(0x095);
    pub const SYMMETRIC: Self = Self(0x096);
    pub const KEY: Self = Self(0x09C);
    pub const INTEGRITY: Self = Self(0x09F);
    pub const TICKET: Self = Self(0x0A0);
    pub const BAD_AUTH: Self = Self(0x0A2);
    pub const BINDING: Self = Self(0x0A5);

    /// Marker for failures raised by the TSS wrapper itself rather than the device.
    pub const WRAPPER: Self = Self(0xFFFF_FFFF);

    const LAYER_MASK: u32 = 0xFFFF_0000;
    const RESMGR_TPM_LAYER: u32 = 11 << 16;
    const TCTI_LAYER: u32 = 10 << 16;
    const FMT1: u32 = 0x080;

    pub const fn new(rc: u32) -> Self {
        Self(rc)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn layer(self) -> u32 {
        self.0 & Self::LAYER_MASK
    }

    /// The response code without layer bits and without the handle/parameter/session
    /// number that format one codes carry.
    pub const fn base(self) -> Self {
        let rc = self.0 & !Self::LAYER_MASK;
        if rc & Self::FMT1 != 0 {
            Self(rc & 0x0BF)
        } else {
            Self(rc)
        }
    }

    /// True when this code originated from the TPM (directly or relayed by the
    /// resource manager) and its base equals `other`.
    pub fn is(self, other: ResponseCode) -> bool {
        let layer = self.layer();
        (layer == 0 || layer == Self::RESMGR_TPM_LAYER) && self.base() == other.base()
    }

    pub const fn is_transport(self) -> bool {
        self.layer() == Self::TCTI_LAYER
    }
}

impl From<u32> for ResponseCode {
    fn from(rc: u32) -> Self {
        Self(rc)
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

/// The device command that a [`TpmError::Device`] failure relates to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TpmCommand {
    Startup,
    GetCapability,
    CreatePrimary,
    Create,
    Load,
    ReadPublic,
    TrFromTpmPublic,
    TrClose,
    EvictControl,
    FlushContext,
    ContextSave,
    ContextLoad,
    StartAuthSession,
    Hash,
    Sign,
    Certify,
}

impl TpmCommand {
    pub fn name(self) -> &'static str {
        match self {
            TpmCommand::Startup => "TPM2_Startup",
            TpmCommand::GetCapability => "TPM2_GetCapability",
            TpmCommand::CreatePrimary => "TPM2_CreatePrimary",
            TpmCommand::Create => "TPM2_Create",
            TpmCommand::Load => "TPM2_Load",
            TpmCommand::ReadPublic => "TPM2_ReadPublic",
            TpmCommand::TrFromTpmPublic => "Esys_TR_FromTPMPublic",
            TpmCommand::TrClose => "Esys_TR_Close",
            TpmCommand::EvictControl => "TPM2_EvictControl",
            TpmCommand::FlushContext => "TPM2_FlushContext",
            TpmCommand::ContextSave => "TPM2_ContextSave",
            TpmCommand::ContextLoad => "TPM2_ContextLoad",
            TpmCommand::StartAuthSession => "TPM2_StartAuthSession",
            TpmCommand::Hash => "TPM2_Hash",
            TpmCommand::Sign => "TPM2_Sign",
            TpmCommand::Certify => "TPM2_Certify",
        }
    }
}

impl fmt::Display for TpmCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Coarse classification of [`TpmError`] values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// No reachable device, or the connection to it was lost.
    Transport,
    /// The device rejected a command, or a request could not be expressed to it.
    Device,
    /// A blob was malformed, of the wrong size, or originated from another device.
    Codec,
    /// No usable signing key, or both signing paths failed.
    Signing,
    /// Configuration input was invalid.
    Config,
    /// Reading or writing durable artifacts failed.
    Io,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TpmError {
    // Transport
    TransportUnavailable,
    TransportLost { command: TpmCommand, rc: ResponseCode },
    TctiNameInvalid,
    TssContextCreate,
    SessionClosed,
    FeatureNotEnabled,

    // Device
    Device { command: TpmCommand, rc: ResponseCode },
    ObjectAttributesInvalid,
    UnsupportedAlgorithm(u16),
    IncorrectKeyType,
    RsaPublicFromComponents,
    RsaPublicToPem,
    RsaPublicToDer,
    Aes256KeyInvalid,
    Aes256GcmEncrypt,
    Aes256GcmDecrypt,

    // Codec
    UnmarshalTruncated(&'static str),
    UnmarshalTrailingData { structure: &'static str, remaining: usize },
    UnmarshalInvalid(&'static str),
    ContextBlobOversize { len: usize, max: usize },
    ContextForeign { rc: ResponseCode },

    // Signing
    SigningKeyUnresolved,
    SignatureSchemeUnsupported(u16),
    SigningHashUnsupported(u16),
    MessageTooLarge { len: usize, max: usize },
    SigningFailed { direct: Box<TpmError>, fallback: Box<TpmError> },
    SignatureInvalid,

    // Config
    ConfigInvalid { key: &'static str, value: String },
    PersistentHandleInvalid(String),

    // Io
    Io { path: String, reason: String },
    SignatureInfoEncode,
}

impl TpmError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TpmError::TransportUnavailable
            | TpmError::TransportLost { .. }
            | TpmError::TctiNameInvalid
            | TpmError::TssContextCreate
            | TpmError::SessionClosed
            | TpmError::FeatureNotEnabled => ErrorKind::Transport,

            TpmError::Device { .. }
            | TpmError::ObjectAttributesInvalid
            | TpmError::UnsupportedAlgorithm(_)
            | TpmError::IncorrectKeyType
            | TpmError::RsaPublicFromComponents
            | TpmError::RsaPublicToPem
            | TpmError::RsaPublicToDer
            | TpmError::Aes256KeyInvalid
            | TpmError::Aes256GcmEncrypt
            | TpmError::Aes256GcmDecrypt => ErrorKind::Device,

            TpmError::UnmarshalTruncated(_)
            | TpmError::UnmarshalTrailingData { .. }
            | TpmError::UnmarshalInvalid(_)
            | TpmError::ContextBlobOversize { .. }
            | TpmError::ContextForeign { .. } => ErrorKind::Codec,

            TpmError::SigningKeyUnresolved
            | TpmError::SignatureSchemeUnsupported(_)
            | TpmError::SigningHashUnsupported(_)
            | TpmError::MessageTooLarge { .. }
            | TpmError::SigningFailed { .. }
            | TpmError::SignatureInvalid => ErrorKind::Signing,

            TpmError::ConfigInvalid { .. } | TpmError::PersistentHandleInvalid(_) => {
                ErrorKind::Config
            }

            TpmError::Io { .. } | TpmError::SignatureInfoEncode => ErrorKind::Io,
        }
    }

    /// The device response code, if this error is a device rejection.
    pub fn response_code(&self) -> Option<ResponseCode> {
        match self {
            TpmError::Device { rc, .. }
            | TpmError::TransportLost { rc, .. }
            | TpmError::ContextForeign { rc } => Some(*rc),
            _ => None,
        }
    }

    /// True if the device rejected `command` with a code whose base is `rc`.
    pub fn is_device(&self, rc: ResponseCode) -> bool {
        matches!(self, TpmError::Device { rc: actual, .. } if actual.is(rc))
    }

    pub(crate) fn io(path: &std::path::Path, err: &std::io::Error) -> Self {
        TpmError::Io {
            path: path.display().to_string(),
            reason: err.to_string(),
        }
    }
}

impl fmt::Display for TpmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TpmError::TransportUnavailable => {
                f.write_str("no software TPM listening and no TPM device node present")
            }
            TpmError::TransportLost { command, rc } => {
                write!(f, "transport failed during {command} (rc={rc})")
            }
            TpmError::TctiNameInvalid => f.write_str("invalid TCTI configuration string"),
            TpmError::TssContextCreate => f.write_str("unable to create TSS context"),
            TpmError::SessionClosed => f.write_str("device session is closed"),
            TpmError::FeatureNotEnabled => {
                f.write_str("built without TPM support (enable the `tpm` feature)")
            }
            TpmError::Device { command, rc } => write!(f, "{command} failed (rc={rc})"),
            TpmError::ObjectAttributesInvalid => f.write_str("invalid object attributes"),
            TpmError::UnsupportedAlgorithm(alg) => {
                write!(f, "unsupported algorithm 0x{alg:04x}")
            }
            TpmError::IncorrectKeyType => f.write_str("object is not of the expected key type"),
            TpmError::RsaPublicFromComponents => {
                f.write_str("unable to build RSA public key from modulus and exponent")
            }
            TpmError::RsaPublicToPem => f.write_str("unable to encode RSA public key as PEM"),
            TpmError::RsaPublicToDer => f.write_str("unable to encode RSA public key as DER"),
            TpmError::Aes256KeyInvalid => f.write_str("invalid AES-256 key"),
            TpmError::Aes256GcmEncrypt => f.write_str("AES-256-GCM wrap failed"),
            TpmError::Aes256GcmDecrypt => f.write_str("AES-256-GCM unwrap failed"),
            TpmError::UnmarshalTruncated(structure) => write!(f, "{structure} is truncated"),
            TpmError::UnmarshalTrailingData {
                structure,
                remaining,
            } => write!(f, "{structure} has {remaining} trailing bytes"),
            TpmError::UnmarshalInvalid(structure) => write!(f, "{structure} is malformed"),
            TpmError::ContextBlobOversize { len, max } => {
                write!(f, "context blob is {len} bytes, maximum is {max}")
            }
            TpmError::ContextForeign { rc } => write!(
                f,
                "context blob was not produced by this device or power cycle (rc={rc})"
            ),
            TpmError::SigningKeyUnresolved => f.write_str("no usable signing key"),
            TpmError::SignatureSchemeUnsupported(alg) => {
                write!(f, "unsupported signature scheme 0x{alg:04x}")
            }
            TpmError::SigningHashUnsupported(alg) => {
                write!(f, "unsupported signing hash algorithm 0x{alg:04x}")
            }
            TpmError::MessageTooLarge { len, max } => {
                write!(f, "message is {len} bytes, device hashing is limited to {max}")
            }
            TpmError::SigningFailed { direct, fallback } => write!(
                f,
                "direct sign failed ({direct}) and ticketed sign failed ({fallback})"
            ),
            TpmError::SignatureInvalid => f.write_str("signature does not verify"),
            TpmError::ConfigInvalid { key, value } => {
                write!(f, "invalid configuration value {key}={value:?}")
            }
            TpmError::PersistentHandleInvalid(value) => {
                write!(f, "invalid persistent handle {value:?}")
            }
            TpmError::Io { path, reason } => write!(f, "{path}: {reason}"),
            TpmError::SignatureInfoEncode => f.write_str("unable to encode signature info"),
        }
    }
}

impl std::error::Error for TpmError {}
