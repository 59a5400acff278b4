//! Signing with a persisted or context-loaded key.
//!
//! The digest is computed on the host and signed directly. If the device
//! refuses a host digest (restricted keys, and some devices for every key) the
//! message is hashed on the device instead and the sign is retried once with
//! the resulting ticket.

use crate::context::{self, ContextBlob};
use crate::error::{ErrorKind, ResponseCode, TpmError};
use crate::export::SignatureInfo;
use crate::provider::{execute_with_session, execute_with_temporary_object, Tpm};
use crate::structures::{
    HashAlgorithm, HashcheckTicket, Hierarchy, ObjectHandle, PersistentHandle,
    PublicKeyDescriptor, SessionHandle, Signature, SignatureScheme, MAX_DIGEST_BUFFER,
};
use crypto_glue::{
    hex,
    rsa::{RS256Signature, RS256VerifyingKey},
    s256::{Sha256, Sha256Output},
    traits::*,
};
use rsa::Pss;
use std::fs;
use std::path::Path;
use tracing::{debug, error, info, warn};

/// Used when the key's public area can't be read or declares no scheme.
pub const DEFAULT_SIGNING_SCHEME: SignatureScheme = SignatureScheme::RsaSsa(HashAlgorithm::Sha256);

pub struct SchemePolicy;

impl SchemePolicy {
    pub fn select(public: Option<&PublicKeyDescriptor>) -> SignatureScheme {
        match public.map(|public| SignatureScheme::from(public.scheme)) {
            None | Some(SignatureScheme::Null) => DEFAULT_SIGNING_SCHEME,
            Some(scheme) => scheme,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySource {
    Persistent(PersistentHandle),
    Context(ContextBlob),
}

impl KeySource {
    /// `0x` prefixed or all-digit arguments name a persistent slot. Anything
    /// else is read as a context blob file.
    pub fn parse(arg: &str) -> Result<Self, TpmError> {
        let is_slot = arg.starts_with("0x")
            || arg.starts_with("0X")
            || (!arg.is_empty() && arg.bytes().all(|b| b.is_ascii_digit()));

        if is_slot {
            arg.parse().map(KeySource::Persistent)
        } else {
            ContextBlob::read_from(Path::new(arg)).map(KeySource::Context)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureArtifact {
    scheme: SignatureScheme,
    signature: Vec<u8>,
    digest: Vec<u8>,
    fallback_used: bool,
}

impl SignatureArtifact {
    fn from_signature(
        signature: Signature,
        digest: Vec<u8>,
        fallback_used: bool,
    ) -> Result<Self, TpmError> {
        let (scheme, signature) = match signature {
            Signature::RsaSsa { hash, sig } => (SignatureScheme::RsaSsa(hash), sig),
            Signature::RsaPss { hash, sig } => (SignatureScheme::RsaPss(hash), sig),
            Signature::Other(alg) => {
                error!(alg, "device returned an unsupported signature algorithm");
                return Err(TpmError::SignatureSchemeUnsupported(alg));
            }
        };

        Ok(SignatureArtifact {
            scheme,
            signature,
            digest,
            fallback_used,
        })
    }

    pub fn scheme(&self) -> SignatureScheme {
        self.scheme
    }

    pub fn hash_alg(&self) -> HashAlgorithm {
        self.scheme.hash_algorithm().unwrap_or(HashAlgorithm::Sha256)
    }

    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    pub fn digest(&self) -> &[u8] {
        &self.digest
    }

    /// True if the device hashed the message and the ticketed retry signed it.
    pub fn fallback_used(&self) -> bool {
        self.fallback_used
    }

    pub fn info(&self) -> SignatureInfo {
        SignatureInfo {
            scheme: self.scheme.name().to_string(),
            hash_alg: self.hash_alg().name().to_string(),
            signature_len: self.signature.len(),
            digest: hex::encode(&self.digest),
        }
    }

    /// Verify against a public area on the host.
    pub fn verify(&self, public: &PublicKeyDescriptor, message: &[u8]) -> Result<bool, TpmError> {
        let pub_key = public.rsa_public_key()?;

        match self.scheme {
            SignatureScheme::RsaSsa(HashAlgorithm::Sha256) => {
                let verifier = RS256VerifyingKey::new(pub_key);
                let sig = RS256Signature::try_from(self.signature.as_slice())
                    .map_err(|_| TpmError::SignatureInvalid)?;
                Ok(verifier.verify(message, &sig).is_ok())
            }
            SignatureScheme::RsaPss(HashAlgorithm::Sha256) => {
                let digest = sha256(message);
                Ok(pub_key
                    .verify(Pss::new::<sha2::Sha256>(), digest.as_slice(), &self.signature)
                    .is_ok())
            }
            SignatureScheme::RsaSsa(hash) | SignatureScheme::RsaPss(hash) => {
                Err(TpmError::SigningHashUnsupported(hash.alg_id()))
            }
            SignatureScheme::Null => Err(TpmError::SignatureSchemeUnsupported(
                self.scheme.alg_id(),
            )),
        }
    }

    /// Write the raw signature and its JSON side-car.
    pub fn write_to(&self, signature_path: &Path, info_path: &Path) -> Result<(), TpmError> {
        fs::write(signature_path, &self.signature).map_err(|io_err| {
            error!(?io_err, path = %signature_path.display(), "Unable to write signature");
            TpmError::io(signature_path, &io_err)
        })?;

        let info = self.info().to_json()?;
        fs::write(info_path, info).map_err(|io_err| {
            error!(?io_err, path = %info_path.display(), "Unable to write signature info");
            TpmError::io(info_path, &io_err)
        })
    }
}

fn sha256(message: &[u8]) -> Sha256Output {
    let mut hasher = Sha256::new();
    hasher.update(message);
    hasher.finalize()
}

/// Sign `message` with the key named by `source`. The key reference and the
/// auth session are released on every path.
pub fn sign<T: Tpm + ?Sized>(
    tpm: &mut T,
    source: &KeySource,
    message: &[u8],
) -> Result<SignatureArtifact, TpmError> {
    match source {
        KeySource::Persistent(slot) => {
            let key = tpm.persistent_object(*slot).map_err(|tpm_err| {
                error!(?tpm_err, %slot, "Unable to open signing key");
                if tpm_err.is_device(ResponseCode::HANDLE) {
                    TpmError::SigningKeyUnresolved
                } else {
                    tpm_err
                }
            })?;

            let res = sign_with_key(tpm, key, message);

            if let Err(tpm_err) = tpm.close_handle(key) {
                warn!(?tpm_err, %slot, "Unable to close persistent object reference");
            }
            res
        }
        KeySource::Context(blob) => {
            let key = context::load(tpm, blob)?;
            execute_with_temporary_object(tpm, key, |tpm, key| sign_with_key(tpm, key, message))
        }
    }
}

fn sign_with_key<T: Tpm + ?Sized>(
    tpm: &mut T,
    key: ObjectHandle,
    message: &[u8],
) -> Result<SignatureArtifact, TpmError> {
    let public = match tpm.read_public(key) {
        Ok(public) => Some(public),
        Err(tpm_err) => {
            warn!(?tpm_err, "Unable to read key public area, using default scheme");
            None
        }
    };

    let scheme = SchemePolicy::select(public.as_ref());
    let hash_alg = match scheme.hash_algorithm() {
        Some(HashAlgorithm::Sha256) => HashAlgorithm::Sha256,
        Some(other) => return Err(TpmError::SigningHashUnsupported(other.alg_id())),
        None => return Err(TpmError::SignatureSchemeUnsupported(scheme.alg_id())),
    };
    debug!(?scheme, "signing scheme selected");

    execute_with_session(tpm, Some(key), |tpm, session| {
        let digest = sha256(message).to_vec();

        let direct_err = match tpm.sign(
            key,
            Some(session),
            &digest,
            scheme,
            &HashcheckTicket::null(),
        ) {
            Ok(signature) => return SignatureArtifact::from_signature(signature, digest, false),
            Err(tpm_err) => tpm_err,
        };

        if direct_err.kind() != ErrorKind::Device {
            return Err(direct_err);
        }

        warn!(?direct_err, "direct sign rejected, retrying with device digest and ticket");

        sign_ticketed(tpm, key, session, scheme, hash_alg, message).map_err(|fallback_err| {
            error!(?fallback_err, "ticketed sign failed");
            TpmError::SigningFailed {
                direct: Box::new(direct_err),
                fallback: Box::new(fallback_err),
            }
        })
    })
}

fn sign_ticketed<T: Tpm + ?Sized>(
    tpm: &mut T,
    key: ObjectHandle,
    session: SessionHandle,
    scheme: SignatureScheme,
    hash_alg: HashAlgorithm,
    message: &[u8],
) -> Result<SignatureArtifact, TpmError> {
    if message.len() > MAX_DIGEST_BUFFER {
        return Err(TpmError::MessageTooLarge {
            len: message.len(),
            max: MAX_DIGEST_BUFFER,
        });
    }

    let (digest, ticket) = tpm.hash(message, hash_alg, Hierarchy::Owner)?;
    let signature = tpm.sign(key, Some(session), &digest, scheme, &ticket)?;

    info!("signed with device digest and ticket");
    SignatureArtifact::from_signature(signature, digest, true)
}
