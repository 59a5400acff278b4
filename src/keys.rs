//! Application key lifecycle: probe, create-or-reuse, persist, evict.
//!
//! A slot moves through `Absent -> Persisted -> Absent`. The transient copy
//! of a key exists only while a single operation runs and is always flushed
//! before the operation returns.

use crate::context::{self, ContextBlob};
use crate::error::{ResponseCode, TpmError};
use crate::export;
use crate::primary::{self, execute_with_primary};
use crate::provider::{execute_with_persistent_object, execute_with_temporary_object, Tpm};
use crate::structures::{
    HashAlgorithm, ObjectHandle, PersistentHandle, PrivateBlob, PublicKeyDescriptor, Signature,
    SignatureScheme,
};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Absent,
    Persisted(PersistentHandle),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evicted {
    Removed,
    NotFound,
}

#[derive(Debug, Clone, Default)]
pub struct EnsureOptions {
    /// Evict and replace any key already at the slot.
    pub force: bool,
    /// Certify a newly created key with the attestation key at this slot.
    pub certify_with: Option<PersistentHandle>,
}

/// TPM2_Certify output for an application key.
#[derive(Debug, Clone)]
pub struct CertifyArtifact {
    /// Marshalled TPMS_ATTEST.
    pub attest: Vec<u8>,
    pub signature: Signature,
}

impl CertifyArtifact {
    /// Marshalled TPMT_SIGNATURE.
    pub fn signature_bytes(&self) -> Vec<u8> {
        self.signature.marshal()
    }
}

/// Everything `ensure` learned about the key at a slot.
#[derive(Debug, Clone)]
pub struct ProvisionedKey {
    pub slot: PersistentHandle,
    /// False when an existing key was reused.
    pub created: bool,
    pub public: PublicKeyDescriptor,
    pub public_pem: String,
    /// Only known on the create path.
    pub private: Option<PrivateBlob>,
    pub context: Option<ContextBlob>,
    pub certification: Option<CertifyArtifact>,
}

/// Where [`ProvisionedKey::write_artifacts`] puts each file. `None` skips it.
#[derive(Debug, Clone, Default)]
pub struct ArtifactPaths {
    pub context: Option<PathBuf>,
    pub public_pem: Option<PathBuf>,
    pub public_blob: Option<PathBuf>,
    pub private_blob: Option<PathBuf>,
    pub attest: Option<PathBuf>,
    pub attest_signature: Option<PathBuf>,
}

impl ArtifactPaths {
    /// The conventional file names, placed in `dir`.
    pub fn in_dir(dir: &Path) -> Self {
        ArtifactPaths {
            context: Some(dir.join("appsk.ctx")),
            public_pem: Some(dir.join("appsk_pub.pem")),
            public_blob: Some(dir.join("appsk.pub")),
            private_blob: Some(dir.join("appsk.priv")),
            attest: Some(dir.join("appsig_info.bin")),
            attest_signature: Some(dir.join("appsig_cert.sig")),
        }
    }
}

fn write_artifact(path: &Path, bytes: &[u8]) -> Result<(), TpmError> {
    fs::write(path, bytes).map_err(|io_err| {
        error!(?io_err, path = %path.display(), "Unable to write artifact");
        TpmError::io(path, &io_err)
    })?;
    info!(path = %path.display(), len = bytes.len(), "artifact written");
    Ok(())
}

impl ProvisionedKey {
    /// Marshalled TPM2B_PUBLIC.
    pub fn public_blob(&self) -> Vec<u8> {
        self.public.marshal()
    }

    /// Write every artifact that both has a path and is present.
    pub fn write_artifacts(&self, paths: &ArtifactPaths) -> Result<(), TpmError> {
        if let (Some(path), Some(blob)) = (&paths.context, &self.context) {
            blob.write_to(path)?;
            info!(path = %path.display(), "context blob written");
        }
        if let Some(path) = &paths.public_pem {
            write_artifact(path, self.public_pem.as_bytes())?;
        }
        if let Some(path) = &paths.public_blob {
            write_artifact(path, &self.public_blob())?;
        }
        if let (Some(path), Some(private)) = (&paths.private_blob, &self.private) {
            write_artifact(path, &private.marshal())?;
        }
        if let Some(certification) = &self.certification {
            if let Some(path) = &paths.attest {
                write_artifact(path, &certification.attest)?;
            }
            if let Some(path) = &paths.attest_signature {
                write_artifact(path, &certification.signature_bytes())?;
            }
        }
        Ok(())
    }
}

/// Flush every transient object resident on the device, including ones leaked
/// by earlier processes. Failures are logged and skipped. Returns the number
/// of objects flushed.
pub fn flush_all_transients<T: Tpm + ?Sized>(tpm: &mut T) -> usize {
    let handles = match tpm.transient_handles() {
        Ok(handles) => handles,
        Err(tpm_err) => {
            warn!(?tpm_err, "Unable to enumerate transient objects");
            return 0;
        }
    };

    let mut flushed = 0;
    for handle in handles {
        match tpm.flush_transient_handle(handle) {
            Ok(()) => {
                debug!(handle = %ObjectHandle::new(handle), "flushed stale transient");
                flushed += 1;
            }
            Err(tpm_err) => {
                warn!(?tpm_err, handle = %ObjectHandle::new(handle), "Unable to flush transient")
            }
        }
    }

    if flushed > 0 {
        info!(flushed, "flushed transient objects");
    }
    flushed
}

/// Non-destructive presence check. On success the caller owns the returned
/// reference and must close it.
pub fn probe<T: Tpm + ?Sized>(
    tpm: &mut T,
    slot: PersistentHandle,
) -> Result<Option<ObjectHandle>, TpmError> {
    if !tpm.persistent_handles()?.contains(&slot) {
        return Ok(None);
    }
    tpm.persistent_object(slot).map(Some)
}

pub fn state<T: Tpm + ?Sized>(tpm: &mut T, slot: PersistentHandle) -> Result<KeyState, TpmError> {
    let state = if tpm.persistent_handles()?.contains(&slot) {
        KeyState::Persisted(slot)
    } else {
        KeyState::Absent
    };
    Ok(state)
}

pub fn read_public<T: Tpm + ?Sized>(
    tpm: &mut T,
    slot: PersistentHandle,
) -> Result<PublicKeyDescriptor, TpmError> {
    execute_with_persistent_object(tpm, slot, |tpm, object| tpm.read_public(object))
}

pub fn ensure<T: Tpm + ?Sized>(
    tpm: &mut T,
    slot: PersistentHandle,
    force: bool,
) -> Result<ProvisionedKey, TpmError> {
    ensure_with(
        tpm,
        slot,
        &EnsureOptions {
            force,
            certify_with: None,
        },
    )
}

/// Create-or-reuse the application key at `slot`.
///
/// Without `force` an existing key is reused and the device is left exactly
/// as it was found, apart from the context save.
pub fn ensure_with<T: Tpm + ?Sized>(
    tpm: &mut T,
    slot: PersistentHandle,
    options: &EnsureOptions,
) -> Result<ProvisionedKey, TpmError> {
    match probe(tpm, slot)? {
        Some(existing) if !options.force => {
            info!(%slot, "found existing AppSK, reusing");
            let res = reuse(tpm, slot, existing);
            if let Err(tpm_err) = tpm.close_handle(existing) {
                warn!(?tpm_err, %slot, "Unable to close persistent object reference");
            }
            return res;
        }
        Some(existing) => {
            info!(%slot, "force set, evicting existing AppSK");
            if let Err(tpm_err) = tpm.evict_persistent(existing, slot) {
                // The stale object may already be gone, or the owner auth may not
                // match. Creation surfaces any real conflict.
                warn!(?tpm_err, %slot, "Unable to evict existing AppSK, continuing");
                if let Err(tpm_err) = tpm.close_handle(existing) {
                    warn!(?tpm_err, %slot, "Unable to close persistent object reference");
                }
            }
        }
        None => info!(%slot, "no AppSK present, creating"),
    }

    let template = primary::application_key_template()?;
    let created = create_persisted(tpm, slot, &template)?;

    let certification = match options.certify_with {
        Some(ak_slot) => certify_best_effort(tpm, slot, ak_slot),
        None => None,
    };

    Ok(ProvisionedKey {
        slot,
        created: true,
        public_pem: export::public_key_pem(&created.public)?,
        public: created.public,
        private: Some(created.private),
        context: created.context,
        certification,
    })
}

fn reuse<T: Tpm + ?Sized>(
    tpm: &mut T,
    slot: PersistentHandle,
    existing: ObjectHandle,
) -> Result<ProvisionedKey, TpmError> {
    let public = tpm.read_public(existing)?;

    let context = match context::save(tpm, existing) {
        Ok(blob) => Some(blob),
        Err(tpm_err) => {
            warn!(?tpm_err, %slot, "Unable to save context of persistent AppSK");
            None
        }
    };

    Ok(ProvisionedKey {
        slot,
        created: false,
        public_pem: export::public_key_pem(&public)?,
        public,
        private: None,
        context,
        certification: None,
    })
}

struct CreatedKey {
    public: PublicKeyDescriptor,
    private: PrivateBlob,
    context: Option<ContextBlob>,
}

/// Create a key from `template` under the owner primary and persist it at
/// `slot`. Both transient objects are flushed on every path.
fn create_persisted<T: Tpm + ?Sized>(
    tpm: &mut T,
    slot: PersistentHandle,
    template: &PublicKeyDescriptor,
) -> Result<CreatedKey, TpmError> {
    flush_all_transients(tpm);

    execute_with_primary(tpm, |tpm, parent| {
        let created = tpm.create(parent, template).map_err(|tpm_err| {
            error!(?tpm_err, "Unable to create key under owner primary");
            tpm_err
        })?;

        let key = tpm.load(parent, &created.private, &created.public)?;

        execute_with_temporary_object(tpm, key, |tpm, key| {
            let persisted = tpm.make_persistent(key, slot).map_err(|tpm_err| {
                error!(?tpm_err, %slot, "Unable to persist key");
                tpm_err
            })?;
            info!(%slot, "key persisted");

            if let Err(tpm_err) = tpm.close_handle(persisted) {
                warn!(?tpm_err, %slot, "Unable to close persistent object reference");
            }

            // The transient copy is still loaded and describes the persisted key.
            let context = match context::save(tpm, key) {
                Ok(blob) => Some(blob),
                Err(tpm_err) => {
                    warn!(?tpm_err, %slot, "Unable to save context of new key");
                    None
                }
            };

            Ok(CreatedKey {
                public: created.public,
                private: created.private,
                context,
            })
        })
    })
}

/// Remove the key at `slot`. An empty slot is not an error.
pub fn evict<T: Tpm + ?Sized>(tpm: &mut T, slot: PersistentHandle) -> Result<Evicted, TpmError> {
    let Some(object) = probe(tpm, slot)? else {
        info!(%slot, "nothing persisted, nothing to evict");
        return Ok(Evicted::NotFound);
    };

    match tpm.evict_persistent(object, slot) {
        Ok(()) => {
            info!(%slot, "evicted");
            Ok(Evicted::Removed)
        }
        Err(tpm_err) => {
            if let Err(close_err) = tpm.close_handle(object) {
                warn!(?close_err, %slot, "Unable to close persistent object reference");
            }
            if tpm_err.is_device(ResponseCode::HANDLE) {
                info!(%slot, "object vanished before eviction");
                Ok(Evicted::NotFound)
            } else {
                error!(?tpm_err, %slot, "Unable to evict");
                Err(tpm_err)
            }
        }
    }
}

/// Provision the restricted attestation key at `slot` unless one is present.
pub fn ensure_attestation_key<T: Tpm + ?Sized>(
    tpm: &mut T,
    slot: PersistentHandle,
) -> Result<PublicKeyDescriptor, TpmError> {
    if let KeyState::Persisted(_) = state(tpm, slot)? {
        debug!(%slot, "attestation key present");
        return read_public(tpm, slot);
    }

    info!(%slot, "provisioning attestation key");
    let template = primary::attestation_key_template()?;
    create_persisted(tpm, slot, &template).map(|created| created.public)
}

/// Certify the key at `app_slot` with the attestation key at `ak_slot`.
pub fn certify<T: Tpm + ?Sized>(
    tpm: &mut T,
    app_slot: PersistentHandle,
    ak_slot: PersistentHandle,
    qualifying_data: &[u8],
) -> Result<CertifyArtifact, TpmError> {
    execute_with_persistent_object(tpm, app_slot, |tpm, app_key| {
        execute_with_persistent_object(tpm, ak_slot, |tpm, ak| {
            tpm.certify(
                app_key,
                ak,
                qualifying_data,
                SignatureScheme::RsaSsa(HashAlgorithm::Sha256),
            )
        })
    })
    .map(|certified| CertifyArtifact {
        attest: certified.attest,
        signature: certified.signature,
    })
}

fn certify_best_effort<T: Tpm + ?Sized>(
    tpm: &mut T,
    app_slot: PersistentHandle,
    ak_slot: PersistentHandle,
) -> Option<CertifyArtifact> {
    match state(tpm, ak_slot) {
        Ok(KeyState::Persisted(_)) => {}
        Ok(KeyState::Absent) => {
            warn!(%ak_slot, "attestation key absent, skipping certification");
            return None;
        }
        Err(tpm_err) => {
            warn!(?tpm_err, %ak_slot, "Unable to probe attestation key");
            return None;
        }
    }

    match certify(tpm, app_slot, ak_slot, &[]) {
        Ok(artifact) => {
            info!(%app_slot, %ak_slot, "AppSK certified");
            Some(artifact)
        }
        Err(tpm_err) => {
            warn!(?tpm_err, %ak_slot, "Unable to certify AppSK");
            None
        }
    }
}
