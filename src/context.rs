//! Saved object contexts: the opaque, device-bound blob that lets a key be
//! reloaded as a transient object without touching its persistent slot.

use crate::error::{ResponseCode, TpmError};
use crate::marshal::{MarshalBuffer, UnmarshalBuffer};
use crate::provider::Tpm;
use crate::structures::{Hierarchy, ObjectHandle, PublicKeyDescriptor};
use std::fs;
use std::path::Path;
use tracing::{debug, error, warn};

/// Upper bound on the encrypted context data a device may return.
pub const MAX_CONTEXT_SIZE: usize = 5120;

/// Size of the fixed TPMS_CONTEXT header: sequence, savedHandle, hierarchy and
/// the TPM2B size field.
const CONTEXT_HEADER_SIZE: usize = 8 + 4 + 4 + 2;

/// TPMS_CONTEXT. Only the device that produced it can load it again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextBlob {
    sequence: u64,
    saved_handle: u32,
    hierarchy: u32,
    data: Vec<u8>,
}

impl ContextBlob {
    pub fn new(
        sequence: u64,
        saved_handle: u32,
        hierarchy: u32,
        data: Vec<u8>,
    ) -> Result<Self, TpmError> {
        if data.len() > MAX_CONTEXT_SIZE {
            return Err(TpmError::ContextBlobOversize {
                len: data.len(),
                max: MAX_CONTEXT_SIZE,
            });
        }
        Ok(ContextBlob {
            sequence,
            saved_handle,
            hierarchy,
            data,
        })
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn saved_handle(&self) -> u32 {
        self.saved_handle
    }

    pub fn hierarchy_handle(&self) -> u32 {
        self.hierarchy
    }

    pub fn hierarchy(&self) -> Option<Hierarchy> {
        Hierarchy::from_handle(self.hierarchy)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = MarshalBuffer::new();
        buf.put_u64(self.sequence);
        buf.put_u32(self.saved_handle);
        buf.put_u32(self.hierarchy);
        buf.put_tpm2b(&self.data);
        buf.into_vec()
    }

    /// Strict decode: truncated input, an oversized blob and trailing bytes are
    /// all rejected.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TpmError> {
        if bytes.len() > CONTEXT_HEADER_SIZE + MAX_CONTEXT_SIZE {
            return Err(TpmError::ContextBlobOversize {
                len: bytes.len(),
                max: CONTEXT_HEADER_SIZE + MAX_CONTEXT_SIZE,
            });
        }

        let mut rd = UnmarshalBuffer::new(bytes, "TPMS_CONTEXT");
        let sequence = rd.get_u64()?;
        let saved_handle = rd.get_u32()?;
        let hierarchy = rd.get_u32()?;
        let data = rd.get_tpm2b()?;
        rd.finish()?;

        Self::new(sequence, saved_handle, hierarchy, data)
    }

    pub fn read_from(path: &Path) -> Result<Self, TpmError> {
        let bytes = fs::read(path).map_err(|io_err| {
            error!(?io_err, path = %path.display(), "Unable to read context blob");
            TpmError::io(path, &io_err)
        })?;
        Self::from_bytes(&bytes)
    }

    pub fn write_to(&self, path: &Path) -> Result<(), TpmError> {
        fs::write(path, self.to_bytes()).map_err(|io_err| {
            error!(?io_err, path = %path.display(), "Unable to write context blob");
            TpmError::io(path, &io_err)
        })
    }
}

/// Save the context of a loaded or persistent object.
pub fn save<T: Tpm + ?Sized>(tpm: &mut T, object: ObjectHandle) -> Result<ContextBlob, TpmError> {
    let blob = tpm.context_save(object)?;
    debug!(%object, sequence = blob.sequence(), len = blob.data().len(), "context saved");
    Ok(blob)
}

/// Load a context as a new transient object. The caller owns the returned
/// handle and must flush it.
pub fn load<T: Tpm + ?Sized>(tpm: &mut T, blob: &ContextBlob) -> Result<ObjectHandle, TpmError> {
    tpm.context_load(blob).map_err(|tpm_err| {
        // Integrity, hierarchy and handle failures all mean the blob was not made
        // by this device in its current state.
        let foreign = [
            ResponseCode::INTEGRITY,
            ResponseCode::HIERARCHY,
            ResponseCode::HANDLE,
            ResponseCode::VALUE,
            ResponseCode::SIZE,
        ];
        match tpm_err.response_code() {
            Some(rc) if foreign.iter().any(|code| rc.is(*code)) => {
                warn!(%rc, "context blob rejected by device");
                TpmError::ContextForeign { rc }
            }
            _ => tpm_err,
        }
    })
}

/// Check that a context blob loads on this device, returning the public area
/// of the object it holds. The temporary object is flushed before returning.
pub fn verify<T: Tpm + ?Sized>(
    tpm: &mut T,
    blob: &ContextBlob,
) -> Result<PublicKeyDescriptor, TpmError> {
    let object = load(tpm, blob)?;
    crate::provider::execute_with_temporary_object(tpm, object, |tpm, object| {
        tpm.read_public(object)
    })
}
