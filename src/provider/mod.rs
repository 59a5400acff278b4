use crate::context::ContextBlob;
use crate::error::TpmError;
use crate::structures::{
    CertifyResult, CreateKeyResult, CreatePrimaryResult, HashAlgorithm, HashcheckTicket,
    Hierarchy, ObjectHandle, PersistentHandle, PrivateBlob, PublicKeyDescriptor, SessionHandle,
    Signature, SignatureScheme,
};
use tracing::warn;

mod soft;
#[cfg(feature = "tpm")]
mod tss;

pub use self::soft::SoftTpm;

#[cfg(feature = "tpm")]
pub use self::tss::TssTpm;

/// The device commands the key lifecycle and signing protocols are built from.
///
/// Object handles returned by one provider are opaque to every other.
/// Persistent objects are referenced through [`Tpm::persistent_object`] and
/// released with [`Tpm::close_handle`]. Loaded objects are released with
/// [`Tpm::flush_context`].
pub trait Tpm {
    /// Raw TPM handles of every transient object resident on the device,
    /// including ones this process did not create.
    fn transient_handles(&mut self) -> Result<Vec<u32>, TpmError>;

    fn flush_transient_handle(&mut self, tpm_handle: u32) -> Result<(), TpmError>;

    fn persistent_handles(&mut self) -> Result<Vec<PersistentHandle>, TpmError>;

    fn create_primary(
        &mut self,
        hierarchy: Hierarchy,
        template: &PublicKeyDescriptor,
    ) -> Result<CreatePrimaryResult, TpmError>;

    fn create(
        &mut self,
        parent: ObjectHandle,
        template: &PublicKeyDescriptor,
    ) -> Result<CreateKeyResult, TpmError>;

    fn load(
        &mut self,
        parent: ObjectHandle,
        private: &PrivateBlob,
        public: &PublicKeyDescriptor,
    ) -> Result<ObjectHandle, TpmError>;

    fn read_public(&mut self, object: ObjectHandle) -> Result<PublicKeyDescriptor, TpmError>;

    /// Open a reference to the object persisted at `slot`.
    fn persistent_object(&mut self, slot: PersistentHandle) -> Result<ObjectHandle, TpmError>;

    /// Release a reference obtained from [`Tpm::persistent_object`] or
    /// [`Tpm::make_persistent`]. The persisted object itself is untouched.
    fn close_handle(&mut self, object: ObjectHandle) -> Result<(), TpmError>;

    /// Copy a loaded object into `slot`. The transient object stays loaded.
    fn make_persistent(
        &mut self,
        object: ObjectHandle,
        slot: PersistentHandle,
    ) -> Result<ObjectHandle, TpmError>;

    /// Remove the persisted object at `slot`. `object` must reference it, and
    /// is no longer valid afterwards.
    fn evict_persistent(
        &mut self,
        object: ObjectHandle,
        slot: PersistentHandle,
    ) -> Result<(), TpmError>;

    fn flush_context(&mut self, object: ObjectHandle) -> Result<(), TpmError>;

    fn context_save(&mut self, object: ObjectHandle) -> Result<ContextBlob, TpmError>;

    fn context_load(&mut self, blob: &ContextBlob) -> Result<ObjectHandle, TpmError>;

    /// Start an HMAC session without parameter encryption, optionally bound to
    /// `bind`.
    fn start_auth_session(
        &mut self,
        bind: Option<ObjectHandle>,
    ) -> Result<SessionHandle, TpmError>;

    fn flush_session(&mut self, session: SessionHandle) -> Result<(), TpmError>;

    /// Hash `data` on the device. The ticket is null if the device declines to
    /// vouch for the data.
    fn hash(
        &mut self,
        data: &[u8],
        alg: HashAlgorithm,
        hierarchy: Hierarchy,
    ) -> Result<(Vec<u8>, HashcheckTicket), TpmError>;

    fn sign(
        &mut self,
        key: ObjectHandle,
        session: Option<SessionHandle>,
        digest: &[u8],
        scheme: SignatureScheme,
        validation: &HashcheckTicket,
    ) -> Result<Signature, TpmError>;

    fn certify(
        &mut self,
        object: ObjectHandle,
        signer: ObjectHandle,
        qualifying_data: &[u8],
        scheme: SignatureScheme,
    ) -> Result<CertifyResult, TpmError>;

    /// Release every session-wide resource. Called once when a session closes.
    fn teardown(&mut self) {}
}

/// Run `f` with a loaded object, flushing it afterwards whatever `f` returned.
/// A failed flush is logged and never replaces the result of `f`.
pub(crate) fn execute_with_temporary_object<T, F, R>(
    tpm: &mut T,
    object: ObjectHandle,
    f: F,
) -> Result<R, TpmError>
where
    T: Tpm + ?Sized,
    F: FnOnce(&mut T, ObjectHandle) -> Result<R, TpmError>,
{
    let res = f(tpm, object);

    if let Err(tpm_err) = tpm.flush_context(object) {
        warn!(?tpm_err, %object, "Unable to flush transient object");
    }

    res
}

/// As [`execute_with_temporary_object`], for a persistent object reference
/// that must be closed rather than flushed.
pub(crate) fn execute_with_persistent_object<T, F, R>(
    tpm: &mut T,
    slot: PersistentHandle,
    f: F,
) -> Result<R, TpmError>
where
    T: Tpm + ?Sized,
    F: FnOnce(&mut T, ObjectHandle) -> Result<R, TpmError>,
{
    let object = tpm.persistent_object(slot)?;

    let res = f(tpm, object);

    if let Err(tpm_err) = tpm.close_handle(object) {
        warn!(?tpm_err, %slot, "Unable to close persistent object reference");
    }

    res
}

/// As [`execute_with_temporary_object`], for an auth session.
pub(crate) fn execute_with_session<T, F, R>(
    tpm: &mut T,
    bind: Option<ObjectHandle>,
    f: F,
) -> Result<R, TpmError>
where
    T: Tpm + ?Sized,
    F: FnOnce(&mut T, SessionHandle) -> Result<R, TpmError>,
{
    let session = tpm.start_auth_session(bind)?;

    let res = f(tpm, session);

    if let Err(tpm_err) = tpm.flush_session(session) {
        warn!(?tpm_err, "Unable to flush auth session");
    }

    res
}
