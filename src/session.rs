use crate::context::ContextBlob;
use crate::error::{ErrorKind, TpmError};
use crate::provider::Tpm;
use crate::structures::{
    CertifyResult, CreateKeyResult, CreatePrimaryResult, HashAlgorithm, HashcheckTicket,
    Hierarchy, ObjectHandle, PersistentHandle, PrivateBlob, PublicKeyDescriptor, SessionHandle,
    Signature, SignatureScheme,
};
use crate::transport::TransportDescriptor;
use tracing::{debug, error};

/// One live connection to a device. Teardown runs exactly once, either from
/// [`Session::close`] or on drop. A transport failure marks the session dead
/// and every later command fails with [`TpmError::SessionClosed`].
pub struct Session<T: Tpm> {
    tpm: T,
    descriptor: TransportDescriptor,
    live: bool,
    torn_down: bool,
}

impl<T: Tpm> Session<T> {
    pub fn new(tpm: T, descriptor: TransportDescriptor) -> Self {
        debug!(%descriptor, "device session opened");
        Session {
            tpm,
            descriptor,
            live: true,
            torn_down: false,
        }
    }

    pub fn descriptor(&self) -> &TransportDescriptor {
        &self.descriptor
    }

    pub fn is_live(&self) -> bool {
        self.live
    }

    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if !self.torn_down {
            self.torn_down = true;
            self.live = false;
            self.tpm.teardown();
            debug!(descriptor = %self.descriptor, "device session closed");
        }
    }

    fn run<R, F>(&mut self, f: F) -> Result<R, TpmError>
    where
        F: FnOnce(&mut T) -> Result<R, TpmError>,
    {
        if !self.live {
            return Err(TpmError::SessionClosed);
        }
        let res = f(&mut self.tpm);
        if let Err(tpm_err) = &res {
            if tpm_err.kind() == ErrorKind::Transport {
                error!(?tpm_err, descriptor = %self.descriptor, "device connection lost");
                self.live = false;
            }
        }
        res
    }
}

#[cfg(feature = "tpm")]
impl Session<crate::provider::TssTpm> {
    /// Connect to the device described by `descriptor` and start it up.
    pub fn open(descriptor: TransportDescriptor) -> Result<Self, TpmError> {
        let tpm = crate::provider::TssTpm::new(&descriptor.to_tcti_name())?;
        Ok(Session::new(tpm, descriptor))
    }
}

impl<T: Tpm> Drop for Session<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<T: Tpm> Tpm for Session<T> {
    fn transient_handles(&mut self) -> Result<Vec<u32>, TpmError> {
        self.run(|tpm| tpm.transient_handles())
    }

    fn flush_transient_handle(&mut self, tpm_handle: u32) -> Result<(), TpmError> {
        self.run(|tpm| tpm.flush_transient_handle(tpm_handle))
    }

    fn persistent_handles(&mut self) -> Result<Vec<PersistentHandle>, TpmError> {
        self.run(|tpm| tpm.persistent_handles())
    }

    fn create_primary(
        &mut self,
        hierarchy: Hierarchy,
        template: &PublicKeyDescriptor,
    ) -> Result<CreatePrimaryResult, TpmError> {
        self.run(|tpm| tpm.create_primary(hierarchy, template))
    }

    fn create(
        &mut self,
        parent: ObjectHandle,
        template: &PublicKeyDescriptor,
    ) -> Result<CreateKeyResult, TpmError> {
        self.run(|tpm| tpm.create(parent, template))
    }

    fn load(
        &mut self,
        parent: ObjectHandle,
        private: &PrivateBlob,
        public: &PublicKeyDescriptor,
    ) -> Result<ObjectHandle, TpmError> {
        self.run(|tpm| tpm.load(parent, private, public))
    }

    fn read_public(&mut self, object: ObjectHandle) -> Result<PublicKeyDescriptor, TpmError> {
        self.run(|tpm| tpm.read_public(object))
    }

    fn persistent_object(&mut self, slot: PersistentHandle) -> Result<ObjectHandle, TpmError> {
        self.run(|tpm| tpm.persistent_object(slot))
    }

    fn close_handle(&mut self, object: ObjectHandle) -> Result<(), TpmError> {
        self.run(|tpm| tpm.close_handle(object))
    }

    fn make_persistent(
        &mut self,
        object: ObjectHandle,
        slot: PersistentHandle,
    ) -> Result<ObjectHandle, TpmError> {
        self.run(|tpm| tpm.make_persistent(object, slot))
    }

    fn evict_persistent(
        &mut self,
        object: ObjectHandle,
        slot: PersistentHandle,
    ) -> Result<(), TpmError> {
        self.run(|tpm| tpm.evict_persistent(object, slot))
    }

    fn flush_context(&mut self, object: ObjectHandle) -> Result<(), TpmError> {
        self.run(|tpm| tpm.flush_context(object))
    }

    fn context_save(&mut self, object: ObjectHandle) -> Result<ContextBlob, TpmError> {
        self.run(|tpm| tpm.context_save(object))
    }

    fn context_load(&mut self, blob: &ContextBlob) -> Result<ObjectHandle, TpmError> {
        self.run(|tpm| tpm.context_load(blob))
    }

    fn start_auth_session(
        &mut self,
        bind: Option<ObjectHandle>,
    ) -> Result<SessionHandle, TpmError> {
        self.run(|tpm| tpm.start_auth_session(bind))
    }

    fn flush_session(&mut self, session: SessionHandle) -> Result<(), TpmError> {
        self.run(|tpm| tpm.flush_session(session))
    }

    fn hash(
        &mut self,
        data: &[u8],
        alg: HashAlgorithm,
        hierarchy: Hierarchy,
    ) -> Result<(Vec<u8>, HashcheckTicket), TpmError> {
        self.run(|tpm| tpm.hash(data, alg, hierarchy))
    }

    fn sign(
        &mut self,
        key: ObjectHandle,
        session: Option<SessionHandle>,
        digest: &[u8],
        scheme: SignatureScheme,
        validation: &HashcheckTicket,
    ) -> Result<Signature, TpmError> {
        self.run(|tpm| tpm.sign(key, session, digest, scheme, validation))
    }

    fn certify(
        &mut self,
        object: ObjectHandle,
        signer: ObjectHandle,
        qualifying_data: &[u8],
        scheme: SignatureScheme,
    ) -> Result<CertifyResult, TpmError> {
        self.run(|tpm| tpm.certify(object, signer, qualifying_data, scheme))
    }

    fn teardown(&mut self) {
        self.shutdown();
    }
}
