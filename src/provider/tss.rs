use crate::context::ContextBlob;
use crate::error::{ResponseCode, TpmCommand, TpmError};
use crate::provider::Tpm;
use crate::structures::{
    CertifyResult, CreateKeyResult, CreatePrimaryResult, HashAlgorithm, HashcheckTicket,
    Hierarchy, ObjectHandle, PersistentHandle, PrivateBlob, PublicKeyDescriptor, SessionHandle,
    Signature, SignatureScheme, MAX_DIGEST_BUFFER, TPM2_PERSISTENT_FIRST, TPM2_ST_HASHCHECK,
    TPM2_TRANSIENT_FIRST,
};
use std::collections::BTreeMap;
use std::str::FromStr;
use tracing::{debug, error, trace, warn};
use tss_esapi::attributes::SessionAttributesBuilder;
use tss_esapi::constants::{CapabilityType, SessionType, StartupType};
use tss_esapi::handles::{
    KeyHandle, ObjectHandle as TssObjectHandle, PersistentTpmHandle, SessionHandle as TssSession,
    TpmHandle, TransientTpmHandle,
};
use tss_esapi::interface_types::algorithm::HashingAlgorithm;
use tss_esapi::interface_types::dynamic_handles::Persistent;
use tss_esapi::interface_types::resource_handles::{Hierarchy as TssHierarchy, Provision};
use tss_esapi::interface_types::session_handles::AuthSession;
use tss_esapi::structures::{
    CapabilityData, Data, Digest, HashScheme, HashcheckTicket as TssTicket, MaxBuffer, Nonce,
    Private, Public, Signature as TssSignature, SignatureScheme as TssSignatureScheme,
    SymmetricDefinition,
};
use tss_esapi::traits::{Marshall, UnMarshall};
use tss_esapi::tss2_esys::{TPM2B_DIGEST, TPMS_CONTEXT, TPMT_TK_HASHCHECK, TSS2_RC};
use tss_esapi::utils::TpmsContext;
use tss_esapi::Context;
use tss_esapi::TctiNameConf;

const CAPABILITY_BATCH: u32 = 64;

/// A device reached through the TSS ESAPI.
pub struct TssTpm {
    tpm_ctx: Context,
    sessions: BTreeMap<u32, AuthSession>,
    next_session: u32,
}

impl Drop for TssTpm {
    fn drop(&mut self) {
        self.tpm_ctx.clear_sessions();
    }
}

/// Split a TSS failure into a device rejection or a lost transport.
fn tss_error(command: TpmCommand, tss_err: tss_esapi::Error) -> TpmError {
    match tss_err {
        tss_esapi::Error::TssError(rc) => {
            let rc = ResponseCode::new(TSS2_RC::from(rc));
            if rc.is_transport() {
                error!(command = command.name(), %rc, "device transport failed");
                TpmError::TransportLost { command, rc }
            } else {
                debug!(command = command.name(), %rc, "device rejected command");
                TpmError::Device { command, rc }
            }
        }
        tss_esapi::Error::WrapperError(kind) => {
            error!(?kind, command = command.name(), "TSS wrapper rejected command");
            TpmError::Device {
                command,
                rc: ResponseCode::WRAPPER,
            }
        }
    }
}

fn hashing_algorithm(alg: HashAlgorithm) -> HashingAlgorithm {
    match alg {
        HashAlgorithm::Sha1 => HashingAlgorithm::Sha1,
        HashAlgorithm::Sha256 => HashingAlgorithm::Sha256,
        HashAlgorithm::Sha384 => HashingAlgorithm::Sha384,
        HashAlgorithm::Sha512 => HashingAlgorithm::Sha512,
    }
}

fn tss_hierarchy(hierarchy: Hierarchy) -> TssHierarchy {
    match hierarchy {
        Hierarchy::Owner => TssHierarchy::Owner,
        Hierarchy::Null => TssHierarchy::Null,
    }
}

fn tss_signature_scheme(scheme: SignatureScheme) -> TssSignatureScheme {
    match scheme {
        SignatureScheme::Null => TssSignatureScheme::Null,
        SignatureScheme::RsaSsa(hash) => TssSignatureScheme::RsaSsa {
            scheme: HashScheme::new(hashing_algorithm(hash)),
        },
        SignatureScheme::RsaPss(hash) => TssSignatureScheme::RsaPss {
            scheme: HashScheme::new(hashing_algorithm(hash)),
        },
    }
}

// Both sides speak TPMT_PUBLIC, so the wire form is the conversion.
fn tss_public(public: &PublicKeyDescriptor) -> Result<Public, TpmError> {
    Public::unmarshall(&public.marshal_public_area()).map_err(|tss_err| {
        error!(?tss_err, "Unable to convert public area");
        TpmError::UnmarshalInvalid("TPMT_PUBLIC")
    })
}

fn descriptor(public: &Public) -> Result<PublicKeyDescriptor, TpmError> {
    let bytes = public.marshall().map_err(|tss_err| {
        error!(?tss_err, "Unable to marshal public area");
        TpmError::UnmarshalInvalid("TPMT_PUBLIC")
    })?;
    PublicKeyDescriptor::unmarshal_public_area(&bytes)
}

fn signature(signature: &TssSignature) -> Result<Signature, TpmError> {
    let bytes = signature.marshall().map_err(|tss_err| {
        error!(?tss_err, "Unable to marshal signature");
        TpmError::UnmarshalInvalid("TPMT_SIGNATURE")
    })?;
    Signature::unmarshal(&bytes)
}

fn context_blob(tpms_context: TpmsContext) -> Result<ContextBlob, TpmError> {
    let raw = TPMS_CONTEXT::try_from(tpms_context).map_err(|tss_err| {
        error!(?tss_err, "Unable to convert saved context");
        TpmError::UnmarshalInvalid("TPMS_CONTEXT")
    })?;

    let data = raw
        .contextBlob
        .buffer
        .get(..usize::from(raw.contextBlob.size))
        .ok_or(TpmError::UnmarshalInvalid("TPM2B_CONTEXT_DATA"))?
        .to_vec();

    ContextBlob::new(raw.sequence, raw.savedHandle, raw.hierarchy, data)
}

fn tpms_context(blob: &ContextBlob) -> Result<TpmsContext, TpmError> {
    let mut raw = TPMS_CONTEXT {
        sequence: blob.sequence(),
        savedHandle: blob.saved_handle(),
        hierarchy: blob.hierarchy_handle(),
        contextBlob: Default::default(),
    };

    let data = blob.data();
    let size = u16::try_from(data.len()).map_err(|_| TpmError::ContextBlobOversize {
        len: data.len(),
        max: usize::from(u16::MAX),
    })?;
    raw.contextBlob
        .buffer
        .get_mut(..data.len())
        .ok_or(TpmError::ContextBlobOversize {
            len: data.len(),
            max: raw.contextBlob.buffer.len(),
        })?
        .copy_from_slice(data);
    raw.contextBlob.size = size;

    TpmsContext::try_from(raw).map_err(|tss_err| {
        error!(?tss_err, "Unable to convert context blob");
        TpmError::UnmarshalInvalid("TPMS_CONTEXT")
    })
}

fn tss_ticket(ticket: &HashcheckTicket) -> Result<TssTicket, TpmError> {
    let digest = Digest::try_from(ticket.digest.clone()).map_err(|tss_err| {
        error!(?tss_err, "Ticket digest too large");
        TpmError::UnmarshalInvalid("TPMT_TK_HASHCHECK")
    })?;

    TPMT_TK_HASHCHECK {
        tag: TPM2_ST_HASHCHECK,
        hierarchy: ticket.hierarchy,
        digest: TPM2B_DIGEST::from(digest),
    }
    .try_into()
    .map_err(|tss_err| {
        error!(?tss_err, "Unable to convert ticket");
        TpmError::UnmarshalInvalid("TPMT_TK_HASHCHECK")
    })
}

fn ticket(ticket: TssTicket) -> Result<HashcheckTicket, TpmError> {
    let raw = TPMT_TK_HASHCHECK::try_from(ticket).map_err(|tss_err| {
        error!(?tss_err, "Unable to convert ticket");
        TpmError::UnmarshalInvalid("TPMT_TK_HASHCHECK")
    })?;

    let digest = raw
        .digest
        .buffer
        .get(..usize::from(raw.digest.size))
        .ok_or(TpmError::UnmarshalInvalid("TPMT_TK_HASHCHECK"))?
        .to_vec();

    Ok(HashcheckTicket {
        hierarchy: raw.hierarchy,
        digest,
    })
}

fn key_handle(object: ObjectHandle) -> KeyHandle {
    KeyHandle::from(TssObjectHandle::from(object.value()))
}

fn object_handle(object: impl Into<TssObjectHandle>) -> ObjectHandle {
    ObjectHandle::new(u32::from(object.into()))
}

fn persistent_tpm_handle(slot: PersistentHandle) -> Result<PersistentTpmHandle, TpmError> {
    PersistentTpmHandle::new(slot.value()).map_err(|tss_err| {
        error!(?tss_err, %slot, "Invalid persistent handle");
        TpmError::PersistentHandleInvalid(slot.to_string())
    })
}

impl TssTpm {
    /// Connect through `tcti_name` and start the device. A device that was
    /// already started is fine.
    pub fn new(tcti_name: &str) -> Result<Self, TpmError> {
        let tpm_name_config = TctiNameConf::from_str(tcti_name).map_err(|tpm_err| {
            error!(?tpm_err, tcti_name, "Invalid TCTI name");
            TpmError::TctiNameInvalid
        })?;

        let mut tpm_ctx = Context::new(tpm_name_config).map_err(|tpm_err| {
            error!(?tpm_err, tcti_name, "Unable to open TSS context");
            TpmError::TssContextCreate
        })?;

        match tpm_ctx.startup(StartupType::Clear) {
            Ok(()) => debug!("device started"),
            Err(tss_err) => match tss_error(TpmCommand::Startup, tss_err) {
                TpmError::Device { rc, .. } if rc.is(ResponseCode::INITIALIZE) => {
                    warn!("device already started, continuing")
                }
                tpm_err => return Err(tpm_err),
            },
        }

        Ok(TssTpm {
            tpm_ctx,
            sessions: BTreeMap::new(),
            next_session: 0,
        })
    }

    fn handles_from(&mut self, first: u32) -> Result<Vec<u32>, TpmError> {
        let range = first & 0xFF00_0000;
        let mut handles = Vec::new();
        let mut property = first;

        loop {
            let (capabilities, more_data) = self
                .tpm_ctx
                .get_capability(CapabilityType::Handles, property, CAPABILITY_BATCH)
                .map_err(|tss_err| tss_error(TpmCommand::GetCapability, tss_err))?;

            let CapabilityData::Handles(list) = capabilities else {
                error!("device answered a handle query with other capability data");
                return Err(TpmError::UnmarshalInvalid("TPML_HANDLE"));
            };

            let batch: Vec<u32> = list
                .into_inner()
                .into_iter()
                .map(u32::from)
                .filter(|handle| handle & 0xFF00_0000 == range)
                .collect();

            let next = batch.last().map(|last| last + 1);
            handles.extend(batch);

            match next {
                Some(next) if more_data => property = next,
                _ => break,
            }
        }

        trace!(range = format_args!("{range:#010x}"), count = handles.len());
        Ok(handles)
    }

    fn auth_session(&self, session: SessionHandle) -> Result<AuthSession, TpmError> {
        self.sessions
            .get(&session.value())
            .copied()
            .ok_or(TpmError::SessionClosed)
    }
}

impl Tpm for TssTpm {
    fn transient_handles(&mut self) -> Result<Vec<u32>, TpmError> {
        self.handles_from(TPM2_TRANSIENT_FIRST)
    }

    fn flush_transient_handle(&mut self, tpm_handle: u32) -> Result<(), TpmError> {
        let handle = TransientTpmHandle::new(tpm_handle).map_err(|tss_err| {
            error!(?tss_err, tpm_handle, "Not a transient handle");
            TpmError::UnmarshalInvalid("TPM2_HANDLE")
        })?;

        let object = self
            .tpm_ctx
            .tr_from_tpm_public(TpmHandle::Transient(handle))
            .map_err(|tss_err| tss_error(TpmCommand::TrFromTpmPublic, tss_err))?;

        self.tpm_ctx
            .flush_context(object)
            .map_err(|tss_err| tss_error(TpmCommand::FlushContext, tss_err))
    }

    fn persistent_handles(&mut self) -> Result<Vec<PersistentHandle>, TpmError> {
        self.handles_from(TPM2_PERSISTENT_FIRST)
            .map(|handles| handles.into_iter().map(PersistentHandle::new).collect())
    }

    fn create_primary(
        &mut self,
        hierarchy: Hierarchy,
        template: &PublicKeyDescriptor,
    ) -> Result<CreatePrimaryResult, TpmError> {
        let public = tss_public(template)?;

        let created = self
            .tpm_ctx
            .execute_with_nullauth_session(|ctx| {
                ctx.create_primary(tss_hierarchy(hierarchy), public, None, None, None, None)
            })
            .map_err(|tss_err| tss_error(TpmCommand::CreatePrimary, tss_err))?;

        Ok(CreatePrimaryResult {
            handle: object_handle(created.key_handle),
            public: descriptor(&created.out_public)?,
        })
    }

    fn create(
        &mut self,
        parent: ObjectHandle,
        template: &PublicKeyDescriptor,
    ) -> Result<CreateKeyResult, TpmError> {
        let public = tss_public(template)?;

        let created = self
            .tpm_ctx
            .execute_with_nullauth_session(|ctx| {
                ctx.create(key_handle(parent), public, None, None, None, None)
            })
            .map_err(|tss_err| tss_error(TpmCommand::Create, tss_err))?;

        Ok(CreateKeyResult {
            private: PrivateBlob::new(created.out_private.value().to_vec()),
            public: descriptor(&created.out_public)?,
        })
    }

    fn load(
        &mut self,
        parent: ObjectHandle,
        private: &PrivateBlob,
        public: &PublicKeyDescriptor,
    ) -> Result<ObjectHandle, TpmError> {
        let public = tss_public(public)?;
        let private = Private::try_from(private.as_bytes().to_vec()).map_err(|tss_err| {
            error!(?tss_err, "Private blob too large");
            TpmError::UnmarshalInvalid("TPM2B_PRIVATE")
        })?;

        self.tpm_ctx
            .execute_with_nullauth_session(|ctx| ctx.load(key_handle(parent), private, public))
            .map(object_handle)
            .map_err(|tss_err| tss_error(TpmCommand::Load, tss_err))
    }

    fn read_public(&mut self, object: ObjectHandle) -> Result<PublicKeyDescriptor, TpmError> {
        let (public, _name, _qualified_name) = self
            .tpm_ctx
            .read_public(key_handle(object))
            .map_err(|tss_err| tss_error(TpmCommand::ReadPublic, tss_err))?;
        descriptor(&public)
    }

    fn persistent_object(&mut self, slot: PersistentHandle) -> Result<ObjectHandle, TpmError> {
        let handle = persistent_tpm_handle(slot)?;
        self.tpm_ctx
            .tr_from_tpm_public(TpmHandle::Persistent(handle))
            .map(object_handle)
            .map_err(|tss_err| tss_error(TpmCommand::TrFromTpmPublic, tss_err))
    }

    fn close_handle(&mut self, object: ObjectHandle) -> Result<(), TpmError> {
        let mut handle = TssObjectHandle::from(object.value());
        self.tpm_ctx
            .tr_close(&mut handle)
            .map_err(|tss_err| tss_error(TpmCommand::TrClose, tss_err))
    }

    fn make_persistent(
        &mut self,
        object: ObjectHandle,
        slot: PersistentHandle,
    ) -> Result<ObjectHandle, TpmError> {
        let handle = persistent_tpm_handle(slot)?;
        self.tpm_ctx
            .execute_with_nullauth_session(|ctx| {
                ctx.evict_control(
                    Provision::Owner,
                    TssObjectHandle::from(object.value()),
                    Persistent::Persistent(handle),
                )
            })
            .map(object_handle)
            .map_err(|tss_err| tss_error(TpmCommand::EvictControl, tss_err))
    }

    fn evict_persistent(
        &mut self,
        object: ObjectHandle,
        slot: PersistentHandle,
    ) -> Result<(), TpmError> {
        let handle = persistent_tpm_handle(slot)?;
        self.tpm_ctx
            .execute_with_nullauth_session(|ctx| {
                ctx.evict_control(
                    Provision::Owner,
                    TssObjectHandle::from(object.value()),
                    Persistent::Persistent(handle),
                )
            })
            .map(|_| ())
            .map_err(|tss_err| tss_error(TpmCommand::EvictControl, tss_err))
    }

    fn flush_context(&mut self, object: ObjectHandle) -> Result<(), TpmError> {
        self.tpm_ctx
            .flush_context(TssObjectHandle::from(object.value()))
            .map_err(|tss_err| tss_error(TpmCommand::FlushContext, tss_err))
    }

    fn context_save(&mut self, object: ObjectHandle) -> Result<ContextBlob, TpmError> {
        let saved = self
            .tpm_ctx
            .context_save(TssObjectHandle::from(object.value()))
            .map_err(|tss_err| tss_error(TpmCommand::ContextSave, tss_err))?;
        context_blob(saved)
    }

    fn context_load(&mut self, blob: &ContextBlob) -> Result<ObjectHandle, TpmError> {
        let saved = tpms_context(blob)?;
        self.tpm_ctx
            .context_load(saved)
            .map(object_handle)
            .map_err(|tss_err| tss_error(TpmCommand::ContextLoad, tss_err))
    }

    fn start_auth_session(
        &mut self,
        bind: Option<ObjectHandle>,
    ) -> Result<SessionHandle, TpmError> {
        let nonce = self
            .tpm_ctx
            .get_random(16)
            .and_then(|random| Nonce::from_bytes(random.as_slice()))
            .map(Some)
            .map_err(|tss_err| tss_error(TpmCommand::StartAuthSession, tss_err))?;

        let auth_session = self
            .tpm_ctx
            .start_auth_session(
                None,
                bind.map(|object| TssObjectHandle::from(object.value())),
                nonce,
                SessionType::Hmac,
                SymmetricDefinition::Null,
                HashingAlgorithm::Sha256,
            )
            .map_err(|tss_err| tss_error(TpmCommand::StartAuthSession, tss_err))?
            .ok_or_else(|| {
                error!("No auth session created by tpm context");
                TpmError::Device {
                    command: TpmCommand::StartAuthSession,
                    rc: ResponseCode::WRAPPER,
                }
            })?;

        let (session_attributes, session_attributes_mask) = SessionAttributesBuilder::new()
            .with_continue_session(true)
            .build();

        self.tpm_ctx
            .tr_sess_set_attributes(auth_session, session_attributes, session_attributes_mask)
            .map_err(|tss_err| tss_error(TpmCommand::StartAuthSession, tss_err))?;

        self.next_session = self.next_session.wrapping_add(1);
        self.sessions.insert(self.next_session, auth_session);
        Ok(SessionHandle::new(self.next_session))
    }

    fn flush_session(&mut self, session: SessionHandle) -> Result<(), TpmError> {
        let auth_session = self
            .sessions
            .remove(&session.value())
            .ok_or(TpmError::SessionClosed)?;

        self.tpm_ctx
            .flush_context(TssSession::from(auth_session).into())
            .map_err(|tss_err| tss_error(TpmCommand::FlushContext, tss_err))
    }

    fn hash(
        &mut self,
        data: &[u8],
        alg: HashAlgorithm,
        hierarchy: Hierarchy,
    ) -> Result<(Vec<u8>, HashcheckTicket), TpmError> {
        let buffer = MaxBuffer::try_from(data.to_vec()).map_err(|_| TpmError::MessageTooLarge {
            len: data.len(),
            max: MAX_DIGEST_BUFFER,
        })?;

        let (digest, validation) = self
            .tpm_ctx
            .hash(buffer, hashing_algorithm(alg), tss_hierarchy(hierarchy))
            .map_err(|tss_err| tss_error(TpmCommand::Hash, tss_err))?;

        Ok((digest.value().to_vec(), ticket(validation)?))
    }

    fn sign(
        &mut self,
        key: ObjectHandle,
        session: Option<SessionHandle>,
        digest: &[u8],
        scheme: SignatureScheme,
        validation: &HashcheckTicket,
    ) -> Result<Signature, TpmError> {
        let tpm_digest = Digest::try_from(digest.to_vec()).map_err(|tss_err| {
            error!(?tss_err, "Digest too large");
            TpmError::UnmarshalInvalid("TPM2B_DIGEST")
        })?;
        let validation = tss_ticket(validation)?;
        let sig_scheme = tss_signature_scheme(scheme);

        let signed = match session {
            Some(session) => {
                let auth_session = self.auth_session(session)?;
                self.tpm_ctx.execute_with_session(Some(auth_session), |ctx| {
                    ctx.sign(key_handle(key), tpm_digest, sig_scheme, validation)
                })
            }
            None => self.tpm_ctx.execute_with_nullauth_session(|ctx| {
                ctx.sign(key_handle(key), tpm_digest, sig_scheme, validation)
            }),
        };

        let sig = signed.map_err(|tss_err| tss_error(TpmCommand::Sign, tss_err))?;
        signature(&sig)
    }

    fn certify(
        &mut self,
        object: ObjectHandle,
        signer: ObjectHandle,
        qualifying_data: &[u8],
        scheme: SignatureScheme,
    ) -> Result<CertifyResult, TpmError> {
        let qualifying_data = Data::try_from(qualifying_data.to_vec()).map_err(|tss_err| {
            error!(?tss_err, "Qualifying data too large");
            TpmError::UnmarshalInvalid("TPM2B_DATA")
        })?;
        let sig_scheme = tss_signature_scheme(scheme);

        let (attest, sig) = self
            .tpm_ctx
            .execute_with_sessions(
                (Some(AuthSession::Password), Some(AuthSession::Password), None),
                |ctx| {
                    ctx.certify(
                        TssObjectHandle::from(object.value()),
                        key_handle(signer),
                        qualifying_data,
                        sig_scheme,
                    )
                },
            )
            .map_err(|tss_err| tss_error(TpmCommand::Certify, tss_err))?;

        let attest = attest.marshall().map_err(|tss_err| {
            error!(?tss_err, "Unable to marshal attestation");
            TpmError::UnmarshalInvalid("TPMS_ATTEST")
        })?;

        Ok(CertifyResult {
            attest,
            signature: signature(&sig)?,
        })
    }

    fn teardown(&mut self) {
        let sessions = std::mem::take(&mut self.sessions);
        for (_, auth_session) in sessions {
            if let Err(tss_err) = self.tpm_ctx.flush_context(TssSession::from(auth_session).into())
            {
                warn!(?tss_err, "Unable to flush auth session");
            }
        }
        self.tpm_ctx.clear_sessions();
    }
}

#[cfg(test)]
mod tests {
    use super::TssTpm;

    // Hardware tests run only when a device is named, e.g.
    // `TCTI=swtpm:host=127.0.0.1,port=2321`.
    fn open(var: &str) -> Option<TssTpm> {
        let tcti = std::env::var(var).ok()?;
        Some(TssTpm::new(&tcti).expect("Unable to open TSS device"))
    }

    #[test]
    fn tss_tpm_ensure_is_idempotent() {
        let Some(tss_tpm) = open("TCTI") else { return };
        crate::tests::test_ensure_is_idempotent(tss_tpm);
    }

    #[test]
    fn tss_tpm_force_replaces_key() {
        let Some(tss_tpm) = open("TCTI") else { return };
        crate::tests::test_force_replaces_key(tss_tpm);
    }

    #[test]
    fn tss_tpm_context_round_trip() {
        let Some(tss_tpm) = open("TCTI") else { return };
        crate::tests::test_context_round_trip(tss_tpm);
    }

    #[test]
    fn tss_tpm_foreign_context_rejected() {
        let (Some(tss_tpm_a), Some(tss_tpm_b)) = (open("TCTI"), open("TCTI_FOREIGN")) else {
            return;
        };
        crate::tests::test_foreign_context_rejected(tss_tpm_a, tss_tpm_b);
    }

    #[test]
    fn tss_tpm_sign_and_verify() {
        let Some(tss_tpm) = open("TCTI") else { return };
        crate::tests::test_sign_and_verify(tss_tpm);
    }

    #[test]
    fn tss_tpm_evict() {
        let Some(tss_tpm) = open("TCTI") else { return };
        crate::tests::test_evict(tss_tpm);
    }

    #[test]
    fn tss_tpm_empty_device_scenario() {
        let Some(tss_tpm) = open("TCTI") else { return };
        crate::tests::test_empty_device_scenario(tss_tpm);
    }

    #[test]
    fn tss_tpm_transient_sweep() {
        let Some(tss_tpm) = open("TCTI") else { return };
        crate::tests::test_transient_sweep(tss_tpm);
    }

    #[test]
    fn tss_tpm_certify() {
        let Some(tss_tpm) = open("TCTI") else { return };
        crate::tests::test_certify(tss_tpm);
    }

    #[test]
    fn tss_tpm_restricted_key_uses_ticketed_fallback() {
        let Some(tss_tpm) = open("TCTI") else { return };
        crate::tests::test_restricted_key_uses_ticketed_fallback(tss_tpm);
    }

    #[test]
    fn tss_tpm_failed_signs_release_resources() {
        let Some(tss_tpm) = open("TCTI") else { return };
        crate::tests::test_failed_signs_release_resources(tss_tpm);
    }

    #[test]
    fn tss_tpm_session_lifecycle() {
        let Some(tss_tpm) = open("TCTI") else { return };
        crate::tests::test_session_lifecycle(tss_tpm);
    }
}
