use crate::context::ContextBlob;
use crate::error::{ResponseCode, TpmCommand, TpmError};
use crate::marshal::{MarshalBuffer, UnmarshalBuffer};
use crate::provider::Tpm;
use crate::structures::{
    CertifyResult, CreateKeyResult, CreatePrimaryResult, HashAlgorithm, HashcheckTicket,
    Hierarchy, ObjectHandle, PersistentHandle, PrivateBlob, PublicKeyDescriptor, SessionHandle,
    Signature, SignatureScheme, SymmetricDefinitionObject, MAX_DIGEST_BUFFER,
    TPM2_GENERATED_VALUE, TPM2_PERSISTENT_FIRST, TPM2_PERSISTENT_OWNER_LAST,
    TPM2_ST_ATTEST_CERTIFY, TPM2_ST_HASHCHECK, TPM2_TRANSIENT_FIRST,
};
use crate::wrap::{unwrap_aes256gcm, wrap_aes256gcm, SealedBlob};
use crypto_glue::{
    aes256::{self, Aes256Key},
    aes256gcm::{self, AeadInPlace, Aes256Gcm, KeyInit},
    rsa::RS256PrivateKey,
    s256::{Sha256, Sha256Output},
    traits::*,
};
use rsa::{traits::PublicKeyParts, Pkcs1v15Sign};
use std::collections::BTreeMap;
use tracing::{debug, error, trace};

const SOFT_TRANSIENT_SLOTS: usize = 3;
const SOFT_PERSISTENT_SLOTS: usize = 7;
const SOFT_SESSION_SLOTS: usize = 3;

const HMAC_SESSION_FIRST: u32 = 0x0200_0000;
/// savedHandle the device reports for an object context.
const CONTEXT_OBJECT_HANDLE: u32 = 0x8000_0000;

const SENSITIVE_STORAGE: u8 = 0;
const SENSITIVE_SIGNING: u8 = 1;

#[derive(Clone)]
enum SoftSensitive {
    Storage { seed: Aes256Key },
    Signing { key: RS256PrivateKey },
}

#[derive(Clone)]
struct SoftObject {
    hierarchy: Hierarchy,
    public: PublicKeyDescriptor,
    sensitive: SoftSensitive,
}

impl SoftObject {
    fn marshal(&self) -> Result<Zeroizing<Vec<u8>>, TpmError> {
        let mut buf = MarshalBuffer::new();
        buf.put_u32(self.hierarchy.handle());
        buf.put_tpm2b(&self.public.marshal_public_area());
        match &self.sensitive {
            SoftSensitive::Storage { seed } => {
                buf.put_u8(SENSITIVE_STORAGE);
                buf.put_tpm2b(seed.as_slice());
            }
            SoftSensitive::Signing { key } => {
                let pkcs8 = key.to_pkcs8_der().map_err(|err| {
                    error!(?err, "Unable to serialise RSA private key to der");
                    TpmError::Device {
                        command: TpmCommand::ContextSave,
                        rc: ResponseCode::FAILURE,
                    }
                })?;
                buf.put_u8(SENSITIVE_SIGNING);
                buf.put_tpm2b(pkcs8.to_bytes().as_slice());
            }
        }
        Ok(Zeroizing::new(buf.into_vec()))
    }

    fn unmarshal(bytes: &[u8]) -> Result<Self, TpmError> {
        let mut rd = UnmarshalBuffer::new(bytes, "SOFT_OBJECT");
        let hierarchy = Hierarchy::from_handle(rd.get_u32()?).ok_or_else(|| rd.invalid())?;
        let public = PublicKeyDescriptor::unmarshal_public_area(&rd.get_tpm2b()?)?;
        let kind = rd.get_u8()?;
        let secret = Zeroizing::new(rd.get_tpm2b()?);
        rd.finish()?;

        let sensitive = match kind {
            SENSITIVE_STORAGE => SoftSensitive::Storage {
                seed: aes256::key_from_vec(secret.to_vec())
                    .ok_or(TpmError::Aes256KeyInvalid)?,
            },
            SENSITIVE_SIGNING => SoftSensitive::Signing {
                key: RS256PrivateKey::from_pkcs8_der(&secret)
                    .map_err(|_| TpmError::UnmarshalInvalid("SOFT_OBJECT"))?,
            },
            _ => return Err(TpmError::UnmarshalInvalid("SOFT_OBJECT")),
        };

        Ok(SoftObject {
            hierarchy,
            public,
            sensitive,
        })
    }
}

fn device(command: TpmCommand, rc: ResponseCode) -> TpmError {
    TpmError::Device { command, rc }
}

fn sha256_parts(parts: &[&[u8]]) -> Sha256Output {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize()
}

/// An in-process device with the same command semantics as a real TPM, backed
/// by software keys. Handles, capacities and response codes follow the
/// reference implementation closely enough to exercise every lifecycle path.
pub struct SoftTpm {
    owner_seed: Aes256Key,
    null_seed: Aes256Key,
    context_key: Aes256Key,

    transient: BTreeMap<u32, SoftObject>,
    persistent: BTreeMap<u32, SoftObject>,
    sessions: BTreeMap<u32, Option<ObjectHandle>>,

    context_sequence: u64,
    reset_count: u32,
    clock: u64,

    transient_slots: usize,
    persistent_slots: usize,
    reject_host_digests: bool,
}

impl Default for SoftTpm {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftTpm {
    pub fn new() -> Self {
        SoftTpm {
            owner_seed: aes256::new_key(),
            null_seed: aes256::new_key(),
            context_key: aes256::new_key(),
            transient: BTreeMap::new(),
            persistent: BTreeMap::new(),
            sessions: BTreeMap::new(),
            context_sequence: 0,
            reset_count: 0,
            clock: 0,
            transient_slots: SOFT_TRANSIENT_SLOTS,
            persistent_slots: SOFT_PERSISTENT_SLOTS,
            reject_host_digests: false,
        }
    }

    pub fn with_capacity(mut self, transient_slots: usize, persistent_slots: usize) -> Self {
        self.transient_slots = transient_slots;
        self.persistent_slots = persistent_slots;
        self
    }

    /// Emulate devices that refuse to sign a digest computed off device, even
    /// for unrestricted keys.
    pub fn rejecting_host_digests(mut self) -> Self {
        self.reject_host_digests = true;
        self
    }

    /// TPM Reset. Transient objects and sessions are lost, and contexts saved
    /// before the reset no longer load. Persistent objects survive.
    pub fn reset(&mut self) {
        self.transient.clear();
        self.sessions.clear();
        self.null_seed = aes256::new_key();
        self.context_key = aes256::new_key();
        self.reset_count = self.reset_count.wrapping_add(1);
        debug!(reset_count = self.reset_count, "soft tpm reset");
    }

    fn resolve(&self, command: TpmCommand, object: ObjectHandle) -> Result<&SoftObject, TpmError> {
        let handle = object.value();
        self.transient
            .get(&handle)
            .or_else(|| self.persistent.get(&handle))
            .ok_or_else(|| device(command, ResponseCode::HANDLE))
    }

    fn allocate_transient(
        &mut self,
        command: TpmCommand,
        object: SoftObject,
    ) -> Result<ObjectHandle, TpmError> {
        let handle = (0..self.transient_slots as u32)
            .map(|idx| TPM2_TRANSIENT_FIRST + idx)
            .find(|handle| !self.transient.contains_key(handle))
            .ok_or_else(|| device(command, ResponseCode::OBJECT_MEMORY))?;

        self.transient.insert(handle, object);
        let object = ObjectHandle::new(handle);
        trace!(%object, "transient object loaded");
        Ok(object)
    }

    fn hierarchy_seed(&self, hierarchy: Hierarchy) -> &Aes256Key {
        match hierarchy {
            Hierarchy::Owner => &self.owner_seed,
            Hierarchy::Null => &self.null_seed,
        }
    }

    fn ticket_digest(&self, hierarchy: Hierarchy, digest: &[u8]) -> Vec<u8> {
        let proof = self.hierarchy_seed(hierarchy);
        sha256_parts(&[&TPM2_ST_HASHCHECK.to_be_bytes(), proof.as_slice(), digest]).to_vec()
    }

    fn ticket_is_valid(&self, ticket: &HashcheckTicket, digest: &[u8]) -> bool {
        if ticket.is_null() {
            return false;
        }
        match Hierarchy::from_handle(ticket.hierarchy) {
            Some(Hierarchy::Owner) => self.ticket_digest(Hierarchy::Owner, digest) == ticket.digest,
            _ => false,
        }
    }

    fn resolve_scheme(
        command: TpmCommand,
        public: &PublicKeyDescriptor,
        requested: SignatureScheme,
    ) -> Result<SignatureScheme, TpmError> {
        let key_scheme = SignatureScheme::from(public.scheme);
        match (key_scheme, requested) {
            (SignatureScheme::Null, SignatureScheme::Null) => {
                Err(device(command, ResponseCode::SCHEME))
            }
            (SignatureScheme::Null, requested) => Ok(requested),
            (key_scheme, SignatureScheme::Null) => Ok(key_scheme),
            (key_scheme, requested) if key_scheme == requested => Ok(key_scheme),
            _ => Err(device(command, ResponseCode::SCHEME)),
        }
    }

    fn sign_digest(
        command: TpmCommand,
        key: &RS256PrivateKey,
        scheme: SignatureScheme,
        digest: &[u8],
    ) -> Result<Signature, TpmError> {
        if scheme.hash_algorithm() != Some(HashAlgorithm::Sha256) {
            return Err(device(command, ResponseCode::HASH));
        }
        if digest.len() != HashAlgorithm::Sha256.digest_size() {
            return Err(device(command, ResponseCode::SIZE));
        }

        // Only RSASSA keys are created here.
        let SignatureScheme::RsaSsa(hash) = scheme else {
            return Err(device(command, ResponseCode::SCHEME));
        };

        key.sign(Pkcs1v15Sign::new::<sha2::Sha256>(), digest)
            .map(|sig| Signature::RsaSsa { hash, sig })
            .map_err(|err| {
                error!(?err, "soft tpm signing failed");
                device(command, ResponseCode::FAILURE)
            })
    }
}

impl Tpm for SoftTpm {
    fn transient_handles(&mut self) -> Result<Vec<u32>, TpmError> {
        Ok(self.transient.keys().copied().collect())
    }

    fn flush_transient_handle(&mut self, tpm_handle: u32) -> Result<(), TpmError> {
        self.transient
            .remove(&tpm_handle)
            .map(|_| ())
            .ok_or_else(|| device(TpmCommand::FlushContext, ResponseCode::HANDLE))
    }

    fn persistent_handles(&mut self) -> Result<Vec<PersistentHandle>, TpmError> {
        Ok(self
            .persistent
            .keys()
            .copied()
            .map(PersistentHandle::new)
            .collect())
    }

    fn create_primary(
        &mut self,
        hierarchy: Hierarchy,
        template: &PublicKeyDescriptor,
    ) -> Result<CreatePrimaryResult, TpmError> {
        let command = TpmCommand::CreatePrimary;

        // Only storage parents are supported as primaries.
        if !template.attributes.is_storage_parent() {
            return Err(device(command, ResponseCode::ATTRIBUTES));
        }
        if template.symmetric == SymmetricDefinitionObject::Null {
            return Err(device(command, ResponseCode::SYMMETRIC));
        }

        // Same seed and template always give the same primary.
        let hierarchy_seed = self.hierarchy_seed(hierarchy);
        let template_bytes = template.marshal_public_area();
        let seed_digest = sha256_parts(&[b"storage", hierarchy_seed.as_slice(), &template_bytes]);
        let seed = aes256::key_from_vec(seed_digest.to_vec()).ok_or(TpmError::Aes256KeyInvalid)?;

        let unique_len = template.key_bits as usize / 8;
        let mut unique = Vec::with_capacity(unique_len);
        let mut counter: u32 = 0;
        while unique.len() < unique_len {
            unique.extend_from_slice(
                sha256_parts(&[b"unique", seed.as_slice(), &counter.to_be_bytes()]).as_slice(),
            );
            counter += 1;
        }
        unique.truncate(unique_len);

        let mut public = template.clone();
        public.unique = unique;

        let handle = self.allocate_transient(
            command,
            SoftObject {
                hierarchy,
                public: public.clone(),
                sensitive: SoftSensitive::Storage { seed },
            },
        )?;

        Ok(CreatePrimaryResult { handle, public })
    }

    fn create(
        &mut self,
        parent: ObjectHandle,
        template: &PublicKeyDescriptor,
    ) -> Result<CreateKeyResult, TpmError> {
        let command = TpmCommand::Create;

        let parent_seed = match &self.resolve(command, parent)?.sensitive {
            SoftSensitive::Storage { seed } => seed.clone(),
            SoftSensitive::Signing { .. } => return Err(device(command, ResponseCode::TYPE)),
        };

        // Only signing keys may be created under a parent.
        let attrs = template.attributes;
        if !attrs.sign_encrypt() || attrs.decrypt() {
            return Err(device(command, ResponseCode::ATTRIBUTES));
        }
        if template.key_bits != 2048 {
            return Err(device(command, ResponseCode::KEY_SIZE));
        }

        let key = crypto_glue::rsa::new_key(template.key_bits as usize).map_err(|err| {
            error!(?err, "Unable to generate RSA private key");
            device(command, ResponseCode::FAILURE)
        })?;

        let mut public = template.clone();
        public.unique = key.n().to_bytes_be();

        let pkcs8 = key.to_pkcs8_der().map_err(|err| {
            error!(?err, "Unable to serialise RSA private key to der");
            device(command, ResponseCode::FAILURE)
        })?;
        let pkcs8_bytes = pkcs8.to_bytes();
        let name = public.name()?;

        let sealed = wrap_aes256gcm!(&parent_seed, pkcs8_bytes, name.as_slice())?;

        Ok(CreateKeyResult {
            private: PrivateBlob::new(sealed.to_bytes()),
            public,
        })
    }

    fn load(
        &mut self,
        parent: ObjectHandle,
        private: &PrivateBlob,
        public: &PublicKeyDescriptor,
    ) -> Result<ObjectHandle, TpmError> {
        let command = TpmCommand::Load;

        let parent_object = self.resolve(command, parent)?;
        let hierarchy = parent_object.hierarchy;
        let parent_seed = match &parent_object.sensitive {
            SoftSensitive::Storage { seed } => seed.clone(),
            SoftSensitive::Signing { .. } => return Err(device(command, ResponseCode::TYPE)),
        };

        let name = public.name()?;
        let sealed = SealedBlob::from_bytes(private.as_bytes())
            .map_err(|_| device(command, ResponseCode::INTEGRITY))?;
        let pkcs8_bytes: Result<Zeroizing<Vec<u8>>, TpmError> =
            unwrap_aes256gcm!(&parent_seed, &sealed, name.as_slice());
        let pkcs8_bytes = pkcs8_bytes.map_err(|_| device(command, ResponseCode::INTEGRITY))?;

        let key = RS256PrivateKey::from_pkcs8_der(&pkcs8_bytes)
            .map_err(|_| device(command, ResponseCode::INTEGRITY))?;

        if key.n().to_bytes_be() != public.unique {
            return Err(device(command, ResponseCode::BINDING));
        }

        self.allocate_transient(
            command,
            SoftObject {
                hierarchy,
                public: public.clone(),
                sensitive: SoftSensitive::Signing { key },
            },
        )
    }

    fn read_public(&mut self, object: ObjectHandle) -> Result<PublicKeyDescriptor, TpmError> {
        self.resolve(TpmCommand::ReadPublic, object)
            .map(|object| object.public.clone())
    }

    fn persistent_object(&mut self, slot: PersistentHandle) -> Result<ObjectHandle, TpmError> {
        if self.persistent.contains_key(&slot.value()) {
            Ok(ObjectHandle::new(slot.value()))
        } else {
            Err(device(TpmCommand::TrFromTpmPublic, ResponseCode::HANDLE))
        }
    }

    fn close_handle(&mut self, _object: ObjectHandle) -> Result<(), TpmError> {
        // References hold no device state here.
        Ok(())
    }

    fn make_persistent(
        &mut self,
        object: ObjectHandle,
        slot: PersistentHandle,
    ) -> Result<ObjectHandle, TpmError> {
        let command = TpmCommand::EvictControl;

        let source = self
            .transient
            .get(&object.value())
            .cloned()
            .ok_or_else(|| device(command, ResponseCode::HANDLE))?;

        if source.hierarchy != Hierarchy::Owner {
            return Err(device(command, ResponseCode::HIERARCHY));
        }
        if !(TPM2_PERSISTENT_FIRST..=TPM2_PERSISTENT_OWNER_LAST).contains(&slot.value()) {
            return Err(device(command, ResponseCode::VALUE));
        }
        if self.persistent.contains_key(&slot.value()) {
            return Err(device(command, ResponseCode::NV_DEFINED));
        }
        if self.persistent.len() >= self.persistent_slots {
            return Err(device(command, ResponseCode::NV_SPACE));
        }

        self.persistent.insert(slot.value(), source);
        debug!(%slot, "object persisted");
        Ok(ObjectHandle::new(slot.value()))
    }

    fn evict_persistent(
        &mut self,
        object: ObjectHandle,
        slot: PersistentHandle,
    ) -> Result<(), TpmError> {
        let command = TpmCommand::EvictControl;

        if object.value() != slot.value() {
            return Err(device(command, ResponseCode::VALUE));
        }
        self.persistent
            .remove(&slot.value())
            .map(|_| debug!(%slot, "object evicted"))
            .ok_or_else(|| device(command, ResponseCode::HANDLE))
    }

    fn flush_context(&mut self, object: ObjectHandle) -> Result<(), TpmError> {
        let handle = object.value();
        if self.transient.remove(&handle).is_some() {
            trace!(%object, "transient object flushed");
            Ok(())
        } else {
            Err(device(TpmCommand::FlushContext, ResponseCode::HANDLE))
        }
    }

    fn context_save(&mut self, object: ObjectHandle) -> Result<ContextBlob, TpmError> {
        let command = TpmCommand::ContextSave;

        let soft_object = self.resolve(command, object)?;
        let hierarchy = soft_object.hierarchy.handle();
        let state = soft_object.marshal()?;

        self.context_sequence += 1;
        let sequence = self.context_sequence;

        let mut aad = MarshalBuffer::new();
        aad.put_u64(sequence);
        aad.put_u32(CONTEXT_OBJECT_HANDLE);
        aad.put_u32(hierarchy);
        let aad = aad.into_vec();

        let sealed = wrap_aes256gcm!(&self.context_key, state, aad.as_slice())?;

        ContextBlob::new(sequence, CONTEXT_OBJECT_HANDLE, hierarchy, sealed.to_bytes())
            .map_err(|_| device(command, ResponseCode::SIZE))
    }

    fn context_load(&mut self, blob: &ContextBlob) -> Result<ObjectHandle, TpmError> {
        let command = TpmCommand::ContextLoad;

        let hierarchy = blob
            .hierarchy()
            .ok_or_else(|| device(command, ResponseCode::HIERARCHY))?;
        if blob.saved_handle() != CONTEXT_OBJECT_HANDLE {
            return Err(device(command, ResponseCode::HANDLE));
        }

        let mut aad = MarshalBuffer::new();
        aad.put_u64(blob.sequence());
        aad.put_u32(blob.saved_handle());
        aad.put_u32(blob.hierarchy_handle());
        let aad = aad.into_vec();

        let sealed = SealedBlob::from_bytes(blob.data())
            .map_err(|_| device(command, ResponseCode::INTEGRITY))?;
        let state: Result<Zeroizing<Vec<u8>>, TpmError> =
            unwrap_aes256gcm!(&self.context_key, &sealed, aad.as_slice());
        let state = state.map_err(|_| device(command, ResponseCode::INTEGRITY))?;

        let object =
            SoftObject::unmarshal(&state).map_err(|_| device(command, ResponseCode::INTEGRITY))?;
        if object.hierarchy != hierarchy {
            return Err(device(command, ResponseCode::INTEGRITY));
        }

        self.allocate_transient(command, object)
    }

    fn start_auth_session(
        &mut self,
        bind: Option<ObjectHandle>,
    ) -> Result<SessionHandle, TpmError> {
        let command = TpmCommand::StartAuthSession;

        if let Some(bind) = bind {
            self.resolve(command, bind)?;
        }

        let handle = (0..SOFT_SESSION_SLOTS as u32)
            .map(|idx| HMAC_SESSION_FIRST + idx)
            .find(|handle| !self.sessions.contains_key(handle))
            .ok_or_else(|| device(command, ResponseCode::SESSION_MEMORY))?;

        self.sessions.insert(handle, bind);
        Ok(SessionHandle::new(handle))
    }

    fn flush_session(&mut self, session: SessionHandle) -> Result<(), TpmError> {
        self.sessions
            .remove(&session.value())
            .map(|_| ())
            .ok_or_else(|| device(TpmCommand::FlushContext, ResponseCode::HANDLE))
    }

    fn hash(
        &mut self,
        data: &[u8],
        alg: HashAlgorithm,
        hierarchy: Hierarchy,
    ) -> Result<(Vec<u8>, HashcheckTicket), TpmError> {
        let command = TpmCommand::Hash;

        if data.len() > MAX_DIGEST_BUFFER {
            return Err(device(command, ResponseCode::SIZE));
        }
        if alg != HashAlgorithm::Sha256 {
            return Err(device(command, ResponseCode::HASH));
        }

        let digest = sha256_parts(&[data]).to_vec();

        let generated = data.len() >= 4 && data[..4] == TPM2_GENERATED_VALUE.to_be_bytes();
        let ticket = if hierarchy == Hierarchy::Null || generated {
            HashcheckTicket::null()
        } else {
            HashcheckTicket {
                hierarchy: hierarchy.handle(),
                digest: self.ticket_digest(hierarchy, &digest),
            }
        };

        Ok((digest, ticket))
    }

    fn sign(
        &mut self,
        key: ObjectHandle,
        session: Option<SessionHandle>,
        digest: &[u8],
        scheme: SignatureScheme,
        validation: &HashcheckTicket,
    ) -> Result<Signature, TpmError> {
        let command = TpmCommand::Sign;

        if let Some(session) = session {
            if !self.sessions.contains_key(&session.value()) {
                return Err(device(command, ResponseCode::HANDLE));
            }
        }

        let object = self.resolve(command, key)?;
        let private_key = match &object.sensitive {
            SoftSensitive::Signing { key } if object.public.attributes.sign_encrypt() => key,
            _ => return Err(device(command, ResponseCode::KEY)),
        };

        let scheme = Self::resolve_scheme(command, &object.public, scheme)?;

        let needs_ticket = object.public.attributes.restricted() || self.reject_host_digests;
        if (needs_ticket || !validation.is_null()) && !self.ticket_is_valid(validation, digest) {
            return Err(device(command, ResponseCode::TICKET));
        }

        Self::sign_digest(command, private_key, scheme, digest)
    }

    fn certify(
        &mut self,
        object: ObjectHandle,
        signer: ObjectHandle,
        qualifying_data: &[u8],
        scheme: SignatureScheme,
    ) -> Result<CertifyResult, TpmError> {
        let command = TpmCommand::Certify;

        let object_name = self.resolve(command, object)?.public.name()?;

        let signer_object = self.resolve(command, signer)?;
        let signer_key = match &signer_object.sensitive {
            SoftSensitive::Signing { key } if signer_object.public.attributes.sign_encrypt() => {
                key.clone()
            }
            _ => return Err(device(command, ResponseCode::KEY)),
        };
        let signer_name = signer_object.public.name()?;
        let scheme = Self::resolve_scheme(command, &signer_object.public, scheme)?;

        self.clock += 1;

        let mut attest = MarshalBuffer::new();
        attest.put_u32(TPM2_GENERATED_VALUE);
        attest.put_u16(TPM2_ST_ATTEST_CERTIFY);
        attest.put_tpm2b(&signer_name);
        attest.put_tpm2b(qualifying_data);
        // TPMS_CLOCK_INFO
        attest.put_u64(self.clock);
        attest.put_u32(self.reset_count);
        attest.put_u32(0);
        attest.put_u8(1);
        // firmwareVersion
        attest.put_u64(0);
        // TPMS_CERTIFY_INFO
        attest.put_tpm2b(&object_name);
        attest.put_tpm2b(&object_name);
        let attest = attest.into_vec();

        let digest = sha256_parts(&[&attest]);
        let signature = Self::sign_digest(command, &signer_key, scheme, digest.as_slice())?;

        Ok(CertifyResult { attest, signature })
    }

    fn teardown(&mut self) {
        self.sessions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::SoftTpm;
    use crate::context;
    use crate::error::{ResponseCode, TpmError};
    use crate::keys::{self, EnsureOptions};
    use crate::primary;
    use crate::provider::Tpm;
    use crate::sign::{self, KeySource};
    use crate::structures::{
        HashAlgorithm, HashcheckTicket, Hierarchy, PersistentHandle, SignatureScheme,
    };

    const SLOT: PersistentHandle = PersistentHandle::new(0x8101_000B);

    #[test]
    fn soft_ensure_is_idempotent() {
        crate::tests::test_ensure_is_idempotent(SoftTpm::new());
    }

    #[test]
    fn soft_force_replaces_key() {
        crate::tests::test_force_replaces_key(SoftTpm::new());
    }

    #[test]
    fn soft_context_round_trip() {
        crate::tests::test_context_round_trip(SoftTpm::new());
    }

    #[test]
    fn soft_foreign_context_rejected() {
        crate::tests::test_foreign_context_rejected(SoftTpm::new(), SoftTpm::new());
    }

    #[test]
    fn soft_sign_and_verify() {
        crate::tests::test_sign_and_verify(SoftTpm::new());
    }

    #[test]
    fn soft_evict() {
        crate::tests::test_evict(SoftTpm::new());
    }

    #[test]
    fn soft_empty_device_scenario() {
        crate::tests::test_empty_device_scenario(SoftTpm::new());
    }

    #[test]
    fn soft_transient_sweep() {
        crate::tests::test_transient_sweep(SoftTpm::new());
    }

    #[test]
    fn soft_certify() {
        crate::tests::test_certify(SoftTpm::new());
    }

    #[test]
    fn soft_restricted_key_uses_ticketed_fallback() {
        crate::tests::test_restricted_key_uses_ticketed_fallback(SoftTpm::new());
    }

    #[test]
    fn soft_failed_signs_release_resources() {
        crate::tests::test_failed_signs_release_resources(SoftTpm::new());
    }

    #[test]
    fn soft_session_lifecycle() {
        crate::tests::test_session_lifecycle(SoftTpm::new());
    }

    #[test]
    fn soft_host_digest_rejection_falls_back() {
        let _ = tracing_subscriber::fmt::try_init();
        let mut tpm = SoftTpm::new().rejecting_host_digests();

        keys::ensure(&mut tpm, SLOT, false).expect("Unable to provision key");

        let artifact = sign::sign(&mut tpm, &KeySource::Persistent(SLOT), b"quirky device")
            .expect("Unable to sign");
        assert!(artifact.fallback_used());

        let public = keys::read_public(&mut tpm, SLOT).expect("Unable to read public");
        assert!(artifact
            .verify(&public, b"quirky device")
            .expect("Unable to verify"));
    }

    #[test]
    fn soft_reset_invalidates_contexts_but_not_persistence() {
        let _ = tracing_subscriber::fmt::try_init();
        let mut tpm = SoftTpm::new();

        let provisioned = keys::ensure(&mut tpm, SLOT, false).expect("Unable to provision key");
        let blob = provisioned.context.clone().expect("Missing context blob");

        tpm.reset();

        assert!(matches!(
            context::load(&mut tpm, &blob),
            Err(TpmError::ContextForeign { rc }) if rc.is(ResponseCode::INTEGRITY)
        ));

        let reused = keys::ensure(&mut tpm, SLOT, false).expect("Unable to reuse key");
        assert!(!reused.created);
        assert_eq!(reused.public, provisioned.public);

        // A fresh context from the reuse path loads again.
        let fresh = reused.context.expect("Missing fresh context blob");
        let public = context::verify(&mut tpm, &fresh).expect("Unable to verify context");
        assert_eq!(public, provisioned.public);
    }

    #[test]
    fn soft_capacity_limits() {
        let _ = tracing_subscriber::fmt::try_init();
        let mut tpm = SoftTpm::new().with_capacity(2, 1);

        let primary_a = primary::derive_primary(&mut tpm).expect("Unable to derive primary");
        let primary_b = primary::derive_primary(&mut tpm).expect("Unable to derive primary");
        // Same template, same seed.
        assert_eq!(primary_a.public, primary_b.public);
        assert!(matches!(
            primary::derive_primary(&mut tpm),
            Err(err) if err.is_device(ResponseCode::OBJECT_MEMORY)
        ));
        tpm.flush_context(primary_a.handle)
            .expect("Unable to flush primary");
        tpm.flush_context(primary_b.handle)
            .expect("Unable to flush primary");

        keys::ensure(&mut tpm, SLOT, false).expect("Unable to provision key");

        let options = EnsureOptions::default();
        assert!(matches!(
            keys::ensure_with(&mut tpm, PersistentHandle::new(0x8101_000C), &options),
            Err(err) if err.is_device(ResponseCode::NV_SPACE)
        ));
        // The failed attempt left nothing loaded behind.
        assert!(tpm.transient_handles().expect("Unable to list").is_empty());
    }

    #[test]
    fn soft_rejects_platform_range_and_unrestricted_ticket_forgery() {
        let _ = tracing_subscriber::fmt::try_init();
        let mut tpm = SoftTpm::new();

        assert!(matches!(
            keys::ensure(&mut tpm, PersistentHandle::new(0x8180_0000), false),
            Err(err) if err.is_device(ResponseCode::VALUE)
        ));

        keys::ensure(&mut tpm, SLOT, false).expect("Unable to provision key");
        let key = tpm.persistent_object(SLOT).expect("Unable to open key");

        let forged = HashcheckTicket {
            hierarchy: Hierarchy::Owner.handle(),
            digest: vec![0; 32],
        };
        assert!(matches!(
            tpm.sign(
                key,
                None,
                &[0u8; 32],
                SignatureScheme::RsaSsa(HashAlgorithm::Sha256),
                &forged
            ),
            Err(err) if err.is_device(ResponseCode::TICKET)
        ));

        // Scheme mismatch with the key's fixed scheme.
        assert!(matches!(
            tpm.sign(
                key,
                None,
                &[0u8; 32],
                SignatureScheme::RsaPss(HashAlgorithm::Sha256),
                &HashcheckTicket::null()
            ),
            Err(err) if err.is_device(ResponseCode::SCHEME)
        ));
    }

    #[test]
    fn soft_hash_tickets() {
        let mut tpm = SoftTpm::new();

        let (digest, ticket) = tpm
            .hash(b"hello", HashAlgorithm::Sha256, Hierarchy::Owner)
            .expect("Unable to hash");
        assert_eq!(digest.len(), 32);
        assert!(!ticket.is_null());

        let (_, ticket) = tpm
            .hash(b"hello", HashAlgorithm::Sha256, Hierarchy::Null)
            .expect("Unable to hash");
        assert!(ticket.is_null());

        let (_, ticket) = tpm
            .hash(
                &[0xff, 0x54, 0x43, 0x47, 0x00],
                HashAlgorithm::Sha256,
                Hierarchy::Owner,
            )
            .expect("Unable to hash");
        assert!(ticket.is_null());

        assert!(matches!(
            tpm.hash(&[0u8; 1025], HashAlgorithm::Sha256, Hierarchy::Owner),
            Err(err) if err.is_device(ResponseCode::SIZE)
        ));
    }
}
