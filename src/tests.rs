use crate::context;
use crate::error::{ErrorKind, TpmError};
use crate::export;
use crate::keys::{self, ArtifactPaths, EnsureOptions, Evicted, KeyState};
use crate::primary;
use crate::provider::Tpm;
use crate::session::Session;
use crate::sign::{self, KeySource};
use crate::structures::{PersistentHandle, Signature, TPM2_GENERATED_VALUE};
use crate::transport::TransportDescriptor;
use crypto_glue::rsa::{RS256Signature, RS256VerifyingKey};
use crypto_glue::traits::*;
use tracing::trace;

// Each suite uses its own slots so suites can share one device.
const IDEMPOTENT_SLOT: PersistentHandle = PersistentHandle::new(0x8101_0021);
const FORCE_SLOT: PersistentHandle = PersistentHandle::new(0x8101_0022);
const CONTEXT_SLOT: PersistentHandle = PersistentHandle::new(0x8101_0023);
const FOREIGN_SLOT: PersistentHandle = PersistentHandle::new(0x8101_0024);
const SIGN_SLOT: PersistentHandle = PersistentHandle::new(0x8101_0025);
const EVICT_SLOT: PersistentHandle = PersistentHandle::new(0x8101_0026);
const SWEEP_SLOT: PersistentHandle = PersistentHandle::new(0x8101_0027);
const CERTIFY_APP_SLOT: PersistentHandle = PersistentHandle::new(0x8101_0028);
const CERTIFY_AK_SLOT: PersistentHandle = PersistentHandle::new(0x8101_0029);
const RESTRICTED_AK_SLOT: PersistentHandle = PersistentHandle::new(0x8101_002A);
const SESSION_SLOT: PersistentHandle = PersistentHandle::new(0x8101_002B);
const FAILING_SIGN_SLOT: PersistentHandle = PersistentHandle::new(0x8101_002C);
const UNUSED_SLOT: PersistentHandle = PersistentHandle::new(0x8101_002D);
const SCENARIO_SLOT: PersistentHandle = PersistentHandle::new(0x8101_000B);

fn clear_slot<T: Tpm>(tpm: &mut T, slot: PersistentHandle) {
    keys::evict(tpm, slot).expect("Unable to clear slot");
}

fn scratch_dir(name: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("tpm-appsk-{}-{}", name, std::process::id()));
    std::fs::create_dir_all(&dir).expect("Unable to create scratch dir");
    dir
}

pub(crate) fn test_ensure_is_idempotent<T: Tpm>(mut tpm: T) {
    let _ = tracing_subscriber::fmt::try_init();
    clear_slot(&mut tpm, IDEMPOTENT_SLOT);

    let first = keys::ensure(&mut tpm, IDEMPOTENT_SLOT, false).expect("Unable to create key");
    trace!(?first.public);
    assert!(first.created);
    assert!(first.private.is_some());
    assert!(first.context.is_some());
    assert_eq!(
        keys::state(&mut tpm, IDEMPOTENT_SLOT).expect("Unable to probe"),
        KeyState::Persisted(IDEMPOTENT_SLOT)
    );

    let persistent_before = tpm.persistent_handles().expect("Unable to list persistent");
    let transient_before = tpm.transient_handles().expect("Unable to list transient");

    let second = keys::ensure(&mut tpm, IDEMPOTENT_SLOT, false).expect("Unable to reuse key");
    assert!(!second.created);
    assert!(second.private.is_none());
    assert_eq!(second.public, first.public);
    assert_eq!(second.public_pem, first.public_pem);
    assert_eq!(second.public_blob(), first.public_blob());

    assert_eq!(
        tpm.persistent_handles().expect("Unable to list persistent"),
        persistent_before
    );
    assert_eq!(
        tpm.transient_handles().expect("Unable to list transient"),
        transient_before
    );

    clear_slot(&mut tpm, IDEMPOTENT_SLOT);
}

pub(crate) fn test_force_replaces_key<T: Tpm>(mut tpm: T) {
    let _ = tracing_subscriber::fmt::try_init();
    clear_slot(&mut tpm, FORCE_SLOT);

    let first = keys::ensure(&mut tpm, FORCE_SLOT, false).expect("Unable to create key");
    let persistent_count = tpm
        .persistent_handles()
        .expect("Unable to list persistent")
        .len();

    let forced = keys::ensure(&mut tpm, FORCE_SLOT, true).expect("Unable to recreate key");
    assert!(forced.created);
    assert_ne!(forced.public.unique, first.public.unique);
    assert_ne!(forced.public_pem, first.public_pem);

    // Replaced in place, not added alongside.
    assert_eq!(
        tpm.persistent_handles()
            .expect("Unable to list persistent")
            .len(),
        persistent_count
    );
    assert_eq!(
        keys::read_public(&mut tpm, FORCE_SLOT).expect("Unable to read public"),
        forced.public
    );

    clear_slot(&mut tpm, FORCE_SLOT);
}

pub(crate) fn test_context_round_trip<T: Tpm>(mut tpm: T) {
    let _ = tracing_subscriber::fmt::try_init();
    clear_slot(&mut tpm, CONTEXT_SLOT);

    let provisioned = keys::ensure(&mut tpm, CONTEXT_SLOT, false).expect("Unable to create key");
    let blob = provisioned.context.clone().expect("Missing context blob");

    // Through the byte encoding, as a file would carry it.
    let decoded =
        context::ContextBlob::from_bytes(&blob.to_bytes()).expect("Unable to decode context");
    assert_eq!(decoded, blob);

    let key = context::load(&mut tpm, &decoded).expect("Unable to load context");
    let public = tpm.read_public(key).expect("Unable to read public");
    assert_eq!(public, provisioned.public);
    tpm.flush_context(key).expect("Unable to flush key");

    assert_eq!(
        context::verify(&mut tpm, &blob).expect("Unable to verify context"),
        provisioned.public
    );

    // Any transient object, not only the application key.
    let parent = primary::derive_primary(&mut tpm).expect("Unable to derive primary");
    let parent_blob = context::save(&mut tpm, parent.handle).expect("Unable to save primary");
    tpm.flush_context(parent.handle)
        .expect("Unable to flush primary");

    let reloaded = context::load(&mut tpm, &parent_blob).expect("Unable to load primary");
    assert_eq!(
        tpm.read_public(reloaded).expect("Unable to read public"),
        parent.public
    );
    tpm.flush_context(reloaded).expect("Unable to flush primary");

    assert!(tpm
        .transient_handles()
        .expect("Unable to list transient")
        .is_empty());

    clear_slot(&mut tpm, CONTEXT_SLOT);
}

pub(crate) fn test_foreign_context_rejected<T: Tpm>(mut tpm_a: T, mut tpm_b: T) {
    let _ = tracing_subscriber::fmt::try_init();
    clear_slot(&mut tpm_a, FOREIGN_SLOT);

    let provisioned = keys::ensure(&mut tpm_a, FOREIGN_SLOT, false).expect("Unable to create key");
    let blob = provisioned.context.expect("Missing context blob");

    let err = context::load(&mut tpm_b, &blob).expect_err("Foreign context was loaded");
    trace!(?err);
    assert!(matches!(err.kind(), ErrorKind::Codec | ErrorKind::Device));
    assert!(tpm_b
        .transient_handles()
        .expect("Unable to list transient")
        .is_empty());

    // Signing through the foreign blob fails the same way.
    assert!(sign::sign(&mut tpm_b, &KeySource::Context(blob), b"foreign").is_err());

    clear_slot(&mut tpm_a, FOREIGN_SLOT);
}

pub(crate) fn test_sign_and_verify<T: Tpm>(mut tpm: T) {
    let _ = tracing_subscriber::fmt::try_init();
    clear_slot(&mut tpm, SIGN_SLOT);

    let provisioned = keys::ensure(&mut tpm, SIGN_SLOT, false).expect("Unable to create key");
    assert_eq!(
        export::public_key_pem(&provisioned.public).expect("Unable to export PEM"),
        provisioned.public_pem
    );

    let message = b"attested workload payload";

    let artifact = sign::sign(&mut tpm, &KeySource::Persistent(SIGN_SLOT), message)
        .expect("Unable to sign with persistent key");
    trace!(?artifact);
    assert!(!artifact.fallback_used());
    assert!(artifact
        .verify(&provisioned.public, message)
        .expect("Unable to verify"));
    assert!(!artifact
        .verify(&provisioned.public, b"something else")
        .expect("Unable to verify"));

    // Independently of the artifact helper, against the exported key.
    let verifier = RS256VerifyingKey::new(
        provisioned
            .public
            .rsa_public_key()
            .expect("Unable to build public key"),
    );
    let sig = RS256Signature::try_from(artifact.signature()).expect("Invalid signature bytes");
    assert!(verifier.verify(message, &sig).is_ok());

    let info = artifact.info();
    assert_eq!(info.scheme, "RSASSA");
    assert_eq!(info.hash_alg, "SHA256");
    assert_eq!(info.signature_len, 256);

    let blob = provisioned.context.clone().expect("Missing context blob");
    let from_context = sign::sign(&mut tpm, &KeySource::Context(blob), message)
        .expect("Unable to sign with context");
    assert!(from_context
        .verify(&provisioned.public, message)
        .expect("Unable to verify"));

    // Neither path leaves objects behind.
    assert!(tpm
        .transient_handles()
        .expect("Unable to list transient")
        .is_empty());

    clear_slot(&mut tpm, SIGN_SLOT);
}

pub(crate) fn test_evict<T: Tpm>(mut tpm: T) {
    let _ = tracing_subscriber::fmt::try_init();
    clear_slot(&mut tpm, EVICT_SLOT);

    keys::ensure(&mut tpm, EVICT_SLOT, false).expect("Unable to create key");

    assert_eq!(
        keys::evict(&mut tpm, EVICT_SLOT).expect("Unable to evict"),
        Evicted::Removed
    );
    assert_eq!(
        keys::state(&mut tpm, EVICT_SLOT).expect("Unable to probe"),
        KeyState::Absent
    );
    assert!(keys::probe(&mut tpm, EVICT_SLOT)
        .expect("Unable to probe")
        .is_none());

    // Idempotent.
    assert_eq!(
        keys::evict(&mut tpm, EVICT_SLOT).expect("Second evict failed"),
        Evicted::NotFound
    );

    assert_eq!(
        sign::sign(&mut tpm, &KeySource::Persistent(EVICT_SLOT), b"gone"),
        Err(TpmError::SigningKeyUnresolved)
    );
}

pub(crate) fn test_empty_device_scenario<T: Tpm>(mut tpm: T) {
    let _ = tracing_subscriber::fmt::try_init();
    clear_slot(&mut tpm, SCENARIO_SLOT);

    let dir = scratch_dir("scenario");
    let paths = ArtifactPaths::in_dir(&dir);

    let created = keys::ensure(&mut tpm, SCENARIO_SLOT, false).expect("Unable to create key");
    assert!(created.created);
    created
        .write_artifacts(&paths)
        .expect("Unable to write artifacts");

    for path in [
        &paths.public_blob,
        &paths.private_blob,
        &paths.public_pem,
        &paths.context,
    ] {
        let path = path.as_ref().expect("Missing artifact path");
        assert!(path.exists(), "{} was not written", path.display());
    }

    let pem_path = paths.public_pem.clone().expect("Missing PEM path");
    let first_pem = std::fs::read(&pem_path).expect("Unable to read PEM");
    assert!(first_pem.starts_with(b"-----BEGIN PUBLIC KEY-----"));

    let pub_blob = std::fs::read(paths.public_blob.as_ref().expect("Missing pub path"))
        .expect("Unable to read public blob");
    assert_eq!(
        crate::structures::PublicKeyDescriptor::unmarshal(&pub_blob)
            .expect("Unable to decode public blob"),
        created.public
    );

    let persistent_before = tpm.persistent_handles().expect("Unable to list persistent");

    let reused = keys::ensure(&mut tpm, SCENARIO_SLOT, false).expect("Unable to reuse key");
    assert!(!reused.created);
    reused
        .write_artifacts(&paths)
        .expect("Unable to write artifacts");

    let second_pem = std::fs::read(&pem_path).expect("Unable to read PEM");
    assert_eq!(first_pem, second_pem);
    assert_eq!(
        tpm.persistent_handles().expect("Unable to list persistent"),
        persistent_before
    );

    let _ = std::fs::remove_dir_all(&dir);
    clear_slot(&mut tpm, SCENARIO_SLOT);
}

pub(crate) fn test_transient_sweep<T: Tpm>(mut tpm: T) {
    let _ = tracing_subscriber::fmt::try_init();
    clear_slot(&mut tpm, SWEEP_SLOT);

    // Leak objects the way a crashed process would.
    primary::derive_primary(&mut tpm).expect("Unable to derive primary");
    primary::derive_primary(&mut tpm).expect("Unable to derive primary");

    keys::ensure(&mut tpm, SWEEP_SLOT, false).expect("Unable to create key after leaks");
    assert!(tpm
        .transient_handles()
        .expect("Unable to list transient")
        .is_empty());

    primary::derive_primary(&mut tpm).expect("Unable to derive primary");
    assert_eq!(keys::flush_all_transients(&mut tpm), 1);
    assert_eq!(keys::flush_all_transients(&mut tpm), 0);

    clear_slot(&mut tpm, SWEEP_SLOT);
}

pub(crate) fn test_certify<T: Tpm>(mut tpm: T) {
    let _ = tracing_subscriber::fmt::try_init();
    clear_slot(&mut tpm, CERTIFY_APP_SLOT);
    clear_slot(&mut tpm, CERTIFY_AK_SLOT);

    // No AK yet, certification is skipped but provisioning succeeds.
    let options = EnsureOptions {
        force: false,
        certify_with: Some(CERTIFY_AK_SLOT),
    };
    let provisioned =
        keys::ensure_with(&mut tpm, CERTIFY_APP_SLOT, &options).expect("Unable to create key");
    assert!(provisioned.certification.is_none());

    let ak_public =
        keys::ensure_attestation_key(&mut tpm, CERTIFY_AK_SLOT).expect("Unable to create AK");
    assert!(ak_public.attributes.restricted());
    // Present AK is reused.
    assert_eq!(
        keys::ensure_attestation_key(&mut tpm, CERTIFY_AK_SLOT).expect("Unable to reuse AK"),
        ak_public
    );

    let forced = EnsureOptions {
        force: true,
        certify_with: Some(CERTIFY_AK_SLOT),
    };
    let provisioned =
        keys::ensure_with(&mut tpm, CERTIFY_APP_SLOT, &forced).expect("Unable to recreate key");
    let certification = provisioned
        .certification
        .clone()
        .expect("Key was not certified");

    assert_eq!(&certification.attest[..4], &TPM2_GENERATED_VALUE.to_be_bytes());
    let app_name = provisioned.public.name().expect("Unable to compute name");
    assert!(certification
        .attest
        .windows(app_name.len())
        .any(|window| window == app_name.as_slice()));

    let sig = match &certification.signature {
        Signature::RsaSsa { sig, .. } => sig.clone(),
        other => panic!("unexpected certify signature {other:?}"),
    };
    let verifier =
        RS256VerifyingKey::new(ak_public.rsa_public_key().expect("Unable to build AK key"));
    let sig = RS256Signature::try_from(sig.as_slice()).expect("Invalid signature bytes");
    assert!(verifier.verify(&certification.attest, &sig).is_ok());

    let qualified = keys::certify(&mut tpm, CERTIFY_APP_SLOT, CERTIFY_AK_SLOT, b"nonce-1234")
        .expect("Unable to certify");
    assert!(qualified
        .attest
        .windows(10)
        .any(|window| window == b"nonce-1234"));

    clear_slot(&mut tpm, CERTIFY_APP_SLOT);
    clear_slot(&mut tpm, CERTIFY_AK_SLOT);
}

pub(crate) fn test_restricted_key_uses_ticketed_fallback<T: Tpm>(mut tpm: T) {
    let _ = tracing_subscriber::fmt::try_init();
    clear_slot(&mut tpm, RESTRICTED_AK_SLOT);

    let ak_public =
        keys::ensure_attestation_key(&mut tpm, RESTRICTED_AK_SLOT).expect("Unable to create AK");
    let source = KeySource::Persistent(RESTRICTED_AK_SLOT);

    let message = b"restricted keys only sign what the device hashed";
    let artifact = sign::sign(&mut tpm, &source, message).expect("Unable to sign");
    assert!(artifact.fallback_used());
    assert!(artifact
        .verify(&ak_public, message)
        .expect("Unable to verify"));

    // The device never tickets data that mimics its own attestation structures.
    let mut generated = TPM2_GENERATED_VALUE.to_be_bytes().to_vec();
    generated.extend_from_slice(b"forged attestation");
    assert!(matches!(
        sign::sign(&mut tpm, &source, &generated),
        Err(TpmError::SigningFailed { .. })
    ));

    // Too large for a single device hash, and never truncated.
    let oversized = vec![0x41u8; 2048];
    match sign::sign(&mut tpm, &source, &oversized) {
        Err(TpmError::SigningFailed { fallback, .. }) => assert_eq!(
            *fallback,
            TpmError::MessageTooLarge {
                len: 2048,
                max: 1024
            }
        ),
        other => panic!("unexpected result {other:?}"),
    }

    assert!(tpm
        .transient_handles()
        .expect("Unable to list transient")
        .is_empty());

    clear_slot(&mut tpm, RESTRICTED_AK_SLOT);
}

pub(crate) fn test_failed_signs_release_resources<T: Tpm>(mut tpm: T) {
    let _ = tracing_subscriber::fmt::try_init();
    clear_slot(&mut tpm, FAILING_SIGN_SLOT);
    clear_slot(&mut tpm, UNUSED_SLOT);

    let ak_public =
        keys::ensure_attestation_key(&mut tpm, FAILING_SIGN_SLOT).expect("Unable to create AK");

    let ak = keys::probe(&mut tpm, FAILING_SIGN_SLOT)
        .expect("Unable to probe")
        .expect("AK not persisted");
    let mut sources = vec![KeySource::Persistent(FAILING_SIGN_SLOT)];
    match context::save(&mut tpm, ak) {
        Ok(blob) => sources.push(KeySource::Context(blob)),
        Err(tpm_err) => trace!(?tpm_err, "persistent AK context not saveable"),
    }
    tpm.close_handle(ak).expect("Unable to close AK reference");

    let oversized = vec![0x5au8; 1500];

    // More failures than the device has session or object slots.
    for _ in 0..5 {
        for source in &sources {
            match sign::sign(&mut tpm, source, &oversized) {
                Err(TpmError::SigningFailed { fallback, .. }) => assert_eq!(
                    *fallback,
                    TpmError::MessageTooLarge {
                        len: 1500,
                        max: 1024
                    }
                ),
                other => panic!("unexpected result {other:?}"),
            }
        }

        assert_eq!(
            sign::sign(&mut tpm, &KeySource::Persistent(UNUSED_SLOT), b"no key").err(),
            Some(TpmError::SigningKeyUnresolved)
        );
    }

    assert!(tpm
        .transient_handles()
        .expect("Unable to list transient")
        .is_empty());

    for source in &sources {
        let artifact = sign::sign(&mut tpm, source, b"still signing").expect("Unable to sign");
        assert!(artifact
            .verify(&ak_public, b"still signing")
            .expect("Unable to verify"));
    }

    assert!(tpm
        .transient_handles()
        .expect("Unable to list transient")
        .is_empty());

    clear_slot(&mut tpm, FAILING_SIGN_SLOT);
}

pub(crate) fn test_session_lifecycle<T: Tpm>(tpm: T) {
    let _ = tracing_subscriber::fmt::try_init();

    let mut session = Session::new(tpm, TransportDescriptor::Tcti("test".to_string()));
    assert!(session.is_live());
    clear_slot(&mut session, SESSION_SLOT);

    let provisioned =
        keys::ensure(&mut session, SESSION_SLOT, false).expect("Unable to create key");
    let artifact = sign::sign(&mut session, &KeySource::Persistent(SESSION_SLOT), b"via session")
        .expect("Unable to sign");
    assert!(artifact
        .verify(&provisioned.public, b"via session")
        .expect("Unable to verify"));

    clear_slot(&mut session, SESSION_SLOT);
    session.close();
}
