use crate::error::TpmError;
use crate::provider::{execute_with_temporary_object, Tpm};
use crate::structures::{
    CreatePrimaryResult, HashAlgorithm, Hierarchy, ObjectAttributesBuilder, ObjectHandle,
    PublicKeyDescriptor, RsaScheme, SymmetricDefinitionObject,
};
use tracing::{debug, error};

const RSA_KEY_BITS: u16 = 2048;

/// Owner hierarchy storage primary. The template is fixed so that every call
/// regenerates the same parent from the hierarchy seed.
pub fn primary_template() -> Result<PublicKeyDescriptor, TpmError> {
    let attributes = ObjectAttributesBuilder::new()
        .with_fixed_tpm(true)
        .with_fixed_parent(true)
        .with_sensitive_data_origin(true)
        .with_user_with_auth(true)
        .with_restricted(true)
        .with_decrypt(true)
        .build()?;

    Ok(PublicKeyDescriptor {
        name_alg: HashAlgorithm::Sha256,
        attributes,
        auth_policy: Vec::new(),
        symmetric: SymmetricDefinitionObject::Aes128Cfb,
        scheme: RsaScheme::Null,
        key_bits: RSA_KEY_BITS,
        exponent: 0,
        unique: Vec::new(),
    })
}

/// Unrestricted RSASSA-SHA256 signing key, bound to this device and parent.
pub fn application_key_template() -> Result<PublicKeyDescriptor, TpmError> {
    let attributes = ObjectAttributesBuilder::new()
        .with_fixed_tpm(true)
        .with_fixed_parent(true)
        .with_sensitive_data_origin(true)
        .with_user_with_auth(true)
        .with_sign_encrypt(true)
        .build()?;

    Ok(PublicKeyDescriptor {
        name_alg: HashAlgorithm::Sha256,
        attributes,
        auth_policy: Vec::new(),
        symmetric: SymmetricDefinitionObject::Null,
        scheme: RsaScheme::RsaSsa(HashAlgorithm::Sha256),
        key_bits: RSA_KEY_BITS,
        exponent: 0,
        unique: Vec::new(),
    })
}

/// Restricted signing key used to certify application keys. Restricted keys
/// only sign digests the device itself produced.
pub fn attestation_key_template() -> Result<PublicKeyDescriptor, TpmError> {
    let attributes = ObjectAttributesBuilder::new()
        .with_fixed_tpm(true)
        .with_fixed_parent(true)
        .with_sensitive_data_origin(true)
        .with_user_with_auth(true)
        .with_restricted(true)
        .with_sign_encrypt(true)
        .build()?;

    Ok(PublicKeyDescriptor {
        name_alg: HashAlgorithm::Sha256,
        attributes,
        auth_policy: Vec::new(),
        symmetric: SymmetricDefinitionObject::Null,
        scheme: RsaScheme::RsaSsa(HashAlgorithm::Sha256),
        key_bits: RSA_KEY_BITS,
        exponent: 0,
        unique: Vec::new(),
    })
}

/// Derive the owner storage primary. The caller must flush the handle.
pub fn derive_primary<T: Tpm + ?Sized>(tpm: &mut T) -> Result<CreatePrimaryResult, TpmError> {
    let template = primary_template()?;
    let primary = tpm
        .create_primary(Hierarchy::Owner, &template)
        .map_err(|tpm_err| {
            error!(?tpm_err, "Unable to derive owner primary");
            tpm_err
        })?;
    debug!(handle = %primary.handle, "owner primary derived");
    Ok(primary)
}

/// Derive the owner primary, run `f` with it, and flush it again.
pub(crate) fn execute_with_primary<T, F, R>(tpm: &mut T, f: F) -> Result<R, TpmError>
where
    T: Tpm + ?Sized,
    F: FnOnce(&mut T, ObjectHandle) -> Result<R, TpmError>,
{
    let primary = derive_primary(tpm)?;
    execute_with_temporary_object(tpm, primary.handle, f)
}

#[cfg(test)]
mod tests {
    use super::{application_key_template, attestation_key_template, primary_template};
    use crypto_glue::hex;

    #[test]
    fn primary_template_encoding() {
        let template = primary_template().expect("Unable to build primary template");
        assert_eq!(
            hex::encode(template.marshal_public_area()),
            "0001000b00030072000000060080004300100800000000000000"
        );
    }

    #[test]
    fn application_key_template_encoding() {
        let template = application_key_template().expect("Unable to build key template");
        assert_eq!(template.attributes.raw(), 0x0004_0072);
        assert!(!template.attributes.restricted());
        assert_eq!(
            hex::encode(template.marshal_public_area()),
            "0001000b00040072000000100014000b0800000000000000"
        );
    }

    #[test]
    fn attestation_key_is_restricted_signer() {
        let template = attestation_key_template().expect("Unable to build AK template");
        assert!(template.attributes.restricted());
        assert!(template.attributes.sign_encrypt());
        assert!(!template.attributes.decrypt());
    }
}
