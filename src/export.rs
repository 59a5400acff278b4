use crate::error::TpmError;
use crate::structures::PublicKeyDescriptor;
use crypto_glue::{
    s256::{self, Sha256Output},
    traits::*,
};
use serde::{Deserialize, Serialize};
use tracing::error;

/// SubjectPublicKeyInfo PEM of an RSA public area.
pub fn public_key_pem(public: &PublicKeyDescriptor) -> Result<String, TpmError> {
    public
        .rsa_public_key()?
        .to_public_key_pem(Default::default())
        .map_err(|err| {
            error!(?err, "Unable to encode public key as PEM");
            TpmError::RsaPublicToPem
        })
}

pub fn public_key_der(public: &PublicKeyDescriptor) -> Result<Vec<u8>, TpmError> {
    public
        .rsa_public_key()?
        .to_public_key_der()
        .map(|asn1_der| asn1_der.to_vec())
        .map_err(|_| TpmError::RsaPublicToDer)
}

/// SHA-256 over the DER encoded public key.
pub fn fingerprint(public: &PublicKeyDescriptor) -> Result<Sha256Output, TpmError> {
    public_key_der(public).map(|pub_key_der| {
        let mut hasher = s256::Sha256::new();
        hasher.update(pub_key_der);
        hasher.finalize()
    })
}

/// Side-car metadata describing a signature file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureInfo {
    pub scheme: String,
    #[serde(rename = "hashAlg")]
    pub hash_alg: String,
    pub signature_len: usize,
    /// Hex digest that was signed.
    pub digest: String,
}

impl SignatureInfo {
    pub fn to_json(&self) -> Result<String, TpmError> {
        serde_json::to_string_pretty(self).map_err(|err| {
            error!(?err, "Unable to encode signature info");
            TpmError::SignatureInfoEncode
        })
    }
}
