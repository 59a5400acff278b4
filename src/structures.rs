use crate::error::TpmError;
use crate::marshal::{MarshalBuffer, UnmarshalBuffer};
use crypto_glue::{
    rsa::{BigUint, RS256PublicKey},
    s256::{Sha256, Sha256Output},
    traits::Digest,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub(crate) const TPM2_ALG_RSA: u16 = 0x0001;
pub(crate) const TPM2_ALG_SHA1: u16 = 0x0004;
pub(crate) const TPM2_ALG_AES: u16 = 0x0006;
pub(crate) const TPM2_ALG_SHA256: u16 = 0x000B;
pub(crate) const TPM2_ALG_SHA384: u16 = 0x000C;
pub(crate) const TPM2_ALG_SHA512: u16 = 0x000D;
pub(crate) const TPM2_ALG_NULL: u16 = 0x0010;
pub(crate) const TPM2_ALG_RSASSA: u16 = 0x0014;
pub(crate) const TPM2_ALG_RSAPSS: u16 = 0x0016;
pub(crate) const TPM2_ALG_CFB: u16 = 0x0043;

pub(crate) const TPM2_ST_ATTEST_CERTIFY: u16 = 0x8017;
pub(crate) const TPM2_ST_HASHCHECK: u16 = 0x8024;

/// Prefix the device reserves for data it generates itself. Messages starting
/// with it never receive a hash ticket.
pub const TPM2_GENERATED_VALUE: u32 = 0xff54_4347;

pub(crate) const TPM2_RH_OWNER: u32 = 0x4000_0001;
pub(crate) const TPM2_RH_NULL: u32 = 0x4000_0007;

pub const TPM2_PERSISTENT_FIRST: u32 = 0x8100_0000;
pub const TPM2_PERSISTENT_LAST: u32 = 0x81FF_FFFF;
/// Last persistent handle the owner may provision. The rest belongs to platform.
pub const TPM2_PERSISTENT_OWNER_LAST: u32 = 0x817F_FFFF;
pub const TPM2_TRANSIENT_FIRST: u32 = 0x8000_0000;

/// Largest message the device hashes in one TPM2_Hash command.
pub const MAX_DIGEST_BUFFER: usize = 1024;

/// Reference to a loaded or persistent object, only meaningful to the
/// provider that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectHandle(u32);

impl ObjectHandle {
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

/// Reference to an authorisation session started on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionHandle(u32);

impl SessionHandle {
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u32 {
        self.0
    }
}

/// A 32-bit slot number in the device's persistent object range.
///
/// Values are not range checked here. See [`crate::config::parse_slot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PersistentHandle(u32);

impl PersistentHandle {
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u32 {
        self.0
    }

    pub const fn in_persistent_range(self) -> bool {
        self.0 >= TPM2_PERSISTENT_FIRST && self.0 <= TPM2_PERSISTENT_LAST
    }

    /// Parse a slot written in hex, with or without a `0x` prefix.
    pub fn parse_hex(input: &str) -> Result<Self, TpmError> {
        let trimmed = input.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);
        u32::from_str_radix(digits, 16)
            .map(Self)
            .map_err(|_| TpmError::PersistentHandleInvalid(input.to_string()))
    }
}

impl FromStr for PersistentHandle {
    type Err = TpmError;

    /// `0x` prefixed values are hex, anything else is decimal.
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let trimmed = input.trim();
        if trimmed.starts_with("0x") || trimmed.starts_with("0X") {
            Self::parse_hex(trimmed)
        } else {
            trimmed
                .parse::<u32>()
                .map(Self)
                .map_err(|_| TpmError::PersistentHandleInvalid(input.to_string()))
        }
    }
}

impl fmt::Display for PersistentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Hierarchy {
    Owner,
    Null,
}

impl Hierarchy {
    pub const fn handle(self) -> u32 {
        match self {
            Hierarchy::Owner => TPM2_RH_OWNER,
            Hierarchy::Null => TPM2_RH_NULL,
        }
    }

    pub fn from_handle(handle: u32) -> Option<Self> {
        match handle {
            TPM2_RH_OWNER => Some(Hierarchy::Owner),
            TPM2_RH_NULL => Some(Hierarchy::Null),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HashAlgorithm {
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    pub const fn alg_id(self) -> u16 {
        match self {
            HashAlgorithm::Sha1 => TPM2_ALG_SHA1,
            HashAlgorithm::Sha256 => TPM2_ALG_SHA256,
            HashAlgorithm::Sha384 => TPM2_ALG_SHA384,
            HashAlgorithm::Sha512 => TPM2_ALG_SHA512,
        }
    }

    pub fn from_alg_id(alg: u16) -> Result<Self, TpmError> {
        match alg {
            TPM2_ALG_SHA1 => Ok(HashAlgorithm::Sha1),
            TPM2_ALG_SHA256 => Ok(HashAlgorithm::Sha256),
            TPM2_ALG_SHA384 => Ok(HashAlgorithm::Sha384),
            TPM2_ALG_SHA512 => Ok(HashAlgorithm::Sha512),
            other => Err(TpmError::UnsupportedAlgorithm(other)),
        }
    }

    pub const fn digest_size(self) -> usize {
        match self {
            HashAlgorithm::Sha1 => 20,
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha384 => 48,
            HashAlgorithm::Sha512 => 64,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            HashAlgorithm::Sha1 => "SHA1",
            HashAlgorithm::Sha256 => "SHA256",
            HashAlgorithm::Sha384 => "SHA384",
            HashAlgorithm::Sha512 => "SHA512",
        }
    }
}

/// TPMA_OBJECT
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectAttributes(u32);

impl ObjectAttributes {
    pub const FIXED_TPM: u32 = 0x0000_0002;
    pub const FIXED_PARENT: u32 = 0x0000_0010;
    pub const SENSITIVE_DATA_ORIGIN: u32 = 0x0000_0020;
    pub const USER_WITH_AUTH: u32 = 0x0000_0040;
    pub const RESTRICTED: u32 = 0x0001_0000;
    pub const DECRYPT: u32 = 0x0002_0000;
    pub const SIGN_ENCRYPT: u32 = 0x0004_0000;

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn contains(self, bits: u32) -> bool {
        self.0 & bits == bits
    }

    pub const fn restricted(self) -> bool {
        self.contains(Self::RESTRICTED)
    }

    pub const fn decrypt(self) -> bool {
        self.contains(Self::DECRYPT)
    }

    pub const fn sign_encrypt(self) -> bool {
        self.contains(Self::SIGN_ENCRYPT)
    }

    /// A restricted decryption key, the only kind that may parent other objects.
    pub const fn is_storage_parent(self) -> bool {
        self.restricted() && self.decrypt() && !self.sign_encrypt()
    }
}

#[derive(Debug, Default)]
pub struct ObjectAttributesBuilder {
    raw: u32,
}

impl ObjectAttributesBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn set(mut self, bit: u32, set: bool) -> Self {
        if set {
            self.raw |= bit;
        } else {
            self.raw &= !bit;
        }
        self
    }

    pub fn with_fixed_tpm(self, set: bool) -> Self {
        self.set(ObjectAttributes::FIXED_TPM, set)
    }

    pub fn with_fixed_parent(self, set: bool) -> Self {
        self.set(ObjectAttributes::FIXED_PARENT, set)
    }

    pub fn with_sensitive_data_origin(self, set: bool) -> Self {
        self.set(ObjectAttributes::SENSITIVE_DATA_ORIGIN, set)
    }

    pub fn with_user_with_auth(self, set: bool) -> Self {
        self.set(ObjectAttributes::USER_WITH_AUTH, set)
    }

    pub fn with_restricted(self, set: bool) -> Self {
        self.set(ObjectAttributes::RESTRICTED, set)
    }

    pub fn with_decrypt(self, set: bool) -> Self {
        self.set(ObjectAttributes::DECRYPT, set)
    }

    pub fn with_sign_encrypt(self, set: bool) -> Self {
        self.set(ObjectAttributes::SIGN_ENCRYPT, set)
    }

    /// Rejects combinations the device would refuse at creation time.
    pub fn build(self) -> Result<ObjectAttributes, TpmError> {
        let attrs = ObjectAttributes(self.raw);

        if attrs.contains(ObjectAttributes::FIXED_TPM)
            && !attrs.contains(ObjectAttributes::FIXED_PARENT)
        {
            return Err(TpmError::ObjectAttributesInvalid);
        }

        if attrs.restricted() && attrs.decrypt() && attrs.sign_encrypt() {
            return Err(TpmError::ObjectAttributesInvalid);
        }

        if attrs.restricted() && !attrs.decrypt() && !attrs.sign_encrypt() {
            return Err(TpmError::ObjectAttributesInvalid);
        }

        Ok(attrs)
    }
}

/// TPMT_SYM_DEF_OBJECT, limited to what an RSA storage parent uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SymmetricDefinitionObject {
    Null,
    Aes128Cfb,
    Aes256Cfb,
}

impl SymmetricDefinitionObject {
    fn marshal(self, buf: &mut MarshalBuffer) {
        match self {
            SymmetricDefinitionObject::Null => buf.put_u16(TPM2_ALG_NULL),
            SymmetricDefinitionObject::Aes128Cfb => {
                buf.put_u16(TPM2_ALG_AES);
                buf.put_u16(128);
                buf.put_u16(TPM2_ALG_CFB);
            }
            SymmetricDefinitionObject::Aes256Cfb => {
                buf.put_u16(TPM2_ALG_AES);
                buf.put_u16(256);
                buf.put_u16(TPM2_ALG_CFB);
            }
        }
    }

    fn unmarshal(rd: &mut UnmarshalBuffer) -> Result<Self, TpmError> {
        match rd.get_u16()? {
            TPM2_ALG_NULL => Ok(SymmetricDefinitionObject::Null),
            TPM2_ALG_AES => {
                let bits = rd.get_u16()?;
                let mode = rd.get_u16()?;
                match (bits, mode) {
                    (128, TPM2_ALG_CFB) => Ok(SymmetricDefinitionObject::Aes128Cfb),
                    (256, TPM2_ALG_CFB) => Ok(SymmetricDefinitionObject::Aes256Cfb),
                    (_, mode) => Err(TpmError::UnsupportedAlgorithm(mode)),
                }
            }
            other => Err(TpmError::UnsupportedAlgorithm(other)),
        }
    }
}

/// TPMT_RSA_SCHEME for the signing schemes this crate understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RsaScheme {
    Null,
    RsaSsa(HashAlgorithm),
    RsaPss(HashAlgorithm),
}

impl RsaScheme {
    fn marshal(self, buf: &mut MarshalBuffer) {
        match self {
            RsaScheme::Null => buf.put_u16(TPM2_ALG_NULL),
            RsaScheme::RsaSsa(hash) => {
                buf.put_u16(TPM2_ALG_RSASSA);
                buf.put_u16(hash.alg_id());
            }
            RsaScheme::RsaPss(hash) => {
                buf.put_u16(TPM2_ALG_RSAPSS);
                buf.put_u16(hash.alg_id());
            }
        }
    }

    fn unmarshal(rd: &mut UnmarshalBuffer) -> Result<Self, TpmError> {
        match rd.get_u16()? {
            TPM2_ALG_NULL => Ok(RsaScheme::Null),
            TPM2_ALG_RSASSA => HashAlgorithm::from_alg_id(rd.get_u16()?).map(RsaScheme::RsaSsa),
            TPM2_ALG_RSAPSS => HashAlgorithm::from_alg_id(rd.get_u16()?).map(RsaScheme::RsaPss),
            other => Err(TpmError::UnsupportedAlgorithm(other)),
        }
    }
}

/// Public area of an RSA object (TPMT_PUBLIC). With an empty `unique` this is
/// a creation template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeyDescriptor {
    pub name_alg: HashAlgorithm,
    pub attributes: ObjectAttributes,
    pub auth_policy: Vec<u8>,
    pub symmetric: SymmetricDefinitionObject,
    pub scheme: RsaScheme,
    pub key_bits: u16,
    /// Zero means the default exponent, 65537.
    pub exponent: u32,
    /// The RSA modulus, big endian.
    pub unique: Vec<u8>,
}

impl PublicKeyDescriptor {
    pub(crate) fn marshal_into(&self, buf: &mut MarshalBuffer) {
        buf.put_u16(TPM2_ALG_RSA);
        buf.put_u16(self.name_alg.alg_id());
        buf.put_u32(self.attributes.raw());
        buf.put_tpm2b(&self.auth_policy);
        self.symmetric.marshal(buf);
        self.scheme.marshal(buf);
        buf.put_u16(self.key_bits);
        buf.put_u32(self.exponent);
        buf.put_tpm2b(&self.unique);
    }

    pub(crate) fn unmarshal_from(rd: &mut UnmarshalBuffer) -> Result<Self, TpmError> {
        if rd.get_u16()? != TPM2_ALG_RSA {
            return Err(TpmError::IncorrectKeyType);
        }
        let name_alg = HashAlgorithm::from_alg_id(rd.get_u16()?)?;
        let attributes = ObjectAttributes::from_raw(rd.get_u32()?);
        let auth_policy = rd.get_tpm2b()?;
        let symmetric = SymmetricDefinitionObject::unmarshal(rd)?;
        let scheme = RsaScheme::unmarshal(rd)?;
        let key_bits = rd.get_u16()?;
        let exponent = rd.get_u32()?;
        let unique = rd.get_tpm2b()?;

        Ok(PublicKeyDescriptor {
            name_alg,
            attributes,
            auth_policy,
            symmetric,
            scheme,
            key_bits,
            exponent,
            unique,
        })
    }

    /// TPMT_PUBLIC encoding.
    pub fn marshal_public_area(&self) -> Vec<u8> {
        let mut buf = MarshalBuffer::new();
        self.marshal_into(&mut buf);
        buf.into_vec()
    }

    pub fn unmarshal_public_area(bytes: &[u8]) -> Result<Self, TpmError> {
        let mut rd = UnmarshalBuffer::new(bytes, "TPMT_PUBLIC");
        let public = Self::unmarshal_from(&mut rd)?;
        rd.finish()?;
        Ok(public)
    }

    /// TPM2B_PUBLIC encoding, the form written to a `.pub` artifact.
    pub fn marshal(&self) -> Vec<u8> {
        let mut buf = MarshalBuffer::new();
        buf.put_tpm2b(&self.marshal_public_area());
        buf.into_vec()
    }

    pub fn unmarshal(bytes: &[u8]) -> Result<Self, TpmError> {
        let mut rd = UnmarshalBuffer::new(bytes, "TPM2B_PUBLIC");
        let area = rd.get_tpm2b()?;
        rd.finish()?;
        Self::unmarshal_public_area(&area)
    }

    /// Object name: the name algorithm id followed by the digest of the public area.
    pub fn name(&self) -> Result<Vec<u8>, TpmError> {
        if self.name_alg != HashAlgorithm::Sha256 {
            return Err(TpmError::UnsupportedAlgorithm(self.name_alg.alg_id()));
        }
        let mut hasher = Sha256::new();
        hasher.update(self.marshal_public_area());
        let digest: Sha256Output = hasher.finalize();

        let mut name = Vec::with_capacity(2 + digest.len());
        name.extend_from_slice(&TPM2_ALG_SHA256.to_be_bytes());
        name.extend_from_slice(digest.as_slice());
        Ok(name)
    }

    pub fn effective_exponent(&self) -> u32 {
        if self.exponent == 0 {
            65537
        } else {
            self.exponent
        }
    }

    pub fn rsa_public_key(&self) -> Result<RS256PublicKey, TpmError> {
        if self.unique.is_empty() {
            return Err(TpmError::RsaPublicFromComponents);
        }
        let n = BigUint::from_bytes_be(&self.unique);
        RS256PublicKey::new(n, self.effective_exponent().into())
            .map_err(|_| TpmError::RsaPublicFromComponents)
    }
}

/// TPM2B_PRIVATE contents. Opaque outside the device that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivateBlob(Vec<u8>);

impl PrivateBlob {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// TPM2B_PRIVATE encoding, the form written to a `.priv` artifact.
    pub fn marshal(&self) -> Vec<u8> {
        let mut buf = MarshalBuffer::new();
        buf.put_tpm2b(&self.0);
        buf.into_vec()
    }
}

/// TPMT_TK_HASHCHECK: proof that the device itself hashed a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashcheckTicket {
    pub hierarchy: u32,
    pub digest: Vec<u8>,
}

impl HashcheckTicket {
    /// The ticket presented when the digest was computed off device.
    pub fn null() -> Self {
        HashcheckTicket {
            hierarchy: TPM2_RH_NULL,
            digest: Vec::new(),
        }
    }

    pub fn is_null(&self) -> bool {
        self.hierarchy == TPM2_RH_NULL && self.digest.is_empty()
    }

    pub fn marshal(&self) -> Vec<u8> {
        let mut buf = MarshalBuffer::new();
        buf.put_u16(TPM2_ST_HASHCHECK);
        buf.put_u32(self.hierarchy);
        buf.put_tpm2b(&self.digest);
        buf.into_vec()
    }
}

/// TPMT_SIG_SCHEME for RSA keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignatureScheme {
    Null,
    RsaSsa(HashAlgorithm),
    RsaPss(HashAlgorithm),
}

impl SignatureScheme {
    pub fn hash_algorithm(self) -> Option<HashAlgorithm> {
        match self {
            SignatureScheme::Null => None,
            SignatureScheme::RsaSsa(hash) | SignatureScheme::RsaPss(hash) => Some(hash),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SignatureScheme::Null => "NULL",
            SignatureScheme::RsaSsa(_) => "RSASSA",
            SignatureScheme::RsaPss(_) => "RSAPSS",
        }
    }

    pub fn alg_id(self) -> u16 {
        match self {
            SignatureScheme::Null => TPM2_ALG_NULL,
            SignatureScheme::RsaSsa(_) => TPM2_ALG_RSASSA,
            SignatureScheme::RsaPss(_) => TPM2_ALG_RSAPSS,
        }
    }
}

impl From<RsaScheme> for SignatureScheme {
    fn from(scheme: RsaScheme) -> Self {
        match scheme {
            RsaScheme::Null => SignatureScheme::Null,
            RsaScheme::RsaSsa(hash) => SignatureScheme::RsaSsa(hash),
            RsaScheme::RsaPss(hash) => SignatureScheme::RsaPss(hash),
        }
    }
}

/// TPMT_SIGNATURE as returned by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signature {
    RsaSsa { hash: HashAlgorithm, sig: Vec<u8> },
    RsaPss { hash: HashAlgorithm, sig: Vec<u8> },
    /// Any other signature algorithm, identified by its TPM2_ALG id.
    Other(u16),
}

impl Signature {
    pub fn marshal(&self) -> Vec<u8> {
        let mut buf = MarshalBuffer::new();
        match self {
            Signature::RsaSsa { hash, sig } => {
                buf.put_u16(TPM2_ALG_RSASSA);
                buf.put_u16(hash.alg_id());
                buf.put_tpm2b(sig);
            }
            Signature::RsaPss { hash, sig } => {
                buf.put_u16(TPM2_ALG_RSAPSS);
                buf.put_u16(hash.alg_id());
                buf.put_tpm2b(sig);
            }
            Signature::Other(alg) => buf.put_u16(*alg),
        }
        buf.into_vec()
    }

    pub fn unmarshal(bytes: &[u8]) -> Result<Self, TpmError> {
        let mut rd = UnmarshalBuffer::new(bytes, "TPMT_SIGNATURE");
        let sig = match rd.get_u16()? {
            TPM2_ALG_RSASSA => {
                let hash = HashAlgorithm::from_alg_id(rd.get_u16()?)?;
                Signature::RsaSsa {
                    hash,
                    sig: rd.get_tpm2b()?,
                }
            }
            TPM2_ALG_RSAPSS => {
                let hash = HashAlgorithm::from_alg_id(rd.get_u16()?)?;
                Signature::RsaPss {
                    hash,
                    sig: rd.get_tpm2b()?,
                }
            }
            other => return Ok(Signature::Other(other)),
        };
        rd.finish()?;
        Ok(sig)
    }
}

#[derive(Debug, Clone)]
pub struct CreatePrimaryResult {
    pub handle: ObjectHandle,
    pub public: PublicKeyDescriptor,
}

#[derive(Debug, Clone)]
pub struct CreateKeyResult {
    pub private: PrivateBlob,
    pub public: PublicKeyDescriptor,
}

/// TPM2_Certify output: the marshalled TPMS_ATTEST and the signature over it.
#[derive(Debug, Clone)]
pub struct CertifyResult {
    pub attest: Vec<u8>,
    pub signature: Signature,
}
