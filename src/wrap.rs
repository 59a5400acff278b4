use crate::error::TpmError;
use crypto_glue::aes256gcm::{Aes256GcmNonce, Aes256GcmTag};

macro_rules! wrap_aes256gcm {
    (
        $wrapping_key: expr,
        $data_to_wrap: expr,
        $associated_data: expr
    ) => {{
        let nonce = aes256gcm::new_nonce();
        let cipher = Aes256Gcm::new($wrapping_key);

        let mut enc_data = $data_to_wrap.clone();

        let tag = cipher
            .encrypt_in_place_detached(&nonce, $associated_data, enc_data.as_mut_slice())
            .map_err(|_| TpmError::Aes256GcmEncrypt)?;

        if enc_data.as_slice() == $data_to_wrap.as_slice() {
            // Encryption didn't replace the buffer in place, fail.
            return Err(TpmError::Aes256GcmEncrypt);
        }

        Ok::<_, TpmError>(SealedBlob::new(nonce, tag, enc_data.to_vec()))
    }};
}

pub(crate) use wrap_aes256gcm;

macro_rules! unwrap_aes256gcm {
    (
        $wrapping_key: expr,
        $sealed: expr,
        $associated_data: expr
    ) => {{
        let cipher = Aes256Gcm::new($wrapping_key);
        let sealed: &SealedBlob = $sealed;

        let mut data = Zeroizing::new(sealed.ciphertext().to_vec());

        cipher
            .decrypt_in_place_detached(
                sealed.nonce(),
                $associated_data,
                data.as_mut_slice(),
                sealed.tag(),
            )
            .map(|()| data)
            .map_err(|_| TpmError::Aes256GcmDecrypt)
    }};
}

pub(crate) use unwrap_aes256gcm;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// An AES-256-GCM sealed payload laid out as `nonce || tag || ciphertext`.
#[derive(Debug, Clone)]
pub(crate) struct SealedBlob {
    nonce: Aes256GcmNonce,
    tag: Aes256GcmTag,
    ciphertext: Vec<u8>,
}

impl SealedBlob {
    pub fn new(nonce: Aes256GcmNonce, tag: Aes256GcmTag, ciphertext: Vec<u8>) -> Self {
        SealedBlob {
            nonce,
            tag,
            ciphertext,
        }
    }

    pub fn nonce(&self) -> &Aes256GcmNonce {
        &self.nonce
    }

    pub fn tag(&self) -> &Aes256GcmTag {
        &self.tag
    }

    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(NONCE_LEN + TAG_LEN + self.ciphertext.len());
        out.extend_from_slice(self.nonce.as_slice());
        out.extend_from_slice(self.tag.as_slice());
        out.extend_from_slice(&self.ciphertext);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TpmError> {
        if bytes.len() <= NONCE_LEN + TAG_LEN {
            return Err(TpmError::Aes256GcmDecrypt);
        }
        let (nonce, rest) = bytes.split_at(NONCE_LEN);
        let (tag, ciphertext) = rest.split_at(TAG_LEN);
        Ok(SealedBlob {
            nonce: *Aes256GcmNonce::from_slice(nonce),
            tag: *Aes256GcmTag::from_slice(tag),
            ciphertext: ciphertext.to_vec(),
        })
    }
}
