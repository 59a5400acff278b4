//! Big-endian TPM wire encoding for the handful of structures this crate
//! persists or inspects itself.

use crate::error::TpmError;

#[derive(Debug, Default)]
pub(crate) struct MarshalBuffer {
    data: Vec<u8>,
}

impl MarshalBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_u8(&mut self, v: u8) {
        self.data.push(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.data.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.data.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.data.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// A TPM2B: u16 size followed by that many bytes. Callers bound the length.
    pub fn put_tpm2b(&mut self, bytes: &[u8]) {
        self.put_u16(bytes.len() as u16);
        self.put_bytes(bytes);
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }
}

/// Cursor over a marshalled structure. `structure` names the outer type in errors.
#[derive(Debug)]
pub(crate) struct UnmarshalBuffer<'a> {
    data: &'a [u8],
    pos: usize,
    structure: &'static str,
}

impl<'a> UnmarshalBuffer<'a> {
    pub fn new(data: &'a [u8], structure: &'static str) -> Self {
        Self {
            data,
            pos: 0,
            structure,
        }
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], TpmError> {
        if len > self.remaining() {
            return Err(TpmError::UnmarshalTruncated(self.structure));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn get_u8(&mut self) -> Result<u8, TpmError> {
        self.take(1).map(|b| b[0])
    }

    pub fn get_u16(&mut self) -> Result<u16, TpmError> {
        let mut buf = [0u8; 2];
        buf.copy_from_slice(self.take(2)?);
        Ok(u16::from_be_bytes(buf))
    }

    pub fn get_u32(&mut self) -> Result<u32, TpmError> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.take(4)?);
        Ok(u32::from_be_bytes(buf))
    }

    pub fn get_u64(&mut self) -> Result<u64, TpmError> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(buf))
    }

    pub fn get_bytes(&mut self, len: usize) -> Result<Vec<u8>, TpmError> {
        self.take(len).map(|b| b.to_vec())
    }

    pub fn get_tpm2b(&mut self) -> Result<Vec<u8>, TpmError> {
        let size = self.get_u16()? as usize;
        self.get_bytes(size)
    }

    pub fn invalid(&self) -> TpmError {
        TpmError::UnmarshalInvalid(self.structure)
    }

    /// Fails if any input remains unconsumed.
    pub fn finish(self) -> Result<(), TpmError> {
        match self.remaining() {
            0 => Ok(()),
            remaining => Err(TpmError::UnmarshalTrailingData {
                structure: self.structure,
                remaining,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{MarshalBuffer, UnmarshalBuffer};
    use crate::error::TpmError;

    #[test]
    fn tpm2b_and_integers() {
        let mut buf = MarshalBuffer::new();
        buf.put_u16(0x8024);
        buf.put_u32(0x4000_0001);
        buf.put_tpm2b(&[0xaa, 0xbb]);
        buf.put_u64(7);
        let bytes = buf.into_vec();
        assert_eq!(
            &bytes[..10],
            &[0x80, 0x24, 0x40, 0x00, 0x00, 0x01, 0x00, 0x02, 0xaa, 0xbb]
        );

        let mut rd = UnmarshalBuffer::new(&bytes, "TEST");
        assert_eq!(rd.get_u16().unwrap(), 0x8024);
        assert_eq!(rd.get_u32().unwrap(), 0x4000_0001);
        assert_eq!(rd.get_tpm2b().unwrap(), vec![0xaa, 0xbb]);
        assert_eq!(rd.get_u64().unwrap(), 7);
        assert!(rd.finish().is_ok());
    }

    #[test]
    fn truncation_and_trailing_data() {
        let mut rd = UnmarshalBuffer::new(&[0x00, 0x05, 0x01], "TEST");
        assert_eq!(rd.get_tpm2b(), Err(TpmError::UnmarshalTruncated("TEST")));

        let mut rd = UnmarshalBuffer::new(&[0x00, 0x01, 0x02], "TEST");
        assert_eq!(rd.get_u16().unwrap(), 1);
        assert_eq!(
            rd.finish(),
            Err(TpmError::UnmarshalTrailingData {
                structure: "TEST",
                remaining: 1
            })
        );
    }
}
