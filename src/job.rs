//! Canonical internal job descriptor, decoded from a pool job object.

use crate::error::{MinerError, Result};
use crate::target::Target;

/// Fixed byte offset of the 4-byte little-endian nonce within the hashing
/// blob for this protocol family (major/minor version varints + timestamp
/// varint + 32-byte previous-block id always sum to 39 bytes).
pub const NONCE_OFFSET: usize = 39;
const NONCE_LEN: usize = 4;
const MIN_BLOB_LEN: usize = 76;

#[derive(Debug, Clone)]
pub struct Job {
    pub job_id: String,
    pub height: u64,
    pub seed_hash: [u8; 32],
    pub blob: Vec<u8>,
    pub target: Target,
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.job_id == other.job_id
    }
}
impl Eq for Job {}

impl Job {
    pub fn new(
        job_id: String,
        height: u64,
        seed_hash_hex: &str,
        blob_hex: &str,
        target_hex: &str,
    ) -> Result<Self> {
        let blob = hex::decode(blob_hex)
            .map_err(|e| MinerError::ProtocolMalformed(format!("bad job blob hex: {e}")))?;
        if blob.len() < MIN_BLOB_LEN {
            return Err(MinerError::ProtocolMalformed(format!(
                "job blob too short: {} bytes, need at least {MIN_BLOB_LEN}",
                blob.len()
            )));
        }
        if NONCE_OFFSET + NONCE_LEN > blob.len() {
            return Err(MinerError::ProtocolMalformed(
                "nonce offset out of range for blob".into(),
            ));
        }
        let seed_bytes = hex::decode(seed_hash_hex)
            .map_err(|e| MinerError::ProtocolMalformed(format!("bad seed hash hex: {e}")))?;
        if seed_bytes.len() != 32 {
            return Err(MinerError::ProtocolMalformed(format!(
                "seed hash must be 32 bytes, got {}",
                seed_bytes.len()
            )));
        }
        let mut seed_hash = [0u8; 32];
        seed_hash.copy_from_slice(&seed_bytes);

        let target = Target::from_hex(target_hex)?;

        Ok(Self {
            job_id,
            height,
            seed_hash,
            blob,
            target,
        })
    }

    /// Copy the blob with `nonce` written little-endian at [`NONCE_OFFSET`].
    pub fn blob_with_nonce(&self, nonce: u32) -> Vec<u8> {
        let mut blob = self.blob.clone();
        write_nonce(&mut blob, NONCE_OFFSET, nonce);
        blob
    }
}

pub fn write_nonce(blob: &mut [u8], offset: usize, nonce: u32) {
    blob[offset..offset + 4].copy_from_slice(&nonce.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_blob_hex() -> String {
        hex::encode([0u8; MIN_BLOB_LEN])
    }

    #[test]
    fn decodes_minimal_valid_job() {
        let job = Job::new(
            "42".to_string(),
            100,
            &hex::encode([0xABu8; 32]),
            &sample_blob_hex(),
            "f3220000",
        )
        .unwrap();
        assert_eq!(job.job_id, "42");
        assert_eq!(job.blob.len(), MIN_BLOB_LEN);
    }

    #[test]
    fn rejects_short_blob() {
        let short = hex::encode([0u8; 40]);
        let err = Job::new(
            "1".to_string(),
            1,
            &hex::encode([0u8; 32]),
            &short,
            "f3220000",
        );
        assert!(err.is_err());
    }

    #[test]
    fn nonce_injection_matches_scenario() {
        let job = Job::new(
            "1".to_string(),
            1,
            &hex::encode([0u8; 32]),
            &sample_blob_hex(),
            "f3220000",
        )
        .unwrap();
        let blob = job.blob_with_nonce(0xdead_beef);
        assert_eq!(&blob[39..43], &[0xef, 0xbe, 0xad, 0xde]);
    }

    #[test]
    fn equality_is_by_job_id_only() {
        let a = Job::new(
            "7".to_string(),
            1,
            &hex::encode([0u8; 32]),
            &sample_blob_hex(),
            "f3220000",
        )
        .unwrap();
        let mut b = a.clone();
        b.height = 999;
        assert_eq!(a, b);
    }
}
