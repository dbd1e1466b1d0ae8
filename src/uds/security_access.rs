//! Provides the seed/key handshake unlocking security protected ECU
//! functions (memory writes, routines, re-flashing).
//!
//! The seed-to-key computation is OEM specific, so it is injected as a
//! [SeedKeyAlgorithm] strategy selected per module. The default
//! [XorSeedKey] is a placeholder good enough for bench simulators, and is
//! what the in-crate simulated vehicle validates against.

use std::time::Duration;

use log::warn;

use crate::{DiagError, DiagServerResult};

use super::{UdsClient, UdsCommand};

/// Security operation sub-functions
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum SecurityOperation {
    /// Asks the ECU for a security seed
    RequestSeed,
    /// Sends the computed key to the ECU
    SendKey,
}

impl From<SecurityOperation> for u8 {
    fn from(from: SecurityOperation) -> Self {
        match from {
            SecurityOperation::RequestSeed => 0x01,
            SecurityOperation::SendKey => 0x02,
        }
    }
}

/// Computes an unlock key from an ECU-provided seed
pub trait SeedKeyAlgorithm: Send + Sync + std::fmt::Debug {
    /// Derives the key bytes for `seed`
    fn compute_key(&self, seed: &[u8]) -> Vec<u8>;
}

/// Placeholder algorithm XORing the seed with a fixed 32-bit mask,
/// repeated over the seed length
#[derive(Debug, Copy, Clone)]
pub struct XorSeedKey(pub u32);

impl Default for XorSeedKey {
    fn default() -> Self {
        Self(0xA5A5_A5A5)
    }
}

impl SeedKeyAlgorithm for XorSeedKey {
    fn compute_key(&self, seed: &[u8]) -> Vec<u8> {
        let mask = self.0.to_be_bytes();
        seed.iter()
            .enumerate()
            .map(|(i, b)| b ^ mask[i % 4])
            .collect()
    }
}

/// Requests a security seed from the ECU.
///
/// An all-zero seed means the ECU is already unlocked; no key needs to be
/// sent in that case.
pub fn request_seed(client: &mut UdsClient) -> DiagServerResult<Vec<u8>> {
    let mut resp = client.execute_command_with_response(
        UdsCommand::SecurityAccess,
        &[SecurityOperation::RequestSeed.into()],
    )?;
    if resp.len() < 2 {
        return Err(DiagError::InvalidResponseLength);
    }
    resp.drain(0..2); // SID + sub-function, leaving the seed
    Ok(resp)
}

/// Sends a computed key to the ECU
pub fn send_key(client: &mut UdsClient, key: &[u8]) -> DiagServerResult<()> {
    let mut payload = Vec::with_capacity(key.len() + 1);
    payload.push(SecurityOperation::SendKey.into());
    payload.extend_from_slice(key);
    client
        .execute_command_with_response(UdsCommand::SecurityAccess, &payload)
        .map(|_| ())
}

/// Performs the complete unlock: request seed, compute the key with
/// `algorithm`, send it.
///
/// A rejected key is retried after the ECU's mandatory delay, up to
/// `max_attempts` attempts in total.
pub fn unlock(
    client: &mut UdsClient,
    algorithm: &dyn SeedKeyAlgorithm,
    max_attempts: u32,
) -> DiagServerResult<()> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let seed = request_seed(client)?;
        if seed.iter().all(|b| *b == 0) {
            return Ok(()); // Already unlocked
        }
        let key = algorithm.compute_key(&seed);
        match send_key(client, &key) {
            Ok(()) => return Ok(()),
            Err(DiagError::InvalidKey) if attempt < max_attempts => {
                warn!("security key rejected (attempt {attempt}), backing off");
                std::thread::sleep(Duration::from_millis(500));
            }
            Err(DiagError::UdsNegative(super::UdsError::RequiredTimeDelayNotExpired))
                if attempt < max_attempts =>
            {
                std::thread::sleep(Duration::from_secs(1));
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xor_key_derivation() {
        let algo = XorSeedKey::default();
        let seed = [0x12, 0x34, 0x56, 0x78];
        let key = algo.compute_key(&seed);
        assert_eq!(key, vec![0x12 ^ 0xA5, 0x34 ^ 0xA5, 0x56 ^ 0xA5, 0x78 ^ 0xA5]);
        // XOR twice returns the seed
        assert_eq!(algo.compute_key(&key), seed.to_vec());
    }

    #[test]
    fn xor_key_handles_odd_lengths() {
        let algo = XorSeedKey(0x0102_0304);
        assert_eq!(algo.compute_key(&[0xFF]), vec![0xFF ^ 0x01]);
        assert_eq!(
            algo.compute_key(&[0, 0, 0, 0, 0]),
            vec![0x01, 0x02, 0x03, 0x04, 0x01]
        );
    }
}
