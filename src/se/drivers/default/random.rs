//! Random source for DevNonces and other protocol nonces

use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tracing::warn;

use crate::se::{Error, Result};

/// Thin wrapper over an `RngCore`; `OsRng` in deployed builds.
///
/// `random_u8` and `random_u16` cannot fail, so when the entropy source
/// errors they draw from a clock-seeded `StdRng` instead of panicking the
/// way `OsRng::fill_bytes` would. Those values only feed channel and timing
/// jitter. Nonces that need real entropy (the DevNonce) go through
/// [`RandomSource::fill`], which reports the failure.
#[derive(Debug)]
pub struct RandomSource<R> {
    rng: R,
    fallback: Option<StdRng>,
}

impl<R: RngCore> RandomSource<R> {
    pub fn new(rng: R) -> Self {
        Self { rng, fallback: None }
    }

    pub fn random_u8(&mut self) -> u8 {
        let mut byte = [0u8; 1];
        self.fill_or_fallback(&mut byte);
        byte[0]
    }

    pub fn random_u16(&mut self) -> u16 {
        let mut bytes = [0u8; 2];
        self.fill_or_fallback(&mut bytes);
        u16::from_le_bytes(bytes)
    }

    fn fill_or_fallback(&mut self, buf: &mut [u8]) {
        if let Err(e) = self.rng.try_fill_bytes(buf) {
            let fallback = self.fallback.get_or_insert_with(|| {
                warn!(error = %e, "entropy source unavailable, using clock-seeded fallback");
                let nanos = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_nanos() as u64)
                    .unwrap_or_default();
                StdRng::seed_from_u64(nanos)
            });
            fallback.fill_bytes(buf);
        }
    }

    /// Fill `buf`, reporting an unavailable entropy source as `SourceExhausted`.
    pub fn fill(&mut self, buf: &mut [u8]) -> Result<()> {
        self.rng.try_fill_bytes(buf).map_err(|e| {
            warn!(error = %e, "entropy source unavailable");
            Error::SourceExhausted
        })
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{DeadRng, SequenceRng};
    use super::*;

    #[test]
    fn test_values_follow_the_underlying_stream() {
        let mut random = RandomSource::new(SequenceRng::new(&[0xAB, 0x34, 0x12, 0x01, 0x02]));
        assert_eq!(random.random_u8(), 0xAB);
        assert_eq!(random.random_u16(), 0x1234);

        let mut buf = [0u8; 4];
        random.fill(&mut buf).unwrap();
        assert_eq!(buf, [0x01, 0x02, 0xAB, 0x34]);
    }

    #[test]
    fn test_dead_source_reports_exhaustion() {
        let mut random = RandomSource::new(DeadRng);
        let mut buf = [0u8; 8];
        assert_eq!(random.fill(&mut buf), Err(Error::SourceExhausted));
    }

    #[test]
    fn test_dead_source_falls_back_for_small_values() {
        let mut random = RandomSource::new(DeadRng);
        let _ = random.random_u8();
        let _ = random.random_u16();
        assert!(random.fallback.is_some());

        // The fallback never masks a failed DevNonce draw
        let mut nonce = [0u8; 2];
        assert_eq!(random.fill(&mut nonce), Err(Error::SourceExhausted));
    }

    #[test]
    fn test_working_source_never_touches_fallback() {
        let mut random = RandomSource::new(SequenceRng::new(&[0x01, 0x02, 0x03]));
        assert_eq!(random.random_u8(), 0x01);
        assert_eq!(random.random_u16(), 0x0302);
        assert!(random.fallback.is_none());
    }

    #[test]
    fn test_os_rng_fills_buffer() {
        let mut random = RandomSource::new(rand::rngs::OsRng);
        let mut buf = [0u8; 32];
        random.fill(&mut buf).unwrap();
        // 32 zero bytes from a working OS source is not a realistic outcome
        assert_ne!(buf, [0u8; 32]);
    }
}
