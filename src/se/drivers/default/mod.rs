//! Software secure element
//!
//! Keys live in process memory and are zeroized on drop. AES and CMAC come
//! from the RustCrypto `aes` and `cmac` crates; nonces from the OS entropy
//! source unless a different `RngCore` is supplied.

pub mod cipher;
pub mod frame;
pub mod join;
pub mod random;

use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, info};

use self::join::PendingJoin;
use self::random::RandomSource;
use crate::lorawan::{DeviceIdentity, JoinAccept, JOIN_REQUEST_LEN};
use crate::se::{
    Error, FrameContext, JoinFormat, Key, KeyRole, KeySelector, KeyStore, Result, SecureElement,
};

/// Default secure element driver
#[derive(Debug)]
pub struct DefaultDriver<R: RngCore = OsRng> {
    store: KeyStore,
    random: RandomSource<R>,
    identity: Option<DeviceIdentity>,
    pending_join: Option<PendingJoin>,
}

impl DefaultDriver {
    pub fn new() -> Self {
        Self::with_rng(OsRng)
    }
}

impl Default for DefaultDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: RngCore> DefaultDriver<R> {
    /// Build a driver drawing nonces from `rng`
    pub fn with_rng(rng: R) -> Self {
        Self {
            store: KeyStore::new(),
            random: RandomSource::new(rng),
            identity: None,
            pending_join: None,
        }
    }

    pub fn identity(&self) -> Option<&DeviceIdentity> {
        self.identity.as_ref()
    }

    /// DevNonce of the join-request awaiting its accept, if any
    pub fn pending_dev_nonce(&self) -> Option<u16> {
        self.pending_join.map(|pending| pending.dev_nonce)
    }
}

impl<R: RngCore> SecureElement for DefaultDriver<R> {
    fn initialize(&mut self) {
        self.store.clear();
        self.identity = None;
        self.pending_join = None;
        debug!("secure element initialized");
    }

    fn random_u8(&mut self) -> u8 {
        self.random.random_u8()
    }

    fn random_u16(&mut self) -> u16 {
        self.random.random_u16()
    }

    fn fill_random(&mut self, buf: &mut [u8]) -> Result<()> {
        self.random.fill(buf)
    }

    fn set_identity(&mut self, identity: DeviceIdentity) {
        debug!(
            dev_eui = format_args!("{:016X}", identity.dev_eui),
            join_eui = format_args!("{:016X}", identity.join_eui),
            "identity set"
        );
        self.identity = Some(identity);
    }

    fn set_key(&mut self, role: KeyRole, selector: KeySelector, key: &Key) -> Result<()> {
        self.store.set(role, selector, key)
    }

    fn get_key(&self, role: KeyRole, selector: KeySelector) -> Result<Key> {
        self.store.get(role, selector)
    }

    fn set_session_format(&mut self, selector: KeySelector, format: JoinFormat) -> Result<()> {
        self.store.set_session_format(selector, format)
    }

    fn create_join_request(&mut self, out: &mut [u8], format: JoinFormat) -> Result<usize> {
        let identity = self.identity.ok_or(Error::IdentityNotSet)?;
        if out.len() < JOIN_REQUEST_LEN {
            return Err(Error::BufferTooSmall {
                needed: JOIN_REQUEST_LEN,
                available: out.len(),
            });
        }
        // No nonce is spent on a request that cannot be signed
        self.store.key(join::root_role(format), KeySelector::Unicast)?;

        let mut nonce = [0u8; 2];
        self.random.fill(&mut nonce)?;
        let dev_nonce = u16::from_le_bytes(nonce);

        let len = join::build_join_request(&self.store, &identity, dev_nonce, format, out)?;
        self.pending_join = Some(PendingJoin { dev_nonce, format });
        info!(dev_nonce, %format, "join-request created");
        Ok(len)
    }

    fn decode_join_accept(
        &mut self,
        frame: &[u8],
        clear_text: &mut [u8],
        format: JoinFormat,
    ) -> Result<JoinAccept> {
        let identity = self.identity.ok_or(Error::IdentityNotSet)?;
        join::decode_join_accept(
            &mut self.store,
            &identity,
            self.pending_join.as_ref(),
            frame,
            clear_text,
            format,
        )
    }

    fn encode_message(
        &self,
        message: &[u8],
        payload_offset: usize,
        out: &mut [u8],
        selector: KeySelector,
    ) -> Result<usize> {
        frame::encode(&self.store, message, payload_offset, out, selector, None)
    }

    fn encode_message_with(
        &self,
        message: &[u8],
        payload_offset: usize,
        out: &mut [u8],
        selector: KeySelector,
        ctx: &FrameContext,
    ) -> Result<usize> {
        frame::encode(&self.store, message, payload_offset, out, selector, Some(ctx))
    }

    fn verify_mic(
        &self,
        phy_payload: &[u8],
        dev_addr: u32,
        fcnt_down: u32,
        selector: KeySelector,
    ) -> Result<bool> {
        frame::verify(
            &self.store,
            phy_payload,
            dev_addr,
            selector,
            &FrameContext::new(fcnt_down),
        )
    }

    fn verify_mic_with(
        &self,
        phy_payload: &[u8],
        dev_addr: u32,
        selector: KeySelector,
        ctx: &FrameContext,
    ) -> Result<bool> {
        frame::verify(&self.store, phy_payload, dev_addr, selector, ctx)
    }

    fn decode_message(
        &self,
        phy_payload: &[u8],
        dev_addr: u32,
        fcnt_down: u32,
        selector: KeySelector,
        clear_text: &mut [u8],
    ) -> Result<usize> {
        frame::decode(&self.store, phy_payload, dev_addr, fcnt_down, selector, clear_text)
    }

    fn aes128_encrypt(&self, key: &Key, input: &[u8; 16]) -> [u8; 16] {
        cipher::aes128_encrypt(key, input)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::random::testing::{DeadRng, SequenceRng};
    use super::*;
    use rand::RngCore;
    use crate::lorawan::encoder::FrameBuilder;
    use crate::lorawan::MIC_LEN;

    const IDENTITY: DeviceIdentity = DeviceIdentity {
        dev_eui: 0x1112131415161718,
        join_eui: 0x0102030405060708,
    };

    fn root_key() -> Key {
        Key::new(core::array::from_fn(|i| i as u8))
    }

    /// Driver whose next DevNonce is 0x1234
    fn joined_driver(format: JoinFormat) -> DefaultDriver<SequenceRng> {
        let mut driver = DefaultDriver::with_rng(SequenceRng::new(&[0x34, 0x12]));
        driver.set_identity(IDENTITY);
        match format {
            JoinFormat::V1_0 => driver
                .set_key(KeyRole::AppKey, KeySelector::Unicast, &root_key())
                .unwrap(),
            JoinFormat::V1_1 => {
                driver
                    .set_key(KeyRole::NwkKey, KeySelector::Unicast, &root_key())
                    .unwrap();
                driver
                    .set_key(
                        KeyRole::AppKey,
                        KeySelector::Unicast,
                        &Key::new(core::array::from_fn(|i| 0x10 + i as u8)),
                    )
                    .unwrap();
            }
        }

        let mut request = [0u8; JOIN_REQUEST_LEN];
        let n = driver.create_join_request(&mut request, format).unwrap();
        assert_eq!(
            hex::encode(&request[..n]),
            "000807060504030201181716151413121134123ddb4c05"
        );
        driver
    }

    #[test]
    fn test_join_v1_0_end_to_end() {
        let mut driver = joined_driver(JoinFormat::V1_0);
        assert_eq!(driver.pending_dev_nonce(), Some(0x1234));

        let accept = hex::decode("202028547b3ae86add8d9745347d015e25").unwrap();
        let mut clear = [0u8; 33];
        let fields = driver
            .decode_join_accept(&accept, &mut clear, JoinFormat::V1_0)
            .unwrap();
        assert_eq!(fields.dev_addr, 0x26011BDA);
        assert_eq!(
            hex::encode(&clear[..accept.len()]),
            "200c0b0a130000da1b01260001e672aa70"
        );

        // Uplink with the derived session
        let message = FrameBuilder::new_uplink(fields.dev_addr, 1, 1, b"hello".to_vec())
            .build()
            .unwrap();
        let mut out = [0u8; 64];
        let n = driver
            .encode_message(&message.bytes, message.payload_offset, &mut out, KeySelector::Unicast)
            .unwrap();
        assert_eq!(
            hex::encode(&out[..n]),
            "40da1b012600010001594fc2c13fec3397d5"
        );

        // Downlink verify then decrypt
        let downlink = hex::decode("60da1b0126000500022d8714c650d342").unwrap();
        assert!(driver
            .verify_mic(&downlink, fields.dev_addr, 5, KeySelector::Unicast)
            .unwrap());
        let mut plain = [0u8; 32];
        let m = driver
            .decode_message(&downlink, fields.dev_addr, 5, KeySelector::Unicast, &mut plain)
            .unwrap();
        assert_eq!(&plain[9..m], &[0x01, 0x02, 0x03]);
    }

    #[test]
    fn test_join_v1_1_end_to_end() {
        let mut driver = joined_driver(JoinFormat::V1_1);
        let accept = hex::decode("202666b957f53772d281327a907c9b017d").unwrap();
        let mut clear = [0u8; 17];
        let fields = driver
            .decode_join_accept(&accept, &mut clear, JoinFormat::V1_1)
            .unwrap();
        assert_eq!(fields.format, JoinFormat::V1_1);
        assert_eq!(
            hex::encode(
                driver
                    .get_key(KeyRole::AppSKey, KeySelector::Unicast)
                    .unwrap()
                    .as_bytes()
            ),
            "8ace949ee755311e1e2e2b56dbef21b3"
        );

        let message = FrameBuilder::new_uplink(0x26011BDA, 1, 1, b"hello".to_vec())
            .build()
            .unwrap();
        let mut out = [0u8; 64];
        let n = driver
            .encode_message(&message.bytes, message.payload_offset, &mut out, KeySelector::Unicast)
            .unwrap();
        assert_eq!(
            hex::encode(&out[..n]),
            "40da1b01260001000181afb93180ab266aa7"
        );

        let downlink = hex::decode("60da1b012600050002c06d3da9028047").unwrap();
        assert!(driver
            .verify_mic_with(&downlink, 0x26011BDA, KeySelector::Unicast, &FrameContext::new(5))
            .unwrap());
    }

    fn session_snapshot<R: RngCore>(driver: &DefaultDriver<R>) -> Vec<Key> {
        [
            KeyRole::FNwkSIntKey,
            KeyRole::SNwkSIntKey,
            KeyRole::NwkSEncKey,
            KeyRole::AppSKey,
        ]
        .into_iter()
        .map(|role| driver.get_key(role, KeySelector::Unicast).unwrap())
        .collect()
    }

    #[test]
    fn test_decoding_same_accept_twice_is_idempotent() {
        for (format, accept_hex, app_s_key) in [
            (
                JoinFormat::V1_0,
                "202028547b3ae86add8d9745347d015e25",
                "42b291af55e7a99ca2c4de49457d9b7d",
            ),
            (
                JoinFormat::V1_1,
                "202666b957f53772d281327a907c9b017d",
                "8ace949ee755311e1e2e2b56dbef21b3",
            ),
        ] {
            let mut driver = joined_driver(format);
            let accept = hex::decode(accept_hex).unwrap();
            let mut first = [0u8; 17];
            let mut second = [0u8; 17];

            let a = driver
                .decode_join_accept(&accept, &mut first, format)
                .unwrap();
            let keys_after_first = session_snapshot(&driver);
            assert_eq!(hex::encode(keys_after_first[3].as_bytes()), app_s_key);

            // Clobber the session so the second decode has to derive again
            driver
                .set_key(KeyRole::AppSKey, KeySelector::Unicast, &Key::new([0xEE; 16]))
                .unwrap();
            driver
                .set_key(KeyRole::FNwkSIntKey, KeySelector::Unicast, &Key::new([0xDD; 16]))
                .unwrap();

            let b = driver
                .decode_join_accept(&accept, &mut second, format)
                .unwrap();
            assert_eq!(a, b);
            assert_eq!(first, second);
            assert_eq!(session_snapshot(&driver), keys_after_first, "{}", format);
        }
    }

    #[test]
    fn test_join_request_preconditions() {
        let mut driver = DefaultDriver::with_rng(SequenceRng::new(&[1, 2]));
        let mut out = [0u8; 32];
        assert_eq!(
            driver.create_join_request(&mut out, JoinFormat::V1_0),
            Err(Error::IdentityNotSet)
        );

        driver.set_identity(IDENTITY);
        assert_eq!(
            driver.create_join_request(&mut out, JoinFormat::V1_0),
            Err(Error::KeyNotSet("AppKey"))
        );
        assert_eq!(
            driver.create_join_request(&mut out[..10], JoinFormat::V1_0),
            Err(Error::BufferTooSmall {
                needed: JOIN_REQUEST_LEN,
                available: 10
            })
        );
        assert_eq!(driver.pending_dev_nonce(), None);
    }

    #[test]
    fn test_dead_entropy_source_fails_join_request() {
        let mut driver = DefaultDriver::with_rng(DeadRng);
        driver.set_identity(IDENTITY);
        driver
            .set_key(KeyRole::AppKey, KeySelector::Unicast, &root_key())
            .unwrap();
        let mut out = [0u8; 32];
        let err = driver
            .create_join_request(&mut out, JoinFormat::V1_0)
            .unwrap_err();
        assert_eq!(err, Error::SourceExhausted);
        assert!(err.is_transient());
        assert_eq!(driver.pending_dev_nonce(), None);

        // Small values keep flowing from the fallback
        let _ = driver.random_u8();
        let _ = driver.random_u16();
    }

    #[test]
    fn test_each_join_request_draws_fresh_nonce() {
        let mut driver = DefaultDriver::with_rng(SequenceRng::new(&[0x01, 0x00, 0x02, 0x00]));
        driver.set_identity(IDENTITY);
        driver
            .set_key(KeyRole::AppKey, KeySelector::Unicast, &root_key())
            .unwrap();
        let mut out = [0u8; 32];
        driver.create_join_request(&mut out, JoinFormat::V1_0).unwrap();
        assert_eq!(driver.pending_dev_nonce(), Some(1));
        driver.create_join_request(&mut out, JoinFormat::V1_0).unwrap();
        assert_eq!(driver.pending_dev_nonce(), Some(2));
        assert_eq!(&out[17..19], &[0x02, 0x00]);
    }

    #[test]
    fn test_initialize_clears_state() {
        let mut driver = joined_driver(JoinFormat::V1_0);
        driver.initialize();
        assert!(driver.identity().is_none());
        assert_eq!(driver.pending_dev_nonce(), None);
        assert_eq!(
            driver.get_key(KeyRole::AppKey, KeySelector::Unicast),
            Err(Error::KeyNotSet("AppKey"))
        );
        let accept = hex::decode("202028547b3ae86add8d9745347d015e25").unwrap();
        let mut clear = [0u8; 17];
        assert_eq!(
            driver.decode_join_accept(&accept, &mut clear, JoinFormat::V1_0),
            Err(Error::IdentityNotSet)
        );
    }

    #[test]
    fn test_aes128_encrypt_matches_fips197() {
        let driver = DefaultDriver::new();
        let input: [u8; 16] = hex::decode("00112233445566778899aabbccddeeff")
            .unwrap()
            .try_into()
            .unwrap();
        assert_eq!(
            hex::encode(driver.aes128_encrypt(&root_key(), &input)),
            "69c4e0d86a7b0430d8cdb78070b4c55a"
        );
    }

    #[test]
    fn test_abp_session_format_switch() {
        let mut driver = DefaultDriver::new();
        for (role, fill) in [
            (KeyRole::FNwkSIntKey, 0x11),
            (KeyRole::SNwkSIntKey, 0x13),
            (KeyRole::AppSKey, 0x22),
        ] {
            driver
                .set_key(role, KeySelector::Unicast, &Key::new([fill; 16]))
                .unwrap();
        }

        let message = FrameBuilder::new_uplink(0x01020304, 7, 3, vec![0xAA]).build().unwrap();
        let mut v1_0 = [0u8; 32];
        let n = driver
            .encode_message(&message.bytes, message.payload_offset, &mut v1_0, KeySelector::Unicast)
            .unwrap();

        driver
            .set_session_format(KeySelector::Unicast, JoinFormat::V1_1)
            .unwrap();
        let mut v1_1 = [0u8; 32];
        driver
            .encode_message(&message.bytes, message.payload_offset, &mut v1_1, KeySelector::Unicast)
            .unwrap();

        // Same ciphertext; the 1.1 MIC keeps the FNwkSIntKey half of the
        // 1.0 MIC in its last two bytes
        assert_eq!(&v1_0[..n - MIC_LEN], &v1_1[..n - MIC_LEN]);
        assert_eq!(hex::encode(&v1_0[n - MIC_LEN..n]), "95936b3c");
        assert_eq!(hex::encode(&v1_1[n - MIC_LEN..n]), "12a69593");
    }

    fn abp_driver() -> DefaultDriver<SequenceRng> {
        let mut driver = DefaultDriver::with_rng(SequenceRng::new(&[0]));
        for (role, fill) in [
            (KeyRole::FNwkSIntKey, 0x31),
            (KeyRole::SNwkSIntKey, 0x32),
            (KeyRole::NwkSEncKey, 0x33),
            (KeyRole::AppSKey, 0x34),
        ] {
            driver
                .set_key(role, KeySelector::Unicast, &Key::new([fill; 16]))
                .unwrap();
        }
        driver
    }

    proptest! {
        #[test]
        fn prop_encode_then_decode_restores_message(
            downlink in any::<bool>(),
            dev_addr in any::<u32>(),
            fcnt in any::<u32>(),
            f_port in 0u8..=223,
            f_opts in proptest::collection::vec(any::<u8>(), 0..=15),
            payload in proptest::collection::vec(any::<u8>(), 0..=200),
        ) {
            let driver = abp_driver();
            let mut builder = if downlink {
                FrameBuilder::new_downlink(dev_addr, fcnt, f_port, payload)
            } else {
                FrameBuilder::new_uplink(dev_addr, fcnt, f_port, payload)
            };
            builder.f_opts = f_opts;
            let message = builder.build().unwrap();

            let ctx = FrameContext::new(fcnt);
            let mut phy = [0u8; 255];
            let n = driver
                .encode_message_with(&message.bytes, message.payload_offset, &mut phy, KeySelector::Unicast, &ctx)
                .unwrap();
            prop_assert_eq!(n, message.bytes.len() + MIC_LEN);
            prop_assert!(driver.verify_mic_with(&phy[..n], dev_addr, KeySelector::Unicast, &ctx).unwrap());

            let mut clear = [0u8; 255];
            let m = driver
                .decode_message(&phy[..n], dev_addr, fcnt, KeySelector::Unicast, &mut clear)
                .unwrap();
            prop_assert_eq!(&clear[..m], message.bytes.as_slice());
        }

        #[test]
        fn prop_single_bit_flip_fails_mic(bit in 0usize..(14 + MIC_LEN) * 8) {
            let driver = abp_driver();
            let message = FrameBuilder::new_uplink(0x26011BDA, 9, 1, b"hello".to_vec())
                .build()
                .unwrap();
            let mut phy = [0u8; 32];
            let n = driver
                .encode_message(&message.bytes, message.payload_offset, &mut phy, KeySelector::Unicast)
                .unwrap();
            phy[bit / 8] ^= 1 << (bit % 8);
            prop_assert!(!driver.verify_mic(&phy[..n], 0x26011BDA, 9, KeySelector::Unicast).unwrap());
        }
    }
}
