//! Volatile session cache
//!
//! Holds the derived seed, the cached passphrase and the "PIN accepted"
//! flag for the lifetime of the engine. Nothing here is ever persisted and
//! every clear path zeroizes the secrets before releasing them.

use zeroize::{Zeroize, Zeroizing};

/// BIP-39 seed length
pub const SEED_LEN: usize = 64;

/// Longest passphrase kept in the cache, in bytes
pub const MAX_PASSPHRASE_LEN: usize = 50;

/// Seed plus whether it was derived with the cached passphrase
struct CachedSeed {
    bytes: Zeroizing<[u8; SEED_LEN]>,
    uses_passphrase: bool,
}

/// Session-scoped secrets
#[derive(Default)]
pub struct SessionCache {
    seed: Option<CachedSeed>,
    passphrase: Option<Zeroizing<String>>,
    pin_cached: bool,
}

impl SessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the cached seed if it was derived the requested way
    pub fn seed(&self, use_passphrase: bool) -> Option<Zeroizing<[u8; SEED_LEN]>> {
        self.seed
            .as_ref()
            .filter(|seed| seed.uses_passphrase == use_passphrase)
            .map(|seed| Zeroizing::new(*seed.bytes))
    }

    pub fn store_seed(&mut self, seed: &[u8; SEED_LEN], uses_passphrase: bool) {
        self.seed = Some(CachedSeed {
            bytes: Zeroizing::new(*seed),
            uses_passphrase,
        });
    }

    pub fn has_seed(&self) -> bool {
        self.seed.is_some()
    }

    pub fn invalidate_seed(&mut self) {
        // Zeroizing wipes the bytes on drop
        self.seed = None;
    }

    pub fn passphrase(&self) -> Option<&str> {
        self.passphrase.as_deref().map(String::as_str)
    }

    pub fn is_passphrase_cached(&self) -> bool {
        self.passphrase.is_some()
    }

    /// Cache a passphrase, truncated to [`MAX_PASSPHRASE_LEN`] bytes
    pub fn cache_passphrase(&mut self, passphrase: &str) {
        let mut len = passphrase.len().min(MAX_PASSPHRASE_LEN);
        while !passphrase.is_char_boundary(len) {
            len -= 1;
        }
        self.passphrase = Some(Zeroizing::new(passphrase[..len].to_owned()));
    }

    pub fn clear_passphrase(&mut self) {
        self.passphrase = None;
    }

    pub fn is_pin_cached(&self) -> bool {
        self.pin_cached
    }

    pub fn set_pin_cached(&mut self, cached: bool) {
        self.pin_cached = cached;
    }

    /// Drop seed and passphrase, and optionally the PIN flag
    pub fn clear(&mut self, clear_pin: bool) {
        self.invalidate_seed();
        self.clear_passphrase();
        if clear_pin {
            self.pin_cached = false;
        }
    }
}

impl Zeroize for SessionCache {
    fn zeroize(&mut self) {
        self.clear(true);
    }
}

impl Drop for SessionCache {
    fn drop(&mut self) {
        self.zeroize();
    }
}
