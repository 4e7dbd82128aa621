//! Secret gates
//!
//! A [`SecretGate`] decides how the PIN and the mnemonic are kept in the
//! record and how a candidate PIN is checked:
//!
//! - [`PlaintextPinGate`]: the PIN digits and the mnemonic are stored as is,
//!   PIN attempts are throttled by the flash failure journal.
//! - [`SecureElementGate`]: an external secure element holds the PIN and an
//!   AES key. The record only stores a PIN marker and the mnemonic sealed
//!   with AES-256-CBC under the element's key; the element counts attempts.

use std::fmt;

use rand::rngs::OsRng;
use rand::RngCore;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};
use zeroize::{Zeroize, Zeroizing};

use crate::crypto::{aes256_cbc_decrypt, aes256_cbc_encrypt, essiv};
use crate::error::GateError;
use crate::record::{MNEMONIC_LEN, PIN_LEN};

/// Zone password used while no PIN is set
pub const DEFAULT_ZONE_PASSWORD: u32 = 0x00ff_ffff;

/// Record PIN field marking "PIN held by the secure element"
pub const SECURE_ELEMENT_PIN_MARKER: &[u8] = b"*";

/// Length of the MCU serial mixed into the mnemonic IV
pub const DEVICE_SERIAL_LEN: usize = 12;

/// Compare two byte strings zero padded to `width`, in constant time
///
/// Inputs longer than `width` never match.
pub(crate) fn ct_eq_padded(a: &[u8], b: &[u8], width: usize) -> bool {
    if a.len() > width || b.len() > width {
        return false;
    }
    let mut left = Zeroizing::new(vec![0u8; width]);
    let mut right = Zeroizing::new(vec![0u8; width]);
    left[..a.len()].copy_from_slice(a);
    right[..b.len()].copy_from_slice(b);
    left[..].ct_eq(&right[..]).into()
}

fn until_nul(bytes: &[u8]) -> &[u8] {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    &bytes[..end]
}

/// How PIN and mnemonic are protected at rest
pub trait SecretGate {
    /// Bring up the gate's hardware; returns whether it is usable
    fn init(&mut self) -> bool {
        true
    }

    /// Record PIN field for `pin`; an empty field means "no PIN"
    fn seal_pin(&mut self, pin: &str) -> Result<Vec<u8>, GateError>;

    /// Check `candidate` against the stored PIN field
    fn check_pin(&mut self, stored: Option<&[u8]>, candidate: &str) -> bool;

    /// Record mnemonic field for `phrase`
    fn seal_mnemonic(&mut self, phrase: &str, pin_set: bool) -> Result<Vec<u8>, GateError>;

    /// Recover the phrase from a record mnemonic field
    fn open_mnemonic(&mut self, field: &[u8], pin_set: bool) -> Result<Zeroizing<String>, GateError>;

    /// Make the gate accept writes for an import protected by `pin`
    fn prepare_import(&mut self, _pin: &str) -> Result<(), GateError> {
        Ok(())
    }

    /// Forget any unlocked state
    fn deactivate(&mut self) {}

    /// Destroy the gate's secrets
    fn wipe(&mut self) -> Result<(), GateError> {
        Ok(())
    }

    /// Whether PIN attempts are throttled by the flash failure journal
    fn uses_pin_journal(&self) -> bool {
        true
    }

    /// Attempts left before the gate locks, when the gate counts them
    fn remaining_pin_attempts(&mut self) -> Option<u32> {
        None
    }

    /// Fresh zones left, when the gate has any
    fn remaining_zones(&mut self) -> Option<u32> {
        None
    }
}

/// PIN digits and mnemonic stored in the clear
#[derive(Debug, Default, Clone, Copy)]
pub struct PlaintextPinGate;

impl SecretGate for PlaintextPinGate {
    fn seal_pin(&mut self, pin: &str) -> Result<Vec<u8>, GateError> {
        let len = pin.len().min(PIN_LEN - 1);
        Ok(pin.as_bytes()[..len].to_vec())
    }

    fn check_pin(&mut self, stored: Option<&[u8]>, candidate: &str) -> bool {
        ct_eq_padded(stored.unwrap_or_default(), candidate.as_bytes(), PIN_LEN)
    }

    fn seal_mnemonic(&mut self, phrase: &str, _pin_set: bool) -> Result<Vec<u8>, GateError> {
        if phrase.len() >= MNEMONIC_LEN {
            return Err(GateError::MnemonicTooLong(phrase.len()));
        }
        Ok(crate::record::mnemonic_field(phrase))
    }

    fn open_mnemonic(&mut self, field: &[u8], _pin_set: bool) -> Result<Zeroizing<String>, GateError> {
        Ok(Zeroizing::new(
            String::from_utf8_lossy(until_nul(field)).into_owned(),
        ))
    }
}

/// External secure element holding the PIN and the mnemonic key
pub trait SecureElement {
    fn init(&mut self) -> Result<(), GateError>;

    /// Unlock the user zone with a password
    fn open_zone(&mut self, password: u32) -> Result<(), GateError>;

    /// Lock the user zone again
    fn deactivate(&mut self);

    /// AES key of the open zone
    fn aes_key(&mut self) -> Result<Zeroizing<[u8; 32]>, GateError>;

    /// Change the zone password
    fn set_pin(&mut self, password: u32) -> Result<(), GateError>;

    fn remaining_pin_attempts(&mut self) -> Result<u32, GateError>;

    fn wipe_zone(&mut self) -> Result<(), GateError>;

    /// Provision a zone with a fresh key
    fn initialize_new_zone(&mut self) -> Result<(), GateError>;

    fn is_zone_initialized(&self) -> bool;

    fn remaining_zones(&mut self) -> Result<u32, GateError>;
}

/// Zone password for a PIN: its decimal value masked to 24 bits, or the
/// default password for an empty or non-numeric PIN
pub fn zone_password(pin: &str) -> u32 {
    if pin.is_empty() {
        return DEFAULT_ZONE_PASSWORD;
    }
    match pin.parse::<u64>() {
        Ok(value) => (value & 0x00ff_ffff) as u32,
        Err(_) => DEFAULT_ZONE_PASSWORD,
    }
}

/// Gate backed by a [`SecureElement`]
pub struct SecureElementGate<E: SecureElement> {
    element: E,
    serial: [u8; DEVICE_SERIAL_LEN],
}

impl<E: SecureElement> SecureElementGate<E> {
    /// `serial` is the MCU unique id used to derive the mnemonic IV
    pub fn new(element: E, serial: [u8; DEVICE_SERIAL_LEN]) -> Self {
        Self { element, serial }
    }

    pub fn element(&self) -> &E {
        &self.element
    }

    pub fn element_mut(&mut self) -> &mut E {
        &mut self.element
    }

    fn ensure_open(&mut self, pin_set: bool) -> Result<(), GateError> {
        if !pin_set {
            self.element.open_zone(DEFAULT_ZONE_PASSWORD)?;
        }
        Ok(())
    }

    fn key_and_iv(&mut self) -> Result<(Zeroizing<[u8; 32]>, Zeroizing<[u8; 16]>), GateError> {
        let key = self.element.aes_key()?;
        let full = essiv(&key, &self.serial)?;
        let mut iv = Zeroizing::new([0u8; 16]);
        iv.copy_from_slice(&full[..16]);
        Ok((key, iv))
    }
}

impl<E: SecureElement> fmt::Debug for SecureElementGate<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureElementGate")
            .field("serial", &hex::encode(self.serial))
            .finish_non_exhaustive()
    }
}

impl<E: SecureElement> SecretGate for SecureElementGate<E> {
    fn init(&mut self) -> bool {
        match self.element.init() {
            Ok(()) => true,
            Err(error) => {
                warn!(%error, "secure element init failed");
                false
            }
        }
    }

    fn seal_pin(&mut self, pin: &str) -> Result<Vec<u8>, GateError> {
        let password = zone_password(pin);
        self.element.set_pin(password)?;
        if password == DEFAULT_ZONE_PASSWORD {
            Ok(Vec::new())
        } else {
            Ok(SECURE_ELEMENT_PIN_MARKER.to_vec())
        }
    }

    fn check_pin(&mut self, _stored: Option<&[u8]>, candidate: &str) -> bool {
        self.element.deactivate();
        self.element.open_zone(zone_password(candidate)).is_ok()
    }

    fn seal_mnemonic(&mut self, phrase: &str, pin_set: bool) -> Result<Vec<u8>, GateError> {
        if phrase.len() >= MNEMONIC_LEN {
            return Err(GateError::MnemonicTooLong(phrase.len()));
        }
        if !self.element.is_zone_initialized() {
            self.element.initialize_new_zone()?;
        }
        self.ensure_open(pin_set)?;

        let (key, iv) = self.key_and_iv()?;
        let mut field = crate::record::mnemonic_field(phrase);
        if let Err(error) = aes256_cbc_encrypt(&key, &iv, &mut field) {
            field.zeroize();
            return Err(error.into());
        }
        Ok(field)
    }

    fn open_mnemonic(&mut self, field: &[u8], pin_set: bool) -> Result<Zeroizing<String>, GateError> {
        self.ensure_open(pin_set)?;
        let (key, iv) = self.key_and_iv()?;

        let mut plain = Zeroizing::new(field.to_vec());
        aes256_cbc_decrypt(&key, &iv, &mut plain)?;
        if let Some(last) = plain.last_mut() {
            *last = 0;
        }
        Ok(Zeroizing::new(
            String::from_utf8_lossy(until_nul(&plain)).into_owned(),
        ))
    }

    fn prepare_import(&mut self, pin: &str) -> Result<(), GateError> {
        self.element.open_zone(zone_password(pin))
    }

    fn deactivate(&mut self) {
        self.element.deactivate();
    }

    fn wipe(&mut self) -> Result<(), GateError> {
        self.element.wipe_zone()
    }

    fn uses_pin_journal(&self) -> bool {
        false
    }

    fn remaining_pin_attempts(&mut self) -> Option<u32> {
        Some(self.element.remaining_pin_attempts().unwrap_or(0))
    }

    fn remaining_zones(&mut self) -> Option<u32> {
        self.element.remaining_zones().ok()
    }
}

/// Attempts a simulated zone allows before locking
pub const SIMULATED_PIN_ATTEMPTS: u32 = 5;

/// Zones a simulated element can provision
pub const SIMULATED_ZONES: u32 = 4;

/// In-memory secure element for host builds and tests
pub struct SimulatedSecureElement {
    key: Option<Zeroizing<[u8; 32]>>,
    password: u32,
    open: bool,
    attempts_left: u32,
    zones_left: u32,
    fail_init: bool,
}

impl Default for SimulatedSecureElement {
    fn default() -> Self {
        Self {
            key: None,
            password: DEFAULT_ZONE_PASSWORD,
            open: false,
            attempts_left: SIMULATED_PIN_ATTEMPTS,
            zones_left: SIMULATED_ZONES,
            fail_init: false,
        }
    }
}

impl SimulatedSecureElement {
    pub fn new() -> Self {
        Self::default()
    }

    /// Element whose `init` reports a failure
    pub fn failing() -> Self {
        Self {
            fail_init: true,
            ..Self::default()
        }
    }

    pub fn is_open(&self) -> bool {
        self.open
    }
}

impl fmt::Debug for SimulatedSecureElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulatedSecureElement")
            .field("initialized", &self.key.is_some())
            .field("open", &self.open)
            .field("attempts_left", &self.attempts_left)
            .field("zones_left", &self.zones_left)
            .finish()
    }
}

impl SecureElement for SimulatedSecureElement {
    fn init(&mut self) -> Result<(), GateError> {
        if self.fail_init {
            return Err(GateError::SecureElement("no response".into()));
        }
        Ok(())
    }

    fn open_zone(&mut self, password: u32) -> Result<(), GateError> {
        if self.attempts_left == 0 {
            return Err(GateError::Locked);
        }
        if password == self.password {
            self.open = true;
            self.attempts_left = SIMULATED_PIN_ATTEMPTS;
            Ok(())
        } else {
            self.open = false;
            self.attempts_left -= 1;
            debug!(attempts_left = self.attempts_left, "zone password rejected");
            Err(GateError::SecureElement("wrong zone password".into()))
        }
    }

    fn deactivate(&mut self) {
        self.open = false;
    }

    fn aes_key(&mut self) -> Result<Zeroizing<[u8; 32]>, GateError> {
        if !self.open {
            return Err(GateError::Locked);
        }
        self.key
            .as_ref()
            .map(|key| Zeroizing::new(**key))
            .ok_or_else(|| GateError::SecureElement("zone not initialized".into()))
    }

    fn set_pin(&mut self, password: u32) -> Result<(), GateError> {
        if !self.open && self.password != DEFAULT_ZONE_PASSWORD {
            return Err(GateError::Locked);
        }
        self.password = password;
        Ok(())
    }

    fn remaining_pin_attempts(&mut self) -> Result<u32, GateError> {
        Ok(self.attempts_left)
    }

    fn wipe_zone(&mut self) -> Result<(), GateError> {
        self.key = None;
        self.password = DEFAULT_ZONE_PASSWORD;
        self.open = false;
        self.attempts_left = SIMULATED_PIN_ATTEMPTS;
        Ok(())
    }

    fn initialize_new_zone(&mut self) -> Result<(), GateError> {
        if self.zones_left == 0 {
            return Err(GateError::SecureElement("no zones left".into()));
        }
        self.zones_left -= 1;
        let mut key = Zeroizing::new([0u8; 32]);
        OsRng.fill_bytes(&mut key[..]);
        self.key = Some(key);
        self.open = true;
        Ok(())
    }

    fn is_zone_initialized(&self) -> bool {
        self.key.is_some()
    }

    fn remaining_zones(&mut self) -> Result<u32, GateError> {
        Ok(self.zones_left)
    }
}
