//! Root secret, PIN, passphrase and session state

use std::fmt;

use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use super::{record_view, StorageEngine};
use crate::crypto::Curve;
use crate::error::Result;
use crate::flash::Flash;
use crate::gate::ct_eq_padded;
use crate::record::{HdNode, MNEMONIC_LEN};
use crate::session::SEED_LEN;
use crate::ui::{permille, PROGRESS_UPDATING, PROGRESS_WAKING_UP};
use crate::U2F_KEY_PATH;

/// Length of a session state blob: salt then HMAC
pub const SESSION_STATE_LEN: usize = 64;

/// Provisioning request for a device loaded with an existing secret
#[derive(Default)]
pub struct LoadDevice {
    /// Mnemonic phrase; ignored when `node` is given
    pub mnemonic: Option<Zeroizing<String>>,
    pub node: Option<HdNode>,
    pub pin: Option<Zeroizing<String>>,
    pub passphrase_protection: bool,
    pub language: Option<String>,
    pub label: Option<String>,
    pub u2f_counter: Option<u32>,
}

impl fmt::Debug for LoadDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadDevice")
            .field("mnemonic", &self.mnemonic.as_ref().map(|_| "<redacted>"))
            .field("node", &self.node)
            .field("pin", &self.pin.as_ref().map(|_| "<redacted>"))
            .field("passphrase_protection", &self.passphrase_protection)
            .field("language", &self.language)
            .field("label", &self.label)
            .field("u2f_counter", &self.u2f_counter)
            .finish()
    }
}

impl<F: Flash> StorageEngine<F> {
    /// Whether the PIN in effect after the next commit is non-empty
    fn pin_set(&self) -> Result<bool> {
        if let Some(pin) = &self.pending.pin {
            return Ok(!pin.is_empty());
        }
        Ok(self.view()?.pin_field().is_some_and(|pin| !pin.is_empty()))
    }

    pub fn has_pin(&self) -> Result<bool> {
        self.guard()?;
        Ok(self.view()?.pin_field().is_some_and(|pin| !pin.is_empty()))
    }

    /// Stage a new PIN; an empty PIN removes it
    pub fn set_pin(&mut self, pin: &str) -> Result<()> {
        self.guard()?;
        let field = self.gate.seal_pin(pin)?;
        self.pending.pin = Some(field);
        self.session.set_pin_cached(false);
        Ok(())
    }

    /// Check `pin` against the stored PIN
    pub fn contains_pin(&mut self, pin: &str) -> Result<bool> {
        self.guard()?;
        let view = record_view(&self.flash, &self.layout)?;
        Ok(self.gate.check_pin(view.pin_field(), pin))
    }

    pub fn is_pin_cached(&self) -> bool {
        self.session.is_pin_cached()
    }

    /// Mark the PIN as entered for this session
    pub fn cache_pin(&mut self) {
        self.session.set_pin_cached(true);
    }

    pub fn has_mnemonic(&self) -> Result<bool> {
        self.guard()?;
        Ok(self.view()?.has_mnemonic())
    }

    pub fn has_node(&self) -> Result<bool> {
        self.guard()?;
        Ok(self.view()?.has_node())
    }

    /// Stage a mnemonic as the root secret, replacing any node
    pub fn set_mnemonic(&mut self, phrase: &str) -> Result<()> {
        self.guard()?;
        let pin_set = self.pin_set()?;
        let field = self.gate.seal_mnemonic(phrase, pin_set)?;
        self.pending.mnemonic = Some(field);
        self.pending.node = None;
        self.session.invalidate_seed();
        Ok(())
    }

    /// Stage an HD node as the root secret, replacing any mnemonic
    pub fn set_node(&mut self, node: HdNode) {
        self.pending.node = Some(node);
        self.pending.mnemonic = None;
        self.session.invalidate_seed();
    }

    /// The mnemonic phrase, pending first, then persisted
    pub fn get_mnemonic(&mut self) -> Result<Option<Zeroizing<String>>> {
        self.guard()?;
        let pin_set = self.pin_set()?;
        let field = match &self.pending.mnemonic {
            Some(field) => Zeroizing::new(field.clone()),
            None => match self.view()?.mnemonic_field() {
                Some(field) => Zeroizing::new(field.to_vec()),
                None => return Ok(None),
            },
        };
        Ok(Some(self.gate.open_mnemonic(&field, pin_set)?))
    }

    /// Compare `phrase` with the stored mnemonic in constant time
    pub fn contains_mnemonic(&mut self, phrase: &str) -> Result<bool> {
        self.guard()?;
        let pin_set = self.pin_set()?;
        let field = match self.view()?.mnemonic_field() {
            Some(field) => Zeroizing::new(field.to_vec()),
            None => return Ok(false),
        };
        let stored = self.gate.open_mnemonic(&field, pin_set)?;
        Ok(ct_eq_padded(stored.as_bytes(), phrase.as_bytes(), MNEMONIC_LEN))
    }

    /// U2F root for a mnemonic field, `None` when it cannot be derived
    pub(super) fn compute_u2f_root(&mut self, field: &[u8], pin_set: bool) -> Option<HdNode> {
        let phrase = match self.gate.open_mnemonic(field, pin_set) {
            Ok(phrase) if !phrase.is_empty() => phrase,
            Ok(_) => return None,
            Err(error) => {
                warn!(%error, "cannot open mnemonic, U2F root left empty");
                return None;
            }
        };

        let ui = &mut self.ui;
        let seed = match self.crypto.mnemonic_to_seed(&phrase, "", &mut |iteration, total| {
            ui.progress(PROGRESS_UPDATING, permille(iteration, total))
        }) {
            Ok(seed) => seed,
            Err(error) => {
                warn!(%error, "cannot derive seed, U2F root left empty");
                return None;
            }
        };

        let root = self
            .crypto
            .node_from_seed(&seed[..], Curve::Nist256p1)
            .and_then(|master| self.crypto.node_private_ckd(&master, U2F_KEY_PATH, Curve::Nist256p1));
        match root {
            Ok(mut node) => {
                node.child_num = U2F_KEY_PATH;
                debug!("U2F root recomputed");
                Some(node)
            }
            Err(error) => {
                warn!(%error, "U2F root derivation failed");
                None
            }
        }
    }

    pub fn is_passphrase_cached(&self) -> bool {
        self.session.is_passphrase_cached()
    }

    /// Cache the session passphrase; any cached seed is dropped
    pub fn cache_passphrase(&mut self, passphrase: &str) {
        self.session.invalidate_seed();
        self.session.cache_passphrase(passphrase);
    }

    /// Make sure a passphrase is available when protection is on, asking
    /// the user if needed
    pub fn protect_passphrase(&mut self) -> Result<bool> {
        if !self.has_passphrase_protection()? || self.session.is_passphrase_cached() {
            return Ok(true);
        }
        match self.ui.request_passphrase() {
            Some(passphrase) => {
                self.session.cache_passphrase(&passphrase);
                Ok(true)
            }
            None => {
                debug!("passphrase request declined");
                Ok(false)
            }
        }
    }

    /// BIP-39 seed of the stored mnemonic, cached for the session
    ///
    /// With `use_passphrase` the cached passphrase is mixed in, prompting
    /// for it first when protection is on. `None` when no mnemonic is
    /// stored or the prompt was declined. A stored mnemonic that fails its
    /// checksum is fatal unless it was imported.
    pub fn get_seed(&mut self, use_passphrase: bool) -> Result<Option<Zeroizing<[u8; SEED_LEN]>>> {
        self.guard()?;
        if let Some(seed) = self.session.seed(use_passphrase) {
            return Ok(Some(seed));
        }

        let view = self.view()?;
        let Some(field) = view.mnemonic_field().map(|field| Zeroizing::new(field.to_vec())) else {
            return Ok(None);
        };
        let imported = view.imported() == Some(true);
        let pin_set = view.pin_field().is_some_and(|pin| !pin.is_empty());

        if use_passphrase && !self.protect_passphrase()? {
            return Ok(None);
        }

        let phrase = self.gate.open_mnemonic(&field, pin_set)?;
        if !imported && !self.crypto.mnemonic_check(&phrase) {
            return Err(self.fatal("stored mnemonic fails its checksum"));
        }

        let passphrase = Zeroizing::new(match (use_passphrase, self.session.passphrase()) {
            (true, Some(passphrase)) => passphrase.to_owned(),
            _ => String::new(),
        });
        let ui = &mut self.ui;
        let seed = self.crypto.mnemonic_to_seed(&phrase, &passphrase, &mut |iteration, total| {
            ui.progress(PROGRESS_WAKING_UP, permille(iteration, total))
        })?;
        self.session.store_seed(&seed, use_passphrase);
        info!(use_passphrase, "seed derived");
        Ok(Some(seed))
    }

    /// Root node for `curve`
    ///
    /// A stored secp256k1 node is returned directly, decrypted with the
    /// passphrase when protection is on and a non-empty passphrase is
    /// cached. Otherwise the node is derived from the seed.
    pub fn get_root_node(&mut self, curve: Curve, use_passphrase: bool) -> Result<Option<HdNode>> {
        self.guard()?;
        if curve == Curve::Secp256k1 {
            if let Some(stored) = self.view()?.node() {
                return self.open_stored_node(&stored, curve);
            }
        }

        let Some(seed) = self.get_seed(use_passphrase)? else {
            return Ok(None);
        };
        Ok(Some(self.crypto.node_from_seed(&seed[..], curve)?))
    }

    fn open_stored_node(&mut self, stored: &HdNode, curve: Curve) -> Result<Option<HdNode>> {
        if !self.protect_passphrase()? {
            return Ok(None);
        }
        let mut node = match self.crypto.node_from_xprv(stored, curve) {
            Ok(node) => node,
            Err(error) => {
                warn!(%error, "stored node rejected");
                return Ok(None);
            }
        };

        let passphrase = match self.session.passphrase() {
            Some(passphrase) if !passphrase.is_empty() => Zeroizing::new(passphrase.to_owned()),
            _ => return Ok(Some(node)),
        };
        if !self.has_passphrase_protection()? {
            return Ok(Some(node));
        }

        let ui = &mut self.ui;
        let secret = self.crypto.passphrase_key(&passphrase, &mut |iteration, total| {
            ui.progress(PROGRESS_WAKING_UP, permille(iteration, total))
        })?;
        let mut key = Zeroizing::new([0u8; 32]);
        let mut iv = Zeroizing::new([0u8; 16]);
        key.copy_from_slice(&secret[..32]);
        iv.copy_from_slice(&secret[32..48]);

        let mut buffer = Zeroizing::new([0u8; 64]);
        buffer[..32].copy_from_slice(&node.chain_code);
        if let Some(private_key) = &node.private_key {
            buffer[32..].copy_from_slice(private_key);
        }
        self.crypto.aes256_cbc_decrypt(&key, &iv, &mut buffer[..])?;

        node.chain_code.copy_from_slice(&buffer[..32]);
        let mut private_key = [0u8; 32];
        private_key.copy_from_slice(&buffer[32..]);
        node.private_key = Some(private_key);
        Ok(Some(node))
    }

    /// Stored U2F root, checked against nist256p1
    pub fn get_u2f_root(&self) -> Result<Option<HdNode>> {
        self.guard()?;
        let Some(stored) = self.view()?.u2f_root() else {
            return Ok(None);
        };
        match self.crypto.node_from_xprv(&stored, Curve::Nist256p1) {
            Ok(node) => Ok(Some(node)),
            Err(error) => {
                warn!(%error, "stored U2F root rejected");
                Ok(None)
            }
        }
    }

    /// Forget the session secrets; with `clear_pin` also the PIN flag and
    /// any unlocked gate state
    pub fn session_clear(&mut self, clear_pin: bool) {
        self.session.clear(clear_pin);
        if clear_pin {
            self.gate.deactivate();
        }
    }

    /// `salt || HMAC-SHA256(passphrase, salt || uuid)`
    ///
    /// Uses `passphrase` when given, the cached passphrase otherwise, and
    /// returns `None` when neither exists. A random salt is drawn when none
    /// is given.
    pub fn session_state(
        &self,
        salt: Option<&[u8; 32]>,
        passphrase: Option<&str>,
    ) -> Result<Option<[u8; SESSION_STATE_LEN]>> {
        self.guard()?;
        let Some(passphrase) = passphrase.or_else(|| self.session.passphrase()) else {
            return Ok(None);
        };

        let mut state = [0u8; SESSION_STATE_LEN];
        match salt {
            Some(salt) => state[..32].copy_from_slice(salt),
            None => self.crypto.random_bytes(&mut state[..32]),
        }

        let mut message = Vec::with_capacity(32 + self.uuid.len());
        message.extend_from_slice(&state[..32]);
        message.extend_from_slice(&self.uuid);
        let mac = self.crypto.hmac_sha256(passphrase.as_bytes(), &message)?;
        state[32..].copy_from_slice(&mac);
        Ok(Some(state))
    }

    /// Provision the device from an existing secret and commit
    pub fn load_device(&mut self, request: LoadDevice) -> Result<()> {
        self.guard()?;
        self.session_clear(true);

        let pin = request.pin.as_deref().map_or("", String::as_str);
        let pin_field = self.gate.seal_pin(pin)?;
        self.gate.prepare_import(pin)?;

        let mnemonic_field = match (&request.node, &request.mnemonic) {
            (None, Some(phrase)) => Some(self.gate.seal_mnemonic(phrase, !pin_field.is_empty())?),
            _ => None,
        };

        self.pending.imported = Some(true);
        self.pending.pin = Some(pin_field);
        self.set_passphrase_protection(request.passphrase_protection);
        match (request.node.clone(), mnemonic_field) {
            (Some(node), _) => self.set_node(node),
            (None, Some(field)) => {
                self.pending.mnemonic = Some(field);
                self.pending.node = None;
            }
            (None, None) => {}
        }
        if let Some(language) = &request.language {
            self.set_language(language);
        }
        self.set_label(request.label.as_deref().unwrap_or(""));
        if let Some(counter) = request.u2f_counter {
            self.set_u2f_counter(counter);
        }

        info!(label = request.label.as_deref().unwrap_or(""), "loading device");
        self.commit()
    }

    /// Fresh zones left on the secret gate, when it has any
    pub fn remaining_zones(&mut self) -> Result<Option<u32>> {
        self.guard()?;
        Ok(self.gate.remaining_zones())
    }
}
