//! Host-side helpers for working with flash images
//!
//! A flash image is the raw storage region as a file: both sectors, in
//! order, exactly `layout.region_len()` bytes long. A missing image reads
//! as blank (erased) flash.

use std::fmt;
use std::path::Path;

use anyhow::{bail, Context};
use tracing::{debug, info};

use norvault_core::{EngineBuilder, FlashLayout, MemoryFlash, StorageEngine};

/// Layout from a TOML file, or the default layout
///
/// Keys left out of the file keep their default value.
pub fn load_layout(path: Option<&Path>) -> anyhow::Result<FlashLayout> {
    let Some(path) = path else {
        return Ok(FlashLayout::default());
    };

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading layout {}", path.display()))?;
    let layout: FlashLayout = toml::from_str(&content)
        .with_context(|| format!("parsing layout {}", path.display()))?;
    layout.validate()?;

    debug!(?layout, "layout loaded");
    Ok(layout)
}

/// Flash backed by the image at `path`
pub fn read_image(path: &Path, layout: FlashLayout) -> anyhow::Result<MemoryFlash> {
    if !path.exists() {
        info!(path = %path.display(), "no image yet, starting from blank flash");
        return Ok(MemoryFlash::new(layout));
    }

    let image = std::fs::read(path).with_context(|| format!("reading image {}", path.display()))?;
    if image.len() != layout.region_len() as usize {
        bail!(
            "image {} is {} bytes, layout expects {}",
            path.display(),
            image.len(),
            layout.region_len()
        );
    }
    Ok(MemoryFlash::from_image(layout, image)?)
}

/// Write `flash` back to `path`
pub fn write_image(path: &Path, flash: &MemoryFlash) -> anyhow::Result<()> {
    // Write to temp file first, then rename
    let temp_path = path.with_extension("img.tmp");
    std::fs::write(&temp_path, flash.image())
        .with_context(|| format!("writing image {}", temp_path.display()))?;
    std::fs::rename(&temp_path, path)
        .with_context(|| format!("replacing image {}", path.display()))?;
    Ok(())
}

/// Open the engine over the image at `path`, loading or wiping it
pub fn open_engine(path: &Path, layout: FlashLayout) -> anyhow::Result<StorageEngine<MemoryFlash>> {
    let flash = read_image(path, layout)?;
    Ok(EngineBuilder::new().layout(layout).open(flash)?)
}

/// Persist the engine's flash to `path`
pub fn save_engine(path: &Path, engine: StorageEngine<MemoryFlash>) -> anyhow::Result<()> {
    write_image(path, &engine.into_flash())
}

/// Summary of a device image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub uuid: String,
    pub initialized: bool,
    pub imported: bool,
    pub label: Option<String>,
    pub language: Option<String>,
    pub has_pin: bool,
    pub passphrase_protection: bool,
    pub needs_backup: bool,
    pub flags: u32,
    pub pin_failures: u32,
    pub u2f_counter: u32,
    pub u2f_offset: u32,
}

impl Status {
    pub fn read(engine: &StorageEngine<MemoryFlash>) -> anyhow::Result<Self> {
        Ok(Self {
            uuid: engine.uuid_hex(),
            initialized: engine.is_initialized()?,
            imported: engine.is_imported()?,
            label: engine.label()?,
            language: engine.language()?,
            has_pin: engine.has_pin()?,
            passphrase_protection: engine.has_passphrase_protection()?,
            needs_backup: engine.needs_backup()?,
            flags: engine.get_flags()?,
            pin_failures: engine.pin_fail_count()?,
            u2f_counter: engine.u2f_counter()?,
            u2f_offset: engine.u2f_offset(),
        })
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "UUID:                  {}", self.uuid)?;
        writeln!(f, "Initialized:           {}", self.initialized)?;
        writeln!(f, "Imported:              {}", self.imported)?;
        writeln!(f, "Label:                 {}", self.label.as_deref().unwrap_or("-"))?;
        writeln!(f, "Language:              {}", self.language.as_deref().unwrap_or("-"))?;
        writeln!(f, "PIN set:               {}", self.has_pin)?;
        writeln!(f, "Passphrase protection: {}", self.passphrase_protection)?;
        writeln!(f, "Needs backup:          {}", self.needs_backup)?;
        writeln!(f, "Flags:                 {:#010x}", self.flags)?;
        writeln!(f, "PIN failures:          {}", self.pin_failures)?;
        write!(
            f,
            "U2F counter:           {} (journal offset {})",
            self.u2f_counter, self.u2f_offset
        )
    }
}
