//! Seat translation helpers
//!
//! Coordinate scaling for pointer, touch and data-device events, and the
//! keyboard filter that reserves accelerators for the host.

use anyhow::{Context as _, Result};
use log::{debug, warn};
use memmap2::MmapOptions;
use std::collections::BTreeSet;
use std::fs::File;
use std::os::fd::OwnedFd;
use xkbcommon::xkb;

pub const CONTROL_MASK: u32 = 1 << 0;
pub const ALT_MASK: u32 = 1 << 1;
pub const SHIFT_MASK: u32 = 1 << 2;

/// Host surface-local coordinate to guest coordinate.
pub fn to_guest(value: f64, scale: f64) -> f64 {
    value * scale
}

/// Guest surface-local position to host, keeping the fraction (cursor
/// position hints of locked pointers).
pub fn position_to_host(value: f64, scale: f64) -> f64 {
    value / scale
}

/// Guest coordinate to host coordinate (cursor hotspots, subsurface positions).
pub fn to_host(value: i32, scale: f64) -> i32 {
    (value as f64 / scale) as i32
}

/// A key combination reserved for the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Accelerator {
    pub modifiers: u32,
    pub keysym: u32,
}

/// Parse a list like `<Control><Alt>Delete,<Shift>F1`.
///
/// Modifier names are `<Control>`, `<Alt>` and `<Shift>`. Key names are XKB
/// keysym names, matched case-insensitively.
pub fn parse_accelerators(list: &str) -> Result<Vec<Accelerator>> {
    let mut accelerators = Vec::new();
    for entry in list.split(',').filter(|e| !e.is_empty()) {
        let mut rest = entry;
        let mut modifiers = 0;
        while rest.starts_with('<') {
            let end = rest
                .find('>')
                .with_context(|| format!("unterminated modifier in accelerator '{}'", entry))?;
            modifiers |= match &rest[..=end] {
                "<Control>" => CONTROL_MASK,
                "<Alt>" => ALT_MASK,
                "<Shift>" => SHIFT_MASK,
                other => anyhow::bail!("invalid modifier {} in accelerator '{}'", other, entry),
            };
            rest = &rest[end + 1..];
        }
        let keysym = u32::from(xkb::keysym_from_name(rest, xkb::KEYSYM_CASE_INSENSITIVE));
        if keysym == xkb::keysyms::KEY_NoSymbol {
            anyhow::bail!("invalid key symbol '{}' in accelerator '{}'", rest, entry);
        }
        accelerators.push(Accelerator { modifiers, keysym });
    }
    Ok(accelerators)
}

/// Whether a key event reaches the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyVerdict {
    Forward,
    Withhold,
}

/// Tracks pressed keys so that a release is forwarded only when its press was.
#[derive(Debug, Default)]
pub struct KeyFilter {
    accelerators: Vec<Accelerator>,
    pressed: BTreeSet<u32>,
    modifiers: u32,
}

impl KeyFilter {
    pub fn new(accelerators: Vec<Accelerator>) -> Self {
        Self {
            accelerators,
            pressed: BTreeSet::new(),
            modifiers: 0,
        }
    }

    pub fn set_modifiers(&mut self, modifiers: u32) {
        self.modifiers = modifiers;
    }

    pub fn modifiers(&self) -> u32 {
        self.modifiers
    }

    /// A key was pressed; `keysym` is its single symbol, if it has one.
    pub fn press(&mut self, key: u32, keysym: Option<u32>) -> KeyVerdict {
        let reserved = keysym.map_or(false, |sym| {
            self.accelerators
                .iter()
                .any(|a| a.modifiers == self.modifiers && a.keysym == sym)
        });
        if reserved {
            debug!("⌨️ Key {} reserved for the host", key);
            return KeyVerdict::Withhold;
        }
        if self.pressed.insert(key) {
            KeyVerdict::Forward
        } else {
            KeyVerdict::Withhold
        }
    }

    pub fn release(&mut self, key: u32) -> KeyVerdict {
        if self.pressed.remove(&key) {
            KeyVerdict::Forward
        } else {
            KeyVerdict::Withhold
        }
    }

    pub fn pressed(&self) -> impl Iterator<Item = &u32> {
        self.pressed.iter()
    }
}

/// XKB state built from the host keymap, used to resolve key symbols.
pub struct KeymapState {
    state: xkb::State,
    control: xkb::ModMask,
    alt: xkb::ModMask,
    shift: xkb::ModMask,
}

impl KeymapState {
    /// Compile the XKB v1 keymap the host sent in `fd`.
    pub fn from_fd(context: &xkb::Context, fd: OwnedFd, size: u32) -> Result<Self> {
        let file = File::from(fd);
        // SAFETY: the host keymap is a read-only, private mapping.
        let map = unsafe { MmapOptions::new().len(size as usize).map(&file) }
            .context("Failed to map host keymap")?;
        let text = std::str::from_utf8(&map)
            .context("Host keymap is not UTF-8")?
            .trim_end_matches('\0')
            .to_string();
        let keymap = xkb::Keymap::new_from_string(
            context,
            text,
            xkb::KEYMAP_FORMAT_TEXT_V1,
            xkb::KEYMAP_COMPILE_NO_FLAGS,
        )
        .context("Failed to compile host keymap")?;

        let mask = |name: &str| -> xkb::ModMask {
            let index = keymap.mod_get_index(name);
            if index == xkb::MOD_INVALID {
                warn!("⚠️ Host keymap has no {} modifier", name);
                0
            } else {
                1 << index
            }
        };
        let control = mask(xkb::MOD_NAME_CTRL);
        let alt = mask(xkb::MOD_NAME_ALT);
        let shift = mask(xkb::MOD_NAME_SHIFT);
        Ok(Self {
            state: xkb::State::new(&keymap),
            control,
            alt,
            shift,
        })
    }

    /// Apply a modifiers event and return our modifier bits.
    pub fn update_modifiers(&mut self, depressed: u32, latched: u32, locked: u32, group: u32) -> u32 {
        self.state.update_mask(depressed, latched, locked, 0, 0, group);
        let mask = self
            .state
            .serialize_mods(xkb::STATE_MODS_DEPRESSED | xkb::STATE_MODS_LATCHED);
        let mut modifiers = 0;
        if mask & self.control != 0 {
            modifiers |= CONTROL_MASK;
        }
        if mask & self.alt != 0 {
            modifiers |= ALT_MASK;
        }
        if mask & self.shift != 0 {
            modifiers |= SHIFT_MASK;
        }
        modifiers
    }

    /// The key's symbol when it resolves to exactly one.
    pub fn keysym(&self, key: u32) -> Option<u32> {
        match self.state.key_get_syms((key + 8).into()) {
            [sym] => Some(u32::from(*sym)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_accelerators() {
        let list = parse_accelerators("<Control><Alt>Delete,<Shift>f1,Escape").unwrap();
        assert_eq!(list.len(), 3);
        assert_eq!(list[0].modifiers, CONTROL_MASK | ALT_MASK);
        assert_eq!(list[0].keysym, xkb::keysyms::KEY_Delete);
        assert_eq!(list[1].modifiers, SHIFT_MASK);
        assert_eq!(list[1].keysym, xkb::keysyms::KEY_F1);
        assert_eq!(list[2].modifiers, 0);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(parse_accelerators("<Super>a").is_err());
        assert!(parse_accelerators("<Control>NotAKey").is_err());
        assert!(parse_accelerators("<Control").is_err());
        assert!(parse_accelerators("").unwrap().is_empty());
    }

    #[test]
    fn test_accelerator_withheld_and_release_suppressed() {
        let mut filter = KeyFilter::new(vec![Accelerator {
            modifiers: CONTROL_MASK,
            keysym: 0x71,
        }]);
        filter.set_modifiers(CONTROL_MASK);
        assert_eq!(filter.press(16, Some(0x71)), KeyVerdict::Withhold);
        assert_eq!(filter.release(16), KeyVerdict::Withhold);

        filter.set_modifiers(0);
        assert_eq!(filter.press(16, Some(0x71)), KeyVerdict::Forward);
        assert_eq!(filter.release(16), KeyVerdict::Forward);
    }

    #[test]
    fn test_repeated_press_forwarded_once() {
        let mut filter = KeyFilter::default();
        assert_eq!(filter.press(30, None), KeyVerdict::Forward);
        assert_eq!(filter.press(30, None), KeyVerdict::Withhold);
        assert_eq!(filter.pressed().count(), 1);
    }

    #[test]
    fn test_scaling_helpers() {
        assert_eq!(to_guest(10.5, 2.0), 21.0);
        assert_eq!(to_host(7, 2.0), 3);
        // lock hints keep sub-pixel precision
        assert_eq!(position_to_host(7.0, 2.0), 3.5);
        assert_eq!(position_to_host(10.5, 0.5), 21.0);
    }
}
