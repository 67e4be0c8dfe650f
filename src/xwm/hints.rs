//! ICCCM / Motif property decoding
//!
//! Property payloads come straight off the wire. Anything shorter than its
//! fixed layout is a [`BridgeError::MalformedHint`], which callers treat as an
//! absent property.

use crate::error::{BridgeError, BridgeResult};

pub const US_POSITION: u32 = 1 << 0;
pub const US_SIZE: u32 = 1 << 1;
pub const P_POSITION: u32 = 1 << 2;
pub const P_SIZE: u32 = 1 << 3;
pub const P_MIN_SIZE: u32 = 1 << 4;
pub const P_MAX_SIZE: u32 = 1 << 5;

pub const MWM_HINTS_FUNCTIONS: u32 = 1 << 0;
pub const MWM_HINTS_DECORATIONS: u32 = 1 << 1;
pub const MWM_DECOR_ALL: u32 = 1 << 0;
pub const MWM_DECOR_TITLE: u32 = 1 << 3;

/// Either kind of user/program specified position.
pub const ANY_POSITION: u32 = US_POSITION | P_POSITION;

const SIZE_HINTS_WORDS: usize = 18;
const MOTIF_HINTS_WORDS: usize = 5;

/// `WM_NORMAL_HINTS`, the fields the window manager uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SizeHints {
    pub flags: u32,
    pub min_width: i32,
    pub min_height: i32,
    pub max_width: i32,
    pub max_height: i32,
}

impl SizeHints {
    pub fn parse(words: &[u32]) -> BridgeResult<Self> {
        if words.len() < SIZE_HINTS_WORDS {
            return Err(BridgeError::MalformedHint {
                property: "WM_NORMAL_HINTS",
                len: words.len() * 4,
            });
        }
        Ok(Self {
            flags: words[0],
            min_width: words[5] as i32,
            min_height: words[6] as i32,
            max_width: words[7] as i32,
            max_height: words[8] as i32,
        })
    }
}

/// `_MOTIF_WM_HINTS`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MotifHints {
    pub flags: u32,
    pub functions: u32,
    pub decorations: u32,
}

impl MotifHints {
    pub fn parse(words: &[u32]) -> BridgeResult<Self> {
        if words.len() < MOTIF_HINTS_WORDS {
            return Err(BridgeError::MalformedHint {
                property: "_MOTIF_WM_HINTS",
                len: words.len() * 4,
            });
        }
        Ok(Self {
            flags: words[0],
            functions: words[1],
            decorations: words[2],
        })
    }

    /// Whether the window wants a title bar. `None` when the hints say nothing
    /// about decorations.
    pub fn decorated(&self) -> Option<bool> {
        if self.flags & MWM_HINTS_DECORATIONS == 0 {
            return None;
        }
        // DECOR_ALL inverts the meaning of the other bits
        if self.decorations & MWM_DECOR_ALL != 0 {
            Some(self.decorations & MWM_DECOR_TITLE == 0)
        } else {
            Some(self.decorations & MWM_DECOR_TITLE != 0)
        }
    }
}

/// The class name of `WM_CLASS`: the second of two NUL-terminated strings.
pub fn wm_class(value: &[u8]) -> Option<String> {
    let instance_len = value.iter().position(|b| *b == 0)?;
    let rest = &value[instance_len + 1..];
    if rest.is_empty() {
        return None;
    }
    let class = rest.split(|b| *b == 0).next().unwrap_or(rest);
    Some(String::from_utf8_lossy(class).into_owned())
}

/// A single window id property (`WM_TRANSIENT_FOR`, `WM_CLIENT_LEADER`).
pub fn window_id(words: &[u32]) -> BridgeResult<u32> {
    words.first().copied().ok_or(BridgeError::MalformedHint {
        property: "WINDOW",
        len: 0,
    })
}

/// A text property, cut at the first NUL.
pub fn text(value: &[u8]) -> String {
    let end = value.iter().position(|b| *b == 0).unwrap_or(value.len());
    String::from_utf8_lossy(&value[..end]).into_owned()
}

/// `_GTK_THEME_VARIANT` asks for a dark frame.
pub fn is_dark_variant(value: &[u8]) -> bool {
    value.len() >= 4 && text(value) == "dark"
}

/// Both maximized atoms must be present; one-sided maximize is ignored.
pub fn is_maximized(states: &[u32], horz: u32, vert: u32) -> bool {
    states.contains(&horz) && states.contains(&vert)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_hints_layout() {
        let mut words = [0u32; 18];
        words[0] = P_MIN_SIZE | P_POSITION;
        words[5] = 100;
        words[6] = 50;
        words[7] = 800;
        words[8] = 600;
        let hints = SizeHints::parse(&words).unwrap();
        assert_eq!(hints.flags & P_MIN_SIZE, P_MIN_SIZE);
        assert_eq!((hints.min_width, hints.min_height), (100, 50));
        assert_eq!((hints.max_width, hints.max_height), (800, 600));
    }

    #[test]
    fn test_short_hints_are_malformed() {
        assert!(matches!(
            SizeHints::parse(&[0; 17]),
            Err(BridgeError::MalformedHint { len: 68, .. })
        ));
        assert!(MotifHints::parse(&[2, 0, 0]).is_err());
        assert!(window_id(&[]).is_err());
    }

    #[test]
    fn test_motif_decorations() {
        let hints = |flags, decorations| MotifHints {
            flags,
            functions: 0,
            decorations,
        };
        assert_eq!(hints(0, 0).decorated(), None);
        assert_eq!(hints(MWM_HINTS_DECORATIONS, 0).decorated(), Some(false));
        assert_eq!(hints(MWM_HINTS_DECORATIONS, MWM_DECOR_TITLE).decorated(), Some(true));
        assert_eq!(hints(MWM_HINTS_DECORATIONS, MWM_DECOR_ALL).decorated(), Some(true));
        assert_eq!(
            hints(MWM_HINTS_DECORATIONS, MWM_DECOR_ALL | MWM_DECOR_TITLE).decorated(),
            Some(false)
        );
    }

    #[test]
    fn test_wm_class_takes_second_string() {
        assert_eq!(wm_class(b"xterm\0XTerm\0").as_deref(), Some("XTerm"));
        assert_eq!(wm_class(b"xterm\0XTerm").as_deref(), Some("XTerm"));
        assert_eq!(wm_class(b"xterm\0"), None);
        assert_eq!(wm_class(b"xterm"), None);
    }

    #[test]
    fn test_text_and_theme() {
        assert_eq!(text(b"title\0junk"), "title");
        assert!(is_dark_variant(b"dark"));
        assert!(!is_dark_variant(b"light"));
        assert!(!is_dark_variant(b"da"));
    }

    #[test]
    fn test_maximize_needs_both_atoms() {
        assert!(is_maximized(&[10, 11, 12], 11, 12));
        assert!(!is_maximized(&[11], 11, 12));
        assert!(!is_maximized(&[12], 11, 12));
    }
}
