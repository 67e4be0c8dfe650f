//! Atoms interned at startup

x11rb::atom_manager! {
    pub Atoms: AtomsCookie {
        WM_S0,
        WM_PROTOCOLS,
        WM_STATE,
        WM_CHANGE_STATE,
        WM_DELETE_WINDOW,
        WM_TAKE_FOCUS,
        WM_CLIENT_LEADER,
        WL_SURFACE_ID,
        UTF8_STRING,
        _MOTIF_WM_HINTS,
        _NET_FRAME_EXTENTS,
        _NET_STARTUP_ID,
        _NET_SUPPORTING_WM_CHECK,
        _NET_WM_NAME,
        _NET_WM_MOVERESIZE,
        _NET_WM_STATE,
        _NET_WM_STATE_FULLSCREEN,
        _NET_WM_STATE_MAXIMIZED_VERT,
        _NET_WM_STATE_MAXIMIZED_HORZ,
        CLIPBOARD,
        CLIPBOARD_MANAGER,
        TARGETS,
        TIMESTAMP,
        TEXT,
        INCR,
        _WL_SELECTION,
        _GTK_THEME_VARIANT,
    }
}

impl Atoms {
    pub fn state_atoms(&self) -> super::StateAtoms {
        super::StateAtoms {
            fullscreen: self._NET_WM_STATE_FULLSCREEN,
            maximized_horz: self._NET_WM_STATE_MAXIMIZED_HORZ,
            maximized_vert: self._NET_WM_STATE_MAXIMIZED_VERT,
        }
    }

    pub fn selection_atoms(&self) -> crate::selection::SelectionAtoms {
        crate::selection::SelectionAtoms {
            clipboard: self.CLIPBOARD,
            clipboard_manager: self.CLIPBOARD_MANAGER,
            targets: self.TARGETS,
            timestamp: self.TIMESTAMP,
            incr: self.INCR,
            wl_selection: self._WL_SELECTION,
        }
    }
}
