//! Clipboard bridge between the host `wl_data_device` selection and the X
//! `CLIPBOARD` selection
//!
//! [`SelectionBridge`] only keeps state and decides. The X connection and the
//! host glue perform the [`SelectionAction`]s it returns and feed replies back.
//!
//! Host -> X: when the host selection changes we take ownership of
//! `CLIPBOARD` with a dedicated window and answer `SelectionRequest`s from the
//! host offer, switching to INCR for large transfers (see [`incr`]).
//!
//! X -> host: when an X client owns `CLIPBOARD` we fetch its `TARGETS`,
//! publish a host data source offering them, and convert the selection for each
//! host `send` (see [`transfer`]).

pub mod incr;
pub mod transfer;

pub use incr::{IncrSender, SendAction, INCR_CHUNK_SIZE};
pub use transfer::{QueueAction, SendQueue, SendRequest};

use log::{debug, info, warn};
use std::io::Write;

/// `AnyPropertyType`, `None` and `CurrentTime` on the wire.
pub const NONE: u32 = 0;
pub const CURRENT_TIME: u32 = 0;
const ATOM_ATOM: u32 = 4;
const ATOM_INTEGER: u32 = 19;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectionAtoms {
    pub clipboard: u32,
    pub clipboard_manager: u32,
    pub targets: u32,
    pub timestamp: u32,
    pub incr: u32,
    pub wl_selection: u32,
}

/// One mime type of the host offer and its interned atom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfferedType {
    pub atom: u32,
    pub mime: String,
}

/// A `SelectionRequest` from an X client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectionRequest {
    pub time: u32,
    pub requestor: u32,
    pub selection: u32,
    pub target: u32,
    pub property: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionAction {
    /// SetSelectionOwner; `owner` None releases it.
    SetOwner {
        selection: u32,
        owner: Option<u32>,
        time: u32,
    },
    ChangeProperty {
        window: u32,
        property: u32,
        kind: u32,
        format: u8,
        data: Vec<u8>,
    },
    /// SelectionNotify to the requestor; `property` NONE means refused.
    Notify {
        request: SelectionRequest,
        property: u32,
    },
    /// ConvertSelection(CLIPBOARD, target) into `_WL_SELECTION` on our window.
    Convert { target: u32, time: u32 },
    DeleteProperty { window: u32, property: u32 },
    /// Read `_WL_SELECTION` as a list of atoms and resolve their names.
    FetchTargets,
    /// Read `_WL_SELECTION` with delete, then call
    /// [`SelectionBridge::property_received`].
    FetchData,
    /// Open a pipe and ask the host offer to write `mime` into it.
    ReceiveOffer { mime: String },
    PauseReceive,
    ResumeReceive,
    /// Close the host offer pipe.
    CloseReceive,
    /// Poll the active host send descriptor for writability.
    AwaitSinkWritable,
    /// Publish a host data source with these mime types.
    SetHostSelection { mimes: Vec<String> },
    /// Clear the host selection.
    ClearHostSelection,
}

fn atoms_to_bytes(atoms: &[u32]) -> Vec<u8> {
    atoms.iter().flat_map(|a| a.to_ne_bytes()).collect()
}

#[derive(Debug)]
struct Outgoing {
    request: SelectionRequest,
    kind: u32,
    sender: IncrSender,
}

pub struct SelectionBridge<W> {
    window: u32,
    atoms: SelectionAtoms,
    owner: Option<u32>,
    timestamp: u32,
    offer: Option<Vec<OfferedType>>,
    outgoing: Option<Outgoing>,
    sends: SendQueue<W>,
}

impl<W: Write> SelectionBridge<W> {
    /// `window` is our selection window.
    pub fn new(window: u32, atoms: SelectionAtoms) -> Self {
        Self {
            window,
            atoms,
            owner: None,
            timestamp: CURRENT_TIME,
            offer: None,
            outgoing: None,
            sends: SendQueue::new(),
        }
    }

    pub fn window(&self) -> u32 {
        self.window
    }

    pub fn atoms(&self) -> &SelectionAtoms {
        &self.atoms
    }

    pub fn owner(&self) -> Option<u32> {
        self.owner
    }

    pub fn has_offer(&self) -> bool {
        self.offer.is_some()
    }

    pub fn transfer_in_flight(&self) -> bool {
        self.outgoing.is_some()
    }

    /// Host descriptor the current X -> host transfer writes to.
    pub fn active_sink(&self) -> Option<&W> {
        self.sends.active_sink()
    }

    /// The atoms answered to `TARGETS`.
    pub fn offer_atoms(&self) -> Vec<u32> {
        let mut atoms = vec![self.atoms.targets, self.atoms.timestamp];
        if let Some(offer) = &self.offer {
            atoms.extend(offer.iter().map(|t| t.atom));
        }
        atoms
    }

    // Host -> X

    /// The host selection changed. `None` clears it.
    pub fn host_offer(&mut self, offer: Option<Vec<OfferedType>>) -> Vec<SelectionAction> {
        let mut actions = Vec::new();
        match offer {
            None => {
                self.offer = None;
                if self.owner == Some(self.window) {
                    actions.push(SelectionAction::SetOwner {
                        selection: self.atoms.clipboard,
                        owner: None,
                        time: self.timestamp,
                    });
                }
            }
            Some(types) => {
                debug!("📋 Host selection offers {} types", types.len());
                self.offer = Some(types);
                actions.push(SelectionAction::SetOwner {
                    selection: self.atoms.clipboard,
                    owner: Some(self.window),
                    time: CURRENT_TIME,
                });
            }
        }
        actions
    }

    pub fn selection_request(&mut self, request: SelectionRequest) -> Vec<SelectionAction> {
        let notify = |property| SelectionAction::Notify { request, property };

        if request.selection == self.atoms.clipboard_manager {
            return vec![notify(request.property)];
        }
        if request.target == self.atoms.targets {
            return vec![
                SelectionAction::ChangeProperty {
                    window: request.requestor,
                    property: request.property,
                    kind: ATOM_ATOM,
                    format: 32,
                    data: atoms_to_bytes(&self.offer_atoms()),
                },
                notify(request.property),
            ];
        }
        if request.target == self.atoms.timestamp {
            return vec![
                SelectionAction::ChangeProperty {
                    window: request.requestor,
                    property: request.property,
                    kind: ATOM_INTEGER,
                    format: 32,
                    data: atoms_to_bytes(&[self.timestamp]),
                },
                notify(request.property),
            ];
        }

        let mime = self
            .offer
            .as_ref()
            .and_then(|offer| offer.iter().find(|t| t.atom == request.target))
            .map(|t| t.mime.clone());
        let Some(mime) = mime else {
            return vec![notify(NONE)];
        };
        if self.outgoing.is_some() {
            warn!("⚠️ Selection transfer already pending, refusing {}", mime);
            return vec![notify(NONE)];
        }

        debug!("📋 X client {:#x} requests {}", request.requestor, mime);
        self.outgoing = Some(Outgoing {
            request,
            kind: request.target,
            sender: IncrSender::new(),
        });
        vec![SelectionAction::ReceiveOffer { mime }]
    }

    /// The host pipe could not be created.
    pub fn receive_failed(&mut self) -> Vec<SelectionAction> {
        match self.outgoing.take() {
            Some(outgoing) => vec![SelectionAction::Notify {
                request: outgoing.request,
                property: NONE,
            }],
            None => Vec::new(),
        }
    }

    /// Buffer for the next read from the host pipe.
    pub fn receive_buf(&mut self) -> Option<&mut [u8]> {
        self.outgoing.as_mut().map(|o| o.sender.read_buf())
    }

    pub fn offer_read(&mut self, result: std::io::Result<usize>) -> Vec<SelectionAction> {
        let Some(outgoing) = self.outgoing.as_mut() else {
            return Vec::new();
        };
        let actions = outgoing.sender.on_read(result);
        self.apply_send_actions(actions)
    }

    /// PropertyNotify(Delete) from some window.
    pub fn property_deleted(&mut self, window: u32, property: u32) -> Vec<SelectionAction> {
        let Some(outgoing) = self.outgoing.as_mut() else {
            return Vec::new();
        };
        if outgoing.request.requestor != window
            || outgoing.request.property != property
            || !outgoing.sender.is_incremental()
        {
            return Vec::new();
        }
        let actions = outgoing.sender.on_property_deleted();
        self.apply_send_actions(actions)
    }

    fn apply_send_actions(&mut self, actions: Vec<SendAction>) -> Vec<SelectionAction> {
        let mut out = Vec::new();
        let Some(outgoing) = self.outgoing.as_ref() else {
            return out;
        };
        let request = outgoing.request;
        let kind = outgoing.kind;
        let mut done = false;
        for action in actions {
            match action {
                SendAction::StartIncr { size } => out.push(SelectionAction::ChangeProperty {
                    window: request.requestor,
                    property: request.property,
                    kind: self.atoms.incr,
                    format: 32,
                    data: atoms_to_bytes(&[size]),
                }),
                SendAction::Chunk(data) => out.push(SelectionAction::ChangeProperty {
                    window: request.requestor,
                    property: request.property,
                    kind,
                    format: 8,
                    data,
                }),
                SendAction::Notify => out.push(SelectionAction::Notify {
                    request,
                    property: request.property,
                }),
                SendAction::NotifyFailed => out.push(SelectionAction::Notify {
                    request,
                    property: NONE,
                }),
                SendAction::PauseReading => out.push(SelectionAction::PauseReceive),
                SendAction::ResumeReading => out.push(SelectionAction::ResumeReceive),
                SendAction::Done => done = true,
            }
        }
        if done {
            if let Some(outgoing) = self.outgoing.take() {
                debug!(
                    "📋 Selection transfer to {:#x} done in {} chunks",
                    request.requestor,
                    outgoing.sender.chunks_sent()
                );
            }
            out.push(SelectionAction::CloseReceive);
        }
        out
    }

    // X -> host

    /// XFixes selection owner change on `CLIPBOARD`.
    pub fn owner_changed(&mut self, owner: u32, timestamp: u32) -> Vec<SelectionAction> {
        if owner == NONE {
            let ours = self.owner == Some(self.window);
            self.owner = None;
            return if ours {
                Vec::new()
            } else {
                vec![SelectionAction::ClearHostSelection]
            };
        }

        self.owner = Some(owner);
        if owner == self.window {
            self.timestamp = timestamp;
            return Vec::new();
        }

        info!("📋 X client {:#x} owns the clipboard", owner);
        vec![SelectionAction::Convert {
            target: self.atoms.targets,
            time: timestamp,
        }]
    }

    /// SelectionNotify for our conversion.
    pub fn selection_notify(&mut self, target: u32, property: u32) -> Vec<SelectionAction> {
        if property == NONE {
            if target == self.atoms.targets {
                return Vec::new();
            }
            let actions = self.sends.abort();
            return actions.into_iter().map(|a| self.queue_action(a)).collect();
        }
        if target == self.atoms.targets {
            vec![SelectionAction::FetchTargets]
        } else {
            vec![SelectionAction::FetchData]
        }
    }

    /// Atom names read from the owner's `TARGETS` reply.
    pub fn targets_received(&mut self, names: Vec<String>) -> Vec<SelectionAction> {
        vec![SelectionAction::SetHostSelection { mimes: names }]
    }

    /// The host asked for the X selection as `mime`, interned as `target`.
    pub fn host_send(&mut self, target: u32, sink: W) -> Vec<SelectionAction> {
        let actions = self.sends.push(SendRequest { target, sink });
        actions.into_iter().map(|a| self.queue_action(a)).collect()
    }

    /// `_WL_SELECTION` read with delete after a SelectionNotify.
    pub fn property_received(&mut self, kind: u32, data: Vec<u8>) -> Vec<SelectionAction> {
        if kind == self.atoms.incr {
            debug!("📋 X owner uses INCR");
            self.sends.begin_incremental();
            return Vec::new();
        }
        let actions = self.sends.property_value(data);
        actions.into_iter().map(|a| self.queue_action(a)).collect()
    }

    /// Whether a NEW_VALUE on `_WL_SELECTION` of our window is an INCR chunk.
    pub fn expects_chunk(&self, window: u32, property: u32) -> bool {
        window == self.window && property == self.atoms.wl_selection && self.sends.is_incremental()
    }

    /// Next INCR chunk read from `_WL_SELECTION`.
    pub fn chunk_received(&mut self, data: Vec<u8>) -> Vec<SelectionAction> {
        let actions = self.sends.property_value(data);
        actions.into_iter().map(|a| self.queue_action(a)).collect()
    }

    pub fn sink_writable(&mut self) -> Vec<SelectionAction> {
        let actions = self.sends.flush();
        actions.into_iter().map(|a| self.queue_action(a)).collect()
    }

    fn queue_action(&self, action: QueueAction) -> SelectionAction {
        match action {
            QueueAction::Convert { target } => SelectionAction::Convert {
                target,
                time: CURRENT_TIME,
            },
            QueueAction::AwaitWritable => SelectionAction::AwaitSinkWritable,
            QueueAction::RequestNextChunk => SelectionAction::DeleteProperty {
                window: self.window,
                property: self.atoms.wl_selection,
            },
        }
    }
}

#[cfg(test)]
mod tests;
