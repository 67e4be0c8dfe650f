use super::*;
use proptest::prelude::*;
use std::cell::RefCell;
use std::rc::Rc;

const SELECTION_WINDOW: u32 = 0x600001;
const REQUESTOR: u32 = 0x800003;
const PROPERTY: u32 = 300;
const TEXT_ATOM: u32 = 400;

fn atoms() -> SelectionAtoms {
    SelectionAtoms {
        clipboard: 100,
        clipboard_manager: 101,
        targets: 102,
        timestamp: 103,
        incr: 104,
        wl_selection: 105,
    }
}

fn bridge() -> SelectionBridge<SharedSink> {
    SelectionBridge::new(SELECTION_WINDOW, atoms())
}

fn request(target: u32) -> SelectionRequest {
    SelectionRequest {
        time: 5000,
        requestor: REQUESTOR,
        selection: atoms().clipboard,
        target,
        property: PROPERTY,
    }
}

fn text_offer() -> Option<Vec<OfferedType>> {
    Some(vec![OfferedType {
        atom: TEXT_ATOM,
        mime: "text/plain;charset=utf-8".into(),
    }])
}

#[derive(Clone, Default)]
struct SharedSink(Rc<RefCell<Vec<u8>>>);

impl Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Feed `bytes` into the bridge as one read, like a host pipe would.
fn read(bridge: &mut SelectionBridge<SharedSink>, bytes: usize) -> Vec<SelectionAction> {
    let buf = bridge.receive_buf().expect("transfer in flight");
    let n = bytes.min(buf.len());
    buf[..n].fill(b'x');
    bridge.offer_read(Ok(n))
}

fn data_chunks(actions: &[SelectionAction]) -> Vec<usize> {
    actions
        .iter()
        .filter_map(|a| match a {
            SelectionAction::ChangeProperty {
                format: 8, data, ..
            } => Some(data.len()),
            _ => None,
        })
        .collect()
}

#[test]
fn test_host_offer_takes_clipboard_ownership() {
    let mut bridge = bridge();
    let actions = bridge.host_offer(text_offer());
    assert_eq!(
        actions,
        vec![SelectionAction::SetOwner {
            selection: 100,
            owner: Some(SELECTION_WINDOW),
            time: CURRENT_TIME
        }]
    );
    assert!(bridge.owner_changed(SELECTION_WINDOW, 777).is_empty());

    let actions = bridge.host_offer(None);
    assert_eq!(
        actions,
        vec![SelectionAction::SetOwner {
            selection: 100,
            owner: None,
            time: 777
        }]
    );
}

#[test]
fn test_targets_lists_offer_atoms() {
    let mut bridge = bridge();
    bridge.host_offer(text_offer());
    let actions = bridge.selection_request(request(102));
    let expected: Vec<u8> = [102u32, 103, TEXT_ATOM]
        .iter()
        .flat_map(|a| a.to_ne_bytes())
        .collect();
    assert_eq!(
        actions[0],
        SelectionAction::ChangeProperty {
            window: REQUESTOR,
            property: PROPERTY,
            kind: 4,
            format: 32,
            data: expected
        }
    );
    assert!(matches!(
        actions[1],
        SelectionAction::Notify { property: PROPERTY, .. }
    ));
}

#[test]
fn test_clipboard_manager_request_acknowledged() {
    let mut bridge = bridge();
    let mut req = request(TEXT_ATOM);
    req.selection = atoms().clipboard_manager;
    assert_eq!(
        bridge.selection_request(req),
        vec![SelectionAction::Notify {
            request: req,
            property: PROPERTY
        }]
    );
}

#[test]
fn test_unknown_target_refused() {
    let mut bridge = bridge();
    assert!(matches!(
        bridge.selection_request(request(TEXT_ATOM))[..],
        [SelectionAction::Notify { property: NONE, .. }]
    ));
    bridge.host_offer(text_offer());
    assert!(matches!(
        bridge.selection_request(request(999))[..],
        [SelectionAction::Notify { property: NONE, .. }]
    ));
}

#[test]
fn test_second_request_refused_while_transfer_pending() {
    let mut bridge = bridge();
    bridge.host_offer(text_offer());
    assert_eq!(
        bridge.selection_request(request(TEXT_ATOM)),
        vec![SelectionAction::ReceiveOffer {
            mime: "text/plain;charset=utf-8".into()
        }]
    );
    assert!(matches!(
        bridge.selection_request(request(TEXT_ATOM))[..],
        [SelectionAction::Notify { property: NONE, .. }]
    ));
}

#[test]
fn test_small_selection_written_at_once() {
    let mut bridge = bridge();
    bridge.host_offer(text_offer());
    bridge.selection_request(request(TEXT_ATOM));
    assert!(read(&mut bridge, 12).is_empty());
    let actions = bridge.offer_read(Ok(0));
    assert_eq!(data_chunks(&actions), vec![12]);
    assert!(actions.contains(&SelectionAction::Notify {
        request: request(TEXT_ATOM),
        property: PROPERTY
    }));
    assert_eq!(actions.last(), Some(&SelectionAction::CloseReceive));
    assert!(!bridge.transfer_in_flight());
}

#[test]
fn test_large_selection_uses_incr() {
    // 200 KiB: INCR after the first 64 KiB, then 64K x3 and the remainder
    let total = 200 * 1024;
    let mut bridge = bridge();
    bridge.host_offer(text_offer());
    bridge.selection_request(request(TEXT_ATOM));

    let mut incr_markers = 0;
    let mut chunks = Vec::new();
    let mut remaining = total;
    let mut reading = true;
    let mut finished = false;

    for _ in 0..64 {
        let actions = if reading {
            let n = remaining.min(INCR_CHUNK_SIZE);
            remaining -= n;
            read(&mut bridge, n)
        } else {
            bridge.property_deleted(REQUESTOR, PROPERTY)
        };
        for action in &actions {
            match action {
                SelectionAction::ChangeProperty { kind: 104, .. } => incr_markers += 1,
                SelectionAction::PauseReceive => reading = false,
                SelectionAction::ResumeReceive => reading = true,
                SelectionAction::CloseReceive => finished = true,
                _ => {}
            }
        }
        chunks.extend(data_chunks(&actions));
        if finished {
            break;
        }
    }

    assert!(finished);
    assert_eq!(incr_markers, 1);
    assert_eq!(
        chunks,
        vec![
            INCR_CHUNK_SIZE,
            INCR_CHUNK_SIZE,
            INCR_CHUNK_SIZE,
            total - 3 * INCR_CHUNK_SIZE,
            0
        ]
    );
}

#[test]
fn test_read_error_notifies_none() {
    let mut bridge = bridge();
    bridge.host_offer(text_offer());
    bridge.selection_request(request(TEXT_ATOM));
    let actions = bridge.offer_read(Err(std::io::ErrorKind::BrokenPipe.into()));
    assert!(actions.contains(&SelectionAction::Notify {
        request: request(TEXT_ATOM),
        property: NONE
    }));
    assert!(!bridge.transfer_in_flight());
}

#[test]
fn test_foreign_owner_fetches_targets() {
    let mut bridge = bridge();
    assert_eq!(
        bridge.owner_changed(0x400001, 1234),
        vec![SelectionAction::Convert {
            target: 102,
            time: 1234
        }]
    );
    assert_eq!(
        bridge.selection_notify(102, 105),
        vec![SelectionAction::FetchTargets]
    );
    assert!(bridge.selection_notify(102, NONE).is_empty());
    assert_eq!(
        bridge.targets_received(vec!["UTF8_STRING".into()]),
        vec![SelectionAction::SetHostSelection {
            mimes: vec!["UTF8_STRING".into()]
        }]
    );
    assert_eq!(
        bridge.owner_changed(NONE, 0),
        vec![SelectionAction::ClearHostSelection]
    );
}

#[test]
fn test_host_send_writes_property_value() {
    let mut bridge = bridge();
    let sink = SharedSink::default();
    assert_eq!(
        bridge.host_send(TEXT_ATOM, sink.clone()),
        vec![SelectionAction::Convert {
            target: TEXT_ATOM,
            time: CURRENT_TIME
        }]
    );
    assert_eq!(
        bridge.selection_notify(TEXT_ATOM, 105),
        vec![SelectionAction::FetchData]
    );
    assert!(bridge.property_received(TEXT_ATOM, b"copied".to_vec()).is_empty());
    assert_eq!(sink.0.borrow().as_slice(), b"copied");
}

/// Sink that records what it got, or fails every write when `broken`.
#[derive(Clone, Default)]
struct CheckedSink {
    bytes: Rc<RefCell<Vec<u8>>>,
    broken: bool,
}

impl Write for CheckedSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.broken {
            return Err(std::io::ErrorKind::BrokenPipe.into());
        }
        self.bytes.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[test]
fn test_host_sends_are_served_one_at_a_time_in_order() {
    const HTML_ATOM: u32 = 401;
    const PNG_ATOM: u32 = 402;
    let convert = |target| {
        vec![SelectionAction::Convert {
            target,
            time: CURRENT_TIME,
        }]
    };
    let mut bridge: SelectionBridge<CheckedSink> = SelectionBridge::new(SELECTION_WINDOW, atoms());
    let text = CheckedSink::default();
    let html = CheckedSink::default();
    let png = CheckedSink {
        broken: true,
        ..CheckedSink::default()
    };

    assert_eq!(bridge.host_send(TEXT_ATOM, text.clone()), convert(TEXT_ATOM));
    assert!(bridge.host_send(HTML_ATOM, html.clone()).is_empty());
    assert!(bridge.host_send(PNG_ATOM, png.clone()).is_empty());

    // a completed transfer starts the next request
    assert_eq!(bridge.selection_notify(TEXT_ATOM, 105), vec![SelectionAction::FetchData]);
    assert_eq!(bridge.property_received(TEXT_ATOM, b"text".to_vec()), convert(HTML_ATOM));
    assert_eq!(text.bytes.borrow().as_slice(), b"text");

    // so does a conversion the owner refuses
    assert_eq!(bridge.selection_notify(HTML_ATOM, NONE), convert(PNG_ATOM));
    assert!(html.bytes.borrow().is_empty());

    // and a sink that fails
    assert_eq!(bridge.selection_notify(PNG_ATOM, 105), vec![SelectionAction::FetchData]);
    assert!(bridge.property_received(PNG_ATOM, vec![0x89; 16]).is_empty());
    assert!(bridge.active_sink().is_none());
    assert!(bridge.selection_notify(PNG_ATOM, NONE).is_empty());
}

#[test]
fn test_incremental_receive_deletes_after_each_chunk() {
    let mut bridge = bridge();
    let sink = SharedSink::default();
    bridge.host_send(TEXT_ATOM, sink.clone());
    assert!(bridge.property_received(104, Vec::new()).is_empty());
    assert!(bridge.expects_chunk(SELECTION_WINDOW, 105));
    assert!(!bridge.expects_chunk(REQUESTOR, 105));

    let delete = SelectionAction::DeleteProperty {
        window: SELECTION_WINDOW,
        property: 105,
    };
    assert_eq!(bridge.chunk_received(vec![1; 10]), vec![delete.clone()]);
    assert_eq!(bridge.chunk_received(vec![2; 5]), vec![delete]);
    assert!(bridge.chunk_received(Vec::new()).is_empty());
    assert!(!bridge.expects_chunk(SELECTION_WINDOW, 105));
    assert_eq!(sink.0.borrow().len(), 15);
}

prop_compose! {
    fn arb_read_sizes()(sizes in prop::collection::vec(1usize..=INCR_CHUNK_SIZE, 0..12)) -> Vec<usize> {
        sizes
    }
}

proptest! {
    /// Whatever the read pattern and however long the requestor takes to
    /// delete each value, it receives every byte in chunks no larger than
    /// one INCR step, sees at most one INCR marker, and never gets a chunk
    /// while the previous value is still on its property.
    #[test]
    fn prop_incr_waits_for_each_deletion(
        sizes in arb_read_sizes(),
        delays in prop::collection::vec(0usize..4, 1..8),
    ) {
        let total: usize = sizes.iter().sum();
        let mut bridge = bridge();
        bridge.host_offer(text_offer());
        bridge.selection_request(request(TEXT_ATOM));

        let mut pending = sizes.into_iter();
        let mut delays = delays.into_iter().cycle();
        let mut reading = true;
        let mut delivered = 0;
        let mut markers = 0;
        let mut finished = false;
        // the requestor has a value it has not deleted yet, and will delete
        // it after `wait` more steps
        let mut undeleted = false;
        let mut wait: usize = 0;

        for _ in 0..1024 {
            let actions = if undeleted && wait == 0 {
                undeleted = false;
                bridge.property_deleted(REQUESTOR, PROPERTY)
            } else {
                wait = wait.saturating_sub(1);
                if reading {
                    // more host data arrives while the requestor dawdles
                    let n = pending.next().unwrap_or(0);
                    if n == 0 {
                        bridge.offer_read(Ok(0))
                    } else {
                        read(&mut bridge, n)
                    }
                } else {
                    // deletions of other properties are not acknowledgements
                    prop_assert!(bridge.property_deleted(REQUESTOR, PROPERTY + 1).is_empty());
                    Vec::new()
                }
            };
            for action in &actions {
                match action {
                    SelectionAction::ChangeProperty { kind: 104, .. } => {
                        markers += 1;
                        undeleted = true;
                        wait = delays.next().unwrap_or(0);
                    }
                    SelectionAction::ChangeProperty { format: 8, data, .. } => {
                        prop_assert!(data.len() <= 2 * INCR_CHUNK_SIZE);
                        if markers > 0 {
                            prop_assert!(!undeleted, "chunk written over an undeleted value");
                            undeleted = true;
                            wait = delays.next().unwrap_or(0);
                        }
                        delivered += data.len();
                    }
                    SelectionAction::PauseReceive => reading = false,
                    SelectionAction::ResumeReceive => reading = true,
                    SelectionAction::CloseReceive => finished = true,
                    _ => {}
                }
            }
            if finished && !bridge.transfer_in_flight() {
                break;
            }
        }

        prop_assert!(finished);
        prop_assert!(markers <= 1);
        prop_assert_eq!(delivered, total);
    }
}
