use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use itc_core::{
    AllocScheme, Gateway, ItcConfig, ItcError, Itc, MailboxId, Message, SendError, Timeout,
};

fn standalone() -> Itc {
    Itc::init(ItcConfig::standalone(16).with_namespace("hosta")).unwrap()
}

/// Spawn a thread that creates mailbox `name`, reports its id, then runs `f`.
fn spawn_owner<F, T>(itc: &Itc, name: &'static str, f: F) -> (MailboxId, thread::JoinHandle<T>)
where
    F: FnOnce(Itc, MailboxId) -> T + Send + 'static,
    T: Send + 'static,
{
    let itc = itc.clone();
    let (tx, rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        let id = itc.create_mailbox(name).unwrap();
        tx.send(id).unwrap();
        f(itc, id)
    });
    (rx.recv().unwrap(), handle)
}

#[test]
fn test_fifo_between_threads() {
    let itc = standalone();
    let (receiver, handle) = spawn_owner(&itc, "sink", |itc, _| {
        let mut seen = Vec::new();
        for _ in 0..100 {
            let msg = itc.receive(Timeout::Millis(5000)).unwrap().unwrap();
            seen.push(u32::from_be_bytes(msg.payload().try_into().unwrap()));
            itc.free(msg).unwrap();
        }
        seen
    });

    let me = itc.create_mailbox("source").unwrap();
    for i in 0..100u32 {
        let msg = itc.alloc_with(0x10, &i.to_be_bytes()).unwrap();
        itc.send(msg, receiver, None, None).unwrap();
    }

    let seen = handle.join().unwrap();
    assert_eq!(seen, (0..100).collect::<Vec<_>>());
    itc.delete_mailbox(me).unwrap();
    itc.exit().unwrap();
}

#[test]
fn test_message_carries_addresses() {
    let itc = standalone();
    let (receiver, handle) = spawn_owner(&itc, "sink", |itc, me| {
        let msg = itc.receive(Timeout::Millis(5000)).unwrap().unwrap();
        assert_eq!(msg.receiver(), me);
        assert_eq!(msg.kind(), 0x77);
        assert_eq!(msg.payload(), b"hello");
        msg.sender()
    });

    let me = itc.create_mailbox("source").unwrap();
    let msg = itc.alloc_with(0x77, b"hello").unwrap();
    itc.send(msg, receiver, Some(me), None).unwrap();

    assert_eq!(handle.join().unwrap(), me);
    itc.delete_mailbox(me).unwrap();
}

#[test]
fn test_receive_no_wait_returns_immediately() {
    let itc = standalone();
    let me = itc.create_mailbox("idle").unwrap();

    let start = Instant::now();
    assert!(itc.receive(Timeout::NoWait).unwrap().is_none());
    assert!(start.elapsed() < Duration::from_millis(100));

    itc.delete_mailbox(me).unwrap();
}

#[test]
fn test_receive_timeout_elapses() {
    let itc = standalone();
    let me = itc.create_mailbox("idle").unwrap();

    let start = Instant::now();
    assert!(itc.receive(Timeout::Millis(150)).unwrap().is_none());
    assert!(start.elapsed() >= Duration::from_millis(150));

    itc.delete_mailbox(me).unwrap();
}

#[test]
fn test_receive_wakes_before_deadline() {
    let itc = standalone();
    let (receiver, handle) = spawn_owner(&itc, "sink", |itc, _| {
        let start = Instant::now();
        let msg = itc.receive(Timeout::Millis(3000)).unwrap();
        (msg.is_some(), start.elapsed())
    });

    let me = itc.create_mailbox("source").unwrap();
    thread::sleep(Duration::from_millis(200));
    let msg = itc.alloc(0, 1).unwrap();
    itc.send(msg, receiver, None, None).unwrap();

    let (got, elapsed) = handle.join().unwrap();
    assert!(got);
    assert!(elapsed < Duration::from_millis(3000));
    itc.delete_mailbox(me).unwrap();
}

#[test]
fn test_send_to_self_is_rejected() {
    let itc = standalone();
    let me = itc.create_mailbox("loop").unwrap();

    let msg = itc.alloc_with(1, b"x").unwrap();
    let err = itc.send(msg, me, None, None).unwrap_err();
    assert!(matches!(err.error(), ItcError::SendToSelf(id) if *id == me));

    // The message comes back intact and nothing was queued.
    let msg = err.into_message();
    assert_eq!(msg.payload(), b"x");
    assert_eq!(itc.pending(me).unwrap(), 0);
    itc.free(msg).unwrap();
    itc.delete_mailbox(me).unwrap();
}

#[test]
fn test_thread_exit_tears_down_mailbox() {
    let itc = standalone();
    let (receiver, handle) = spawn_owner(&itc, "short-lived", |_, _| {
        thread::sleep(Duration::from_millis(200));
    });

    let me = itc.create_mailbox("source").unwrap();
    for _ in 0..3 {
        let msg = itc.alloc(64, 1).unwrap();
        itc.send(msg, receiver, None, None).unwrap();
    }
    assert_eq!(itc.pending(receiver).unwrap(), 3);

    handle.join().unwrap();

    // Queued messages were freed and the name is gone.
    assert_eq!(itc.allocated_bytes(), 0);
    assert!(itc.locate("short-lived", Timeout::NoWait, true).unwrap().is_none());
    let msg = itc.alloc(0, 1).unwrap();
    let err = itc.send(msg, receiver, None, None).unwrap_err();
    assert!(matches!(err.error(), ItcError::NotActiveMailbox(_)));

    itc.delete_mailbox(me).unwrap();
    itc.exit().unwrap();
}

#[test]
fn test_thread_panic_tears_down_mailbox() {
    let itc = standalone();
    let worker = itc.clone();
    let result = thread::spawn(move || {
        worker.create_mailbox("doomed").unwrap();
        panic!("worker failed");
    })
    .join();
    assert!(result.is_err());

    assert!(itc.locate("doomed", Timeout::NoWait, true).unwrap().is_none());
    itc.exit().unwrap();
}

#[test]
fn test_receive_matching_leaves_others_queued() {
    let itc = standalone();
    let (receiver, handle) = spawn_owner(&itc, "picky", |itc, _| {
        let barrier = itc.receive_matching(&[0xFF], None, Timeout::Millis(5000)).unwrap();
        assert!(barrier.is_some());
        (0..3)
            .map(|_| itc.receive(Timeout::Millis(5000)).unwrap().unwrap().kind())
            .collect::<Vec<_>>()
    });

    let me = itc.create_mailbox("source").unwrap();
    for kind in [1, 2, 0xFF, 3] {
        let msg = itc.alloc(0, kind).unwrap();
        itc.send(msg, receiver, None, None).unwrap();
    }

    assert_eq!(handle.join().unwrap(), vec![1, 2, 3]);
    itc.delete_mailbox(me).unwrap();
}

#[test]
fn test_receive_matching_by_sender() {
    let itc = standalone();
    let (noisy_tx, noisy_rx) = mpsc::channel::<MailboxId>();
    let (receiver, handle) = spawn_owner(&itc, "picky", move |itc, _| {
        let noisy = noisy_rx.recv().unwrap();
        let first = itc
            .receive_matching(&[], Some(noisy), Timeout::Millis(5000))
            .unwrap()
            .unwrap();
        let rest = itc.receive(Timeout::Millis(5000)).unwrap().unwrap();
        (first.kind(), rest.kind())
    });

    let me = itc.create_mailbox("quiet").unwrap();
    let msg = itc.alloc(0, 20).unwrap();
    itc.send(msg, receiver, None, None).unwrap();

    let other = itc.clone();
    let noisy = thread::spawn(move || {
        let me = other.create_mailbox("noisy").unwrap();
        let msg = other.alloc(0, 10).unwrap();
        other.send(msg, receiver, None, None).unwrap();
        me
    })
    .join()
    .unwrap();
    noisy_tx.send(noisy).unwrap();

    // The older message from "quiet" waits behind the filtered one.
    assert_eq!(handle.join().unwrap(), (10, 20));
    itc.delete_mailbox(me).unwrap();
}

#[test]
fn test_pool_budget_is_shared_by_live_messages() {
    let itc = Itc::init(ItcConfig::standalone(4).with_alloc(AllocScheme::Pool { bytes: 1024 }))
        .unwrap();

    let mut held = Vec::new();
    loop {
        match itc.alloc(100, 1) {
            Ok(msg) => held.push(msg),
            Err(ItcError::OutOfMemory(_)) => break,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(held.len(), 1024 / (100 + itc_core::HEADER_SIZE + 1));

    itc.free(held.pop().unwrap()).unwrap();
    assert!(itc.alloc(100, 1).is_ok());
}

#[test]
fn test_alloc_rejects_oversized_payload() {
    let itc = standalone();
    let max = itc.max_message_size();
    let err = itc.alloc(max + 1, 1).unwrap_err();
    assert!(matches!(err, ItcError::InvalidSize { .. }));
}

struct RecordingGateway {
    forwarded: Mutex<Vec<(String, MailboxId, Vec<u8>)>>,
}

impl Gateway for RecordingGateway {
    fn forward(&self, namespace: &str, to: MailboxId, message: Message) -> Result<(), SendError> {
        self.forwarded
            .lock()
            .unwrap()
            .push((namespace.to_string(), to, message.payload().to_vec()));
        Ok(())
    }
}

#[test]
fn test_foreign_namespace_goes_to_gateway() {
    let itc = standalone();
    let me = itc.create_mailbox("edge").unwrap();
    let remote = MailboxId::from_raw(0x0040_0002);

    let msg = itc.alloc_with(5, b"far").unwrap();
    let err = itc.send(msg, remote, None, Some("hostb")).unwrap_err();
    assert!(matches!(err.error(), ItcError::NoGateway(ns) if ns == "hostb"));
    itc.free(err.into_message()).unwrap();

    let gateway = Arc::new(RecordingGateway {
        forwarded: Mutex::new(Vec::new()),
    });
    itc.set_gateway(Some(gateway.clone() as Arc<dyn Gateway>));

    let msg = itc.alloc_with(5, b"far").unwrap();
    itc.send(msg, remote, None, Some("hostb")).unwrap();
    let forwarded = gateway.forwarded.lock().unwrap();
    assert_eq!(
        forwarded.as_slice(),
        &[("hostb".to_string(), remote, b"far".to_vec())]
    );
    drop(forwarded);

    // The local namespace stays local.
    let msg = itc.alloc(0, 1).unwrap();
    let err = itc.send(msg, me, None, Some("hosta")).unwrap_err();
    assert!(matches!(err.error(), ItcError::SendToSelf(_)));

    itc.delete_mailbox(me).unwrap();
}

#[test]
fn test_introspection() {
    let itc = standalone();
    let me = itc.create_mailbox("named").unwrap();
    assert_eq!(itc.current_mailbox().unwrap(), me);
    assert_eq!(itc.mailbox_name(me).unwrap(), "named");
    assert_eq!(itc.namespace(), "hosta");
    assert_eq!(itc.capacity(), 16);

    itc.delete_mailbox(me).unwrap();
    assert!(matches!(itc.current_mailbox(), Err(ItcError::NoMailbox)));
    assert!(matches!(
        itc.mailbox_name(me),
        Err(ItcError::NotActiveMailbox(_))
    ));
}

#[test]
fn test_notifier_is_created_once_per_mailbox() {
    use std::os::fd::AsRawFd;

    let itc = standalone();
    assert!(matches!(itc.notifier(), Err(ItcError::NoMailbox)));

    let me = itc.create_mailbox("polled").unwrap();
    let a = itc.notifier().unwrap();
    let b = itc.notifier().unwrap();
    assert_eq!(a.as_raw_fd(), b.as_raw_fd());
    itc.delete_mailbox(me).unwrap();
}

#[test]
fn test_slot_reuse_after_delete() {
    let itc = Itc::init(ItcConfig::standalone(1)).unwrap();
    for _ in 0..5 {
        let id = itc.create_mailbox("cycle").unwrap();
        itc.delete_mailbox(id).unwrap();
    }
    itc.exit().unwrap();
}
