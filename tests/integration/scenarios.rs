//! End-to-end transfer scenarios over the simulated link.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;

use portage_core::config::PortageConfig;
use portage_core::XferError;
use portage_engine::{
    store_key, CompleteFn, ContentStore, Destination, DownloadRequest, Target, XferCounts,
    XferStatus,
};

use crate::harness::{noop, outcomes, record_into, Event, Pair};

static DIR_COUNTER: AtomicU64 = AtomicU64::new(0);

fn temp_dir(tag: &str) -> PathBuf {
    let n = DIR_COUNTER.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!(
        "portage-itest-{tag}-{}-{n}",
        std::process::id()
    ));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn payload_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// B asks A for `target`, default flags.
fn download(net: &mut Pair, target: Target, destination: Destination, cb: CompleteFn) -> u64 {
    let remote = net.addr_a;
    let now = net.now;
    net.b
        .request_download(
            &mut net.lb,
            DownloadRequest {
                remote,
                target,
                destination,
                priority: false,
                use_large_chunks: false,
                dedup_token: None,
                on_complete: cb,
            },
            now,
        )
        .unwrap()
}

#[test]
fn lossless_download_moves_each_chunk_exactly_once() {
    let mut net = Pair::with_defaults();
    let data = payload_bytes(10_000);

    let sender_done = outcomes();
    let id = net.a.register_send_buffer(
        Bytes::from(data.clone()),
        net.now,
        record_into(&sender_done),
    );

    let received = outcomes();
    let got = download(
        &mut net,
        Target::Registered { id },
        Destination::Memory,
        record_into(&received),
    );
    assert_eq!(got, id, "registered transfers keep the sender's id");

    net.settle();

    // 10,000 bytes at 1000-byte chunks: ten chunks, no retransmits.
    assert_eq!(net.la.chunks_total, 10);

    let results = received.borrow();
    assert_eq!(results.len(), 1);
    let bytes = results[0].as_ref().expect("download should succeed");
    assert_eq!(&bytes[..], &data[..]);

    let sent = sender_done.borrow();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].is_ok());

    // Both registries are empty again.
    assert_eq!(net.a.counts(), XferCounts::default());
    assert_eq!(net.b.counts(), XferCounts::default());
}

#[test]
fn download_survives_dropped_acks() {
    let mut net = Pair::with_defaults();
    let data = payload_bytes(10_000);
    let id = net
        .a
        .register_send_buffer(Bytes::from(data.clone()), net.now, noop());

    let received = outcomes();
    download(
        &mut net,
        Target::Registered { id },
        Destination::Memory,
        record_into(&received),
    );

    // Every third ack vanishes; the sender's retry plus the receiver's
    // reconfirm rule have to carry the transfer anyway.
    let mut ack_ordinal = 0usize;
    let mut lossy_acks = move |event: &Event| {
        if event.is_ack() {
            ack_ordinal += 1;
            return ack_ordinal % 3 != 0;
        }
        true
    };
    net.settle_with_retries(60, &mut |_| true, &mut lossy_acks);

    let results = received.borrow();
    assert_eq!(results.len(), 1);
    assert_eq!(&results[0].as_ref().expect("must complete")[..], &data[..]);
    assert!(
        net.la.chunks_total > 10,
        "dropped acks force retransmits (sent {})",
        net.la.chunks_total
    );
}

#[test]
fn unauthorized_destination_path_never_creates_a_transfer() {
    let mut net = Pair::with_defaults();
    let received = outcomes();
    let now = net.now;

    let result = net.b.request_download(
        &mut net.lb,
        DownloadRequest {
            remote: net.addr_a,
            target: Target::File {
                name: "passwd.tmp".into(),
            },
            destination: Destination::File {
                path: "../../etc/passwd".into(),
            },
            priority: false,
            use_large_chunks: false,
            dedup_token: None,
            on_complete: record_into(&received),
        },
        now,
    );

    assert!(matches!(result, Err(XferError::SecurityRejected)));
    assert_eq!(net.b.counts(), XferCounts::default());
    assert!(net.lb.events.is_empty(), "nothing reached the wire");
    assert!(received.borrow().is_empty());
}

#[test]
fn unclaimed_registration_times_out_with_one_callback() {
    let mut net = Pair::with_defaults();
    let done = outcomes();
    let id = net
        .a
        .register_send_buffer(Bytes::from_static(b"orphan"), net.now, record_into(&done));

    net.advance(Duration::from_secs(65));
    net.tick_a();
    // A second sweep must not find the unit again.
    net.tick_a();

    assert_eq!(net.a.status_of(id), None);
    let fired = done.borrow();
    assert_eq!(fired.len(), 1);
    assert!(matches!(fired[0], Err(XferError::Timeout)));
}

#[test]
fn incoming_cap_promotes_exactly_one_queued_download_per_completion() {
    let cfg_a = PortageConfig::default();
    let mut cfg_b = PortageConfig::default();
    cfg_b.transfer.max_incoming = 10;
    let mut net = Pair::new(&cfg_a, &cfg_b);

    let data = payload_bytes(1500);
    let ids: Vec<u64> = (0..15)
        .map(|_| {
            net.a
                .register_send_buffer(Bytes::from(data.clone()), net.now, noop())
        })
        .collect();

    let received = outcomes();
    for &id in &ids {
        download(
            &mut net,
            Target::Registered { id },
            Destination::Memory,
            record_into(&received),
        );
    }

    let counts = net.b.counts();
    assert_eq!(counts.recv_active, 10, "first ten start immediately");
    assert_eq!(counts.recv_pending, 5);

    // Let exactly one transfer's traffic through: completing it must
    // promote exactly one queued download.
    net.settle_only(ids[0]);
    assert_eq!(received.borrow().len(), 1);
    let counts = net.b.counts();
    assert_eq!(counts.recv_active, 10, "one slot freed, one promotion");
    assert_eq!(counts.recv_pending, 4);

    // Everything else drains too (A needs sweeps to promote its own
    // queued sends past the per-host cap).
    net.settle_with_retries(30, &mut |_| true, &mut |_| true);
    let results = received.borrow();
    assert_eq!(results.len(), 15);
    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(net.b.counts(), XferCounts::default());
}

#[test]
fn approved_file_request_is_served_from_disk() {
    let dir = temp_dir("file-serve");
    let path = dir.join("asset.bin");
    let data = payload_bytes(2500);
    std::fs::write(&path, &data).unwrap();

    let mut net = Pair::with_defaults();
    let name = path.to_string_lossy().to_string();
    net.a.expect_file(name.clone());

    let received = outcomes();
    download(
        &mut net,
        Target::File { name },
        Destination::Memory,
        record_into(&received),
    );
    net.settle();

    // 2500 bytes → chunks of 1000, 1000, 500.
    assert_eq!(net.la.chunks_total, 3);
    let results = received.borrow();
    assert_eq!(results.len(), 1);
    assert_eq!(&results[0].as_ref().expect("must complete")[..], &data[..]);

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn store_entries_replicate_between_stores() {
    let dir = temp_dir("store-repl");
    let store_a = ContentStore::new(dir.join("a")).unwrap();
    let store_b = ContentStore::new(dir.join("b")).unwrap();

    let data = payload_bytes(5000);
    let key = store_key(&data);
    store_a.put(&key, &data).unwrap();

    let mut net = Pair::with_defaults();
    net.a.set_store(store_a);
    net.b.set_store(store_b.clone());

    let received = outcomes();
    download(
        &mut net,
        Target::Store { key },
        Destination::Store { key },
        record_into(&received),
    );
    net.settle();

    let results = received.borrow();
    assert_eq!(results.len(), 1);
    assert!(results[0].is_ok());
    assert!(store_b.has(&key));
    assert_eq!(&store_b.get(&key).unwrap().unwrap()[..], &data[..]);

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn large_chunk_negotiation_reduces_round_trips() {
    let mut net = Pair::with_defaults();
    let data = payload_bytes(10_000);
    let id = net
        .a
        .register_send_buffer(Bytes::from(data.clone()), net.now, noop());

    let received = outcomes();
    let now = net.now;
    net.b
        .request_download(
            &mut net.lb,
            DownloadRequest {
                remote: net.addr_a,
                target: Target::Registered { id },
                destination: Destination::Memory,
                priority: false,
                use_large_chunks: true,
                dedup_token: None,
                on_complete: record_into(&received),
            },
            now,
        )
        .unwrap();
    net.settle();

    // 10,000 bytes at 7680-byte chunks: two chunks instead of ten.
    assert_eq!(net.la.chunks_total, 2);
    let results = received.borrow();
    assert_eq!(&results[0].as_ref().expect("must complete")[..], &data[..]);
}

#[test]
fn priority_downloads_jump_the_pending_queue() {
    let cfg_a = PortageConfig::default();
    let mut cfg_b = PortageConfig::default();
    cfg_b.transfer.max_incoming = 1;
    let mut net = Pair::new(&cfg_a, &cfg_b);

    let data = payload_bytes(800);
    let ids: Vec<u64> = (0..3)
        .map(|_| {
            net.a
                .register_send_buffer(Bytes::from(data.clone()), net.now, noop())
        })
        .collect();

    let mk = |net: &mut Pair, id: u64, priority: bool| {
        let now = net.now;
        let remote = net.addr_a;
        net.b
            .request_download(
                &mut net.lb,
                DownloadRequest {
                    remote,
                    target: Target::Registered { id },
                    destination: Destination::Memory,
                    priority,
                    use_large_chunks: false,
                    dedup_token: None,
                    on_complete: noop(),
                },
                now,
            )
            .unwrap()
    };

    let first = mk(&mut net, ids[0], false);
    let second = mk(&mut net, ids[1], false);
    let third = mk(&mut net, ids[2], true);

    assert_eq!(net.b.status_of(first), Some(XferStatus::InProgress));
    assert_eq!(net.b.status_of(second), Some(XferStatus::Pending));
    assert_eq!(net.b.status_of(third), Some(XferStatus::Pending));

    // Completing the active download promotes the priority request ahead
    // of the older normal one.
    net.settle_only(first);
    assert_eq!(net.b.status_of(first), None);
    assert_eq!(net.b.status_of(third), Some(XferStatus::InProgress));
    assert_eq!(net.b.status_of(second), Some(XferStatus::Pending));
}
