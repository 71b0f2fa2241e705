//! Protocol invariants exercised over the simulated link.

use std::collections::HashSet;

use bytes::Bytes;

use portage_core::config::PortageConfig;
use portage_core::wire::{encode_size_prefix, PacketNumber};
use portage_core::XferError;
use portage_engine::{Destination, DownloadRequest, Target, XferCounts};

use crate::harness::{noop, outcomes, record_into, Event, Pair};

fn payload_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// No two simultaneously-live transfers share an id, across both lists
/// and both creation paths.
#[test]
fn live_transfer_ids_never_collide() {
    let mut net = Pair::with_defaults();
    let mut ids = HashSet::new();

    for _ in 0..50 {
        let id = net
            .a
            .register_send_buffer(Bytes::from_static(b"buf"), net.now, noop());
        assert!(ids.insert(id), "registry issued a duplicate id");
    }
    for n in 0..50 {
        let now = net.now;
        let remote = net.addr_b;
        let id = net
            .a
            .request_download(
                &mut net.la,
                DownloadRequest {
                    remote,
                    target: Target::File {
                        name: format!("remote-{n}.dat"),
                    },
                    destination: Destination::Memory,
                    priority: false,
                    use_large_chunks: false,
                    dedup_token: None,
                    on_complete: noop(),
                },
                now,
            )
            .unwrap();
        assert!(ids.insert(id), "registry issued a duplicate id");
    }
}

/// Out-of-window chunks neither advance state nor produce acks; a
/// duplicate of the last accepted chunk produces only a re-ack.
#[test]
fn out_of_window_chunks_never_advance_state() {
    let mut net = Pair::with_defaults();
    let data = payload_bytes(5000);
    let id = net
        .a
        .register_send_buffer(Bytes::from(data.clone()), net.now, noop());

    let received = outcomes();
    let now = net.now;
    let remote = net.addr_a;
    net.b
        .request_download(
            &mut net.lb,
            DownloadRequest {
                remote,
                target: Target::Registered { id },
                destination: Destination::Memory,
                priority: false,
                use_large_chunks: false,
                dedup_token: None,
                on_complete: record_into(&received),
            },
            now,
        )
        .unwrap();

    // Request over, first chunk back.
    net.deliver_b_to_a(&mut |_| true);
    net.deliver_a_to_b(&mut |_| true);
    assert_eq!(net.lb.acks_total, 1);

    // A fabricated future chunk: dropped, no ack, no progress.
    let now = net.now;
    let from = net.addr_a;
    net.b
        .on_chunk(&mut net.lb, from, id, PacketNumber::new(7, false), b"bogus", now);
    assert_eq!(net.lb.acks_total, 1, "mismatched chunk must not be acked");

    // A replay of chunk 0: exactly one re-ack, still no progress.
    let mut first_chunk = encode_size_prefix(data.len() as u32).to_vec();
    first_chunk.extend_from_slice(&data[..1000]);
    net.b.on_chunk(
        &mut net.lb,
        from,
        id,
        PacketNumber::new(0, false),
        &first_chunk,
        now,
    );
    assert_eq!(net.lb.acks_total, 2, "duplicate chunk gets a re-ack only");

    // The transfer still completes byte-exact, proving neither injection
    // advanced or corrupted the stream.
    net.settle();
    let results = received.borrow();
    assert_eq!(results.len(), 1);
    assert_eq!(&results[0].as_ref().expect("must complete")[..], &data[..]);
}

/// Completion callbacks fire exactly once, even when an abort races in
/// after the transfer already finished.
#[test]
fn callbacks_never_fire_twice() {
    let mut net = Pair::with_defaults();
    let data = payload_bytes(600);
    let id = net
        .a
        .register_send_buffer(Bytes::from(data), net.now, noop());

    let received = outcomes();
    let now = net.now;
    let remote = net.addr_a;
    net.b
        .request_download(
            &mut net.lb,
            DownloadRequest {
                remote,
                target: Target::Registered { id },
                destination: Destination::Memory,
                priority: false,
                use_large_chunks: false,
                dedup_token: None,
                on_complete: record_into(&received),
            },
            now,
        )
        .unwrap();
    net.settle();
    assert_eq!(received.borrow().len(), 1);

    // The unit is gone; a late local abort is a no-op.
    let now = net.now;
    net.b.abort(&mut net.lb, id, XferError::Timeout, now);
    assert_eq!(received.borrow().len(), 1);
}

/// A receiver that never acks costs exactly 1 + retry_limit sends of the
/// stuck chunk, then a Timeout abort on both sides.
#[test]
fn silent_receiver_costs_exactly_eleven_sends() {
    let mut net = Pair::with_defaults();
    let data = payload_bytes(4000);
    let sender_done = outcomes();
    let id = net.a.register_send_buffer(
        Bytes::from(data),
        net.now,
        record_into(&sender_done),
    );

    let received = outcomes();
    let now = net.now;
    let remote = net.addr_a;
    net.b
        .request_download(
            &mut net.lb,
            DownloadRequest {
                remote,
                target: Target::Registered { id },
                destination: Destination::Memory,
                priority: false,
                use_large_chunks: false,
                dedup_token: None,
                on_complete: record_into(&received),
            },
            now,
        )
        .unwrap();

    let mut drop_all_acks = |event: &Event| !event.is_ack();
    net.settle_with_retries(40, &mut |_| true, &mut drop_all_acks);

    assert_eq!(
        net.la.chunks_total, 11,
        "1 original + retry_limit retries, never more"
    );

    let sent = sender_done.borrow();
    assert_eq!(sent.len(), 1);
    assert!(matches!(sent[0], Err(XferError::Timeout)));

    // The sender's abort notice reached the receiver too.
    let results = received.borrow();
    assert_eq!(results.len(), 1);
    assert!(matches!(results[0], Err(XferError::Timeout)));
}

/// The per-host outgoing cap holds at every step, and everything still
/// completes as slots free up.
#[test]
fn outgoing_cap_per_host_is_never_exceeded() {
    let mut net = Pair::with_defaults();
    let cap = PortageConfig::default().transfer.max_active_per_host;
    let data = payload_bytes(1200);

    let received = outcomes();
    for _ in 0..15 {
        let id = net
            .a
            .register_send_buffer(Bytes::from(data.clone()), net.now, noop());
        let now = net.now;
        let remote = net.addr_a;
        net.b
            .request_download(
                &mut net.lb,
                DownloadRequest {
                    remote,
                    target: Target::Registered { id },
                    destination: Destination::Memory,
                    priority: false,
                    use_large_chunks: false,
                    dedup_token: None,
                    on_complete: record_into(&received),
                },
                now,
            )
            .unwrap();
    }

    for _ in 0..40 {
        net.deliver_b_to_a(&mut |_| true);
        assert!(net.a.active_sends_to(net.addr_b) <= cap);
        net.deliver_a_to_b(&mut |_| true);
        assert!(net.a.active_sends_to(net.addr_b) <= cap);

        if net.la.events.is_empty() && net.lb.events.is_empty() {
            if received.borrow().len() == 15 {
                break;
            }
            // Quiet but unfinished: queued sends need a sweep.
            net.advance(std::time::Duration::from_millis(3100));
            net.tick_a();
            net.tick_b();
            assert!(net.a.active_sends_to(net.addr_b) <= cap);
        }
    }

    let results = received.borrow();
    assert_eq!(results.len(), 15);
    assert!(results.iter().all(|r| r.is_ok()));
}

/// Downloads on a dead connection abort immediately with no retry and no
/// abort message to the dead peer.
#[test]
fn dead_connection_aborts_downloads_without_retry() {
    let mut net = Pair::with_defaults();
    let data = payload_bytes(3000);
    let id = net
        .a
        .register_send_buffer(Bytes::from(data), net.now, noop());

    let received = outcomes();
    let now = net.now;
    let remote = net.addr_a;
    net.b
        .request_download(
            &mut net.lb,
            DownloadRequest {
                remote,
                target: Target::Registered { id },
                destination: Destination::Memory,
                priority: false,
                use_large_chunks: false,
                dedup_token: None,
                on_complete: record_into(&received),
            },
            now,
        )
        .unwrap();

    // Some traffic flows, then the circuit dies.
    net.deliver_b_to_a(&mut |_| true);
    net.deliver_a_to_b(&mut |_| true);
    net.lb.dead.insert(net.addr_a);
    net.tick_b();

    let results = received.borrow();
    assert_eq!(results.len(), 1);
    assert!(matches!(results[0], Err(XferError::ConnectionLost)));
    assert_eq!(net.b.counts(), XferCounts::default());
    assert!(
        !net.lb.events.iter().any(|e| matches!(e, Event::Abort { .. })),
        "no abort message to a dead host"
    );
}

/// A replayed final chunk after completion is inert: the transfer is
/// gone, nothing is re-acked, nothing is re-written.
#[test]
fn replayed_final_chunk_after_completion_is_inert() {
    let mut net = Pair::with_defaults();
    let data = payload_bytes(500);
    let id = net
        .a
        .register_send_buffer(Bytes::from(data.clone()), net.now, noop());

    let received = outcomes();
    let now = net.now;
    let remote = net.addr_a;
    net.b
        .request_download(
            &mut net.lb,
            DownloadRequest {
                remote,
                target: Target::Registered { id },
                destination: Destination::Memory,
                priority: false,
                use_large_chunks: false,
                dedup_token: None,
                on_complete: record_into(&received),
            },
            now,
        )
        .unwrap();
    net.settle();
    assert_eq!(received.borrow().len(), 1);
    let acks_after_completion = net.lb.acks_total;

    // Replay the one-and-only chunk, final marker set.
    let mut final_chunk = encode_size_prefix(data.len() as u32).to_vec();
    final_chunk.extend_from_slice(&data);
    let now = net.now;
    let from = net.addr_a;
    net.b.on_chunk(
        &mut net.lb,
        from,
        id,
        PacketNumber::new(0, true),
        &final_chunk,
        now,
    );

    assert_eq!(net.lb.acks_total, acks_after_completion);
    assert_eq!(received.borrow().len(), 1);
}
