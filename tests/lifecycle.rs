//! End-to-end channel scenarios against the simulated grant table.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use gntshm::backend::sim::{OrderingViolation, SimHypervisor};
use gntshm::{
    CancelToken, ChannelState, CopyPath, Error, GntStatus, GrantFlags, GrantSink, GrantSource, NotifyAction,
    TeardownCoordinator, TransferStrategy, UnmapNotify, WaitOutcome, WaitPolicy, NOTIFY_SENTINEL, PAGE_SIZE,
};

const GUEST: u16 = 1;
const HOST: u16 = 0;

fn setup() -> (SimHypervisor, GrantSource, GrantSink) {
    let hv = SimHypervisor::new().unwrap();
    let source = GrantSource::new(Arc::new(hv.open_alloc(GUEST)));
    let sink = GrantSink::new(Arc::new(hv.open_map(HOST)));
    (hv, source, sink)
}

fn fast_policy() -> WaitPolicy {
    WaitPolicy {
        poll_interval: Duration::from_millis(1),
        timeout: Some(Duration::from_secs(5)),
    }
}

#[test]
fn test_hello_round_trip() {
    let (_hv, source, sink) = setup();

    let (handle, mut page) = source.allocate_mapped(HOST, 1, GrantFlags::WRITABLE).unwrap();
    page.write(0, b"hello").unwrap();

    let mut mapping = sink.map_remote(GUEST, handle.refs()).unwrap();
    let mut remote = sink.map_local(&mapping).unwrap();
    assert_eq!(remote.len(), PAGE_SIZE);
    assert_eq!(&remote.as_slice()[..5], b"hello");
    assert!(remote.as_slice()[5..].iter().all(|&b| b == 0));

    sink.unmap_local(&mut remote).unwrap();
    sink.unmap_remote(&mut mapping).unwrap();
    source.unmap_local(&mut page).unwrap();
    source.deallocate(handle).unwrap();
}

#[test]
fn test_sink_writes_visible_to_source() {
    let (_hv, source, sink) = setup();

    let (handle, page) = source.allocate_mapped(HOST, 2, GrantFlags::WRITABLE).unwrap();
    let mapping = sink.map_remote(GUEST, handle.refs()).unwrap();
    let mut remote = sink.map_local(&mapping).unwrap();

    remote.write(PAGE_SIZE + 10, b"reply").unwrap();
    let mut buf = [0u8; 5];
    page.read(PAGE_SIZE + 10, &mut buf).unwrap();
    assert_eq!(&buf, b"reply");
}

#[test]
fn test_deallocated_reference_cannot_be_mapped() {
    let (hv, source, sink) = setup();

    let handle = source.allocate(HOST, 1, GrantFlags::WRITABLE).unwrap();
    let gref = handle.refs()[0];
    source.deallocate(handle).unwrap();
    assert!(!hv.is_granted(GUEST, gref));
    assert_eq!(hv.live_grants(), 0);

    let err = sink.map_remote(GUEST, &[gref]).unwrap_err();
    assert!(matches!(err, Error::InvalidReference { ref refs, .. } if refs == &[gref]));
}

#[test]
fn test_wrong_consumer_denied() {
    let (hv, source, _sink) = setup();
    let handle = source.allocate(HOST, 1, GrantFlags::WRITABLE).unwrap();

    let stranger = GrantSink::new(Arc::new(hv.open_map(5)));
    let err = stranger.map_remote(GUEST, handle.refs()).unwrap_err();
    assert!(matches!(err, Error::PermissionDenied { domid: GUEST, .. }));
}

#[test]
fn test_copy_matches_map() {
    for pages in [1u32, 3] {
        let (_hv, source, sink) = setup();
        let (handle, mut page) = source.allocate_mapped(HOST, pages, GrantFlags::WRITABLE).unwrap();
        for (i, b) in page.as_mut_slice().iter_mut().enumerate() {
            *b = (i * 7 % 256) as u8;
        }

        let mapping = sink.map_remote(GUEST, handle.refs()).unwrap();
        let mapped = sink.map_local_readonly(&mapping).unwrap().as_slice().to_vec();

        let mut copied = vec![0u8; pages as usize * PAGE_SIZE];
        CopyPath::for_sink(&sink)
            .copy_from(GUEST, handle.refs(), &mut copied)
            .unwrap();

        assert_eq!(mapped, copied, "{} page(s)", pages);
        assert_eq!(copied, page.as_slice());
    }
}

#[test]
fn test_copy_fails_on_revoked_reference() {
    let (hv, source, sink) = setup();

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let (handle, mut page) = source.allocate_mapped(HOST, 1, GrantFlags::WRITABLE).unwrap();
            page.as_mut_slice().fill(b'a' + i as u8);
            handle
        })
        .collect();
    let refs: Vec<u32> = handles.iter().map(|h| h.refs()[0]).collect();

    let mut handles = handles.into_iter();
    let first = handles.next().unwrap();
    let second = handles.next().unwrap();
    source.deallocate(handles.next().unwrap()).unwrap();
    assert!(!hv.is_granted(GUEST, refs[2]));

    let mut buf = vec![0u8; 4 * PAGE_SIZE];
    let err = CopyPath::for_sink(&sink)
        .copy_from(GUEST, &refs, &mut buf)
        .unwrap_err();

    match err {
        Error::CopySegmentFailed {
            domid,
            gref,
            segment,
            status,
        } => {
            assert_eq!(domid, GUEST);
            assert_eq!(gref, refs[2]);
            assert_eq!(segment, 2);
            assert_eq!(status, GntStatus::BAD_GNTREF);
        }
        other => panic!("unexpected error: {}", other),
    }

    assert!(buf[..PAGE_SIZE].iter().all(|&b| b == b'a'));
    assert!(buf[PAGE_SIZE..2 * PAGE_SIZE].iter().all(|&b| b == b'b'));
    drop((first, second));
}

#[test]
fn test_double_unmap_is_noop() {
    let (_hv, source, sink) = setup();

    let (handle, mut page) = source.allocate_mapped(HOST, 1, GrantFlags::WRITABLE).unwrap();
    let mut mapping = sink.map_remote(GUEST, handle.refs()).unwrap();

    sink.unmap_remote(&mut mapping).unwrap();
    sink.unmap_remote(&mut mapping).unwrap();
    source.unmap_local(&mut page).unwrap();
    source.unmap_local(&mut page).unwrap();
    assert!(!page.is_mapped());
}

#[test]
fn test_notify_byte_cleared_on_unmap() {
    let (hv, source, sink) = setup();

    let (handle, page) = source.allocate_mapped(HOST, 2, GrantFlags::WRITABLE).unwrap();
    let mut channel = TeardownCoordinator::arm(handle, page).unwrap();
    let refs = channel.handle().unwrap().refs().to_vec();

    let mut mapping = sink.map_remote(GUEST, &refs).unwrap();
    sink.set_unmap_notify(&mapping, NotifyAction::CLEAR_BYTE | NotifyAction::SEND_EVENT, 3)
        .unwrap();
    let remote = sink.map_local(&mapping).unwrap();
    assert_eq!(remote.notify_byte().unwrap(), NOTIFY_SENTINEL);

    assert_eq!(channel.poll().unwrap(), ChannelState::Mapped);
    drop(remote);
    sink.unmap_remote(&mut mapping).unwrap();

    let outcome = channel.wait_for_release(&CancelToken::new(), &fast_policy()).unwrap();
    assert_eq!(outcome, WaitOutcome::Released);
    assert_eq!(channel.page().notify_byte().unwrap(), 0);
    assert_eq!(hv.events(), vec![3]);

    channel.release(&source).unwrap();
    assert_eq!(channel.state(), ChannelState::Released);
    assert!(hv.violations().is_empty());
    assert_eq!(hv.live_grants(), 0);
}

#[test]
fn test_readonly_grant_keeps_channel_mapped() {
    let (hv, source, sink) = setup();

    let (handle, page) = source.allocate_mapped(HOST, 1, GrantFlags::empty()).unwrap();
    let mut channel = TeardownCoordinator::arm(handle, page).unwrap();
    let refs = channel.handle().unwrap().refs().to_vec();

    let err = TransferStrategy::DirectMap
        .fetch(&sink, GUEST, &refs, Some(UnmapNotify::clear_byte()))
        .unwrap_err();
    assert!(matches!(err, Error::PermissionDenied { domid: GUEST, .. }));

    let data = TransferStrategy::DirectMap.fetch(&sink, GUEST, &refs, None).unwrap();
    assert_eq!(data[PAGE_SIZE - 1], NOTIFY_SENTINEL);
    assert_eq!(channel.poll().unwrap(), ChannelState::Mapped);
    assert!(channel.release(&source).is_err());
    assert!(hv.is_granted(GUEST, refs[0]));
}

#[test]
fn test_premature_release_refused() {
    let (hv, source, sink) = setup();

    let (handle, page) = source.allocate_mapped(HOST, 1, GrantFlags::WRITABLE).unwrap();
    let mut channel = TeardownCoordinator::arm(handle, page).unwrap();
    let refs = channel.handle().unwrap().refs().to_vec();

    let mut mapping = sink.map_remote(GUEST, &refs).unwrap();
    sink.set_unmap_notify(&mapping, NotifyAction::CLEAR_BYTE, 0).unwrap();

    let err = channel.release(&source).unwrap_err();
    assert!(matches!(err, Error::TeardownRaceViolation { .. }));
    assert!(hv.is_granted(GUEST, refs[0]));
    assert!(hv.violations().is_empty());

    sink.unmap_remote(&mut mapping).unwrap();
    assert_eq!(channel.poll().unwrap(), ChannelState::SourceNotified);
    channel.release(&source).unwrap();
    assert!(hv.violations().is_empty());
}

#[test]
fn test_unordered_deallocation_is_recorded() {
    let (hv, source, sink) = setup();

    let handle = source.allocate(HOST, 1, GrantFlags::WRITABLE).unwrap();
    let gref = handle.refs()[0];
    let mut mapping = sink.map_remote(GUEST, handle.refs()).unwrap();

    source.deallocate(handle).unwrap();
    assert_eq!(
        hv.violations(),
        vec![OrderingViolation {
            domid: GUEST,
            gref,
            mappings: 1
        }]
    );

    sink.unmap_remote(&mut mapping).unwrap();
}

#[test]
fn test_sink_exit_releases_channel() {
    let (hv, source, sink) = setup();

    let (handle, page) = source.allocate_mapped(HOST, 1, GrantFlags::WRITABLE).unwrap();
    let mut channel = TeardownCoordinator::arm(handle, page).unwrap();
    let refs = channel.handle().unwrap().refs().to_vec();

    let consumer = thread::spawn(move || {
        let mapping = sink.map_remote(GUEST, &refs).unwrap();
        sink.set_unmap_notify(&mapping, NotifyAction::CLEAR_BYTE, 0).unwrap();
        thread::sleep(Duration::from_millis(10));
        // Dropping the session stands in for the consumer process exiting.
        drop(mapping);
        drop(sink);
    });

    let outcome = channel.wait_for_release(&CancelToken::new(), &fast_policy()).unwrap();
    consumer.join().unwrap();
    assert_eq!(outcome, WaitOutcome::Released);
    channel.release(&source).unwrap();
    assert!(hv.violations().is_empty());
}

#[test]
fn test_copy_strategy_release() {
    let (hv, source, sink) = setup();

    let (handle, mut page) = source.allocate_mapped(HOST, 1, GrantFlags::WRITABLE).unwrap();
    page.write(0, b"copied").unwrap();
    let mut channel = TeardownCoordinator::arm(handle, page).unwrap();
    let refs = channel.handle().unwrap().refs().to_vec();

    let data = TransferStrategy::OneShotCopy
        .fetch(&sink, GUEST, &refs, Some(UnmapNotify::clear_byte()))
        .unwrap();
    assert_eq!(&data[..6], b"copied");

    assert_eq!(channel.poll().unwrap(), ChannelState::SourceNotified);
    channel.release(&source).unwrap();
    assert!(hv.violations().is_empty());
}

#[test]
fn test_cancel_then_abandon() {
    let (hv, source, sink) = setup();

    let (handle, page) = source.allocate_mapped(HOST, 1, GrantFlags::WRITABLE).unwrap();
    let mut channel = TeardownCoordinator::arm(handle, page).unwrap();

    let token = CancelToken::new();
    token.cancel();
    let outcome = channel.wait_for_release(&token, &fast_policy()).unwrap();
    assert_eq!(outcome, WaitOutcome::Cancelled);

    channel.abandon(&source);
    assert_eq!(channel.state(), ChannelState::Released);
    assert_eq!(hv.live_grants(), 0);
    drop(sink);
}

#[test]
fn test_exhaustion_is_fail_fast() {
    let hv = SimHypervisor::new().unwrap().with_grant_limit(2);
    let source = GrantSource::new(Arc::new(hv.open_alloc(GUEST)));

    let _held = source.allocate(HOST, 2, GrantFlags::WRITABLE).unwrap();
    let err = source.allocate(HOST, 1, GrantFlags::WRITABLE).unwrap_err();
    assert!(matches!(err, Error::AllocationRejected { count: 1, .. }));
    assert_eq!(hv.live_grants(), 2);
}
