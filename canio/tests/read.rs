mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use canio::{Error, Frame, FrameFilter};
use tokio::time::{timeout, Instant};

use common::*;

const SOON: Duration = Duration::from_millis(20);

#[tokio::test(flavor = "multi_thread")]
async fn read_by_id_skips_other_frames() {
    init_logging();
    let driver = bus();
    let can = device(&driver, 0);
    can.start().unwrap();

    inject_later(
        &driver,
        0,
        SOON,
        vec![frame(0x1, &[]), frame(0x2, &[]), frame(0x3, &[]), frame(0x100, &[7])],
    );
    let read = can
        .read_filtered(&FrameFilter::id(0x100), PATIENCE)
        .await
        .unwrap();
    assert_eq!(read.frame, frame(0x100, &[7]));
    assert_eq!(read.discarded, 3);
    assert_eq!(can.stats().filtered_drained, 4);
    can.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn unbounded_timeout_waits_for_match() {
    init_logging();
    let driver = bus();
    let can = device(&driver, 0);
    can.start().unwrap();

    inject_later(&driver, 0, SOON, vec![frame(0x1, &[]), frame(0x100, &[1])]);
    let got = timeout(PATIENCE, can.read_by_id(0x100, Duration::MAX))
        .await
        .unwrap();
    assert_eq!(got, Ok(frame(0x100, &[1])));
    can.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn timeout_reports_observed_frames() {
    init_logging();
    let driver = bus();
    let can = device(&driver, 0);
    can.start().unwrap();

    inject_later(&driver, 0, SOON, vec![frame(0x1, &[]), frame(0x2, &[])]);
    let started = Instant::now();
    let result = can.read_by_id(0x100, Duration::from_millis(200)).await;
    assert_eq!(result, Err(Error::Timeout { observed: 2 }));
    assert!(started.elapsed() >= Duration::from_millis(200));

    // Nothing on the bus at all.
    let result = can.read_by_id(0x100, Duration::from_millis(30)).await;
    assert_eq!(result, Err(Error::Timeout { observed: 0 }));
    can.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn id_set_length_and_rtr_filters() {
    init_logging();
    let driver = bus();
    let can = device(&driver, 0);
    can.start().unwrap();

    inject_later(&driver, 0, SOON, vec![frame(0x5, &[]), frame(0x20, &[1])]);
    let ids = HashSet::from([0x10, 0x20, 0x30]);
    let got = can.read_by_id_set(&ids, PATIENCE).await.unwrap();
    assert_eq!(got.id(), 0x20);

    inject_later(
        &driver,
        0,
        SOON,
        vec![frame(0x7, &[1, 2]), frame(0x7, &[1, 2, 3]), frame(0x7, &[1, 2, 3, 4])],
    );
    let got = can.read_by_id_and_length(0x7, 3, PATIENCE).await.unwrap();
    assert_eq!(got.data(), &[1, 2, 3]);

    inject_later(
        &driver,
        0,
        SOON,
        vec![frame(0x9, &[0]), Frame::remote(0x8, 0).unwrap(), Frame::remote(0x9, 0).unwrap()],
    );
    assert_eq!(can.read_rtr(0x9, PATIENCE).await, Ok(true));
    can.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn subscribers_still_see_discarded_frames() {
    init_logging();
    let driver = bus();
    let can = device(&driver, 0);
    can.start().unwrap();
    let mut sub = can.subscribe().unwrap();

    let frames = vec![frame(0x1, &[]), frame(0x2, &[]), frame(0x3, &[])];
    inject_later(&driver, 0, SOON, frames.clone());

    let (read, got) = tokio::join!(can.read_by_id(0x3, PATIENCE), async {
        let mut got = Vec::new();
        for _ in 0..3 {
            got.push(sub.recv().await.unwrap());
        }
        got
    });
    assert_eq!(read, Ok(frame(0x3, &[])));
    assert_eq!(got, frames);
    can.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn background_sink_resumes_after_read() {
    init_logging();
    let driver = bus();
    let can = device(&driver, 0);
    can.start().unwrap();

    // Let the sink take the channel first, so the read has to make it yield.
    tokio::time::sleep(SOON).await;
    let _ = can.read_by_id(0x1, Duration::from_millis(20)).await;
    let mut sub = can.subscribe().unwrap();

    // With nobody draining the primary channel the reader would block after
    // the first frame and the subscriber would never see the rest.
    let frames: Vec<_> = (0..10).map(|i| frame(i, &[])).collect();
    inject_later(&driver, 0, Duration::ZERO, frames.clone());
    for expected in frames {
        let got = timeout(PATIENCE, sub.recv()).await.unwrap().unwrap();
        assert_eq!(got, expected);
    }

    // The last frame may still sit in the primary channel.
    timeout(PATIENCE, async {
        while can.stats().background_drained < 10 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert!(can.stats().background_yields >= 1);
    can.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_reads_share_one_deadline_budget() {
    init_logging();
    let driver = bus();
    let can = Arc::new(device(&driver, 0));
    can.start().unwrap();

    // The second read waits for the first to finish and must not get a fresh
    // timeout once it gets its turn.
    let first = {
        let can = can.clone();
        tokio::spawn(async move { can.read_by_id(0x1, Duration::from_millis(150)).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let started = Instant::now();
    let second = can.read_by_id(0x2, Duration::from_millis(50)).await;
    assert_eq!(second, Err(Error::Timeout { observed: 0 }));
    assert!(started.elapsed() < Duration::from_millis(140));

    assert_eq!(first.await.unwrap(), Err(Error::Timeout { observed: 0 }));
    can.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_ends_pending_read() {
    init_logging();
    let driver = bus();
    let can = Arc::new(device(&driver, 0));
    can.start().unwrap();

    let pending = {
        let can = can.clone();
        tokio::spawn(async move { can.read_by_id(0x1, Duration::from_secs(10)).await })
    };
    tokio::time::sleep(SOON).await;
    can.stop().await.unwrap();

    let result = timeout(PATIENCE, pending).await.unwrap().unwrap();
    assert_eq!(result, Err(Error::Stopped));
}
