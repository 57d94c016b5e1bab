use std::{sync::Arc, thread};

use ringdma::{
    completion::{Mode, NotifyOn},
    control::{opcode, RawArg},
    sim::{SimChannel, SimEngine, SimMemory, SimRegisters, Source},
    ChannelParams, Device, Direction, ErrorCode, Registry, Reply, Status, Watermarks,
};

type SimDevice = Device<SimChannel, SimMemory, SimRegisters>;

fn trace_init() {
    use tracing_subscriber::filter::{EnvFilter, LevelFilter};

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .without_time()
        .try_init();
}

fn params(total_rings: usize, bytes_per_ring: usize) -> ChannelParams {
    ChannelParams {
        total_rings,
        bytes_per_ring,
        desc_length: 256,
        counter: bytes_per_ring as u32,
    }
}

fn device(
    engine: &mut SimEngine,
    watermarks: Watermarks,
    rx: Option<ChannelParams>,
    tx: Option<ChannelParams>,
) -> SimDevice {
    trace_init();
    let mut dev = Device::probe(
        Arc::new(Registry::new("ringdma")),
        engine,
        SimMemory::new(1 << 20),
        SimRegisters::new(),
        watermarks,
    )
    .unwrap();
    dev.allocate_buffer(1 << 20).unwrap();
    if let Some(rx) = rx {
        dev.setup_channel(Direction::Inbound, &rx).unwrap();
    }
    if let Some(tx) = tx {
        dev.setup_channel(Direction::Outbound, &tx).unwrap();
    }
    dev
}

#[test]
fn rx_continuous_detects_overflow() {
    let mut engine = SimEngine::with_source(Source::Pattern);
    let dev = device(&mut engine, Watermarks::default(), Some(params(2, 1024)), None);
    let rx = dev.rx().unwrap();

    rx.set_mode(Mode::Continuous, NotifyOn::TransferComplete)
        .unwrap();
    assert_eq!(rx.status(), Status::Running);
    assert_eq!(engine.in_flight(Direction::Inbound), 2);

    assert_eq!(engine.step(Direction::Inbound), Some(0));
    assert_eq!(rx.take_error(), ErrorCode::None);
    assert_eq!(engine.step(Direction::Inbound), Some(1));
    assert_eq!(rx.take_error(), ErrorCode::None);

    // nobody has read slot 0 since the first completion, and the hardware
    // has lapped back around to it.
    assert_eq!(engine.step(Direction::Inbound), Some(0));
    assert_eq!(rx.take_error(), ErrorCode::RingOverflow);
    assert_eq!(rx.take_error(), ErrorCode::None, "reading clears the error");

    // overflow isn't fatal.
    assert_eq!(rx.status(), Status::Running);
    assert_eq!(rx.transfer_count(), 3);
    assert_eq!(engine.in_flight(Direction::Inbound), 2);
}

#[test]
fn tx_dataflow_walks_watermark_zones() {
    let mut engine = SimEngine::with_source(Source::Pattern);
    let dev = device(&mut engine, Watermarks::default(), None, Some(params(16, 1024)));
    let tx = dev.tx().unwrap();
    let signal = dev.notifier().signal(Direction::Outbound);

    tx.set_mode(Mode::Continuous, NotifyOn::Dataflow).unwrap();
    assert_eq!(tx.status(), Status::Waiting);
    assert_eq!(engine.in_flight(Direction::Outbound), 0);

    tx.enqueue(10).unwrap();
    assert_eq!(tx.status(), Status::Running);
    assert_eq!(engine.in_flight(Direction::Outbound), 2);

    let expected = [
        (9, ErrorCode::QueueFull, true),
        (8, ErrorCode::QueuePrime, false),
        (7, ErrorCode::QueuePrime, false),
        (6, ErrorCode::QueuePrime, false),
        (5, ErrorCode::QueuePrime, false),
        (4, ErrorCode::QueueLow, true),
        (3, ErrorCode::QueueLow, true),
        (2, ErrorCode::QueueLow, true),
        (1, ErrorCode::QueueLow, true),
    ];
    for (queued, code, notified) in expected {
        assert!(engine.step(Direction::Outbound).is_some());
        assert_eq!(tx.queued(), queued);
        assert_eq!(tx.take_error(), code, "queued = {queued}");
        assert_eq!(signal.take(), notified, "queued = {queued}");
        assert_eq!(tx.status(), Status::Running);
    }

    assert!(engine.step(Direction::Outbound).is_some());
    assert_eq!(tx.queued(), 0);
    assert_eq!(tx.take_error(), ErrorCode::QueueUnderflow);
    assert!(signal.take());
    assert_eq!(tx.status(), Status::Waiting);
    // the last descriptor submitted while the queue was non-empty is still
    // in flight.
    assert_eq!(engine.in_flight(Direction::Outbound), 1);

    // refilling past the prime watermark restarts the pipeline.
    tx.enqueue(5).unwrap();
    assert_eq!(tx.status(), Status::Running);
    assert_eq!(engine.in_flight(Direction::Outbound), 3);
}

#[test]
fn tx_dataflow_submit_failure_stays_latched() {
    let mut engine = SimEngine::with_source(Source::Pattern);
    let dev = device(&mut engine, Watermarks::default(), None, Some(params(16, 1024)));
    let tx = dev.tx().unwrap();
    let signal = dev.notifier().signal(Direction::Outbound);

    tx.set_mode(Mode::Continuous, NotifyOn::Dataflow).unwrap();
    tx.enqueue(10).unwrap();
    assert_eq!(engine.in_flight(Direction::Outbound), 2);

    // the re-arm after the first completion is rejected.
    engine.faults().fail_next_submit();
    assert!(engine.step(Direction::Outbound).is_some());
    assert_eq!(tx.queued(), 9);
    assert!(signal.take());
    assert_eq!(engine.in_flight(Direction::Outbound), 1);

    // the next completion lands in the prime zone, which must not hide the
    // failure from a reader that hasn't looked yet.
    assert!(engine.step(Direction::Outbound).is_some());
    assert_eq!(tx.queued(), 8);
    assert_eq!(tx.take_error(), ErrorCode::SubmitFailed);
    assert_eq!(tx.take_error(), ErrorCode::None);
    assert_eq!(engine.in_flight(Direction::Outbound), 0);
}

#[test]
fn dataflow_below_low_watermark_keeps_error() {
    let watermarks = Watermarks {
        full: 8,
        prime: 4,
        low: 2,
    };
    let mut engine = SimEngine::with_source(Source::Pattern);
    let dev = device(&mut engine, watermarks, None, Some(params(16, 1024)));
    let tx = dev.tx().unwrap();
    let signal = dev.notifier().signal(Direction::Outbound);

    tx.set_mode(Mode::Continuous, NotifyOn::Dataflow).unwrap();
    tx.enqueue(3).unwrap();
    assert_eq!(tx.status(), Status::Waiting);
    tx.enqueue(2).unwrap();
    assert_eq!(tx.status(), Status::Running);

    for queued in [4, 3, 2] {
        assert!(engine.step(Direction::Outbound).is_some());
        assert_eq!(tx.queued(), queued);
    }
    assert!(signal.take());

    // one left: below low, so QueueLow is still there to be read and nobody
    // is woken again.
    assert!(engine.step(Direction::Outbound).is_some());
    assert_eq!(tx.queued(), 1);
    assert!(!signal.take());
    assert_eq!(tx.take_error(), ErrorCode::QueueLow);
    assert_eq!(tx.status(), Status::Running);
}

#[test]
fn tx_continuous_rearms_through_underflow() {
    let watermarks = Watermarks {
        full: 3,
        prime: 2,
        low: 1,
    };
    let mut engine = SimEngine::with_source(Source::Pattern);
    let dev = device(&mut engine, watermarks, None, Some(params(8, 1024)));
    let tx = dev.tx().unwrap();
    let signal = dev.notifier().signal(Direction::Outbound);

    tx.set_mode(Mode::Continuous, NotifyOn::TransferComplete)
        .unwrap();
    tx.enqueue(3).unwrap();
    assert_eq!(tx.status(), Status::Running);

    for queued in [2, 1] {
        assert!(engine.step(Direction::Outbound).is_some());
        assert_eq!(tx.queued(), queued);
        assert_eq!(tx.take_error(), ErrorCode::None);
        assert!(signal.take(), "every completion notifies");
    }

    assert!(engine.step(Direction::Outbound).is_some());
    assert_eq!(tx.queued(), 0);
    assert_eq!(tx.take_error(), ErrorCode::QueueUnderflow);
    assert_eq!(tx.status(), Status::Waiting);
    assert_eq!(engine.in_flight(Direction::Outbound), 2);
    assert_eq!(tx.transfer_count(), 3);
}

#[test]
fn rx_single_with_listener_detects_overflow() {
    let mut engine = SimEngine::with_source(Source::Pattern);
    let mut dev = device(&mut engine, Watermarks::default(), Some(params(2, 1024)), None);
    let notifier = dev.notifier().clone();
    let listener = notifier.listen();

    assert_eq!(
        dev.dispatch_raw(opcode::RX_GET_NEXT_INDEX, RawArg::None),
        Ok(Reply::Index(0))
    );

    let single = RawArg::Value(opcode::SIGNAL_TRANSFER_COMPLETE);
    assert_eq!(dev.dispatch_raw(opcode::RX_SINGLE, single), Ok(Reply::Done));
    assert_eq!(engine.step(Direction::Inbound), Some(0));
    assert_eq!(
        dev.dispatch_raw(opcode::RX_GET_ERROR, RawArg::None),
        Ok(Reply::Error(ErrorCode::None))
    );

    // slot 1 completes before the listener has read it.
    assert_eq!(dev.dispatch_raw(opcode::RX_SINGLE, single), Ok(Reply::Done));
    assert_eq!(engine.step(Direction::Inbound), Some(1));
    assert_eq!(
        dev.dispatch_raw(opcode::RX_GET_ERROR, RawArg::None),
        Ok(Reply::Error(ErrorCode::RingOverflow))
    );
    assert!(notifier.signal(Direction::Inbound).take());

    // completions never move a listener's cursor.
    assert_eq!(
        dev.dispatch_raw(opcode::RX_GET_NEXT_INDEX, RawArg::None),
        Ok(Reply::Index(1))
    );
    drop(listener);
}

#[test]
fn rx_burst_drains_then_stops() {
    let mut engine = SimEngine::with_source(Source::Pattern);
    let dev = device(&mut engine, Watermarks::default(), Some(params(4, 1024)), None);
    let rx = dev.rx().unwrap();
    let notifier = dev.notifier();

    rx.set_mode(Mode::Burst(3), NotifyOn::TransferComplete).unwrap();
    assert_eq!(engine.in_flight(Direction::Inbound), 1);
    assert_eq!(engine.run(16), 3);
    assert_eq!(rx.status(), Status::Ready);
    assert_eq!(rx.transfer_count(), 3);
    assert_eq!(rx.completed(), Some(2));
    assert_eq!(engine.in_flight(Direction::Inbound), 0);

    // without a listener, the read cursor jumps to the last slot and
    // nobody is notified.
    assert!(!notifier.signal(Direction::Inbound).take());
    assert_eq!(rx.next_index(), Ok(2));

    let listener = notifier.listen();
    rx.set_mode(Mode::Burst(2), NotifyOn::TransferComplete).unwrap();
    assert_eq!(engine.run(16), 2);
    assert_eq!(rx.completed(), Some(0));
    assert!(notifier.signal(Direction::Inbound).take());
    assert_eq!(rx.next_index(), Ok(3), "a listener keeps its own cursor");
    drop(listener);
}

#[test]
fn stop_mid_stream_reports_partial_transfer() {
    let mut engine = SimEngine::with_source(Source::Pattern);
    let dev = device(&mut engine, Watermarks::default(), Some(params(4, 1024)), None);
    let rx = dev.rx().unwrap();
    let signal = dev.notifier().signal(Direction::Inbound);

    rx.set_mode(Mode::Continuous, NotifyOn::TransferComplete)
        .unwrap();
    assert_eq!(engine.step(Direction::Inbound), Some(0));
    assert!(signal.take());

    rx.stop().unwrap();
    assert_eq!(rx.status(), Status::Ready);
    assert_eq!(engine.terminations(Direction::Inbound), 1);
    assert_eq!(engine.in_flight(Direction::Inbound), 0);
    assert!(signal.take(), "stopping a running channel notifies readers");

    // a second stop has nothing to terminate.
    rx.stop().unwrap();
    assert_eq!(engine.terminations(Direction::Inbound), 1);
    assert!(!signal.take());

    // and the ring picks up where it left off.
    let (curr, _) = rx.cursors();
    rx.set_mode(Mode::Continuous, NotifyOn::TransferComplete)
        .unwrap();
    assert_eq!(engine.in_flight(Direction::Inbound), 2);
    assert_eq!(engine.step(Direction::Inbound), Some((curr + 1) % 4));
}

#[test]
fn loopback_through_raw_commands() {
    let mut engine = SimEngine::new();
    let mut dev = device(&mut engine, Watermarks::default(), None, None);

    dev.dispatch_raw(opcode::SETUP_RX_CHANNEL, RawArg::Channel(params(4, 4096)))
        .unwrap();
    dev.dispatch_raw(opcode::SETUP_TX_CHANNEL, RawArg::Channel(params(4, 4096)))
        .unwrap();
    dev.dispatch_raw(
        opcode::TEST_LOOPBACK,
        RawArg::Loopback(ringdma::config::LoopbackParams {
            size: 16384,
            bytes_per_ring: 4096,
        }),
    )
    .unwrap();
    assert_eq!(engine.run(16), 2);
    assert_eq!(engine.stream_len(), 0);

    assert_eq!(
        dev.dispatch_raw(opcode::RX_GET_ERROR, RawArg::None),
        Ok(Reply::Error(ErrorCode::None))
    );
    assert_eq!(
        dev.dispatch_raw(opcode::TX_GET_ERROR, RawArg::None),
        Ok(Reply::Error(ErrorCode::None))
    );

    let region = dev.buffer().unwrap();
    let rx = dev.rx().unwrap().slot_span(0).unwrap();
    let tx = dev.tx().unwrap().slot_span(0).unwrap();
    assert_eq!(tx.offset(), 16384);
    for word in 0..1024 {
        assert_eq!(
            region.read_u32(rx.offset() + word * 4),
            ((word + 1) % 1024) as u32,
            "word {word}"
        );
    }
}

#[test]
fn completions_from_another_thread() {
    const TRANSFERS: usize = 100;

    let mut engine = SimEngine::with_source(Source::Pattern);
    let dev = device(&mut engine, Watermarks::default(), Some(params(8, 1024)), None);
    let rx = dev.rx().unwrap();
    let notifier = dev.notifier().clone();

    rx.set_mode(Mode::Continuous, NotifyOn::TransferComplete)
        .unwrap();

    let stepper = engine.clone();
    let hardware = thread::Builder::new()
        .name("hardware".into())
        .spawn(move || {
            for _ in 0..TRANSFERS {
                assert!(stepper.step(Direction::Inbound).is_some());
            }
        })
        .unwrap();

    futures::executor::block_on(notifier.signal(Direction::Inbound).wait()).unwrap();
    for _ in 0..TRANSFERS {
        let index = rx.next_index().unwrap();
        assert!(index < 8);
    }
    hardware.join().unwrap();

    assert_eq!(rx.transfer_count(), TRANSFERS as u64);
    assert_eq!(engine.in_flight(Direction::Inbound), 2);
    assert_eq!(rx.status(), Status::Running);
}
