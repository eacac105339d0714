//! End-to-end feed behaviour against the in-process engine.
//!
//! Every scenario drives the feed the way a native engine would: events are
//! emitted synchronously from inside engine calls, and deferred work runs on
//! a `LocalPool` that the test advances explicitly.
//!
//! Run with: cargo test --test feed_lifecycle -- --nocapture

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use anyhow::anyhow;
use bytes::Bytes;
use futures::channel::oneshot;
use futures::executor::LocalPool;

use spark_feed::{
    Delivery, Feed, FeedError, FeedFlags, FeedOptions, FeedState, MemoryEngine, RefcountTable,
    Span,
};

// =============================================================================
// HARNESS
// =============================================================================

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct Harness {
    pool: LocalPool,
    engine: Rc<MemoryEngine>,
    feed: Feed,
}

impl Harness {
    fn new() -> Self {
        Self::with_options(FeedOptions::default().with_name("test"))
    }

    fn with_options(options: FeedOptions) -> Self {
        init_logging();
        let pool = LocalPool::new();
        let engine = Rc::new(MemoryEngine::new());
        let feed = Feed::create(engine.clone(), pool.spawner(), options).unwrap();
        Self { pool, engine, feed }
    }

    fn collect(&self) -> Rc<RefCell<Vec<Bytes>>> {
        let received = Rc::new(RefCell::new(Vec::new()));
        let sink = received.clone();
        let _unsubscribe = self
            .feed
            .on_data(move |bytes| {
                sink.borrow_mut().push(bytes);
                Ok(Delivery::Complete)
            })
            .unwrap();
        received
    }
}

fn texts(received: &RefCell<Vec<Bytes>>) -> Vec<String> {
    received
        .borrow()
        .iter()
        .map(|b| String::from_utf8_lossy(b).into_owned())
        .collect()
}

// =============================================================================
// DELIVERY
// =============================================================================

#[test]
fn test_spans_delivered_in_order_and_released() {
    let h = Harness::new();
    let handle = h.feed.handle();
    let received = h.collect();

    let table = h.engine.publish_state(handle, &[3]);
    let chunk = h.engine.add_chunk(handle, &b"hello world"[..]);
    h.engine.push_span(handle, Span::new(chunk, 0, 0, 5));
    h.engine.push_span(handle, Span::new(chunk, 0, 5, 1));
    h.engine.push_span(handle, Span::new(chunk, 0, 6, 5));
    h.engine.notify_data(handle);

    assert_eq!(texts(&received), vec!["hello", " ", "world"]);
    assert_eq!(table.snapshot(), vec![0]);
    assert_eq!(h.engine.queued(handle), 0);
}

#[test]
fn test_slices_share_chunk_memory() {
    let h = Harness::new();
    let handle = h.feed.handle();
    let received = h.collect();

    let data = Bytes::from_static(b"abcdef");
    let chunk = h.engine.add_chunk(handle, data.clone());
    h.engine.push_span(handle, Span::new(chunk, 0, 2, 3));
    h.engine.notify_data(handle);

    let received = received.borrow();
    let base = data.as_ptr() as usize;
    assert_eq!(received[0].as_ptr() as usize, base + 2);
}

#[test]
fn test_drain_once_respects_capacity() {
    let h = Harness::with_options(FeedOptions::default().with_drain_capacity(2));
    let handle = h.feed.handle();
    let received = h.collect();

    // Spans are queued without DataAvailable so the test drives the drain.
    let chunk = h.engine.add_chunk(handle, vec![7u8; 10]);
    for i in 0..5 {
        h.engine.push_span(handle, Span::new(chunk, 0, i, 1));
    }

    assert_eq!(h.feed.drain_once().unwrap(), 2);
    assert_eq!(received.borrow().len(), 2);
    assert_eq!(h.feed.drain_all().unwrap(), 3);
    assert_eq!(received.borrow().len(), 5);
    assert_eq!(h.feed.drain_once().unwrap(), 0);
}

#[test]
fn test_zero_length_span_is_skipped() {
    let h = Harness::new();
    let handle = h.feed.handle();
    let calls = Rc::new(Cell::new(0));
    let calls_clone = calls.clone();
    let _unsubscribe = h
        .feed
        .on_data(move |_| {
            calls_clone.set(calls_clone.get() + 1);
            Ok(Delivery::Complete)
        })
        .unwrap();

    let table = h.engine.publish_state(handle, &[1]);
    let chunk = h.engine.add_chunk(handle, &b"xyz"[..]);
    h.engine.push_span(handle, Span::new(chunk, 0, 1, 0));
    h.engine.notify_data(handle);

    assert_eq!(calls.get(), 0);
    assert_eq!(table.snapshot(), vec![1]);
}

#[test]
fn test_out_of_bounds_span_is_skipped() {
    let h = Harness::new();
    let handle = h.feed.handle();
    let received = h.collect();

    let table = h.engine.publish_state(handle, &[1]);
    let chunk = h.engine.add_chunk(handle, &b"abcd"[..]);
    h.engine.push_span(handle, Span::new(chunk, 0, 2, 5));

    assert_eq!(h.feed.drain_all().unwrap(), 1);
    assert!(received.borrow().is_empty());
    assert_eq!(table.snapshot(), vec![1]);
}

#[test]
fn test_span_on_unknown_chunk_is_skipped() {
    let h = Harness::new();
    let handle = h.feed.handle();
    let received = h.collect();

    let chunk = h.engine.insert_chunk(&b"never announced"[..]);
    h.engine.push_span(handle, Span::new(chunk, 0, 0, 5));

    assert_eq!(h.feed.drain_all().unwrap(), 1);
    assert!(received.borrow().is_empty());
}

#[test]
fn test_lazy_chunk_views() {
    let h = Harness::with_options(FeedOptions::default().with_eager_chunk_views(false));
    let handle = h.feed.handle();
    let received = h.collect();

    let chunk = h.engine.add_chunk(handle, &b"lazy bytes"[..]);
    assert_eq!(h.feed.cached_chunks(), 1);
    h.engine.push_span(handle, Span::new(chunk, 0, 5, 5));
    h.engine.notify_data(handle);

    assert_eq!(texts(&received), vec!["bytes"]);
}

#[test]
fn test_pending_data_drained_by_first_subscriber() {
    let h = Harness::new();
    let handle = h.feed.handle();

    let chunk = h.engine.add_chunk(handle, &b"early"[..]);
    h.engine.push_span(handle, Span::new(chunk, 0, 0, 5));
    h.engine.notify_data(handle);

    assert!(h.feed.flags().contains(FeedFlags::PENDING_DATA));
    assert_eq!(h.engine.queued(handle), 1);

    let received = h.collect();
    assert_eq!(texts(&received), vec!["early"]);
    assert!(!h.feed.flags().contains(FeedFlags::PENDING_DATA));
    assert_eq!(h.engine.queued(handle), 0);
}

#[test]
fn test_unsubscribed_handler_is_not_called() {
    let h = Harness::new();
    let handle = h.feed.handle();
    let calls = Rc::new(Cell::new(0));
    let calls_clone = calls.clone();
    let unsubscribe = h
        .feed
        .on_data(move |_| {
            calls_clone.set(calls_clone.get() + 1);
            Ok(Delivery::Complete)
        })
        .unwrap();

    let chunk = h.engine.add_chunk(handle, &b"ab"[..]);
    h.engine.push_span(handle, Span::new(chunk, 0, 0, 1));
    h.engine.notify_data(handle);
    assert_eq!(calls.get(), 1);

    unsubscribe();
    h.engine.push_span(handle, Span::new(chunk, 0, 1, 1));
    h.engine.notify_data(handle);
    assert_eq!(calls.get(), 1);
    assert!(h.feed.flags().contains(FeedFlags::PENDING_DATA));
}

// =============================================================================
// HANDLER ERRORS
// =============================================================================

#[test]
fn test_handler_error_does_not_stop_siblings() {
    let h = Harness::new();
    let handle = h.feed.handle();

    let _failing = h.feed.on_data(|_| Err(anyhow!("boom"))).unwrap();
    let received = h.collect();

    let table = h.engine.publish_state(handle, &[2]);
    let chunk = h.engine.add_chunk(handle, &b"ok!"[..]);
    h.engine.push_span(handle, Span::new(chunk, 0, 0, 2));
    h.engine.push_span(handle, Span::new(chunk, 0, 2, 1));

    let err = h.feed.drain_all().unwrap_err();
    assert!(matches!(err, FeedError::Handler(_)));
    assert!(err.to_string().contains("boom"));

    // The failing batch was still delivered in full.
    assert_eq!(texts(&received), vec!["ok", "!"]);
    assert_eq!(table.snapshot(), vec![0]);
}

#[test]
fn test_pending_drain_error_is_logged_not_returned() {
    let h = Harness::new();
    let handle = h.feed.handle();

    let chunk = h.engine.add_chunk(handle, &b"late"[..]);
    h.engine.push_span(handle, Span::new(chunk, 0, 0, 4));
    h.engine.notify_data(handle);

    let calls = Rc::new(Cell::new(0));
    let calls_clone = calls.clone();
    let subscribed = h.feed.on_data(move |_| {
        calls_clone.set(calls_clone.get() + 1);
        Err(anyhow!("late failure"))
    });

    // The subscription itself succeeds; the failure only reaches the log.
    assert!(subscribed.is_ok());
    assert_eq!(calls.get(), 1);
    assert!(!h.feed.flags().contains(FeedFlags::PENDING_DATA));
    assert_eq!(h.engine.queued(handle), 0);
}

#[test]
fn test_error_events_fan_out() {
    let h = Harness::new();
    let handle = h.feed.handle();
    let first = Rc::new(RefCell::new(Vec::new()));
    let second = Rc::new(RefCell::new(Vec::new()));

    let first_clone = first.clone();
    let unsubscribe = h
        .feed
        .on_error(move |code| first_clone.borrow_mut().push(code))
        .unwrap();
    let second_clone = second.clone();
    let _keep = h
        .feed
        .on_error(move |code| second_clone.borrow_mut().push(code))
        .unwrap();

    h.engine.emit_error(handle, -5);
    unsubscribe();
    h.engine.emit_error(handle, 9);

    assert_eq!(*first.borrow(), vec![-5]);
    assert_eq!(*second.borrow(), vec![-5, 9]);
}

// =============================================================================
// DEFERRED HANDLERS
// =============================================================================

type Gates = Rc<RefCell<Vec<oneshot::Sender<()>>>>;

fn subscribe_gated(feed: &Feed, gate_on: &'static [u8]) -> Gates {
    let gates: Gates = Rc::new(RefCell::new(Vec::new()));
    let gates_clone = gates.clone();
    let _unsubscribe = feed
        .on_data(move |bytes| {
            if bytes.as_ref() != gate_on {
                return Ok(Delivery::Complete);
            }
            let (tx, rx) = oneshot::channel();
            gates_clone.borrow_mut().push(tx);
            Ok(Delivery::deferred(async move {
                rx.await?;
                Ok(())
            }))
        })
        .unwrap();
    gates
}

fn open_gates(gates: &Gates) {
    for tx in gates.borrow_mut().drain(..) {
        let _ = tx.send(());
    }
}

#[test]
fn test_deferred_handler_holds_chunk_reader() {
    let mut h = Harness::new();
    let handle = h.feed.handle();
    let gates = subscribe_gated(&h.feed, b"a");

    let table = h.engine.publish_state(handle, &[2]);
    let chunk = h.engine.add_chunk(handle, &b"ab"[..]);
    h.engine.push_span(handle, Span::new(chunk, 0, 0, 1));
    h.engine.push_span(handle, Span::new(chunk, 0, 1, 1));
    h.engine.notify_data(handle);

    // "b" completed synchronously, "a" is still in flight.
    assert_eq!(table.get(0), Some(1));
    assert_eq!(h.feed.pending_async_handlers(), 1);

    h.pool.run_until_stalled();
    assert_eq!(table.get(0), Some(1));

    open_gates(&gates);
    h.pool.run_until_stalled();
    assert_eq!(table.get(0), Some(0));
    assert_eq!(h.feed.pending_async_handlers(), 0);
}

#[test]
fn test_failed_deferred_work_still_releases() {
    let mut h = Harness::new();
    let handle = h.feed.handle();
    let gates = subscribe_gated(&h.feed, b"z");

    let table = h.engine.publish_state(handle, &[1]);
    let chunk = h.engine.add_chunk(handle, &b"z"[..]);
    h.engine.push_span(handle, Span::new(chunk, 0, 0, 1));
    h.engine.notify_data(handle);
    assert_eq!(table.get(0), Some(1));

    // Dropping the sender makes the deferred work fail.
    gates.borrow_mut().clear();
    h.pool.run_until_stalled();
    assert_eq!(table.get(0), Some(0));
}

#[test]
fn test_close_waits_for_deferred_handlers() {
    let mut h = Harness::new();
    let handle = h.feed.handle();
    let gates = subscribe_gated(&h.feed, b"q");

    let chunk = h.engine.add_chunk(handle, &b"q"[..]);
    h.engine.push_span(handle, Span::new(chunk, 0, 0, 1));
    h.engine.notify_data(handle);

    h.feed.close();
    assert_eq!(h.feed.state(), FeedState::Closing);
    h.pool.run_until_stalled();
    assert_eq!(h.engine.stats().closes, 0);
    assert!(h.engine.is_live(handle));

    open_gates(&gates);
    h.pool.run_until_stalled();
    assert!(h.feed.is_destroyed());
    assert_eq!(h.engine.stats().closes, 1);
    assert_eq!(h.engine.stats().destroys, 1);
}

#[test]
fn test_drop_waits_for_deferred_handlers() {
    let Harness { mut pool, engine, feed } = Harness::new();
    let handle = feed.handle();
    let gates = subscribe_gated(&feed, b"d");

    let table = engine.publish_state(handle, &[1]);
    let chunk = engine.add_chunk(handle, &b"d"[..]);
    engine.push_span(handle, Span::new(chunk, 0, 0, 1));
    engine.notify_data(handle);
    assert_eq!(feed.pending_async_handlers(), 1);

    drop(feed);
    pool.run_until_stalled();
    assert_eq!(engine.stats().closes, 0);
    assert_eq!(engine.stats().destroys, 0);
    assert!(engine.is_live(handle));
    assert_eq!(table.get(0), Some(1));

    open_gates(&gates);
    pool.run_until_stalled();
    assert_eq!(table.get(0), Some(0));
    assert_eq!(engine.stats().closes, 1);
    assert_eq!(engine.stats().destroys, 1);
    assert!(!engine.is_live(handle));
}

// =============================================================================
// CLOSE
// =============================================================================

#[test]
fn test_close_is_idempotent() {
    let h = Harness::new();
    let handle = h.feed.handle();

    h.feed.close();
    h.feed.close();
    h.feed.clone().close();

    let stats = h.engine.stats();
    assert_eq!(stats.closes, 1);
    assert_eq!(stats.destroys, 1);
    assert_eq!(stats.unregisters, 1);
    assert!(!h.engine.is_live(handle));
    assert_eq!(h.feed.state(), FeedState::Destroyed);
}

#[test]
fn test_destroyed_feed_rejects_subscriptions() {
    let h = Harness::new();
    h.feed.close();

    assert!(matches!(
        h.feed.on_data(|_| Ok(Delivery::Complete)),
        Err(FeedError::Destroyed)
    ));
    assert!(matches!(h.feed.on_error(|_| {}), Err(FeedError::Destroyed)));
    assert_eq!(h.feed.drain_once().unwrap(), 0);
    assert_eq!(h.feed.drain_all().unwrap(), 0);
}

#[test]
fn test_close_from_handler_defers_finalize() {
    let mut h = Harness::new();
    let handle = h.feed.handle();
    let received = Rc::new(RefCell::new(Vec::new()));

    let feed = h.feed.clone();
    let sink = received.clone();
    let _unsubscribe = h
        .feed
        .on_data(move |bytes| {
            sink.borrow_mut().push(bytes);
            feed.close();
            Ok(Delivery::Complete)
        })
        .unwrap();

    let chunk = h.engine.add_chunk(handle, &b"123"[..]);
    for i in 0..3 {
        h.engine.push_span(handle, Span::new(chunk, 0, i, 1));
    }
    h.engine.notify_data(handle);

    // Rest of the batch dropped; stream still alive until the retry runs.
    assert_eq!(received.borrow().len(), 1);
    assert!(!h.feed.is_destroyed());
    assert_eq!(h.feed.state(), FeedState::Closing);
    assert_eq!(h.engine.stats().closes, 0);

    h.engine.push_span(handle, Span::new(chunk, 0, 0, 1));
    assert_eq!(h.feed.drain_once().unwrap(), 0);
    assert_eq!(received.borrow().len(), 1);

    h.pool.run_until_stalled();
    assert!(h.feed.is_destroyed());
    assert_eq!(h.engine.stats().closes, 1);
    assert_eq!(h.engine.stats().destroys, 1);
}

#[test]
fn test_close_during_direct_drain_defers_finalize() {
    let mut h = Harness::new();
    let handle = h.feed.handle();
    let received = Rc::new(RefCell::new(Vec::new()));
    let saw_callback_flag = Rc::new(Cell::new(false));

    let feed = h.feed.clone();
    let sink = received.clone();
    let saw = saw_callback_flag.clone();
    let _unsubscribe = h
        .feed
        .on_data(move |bytes| {
            saw.set(saw.get() || feed.flags().contains(FeedFlags::IN_CALLBACK));
            sink.borrow_mut().push(bytes);
            if sink.borrow().len() == 2 {
                feed.close();
            }
            Ok(Delivery::Complete)
        })
        .unwrap();

    // No DataAvailable: the drain is driven from outside any native callback.
    let chunk = h.engine.add_chunk(handle, &b"wxyz"[..]);
    for i in 0..4 {
        h.engine.push_span(handle, Span::new(chunk, 0, i, 1));
    }

    assert_eq!(h.feed.drain_all().unwrap(), 4);
    assert!(!saw_callback_flag.get());
    assert_eq!(texts(&received), vec!["w", "x"]);
    assert!(!h.feed.is_destroyed());
    assert_eq!(h.feed.state(), FeedState::Closing);
    assert_eq!(h.engine.stats().closes, 0);

    h.pool.run_until_stalled();
    assert!(h.feed.is_destroyed());
    assert_eq!(h.engine.stats().closes, 1);
    assert_eq!(h.engine.stats().destroys, 1);
}

#[test]
fn test_close_failure_keeps_stream_usable() {
    let h = Harness::new();
    let handle = h.feed.handle();
    let received = h.collect();

    h.engine.set_close_status(7);
    h.feed.close();
    assert_eq!(h.feed.state(), FeedState::Active);
    assert!(h.engine.is_live(handle));

    let chunk = h.engine.add_chunk(handle, &b"still here"[..]);
    h.engine.push_span(handle, Span::new(chunk, 0, 0, 5));
    h.engine.notify_data(handle);
    assert_eq!(texts(&received), vec!["still"]);

    h.engine.set_close_status(0);
    h.feed.close();
    assert!(h.feed.is_destroyed());
    assert_eq!(h.engine.stats().closes, 2);
    assert_eq!(h.engine.stats().destroys, 1);
}

#[test]
fn test_native_closed_event_then_close() {
    let h = Harness::new();
    let handle = h.feed.handle();

    h.engine.emit_closed(handle);
    assert_eq!(h.feed.state(), FeedState::Closed);

    h.feed.close();
    assert!(h.feed.is_destroyed());
    assert_eq!(h.engine.stats().closes, 1);
    assert_eq!(h.engine.stats().destroys, 1);
}

#[test]
fn test_drop_releases_stream() {
    init_logging();
    let pool = LocalPool::new();
    let engine = Rc::new(MemoryEngine::new());
    let feed = Feed::create(engine.clone(), pool.spawner(), FeedOptions::default()).unwrap();
    let handle = feed.handle();

    drop(feed);
    assert!(!engine.is_live(handle));
    assert_eq!(engine.stats().closes, 1);
    assert_eq!(engine.stats().destroys, 1);
}

// =============================================================================
// CREATE / ATTACH
// =============================================================================

#[test]
fn test_null_handle_fails_create() {
    init_logging();
    let pool = LocalPool::new();
    let engine = Rc::new(MemoryEngine::new());
    engine.fail_next_create();

    let err = Feed::create(engine.clone(), pool.spawner(), FeedOptions::default()).unwrap_err();
    assert!(matches!(err, FeedError::Create));
    assert_eq!(engine.stats().registers, 0);
}

#[test]
fn test_failed_attach_rolls_back() {
    init_logging();
    let pool = LocalPool::new();
    let engine = Rc::new(MemoryEngine::new());
    let handle = engine.open_stream();
    engine.set_attach_status(1);

    let err = Feed::attach(engine.clone(), handle, pool.spawner(), FeedOptions::default())
        .unwrap_err();
    assert_eq!(err.status(), Some(1));

    let stats = engine.stats();
    assert_eq!(stats.registers, 1);
    assert_eq!(stats.unregisters, 1);
    assert_eq!(stats.destroys, 1);
    assert_eq!(stats.closes, 0);
    assert!(!engine.is_live(handle));

    // Nothing is listening anymore.
    engine.notify_data(handle);
    engine.emit_error(handle, 3);
}

#[test]
fn test_attach_to_existing_stream() {
    init_logging();
    let pool = LocalPool::new();
    let engine = Rc::new(MemoryEngine::new());
    let handle = engine.open_stream();

    let feed = Feed::attach(engine.clone(), handle, pool.spawner(), FeedOptions::default())
        .unwrap();
    assert_eq!(feed.handle(), handle);
    assert!(engine.is_registered(handle));
    assert_eq!(engine.stats().creates, 0);

    feed.close();
    assert!(!engine.is_registered(handle));
}
