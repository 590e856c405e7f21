//! Integration tests for the buffered reader and writer.
//!
//! Strict buffering must never lose a message; latest-wins buffering
//! must never show an old one. The writer's two-slot ring must let a
//! producer keep filling while the previous slot is in flight.

use setu::{Bundle, Port, ReaderBuffer, WriterBuffer};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

fn bundle_of(values: &[i32]) -> Bundle {
    let mut b = Bundle::new();
    for v in values {
        b.push_i32(*v);
    }
    b
}

#[test]
fn test_strict_buffering_yields_every_message_in_order() {
    init_logs();
    let tx = Port::open("/buf/strict/tx").expect("open sender");
    let rx = Port::open("/buf/strict/rx").expect("open receiver");
    rx.set_timeout(Some(Duration::from_secs(5)));

    let mut reader = ReaderBuffer::strict();
    reader.attach(&rx).expect("attach");
    assert!(tx.add_output(&rx.contact()));

    // Three bundles of three values each, sent before any read
    for i in 0..3 {
        assert!(tx.write(&bundle_of(&[i, i + 10, i + 20])));
    }
    assert_eq!(reader.pending_reads(), 3);

    for i in 0..3 {
        let got = reader.read().expect("strict read");
        assert_eq!(got.len(), 3, "each read yields one whole bundle");
        assert_eq!(got, bundle_of(&[i, i + 10, i + 20]), "in send order");
    }
    assert_eq!(reader.pending_reads(), 0);
}

#[test]
fn test_latest_wins_keeps_only_newest() {
    init_logs();
    let tx = Port::open("/buf/latest/tx").expect("open sender");
    let rx = Port::open("/buf/latest/rx").expect("open receiver");
    rx.set_timeout(Some(Duration::from_secs(5)));

    let mut reader = ReaderBuffer::latest();
    reader.attach(&rx).expect("attach");
    assert!(tx.add_output(&rx.contact()));

    for i in 0..5 {
        assert!(tx.write(&bundle_of(&[i])));
    }
    // The slow consumer sees only the most recent write
    assert_eq!(reader.pending_reads(), 1);
    assert_eq!(reader.read(), Some(bundle_of(&[4])));
}

#[test]
fn test_strict_bounded_backpressures_producer() {
    init_logs();
    let tx = Port::open("/buf/bp/tx").expect("open sender");
    let rx = Port::open("/buf/bp/rx").expect("open receiver");
    rx.set_timeout(Some(Duration::from_secs(10)));

    let mut reader = ReaderBuffer::strict_bounded(1);
    reader.attach(&rx).expect("attach");
    assert!(tx.add_output(&rx.contact()));

    assert!(tx.write(&bundle_of(&[1])));
    assert!(wait_until(Duration::from_secs(2), || {
        reader.pending_reads() == 1
    }));

    // The second write cannot complete until the queue drains; it must
    // block rather than overwrite.
    let sender = thread::spawn(move || {
        let ok = tx.write(&bundle_of(&[2]));
        (tx, ok)
    });
    thread::sleep(Duration::from_millis(200));
    assert_eq!(reader.pending_reads(), 1, "nothing was overwritten");

    assert_eq!(reader.read(), Some(bundle_of(&[1])));
    let (_tx, ok) = sender.join().expect("sender thread");
    assert!(ok, "the blocked write completed after the drain");
    assert_eq!(reader.read(), Some(bundle_of(&[2])));
}

#[test]
fn test_callback_mode_delivers_synchronously() {
    init_logs();
    let tx = Port::open("/buf/cb/tx").expect("open sender");
    let rx = Port::open("/buf/cb/rx").expect("open receiver");

    let seen: Arc<parking_lot::Mutex<Vec<Bundle>>> =
        Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);

    let mut reader = ReaderBuffer::strict();
    reader.use_callback(move |bundle, _envelope, _from| {
        sink.lock().push(bundle);
    });
    reader.attach(&rx).expect("attach");
    assert!(tx.add_output(&rx.contact()));

    for i in 0..3 {
        assert!(tx.write(&bundle_of(&[i])));
    }
    assert!(wait_until(Duration::from_secs(5), || seen.lock().len() == 3));
    assert_eq!(seen.lock()[2], bundle_of(&[2]));

    // Push mode has no pull queue
    assert_eq!(reader.pending_reads(), 0);
    assert_eq!(reader.read(), None);
}

#[test]
fn test_disable_callback_reverts_to_pull() {
    init_logs();
    let tx = Port::open("/buf/cboff/tx").expect("open sender");
    let rx = Port::open("/buf/cboff/rx").expect("open receiver");
    rx.set_timeout(Some(Duration::from_secs(5)));

    let seen: Arc<parking_lot::Mutex<Vec<Bundle>>> =
        Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);

    let mut reader = ReaderBuffer::strict();
    reader.use_callback(move |bundle, _envelope, _from| {
        sink.lock().push(bundle);
    });
    reader.attach(&rx).expect("attach");
    assert!(tx.add_output(&rx.contact()));

    assert!(tx.write(&bundle_of(&[1])));
    assert!(wait_until(Duration::from_secs(5), || seen.lock().len() == 1));

    // After disabling, arrivals queue for read() instead
    reader.disable_callback();
    assert!(tx.write(&bundle_of(&[2])));
    assert_eq!(reader.read(), Some(bundle_of(&[2])));
    assert_eq!(seen.lock().len(), 1, "callback no longer fires");
}

#[test]
fn test_disable_callback_without_attach_is_safe() {
    init_logs();
    let mut reader = ReaderBuffer::strict();
    reader.disable_callback();

    let mut reader = ReaderBuffer::latest();
    reader.use_callback(|_, _, _| {});
    reader.disable_callback();
}

#[test]
fn test_callback_lock_serializes_against_delivery() {
    init_logs();
    let tx = Port::open("/buf/cblock/tx").expect("open sender");
    let rx = Port::open("/buf/cblock/rx").expect("open receiver");

    let seen: Arc<parking_lot::Mutex<Vec<Bundle>>> =
        Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);

    let mut reader = ReaderBuffer::strict();
    reader.use_callback(move |bundle, _envelope, _from| {
        sink.lock().push(bundle);
    });
    reader.attach(&rx).expect("attach");
    assert!(tx.add_output(&rx.contact()));

    // While the callback lock is held, no callback can run. The write
    // happens on its own thread because it blocks until the receiver
    // acknowledges, which requires the callback to have run.
    let guard = rx.lock_callback();
    let sender = thread::spawn(move || {
        let ok = tx.write(&bundle_of(&[1]));
        (tx, ok)
    });
    thread::sleep(Duration::from_millis(150));
    assert_eq!(seen.lock().len(), 0, "delivery waits for the lock");

    drop(guard);
    let (_tx, ok) = sender.join().expect("sender thread");
    assert!(ok);
    assert_eq!(seen.lock().len(), 1);
}

#[test]
fn test_writer_buffer_synchronous() {
    init_logs();
    let tx = Port::open("/buf/wsync/tx").expect("open sender");
    let rx = Port::open("/buf/wsync/rx").expect("open receiver");
    rx.set_timeout(Some(Duration::from_secs(5)));
    assert!(tx.add_output(&rx.contact()));

    let mut writer = WriterBuffer::new(&tx);
    {
        let mut slot = writer.prepare();
        slot.clear();
        slot.push_str("sync").push_i32(1);
    }
    assert!(writer.write());
    assert!(!writer.is_writing());

    let got = rx.read(false).expect("message");
    assert_eq!(got.get(0).unwrap().as_str(), Some("sync"));
}

#[test]
fn test_writer_buffer_background() {
    init_logs();
    let tx = Port::open("/buf/wbg/tx").expect("open sender");
    let rx = Port::open("/buf/wbg/rx").expect("open receiver");
    rx.set_timeout(Some(Duration::from_secs(5)));
    assert!(tx.add_output(&rx.contact()));

    let mut writer = WriterBuffer::background(&tx).expect("background writer");
    {
        let mut slot = writer.prepare();
        slot.clear();
        slot.push_str("bg").push_i32(1);
    }
    assert!(writer.write(), "background write returns immediately");

    // Completion is observable through is_writing()
    assert!(wait_until(Duration::from_secs(5), || !writer.is_writing()));
    let got = rx.read(false).expect("message");
    assert_eq!(got.get(0).unwrap().as_str(), Some("bg"));

    // The other slot is free while the first flushes; poll before reuse
    {
        let mut slot = writer.prepare();
        slot.clear();
        slot.push_str("bg").push_i32(2);
    }
    assert!(wait_until(Duration::from_secs(5), || writer.write()));
    assert!(wait_until(Duration::from_secs(5), || !writer.is_writing()));
    let got = rx.read(false).expect("second message");
    assert_eq!(got.get(1).unwrap().as_i32(), Some(2));
}

#[test]
fn test_reader_detach_restores_port_queue() {
    init_logs();
    let tx = Port::open("/buf/detach/tx").expect("open sender");
    let rx = Port::open("/buf/detach/rx").expect("open receiver");
    rx.set_timeout(Some(Duration::from_secs(5)));
    assert!(tx.add_output(&rx.contact()));

    let mut reader = ReaderBuffer::latest();
    reader.attach(&rx).expect("attach");
    assert!(tx.write(&bundle_of(&[1])));
    assert_eq!(reader.read(), Some(bundle_of(&[1])));

    // After detach, Port::read consumes directly again
    reader.detach();
    assert!(tx.write(&bundle_of(&[2])));
    assert_eq!(rx.read(false), Some(bundle_of(&[2])));
}

#[test]
fn test_interrupt_unblocks_buffered_read() {
    init_logs();
    let rx = Arc::new(Port::open("/buf/wake/rx").expect("open receiver"));
    let mut reader = ReaderBuffer::strict();
    reader.attach(&rx).expect("attach");

    let port = Arc::clone(&rx);
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        port.interrupt();
    });
    let start = Instant::now();
    assert_eq!(reader.read(), None, "interrupted read returns nothing");
    assert!(start.elapsed() < Duration::from_secs(2));
    handle.join().expect("interrupter thread");
}
