//! Integration tests for the tagged command protocol and the admin
//! side-channel, exercised over real loopback connections.

use setu::bundle::vocab;
use setu::rpc::{Dispatcher, Method, Param, RpcClient};
use setu::admin::DefaultAdminHandler;
use setu::{Bundle, Port, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
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

/// A server port running a dispatcher on its own thread until stopped
struct Server {
    port: Arc<Port>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Server {
    fn start(name: &str, mut dispatcher: Dispatcher) -> Server {
        let port = Arc::new(Port::open(name).expect("open server port"));
        let running = Arc::new(AtomicBool::new(true));
        let serve_port = Arc::clone(&port);
        let serve_flag = Arc::clone(&running);
        let thread = thread::spawn(move || {
            dispatcher.serve_while(&serve_port, &serve_flag);
        });
        Server {
            port,
            running,
            thread: Some(thread),
        }
    }

    fn contact(&self) -> setu::Contact {
        self.port.contact()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.port.interrupt();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn speed_dispatcher(calls: Arc<AtomicUsize>) -> Dispatcher {
    let mut dispatcher = Dispatcher::new();
    dispatcher
        .add(
            Method::new("set_speed")
                .param(Param::f64("speed"))
                .param(Param::i32("ramp").with_default(Value::Int32(100)))
                .help("set wheel speed with optional ramp time")
                .handler(move |args| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let speed = args[0].as_f64().unwrap();
                    let ramp = args[1].as_i32().unwrap();
                    Ok(Some(Value::Str(format!("{}@{}", speed, ramp))))
                }),
        )
        .expect("register set_speed");
    dispatcher
}

#[test]
fn test_rpc_request_reply() {
    init_logs();
    let calls = Arc::new(AtomicUsize::new(0));
    let server = Server::start("/rpc/basic/server", speed_dispatcher(Arc::clone(&calls)));

    let port = Port::open("/rpc/basic/client").expect("open client");
    port.set_timeout(Some(Duration::from_secs(5)));
    assert!(port.add_output(&server.contact()));

    let client = RpcClient::new(&port);
    let reply = client
        .call("set_speed", &[Value::Float64(0.5), Value::Int32(50)])
        .expect("call succeeds");
    assert_eq!(reply.get(0).unwrap().as_str(), Some("0.5@50"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_rpc_omitted_default_equals_explicit() {
    init_logs();
    let calls = Arc::new(AtomicUsize::new(0));
    let server = Server::start("/rpc/def/server", speed_dispatcher(calls));

    let port = Port::open("/rpc/def/client").expect("open client");
    port.set_timeout(Some(Duration::from_secs(5)));
    assert!(port.add_output(&server.contact()));
    let client = RpcClient::new(&port);

    let defaulted = client
        .call("set_speed", &[Value::Float64(0.25)])
        .expect("defaulted call");
    let explicit = client
        .call("set_speed", &[Value::Float64(0.25), Value::Int32(100)])
        .expect("explicit call");
    assert_eq!(defaulted, explicit, "omitting a default changes nothing");
}

#[test]
fn test_rpc_void_reply_is_synchronization_frame() {
    init_logs();
    let stops = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&stops);
    let mut dispatcher = Dispatcher::new();
    dispatcher
        .add(Method::new("halt").handler(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        }))
        .expect("register halt");
    let server = Server::start("/rpc/void/server", dispatcher);

    let port = Port::open("/rpc/void/client").expect("open client");
    port.set_timeout(Some(Duration::from_secs(5)));
    assert!(port.add_output(&server.contact()));

    // The zero-length reply still arrives; the call does not hang
    let reply = RpcClient::new(&port).call("halt", &[]).expect("void call");
    assert!(reply.is_empty());
    assert_eq!(stops.load(Ordering::SeqCst), 1);
}

#[test]
fn test_rpc_oneway_keeps_connection_usable() {
    init_logs();
    let pings = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&pings);
    let mut dispatcher = Dispatcher::new();
    dispatcher
        .add(Method::new("ping").oneway().handler(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        }))
        .expect("register ping");
    dispatcher
        .add(
            Method::new("count")
                .handler(|_| Ok(Some(Value::Int32(1)))),
        )
        .expect("register count");
    let server = Server::start("/rpc/oneway/server", dispatcher);

    let port = Port::open("/rpc/oneway/client").expect("open client");
    port.set_timeout(Some(Duration::from_secs(5)));
    assert!(port.add_output(&server.contact()));
    let client = RpcClient::new(&port);

    client.call_oneway("ping", &[]).expect("one-way send");
    assert!(wait_until(Duration::from_secs(5), || {
        pings.load(Ordering::SeqCst) == 1
    }));

    // The frame boundary was acknowledged; a normal call still works
    let reply = client.call("count", &[]).expect("follow-up call");
    assert_eq!(reply.get(0).unwrap().as_i32(), Some(1));
}

#[test]
fn test_rpc_unknown_tag_fails_but_connection_survives() {
    init_logs();
    let calls = Arc::new(AtomicUsize::new(0));
    let server = Server::start("/rpc/unk/server", speed_dispatcher(calls));

    let port = Port::open("/rpc/unk/client").expect("open client");
    port.set_timeout(Some(Duration::from_secs(5)));
    assert!(port.add_output(&server.contact()));
    let client = RpcClient::new(&port);

    let err = client.call("warp", &[]).expect_err("unknown tag fails");
    assert!(err.to_string().contains("help"), "error suggests help");

    let reply = client
        .call("set_speed", &[Value::Float64(1.0)])
        .expect("connection still usable");
    assert_eq!(reply.get(0).unwrap().as_str(), Some("1@100"));
}

#[test]
fn test_rpc_multi_word_tag_over_wire() {
    init_logs();
    let calls = Arc::new(AtomicUsize::new(0));
    let server = Server::start("/rpc/words/server", speed_dispatcher(calls));

    let port = Port::open("/rpc/words/client").expect("open client");
    port.set_timeout(Some(Duration::from_secs(5)));
    assert!(port.add_output(&server.contact()));

    // "set speed 0.5" as bare tokens resolves the set_speed method
    let mut frame = Bundle::new();
    frame.push_str("set").push_str("speed").push_f64(0.5);
    let reply = port.call(&frame).expect("multi-word call");
    assert_eq!(reply.get(0).unwrap().as_str(), Some("0.5@100"));
}

#[test]
fn test_rpc_help_lists_all_tags() {
    init_logs();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut dispatcher = speed_dispatcher(calls);
    dispatcher
        .add(Method::new("halt").handler(|_| Ok(None)))
        .expect("register halt");
    let server = Server::start("/rpc/help/server", dispatcher);

    let port = Port::open("/rpc/help/client").expect("open client");
    port.set_timeout(Some(Duration::from_secs(5)));
    assert!(port.add_output(&server.contact()));

    // The server has no admin handler, so "help" reaches the
    // dispatcher's universal fallback.
    let mut frame = Bundle::new();
    frame.push_str("help");
    let listing = port.call(&frame).expect("help call");
    let text = listing.to_text();
    assert!(text.contains("set_speed"));
    assert!(text.contains("halt"));
}

#[test]
fn test_rpc_timeout_leaves_connection_usable() {
    init_logs();
    let server = Arc::new(Port::open("/rpc/slow/server").expect("open server"));
    let serve = Arc::clone(&server);
    let handle = thread::spawn(move || {
        // First request is answered too late, second promptly
        let first = serve.read(true).expect("first request");
        thread::sleep(Duration::from_millis(600));
        serve.reply(&first);
        let second = serve.read(true).expect("second request");
        serve.reply(&second);
    });

    let port = Port::open("/rpc/slow/client").expect("open client");
    assert!(port.add_output(&server.contact()));

    let mut first = Bundle::new();
    first.push_str("one");
    let mut second = Bundle::new();
    second.push_str("two");

    port.set_timeout(Some(Duration::from_millis(200)));
    assert!(port.call(&first).is_err(), "late reply times out");

    // The late reply is discarded, not mistaken for the next answer
    port.set_timeout(Some(Duration::from_secs(5)));
    let reply = port.call(&second).expect("second call");
    assert_eq!(reply, second);
    handle.join().expect("server thread");
}

#[test]
fn test_rpc_over_oneway_carrier_fails_fast() {
    init_logs();
    let tx = Port::open("/rpc/dgram/tx").expect("open sender");
    let rx = Port::open("/rpc/dgram/rx").expect("open receiver");
    assert!(tx.add_output(&rx.contact().with_carrier("dgram")));

    let mut frame = Bundle::new();
    frame.push_str("anyone");
    let start = Instant::now();
    assert!(tx.call(&frame).is_err(), "no reply channel, no blocking");
    assert!(start.elapsed() < Duration::from_secs(1));

    // Plain writes still flow
    assert!(tx.write(&frame));
}

#[test]
fn test_reply_discipline() {
    init_logs();
    let server = Port::open("/rpc/disc/server").expect("open server");
    server.set_timeout(Some(Duration::from_secs(5)));

    // reply() with no pending request is a no-op returning false
    let mut resp = Bundle::new();
    resp.push_str("answer");
    assert!(!server.reply(&resp));

    let client = Port::open("/rpc/disc/client").expect("open client");
    client.set_timeout(Some(Duration::from_secs(5)));
    assert!(client.add_output(&server.contact()));

    let mut request = Bundle::new();
    request.push_str("question");
    let caller = thread::spawn(move || {
        let reply = client.call(&request);
        (client, reply)
    });

    let got = server.read(true).expect("request arrives");
    assert_eq!(got.get(0).unwrap().as_str(), Some("question"));
    assert!(server.reply(&resp), "first reply goes through");
    assert!(!server.reply(&resp), "second reply for one request fails");

    let (_client, reply) = caller.join().expect("caller thread");
    assert_eq!(reply.expect("reply"), resp);
}

#[test]
fn test_unreplied_request_resolves_empty() {
    init_logs();
    let server = Port::open("/rpc/noreply/server").expect("open server");
    server.set_timeout(Some(Duration::from_secs(5)));
    let client = Port::open("/rpc/noreply/client").expect("open client");
    client.set_timeout(Some(Duration::from_secs(5)));
    assert!(client.add_output(&server.contact()));

    let mut request = Bundle::new();
    request.push_str("fire");
    let caller = thread::spawn(move || {
        let reply = client.call(&request);
        (client, reply)
    });

    // Consuming the request without will_reply drops the reply slot;
    // the caller gets an empty reply instead of hanging.
    server.read(false).expect("request arrives");
    let (_client, reply) = caller.join().expect("caller thread");
    assert!(reply.expect("empty reply").is_empty());
}

#[test]
fn test_admin_frames_hidden_from_reader_when_handled() {
    init_logs();
    let server = Port::open("/adm/iso/server").expect("open server");
    server.set_admin_handler(Box::new(DefaultAdminHandler));
    let client = Port::open("/adm/iso/client").expect("open client");
    client.set_timeout(Some(Duration::from_secs(5)));
    assert!(client.add_output(&server.contact()));

    let mut frame = Bundle::new();
    frame.push_str("help");
    let reply = client.call(&frame).expect("admin help");
    assert!(reply.to_text().contains("add"), "help text lists commands");

    // The application reader never saw the admin frame
    assert_eq!(server.pending_reads(), 0);
}

#[test]
fn test_admin_frames_fall_through_without_handler() {
    init_logs();
    let server = Port::open("/adm/fall/server").expect("open server");
    server.set_timeout(Some(Duration::from_secs(5)));
    let client = Port::open("/adm/fall/client").expect("open client");
    assert!(client.add_output(&server.contact()));

    let mut frame = Bundle::new();
    frame.push_str("help");
    assert!(client.write(&frame));

    // No admin handler: the reader observes the frame like any other
    let got = server.read(false).expect("frame falls through");
    assert_eq!(got.get(0).unwrap().as_str(), Some("help"));
}

#[test]
fn test_admin_ver_and_list() {
    init_logs();
    let server = Port::open("/adm/ver/server").expect("open server");
    server.set_admin_handler(Box::new(DefaultAdminHandler));
    let client = Port::open("/adm/ver/client").expect("open client");
    client.set_timeout(Some(Duration::from_secs(5)));
    assert!(client.add_output(&server.contact()));

    let mut frame = Bundle::new();
    frame.push_str("ver");
    let reply = client.call(&frame).expect("ver");
    assert_eq!(reply.get(0).unwrap().as_vocab(), Some(vocab(b"ver")));
    assert!(reply.get(1).unwrap().as_i32().is_some());

    let mut frame = Bundle::new();
    frame.push_str("list").push_str("in");
    let reply = client.call(&frame).expect("list in");
    let names = reply.to_text();
    assert!(names.contains("/adm/ver/client"), "we are listed: {}", names);
}

#[test]
fn test_admin_add_del_drive_connections() {
    init_logs();
    let hub = Port::open("/adm/wire/hub").expect("open hub");
    hub.set_admin_handler(Box::new(DefaultAdminHandler));
    let target = Port::open("/adm/wire/target").expect("open target");
    let controller = Port::open("/adm/wire/ctl").expect("open controller");
    controller.set_timeout(Some(Duration::from_secs(5)));
    assert!(controller.add_output(&hub.contact()));

    let events = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&events);
    hub.add_reporter(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    // Remote "add" behaves exactly like a local add_output
    let mut frame = Bundle::new();
    frame.push_str("add").push_str("/adm/wire/target");
    let reply = controller.call(&frame).expect("admin add");
    assert_eq!(reply.get(0).unwrap().as_vocab(), Some(vocab(b"ok")));
    assert_eq!(hub.output_count(), 1);
    assert!(wait_until(Duration::from_secs(2), || target.input_count() == 1));
    assert!(events.load(Ordering::SeqCst) >= 1, "reporter saw the add");

    // And "del" like a local remove_output
    let mut frame = Bundle::new();
    frame.push_str("del").push_str("/adm/wire/target");
    let reply = controller.call(&frame).expect("admin del");
    assert_eq!(reply.get(0).unwrap().as_vocab(), Some(vocab(b"ok")));
    assert_eq!(hub.output_count(), 0);

    // Unknown target reports failure, not silence
    let mut frame = Bundle::new();
    frame.push_str("del").push_str("/adm/wire/nobody");
    let reply = controller.call(&frame).expect("admin del miss");
    assert_eq!(reply.get(0).unwrap().as_vocab(), Some(vocab(b"fail")));
}
