//! Registration against a fake CUCM, followed by a clean teardown, plus
//! the granted-`Expires`-driven renewal schedule: a short grant should
//! produce a renewal `REGISTER` at roughly `Expires/2` and a read
//! deadline of `Expires + 5s`.

mod support;

use std::net::{Ipv4Addr, TcpListener};
use std::time::Duration;

use cucm_softphone::events::{Event, RegistrationStatus};
use cucm_softphone::sip::SipEngine;

#[test]
fn register_succeeds_and_shutdown_is_prompt() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = std::thread::spawn(move || {
        let (mut sock, _) = listener.accept().unwrap();
        let (head, _body) = support::read_frame(&mut sock);
        assert!(head.starts_with("REGISTER sip:"));
        assert!(head.contains("CSeq: 101 REGISTER"));
        support::send(&mut sock, "SIP/2.0 200 OK\r\nCSeq: 101 REGISTER\r\nExpires: 3600\r\nContent-Length: 0\r\n\r\n");
    });

    let profile = support::profile(&addr.ip().to_string(), addr.port(), 0);
    let config = support::config(profile);
    let (tx, rx) = cucm_softphone::event_channel();

    let engine = SipEngine::connect(&config, Ipv4Addr::new(127, 0, 0, 1), tx).unwrap();
    engine.register(false).expect("registration should succeed");
    assert_eq!(engine.registration_status(), RegistrationStatus::Registered);

    let mut saw_registered = false;
    while let Ok(event) = rx.recv_timeout(Duration::from_millis(50)) {
        if event == Event::RegistrationState(RegistrationStatus::Registered) {
            saw_registered = true;
        }
    }
    assert!(saw_registered);

    let start = std::time::Instant::now();
    engine.shutdown();
    assert!(start.elapsed() < Duration::from_secs(2), "shutdown must not wait out the renewal interval");

    server.join().unwrap();
}

#[test]
fn short_expires_grant_drives_renewal_timing_and_read_deadline() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = std::thread::spawn(move || {
        let (mut sock, _) = listener.accept().unwrap();
        let (head, _body) = support::read_frame(&mut sock);
        assert!(head.contains("CSeq: 101 REGISTER"));
        support::send(&mut sock, "SIP/2.0 200 OK\r\nCSeq: 101 REGISTER\r\nExpires: 60\r\nContent-Length: 0\r\n\r\n");

        let (head, _body) = support::read_frame(&mut sock);
        assert!(head.contains("CSeq: 101 REGISTER"), "renewal keeps cseq 101, not a monotonic counter");
        support::send(&mut sock, "SIP/2.0 200 OK\r\nCSeq: 101 REGISTER\r\nExpires: 60\r\nContent-Length: 0\r\n\r\n");
    });

    let profile = support::profile(&addr.ip().to_string(), addr.port(), 0);
    let config = support::config(profile);
    let (tx, _rx) = cucm_softphone::event_channel();

    let engine = SipEngine::connect(&config, Ipv4Addr::new(127, 0, 0, 1), tx).unwrap();
    let start = std::time::Instant::now();
    engine.register(false).expect("registration should succeed");

    server.join().unwrap();
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(29) && elapsed <= Duration::from_secs(33), "renewal should fire near Expires/2: {elapsed:?}");

    engine.shutdown();
}
