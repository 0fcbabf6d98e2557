//! Incoming calls from a fake CUCM: accept through to established, a
//! CANCEL arriving before the host answers, and a BYE from the remote
//! side tearing down an established call.

mod support;

use std::net::{Ipv4Addr, TcpListener};
use std::time::Duration;

use cucm_softphone::events::Event;
use cucm_softphone::sip::SipEngine;

fn register(sock: &mut std::net::TcpStream) {
    let (head, _) = support::read_frame(sock);
    assert!(head.starts_with("REGISTER"));
    assert!(head.contains("CSeq: 101 REGISTER"));
    support::send(sock, "SIP/2.0 200 OK\r\nCSeq: 101 REGISTER\r\nExpires: 3600\r\nContent-Length: 0\r\n\r\n");
}

#[test]
fn incoming_call_is_accepted() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = std::thread::spawn(move || {
        let (mut sock, _) = listener.accept().unwrap();
        register(&mut sock);

        let sdp = "v=0\r\no=x 1 2 IN IP4 127.0.0.1\r\nc=IN IP4 127.0.0.1\r\nt=0 0\r\nm=audio 30002 RTP/AVP 0\r\na=rtpmap:0 PCMU/8000\r\n";
        let invite = format!(
            "INVITE sip:9100@127.0.0.1 SIP/2.0\r\nFrom: \"Caller\" <sip:9200@127.0.0.1>;tag=caller-tag\r\nTo: <sip:9100@127.0.0.1>\r\nCall-ID: call-accept-1\r\nCSeq: 1 INVITE\r\nContent-Type: application/sdp\r\nContent-Length: {}\r\n\r\n{sdp}",
            sdp.len()
        );
        support::send(&mut sock, &invite);

        let (trying, _) = support::read_frame(&mut sock);
        assert!(trying.starts_with("SIP/2.0 100 Trying"));
        let (ringing, _) = support::read_frame(&mut sock);
        assert!(ringing.starts_with("SIP/2.0 180 Ringing"));
        let (ok, _body) = support::read_frame(&mut sock);
        assert!(ok.starts_with("SIP/2.0 200 OK"), "expected 200 OK, got: {ok}");
    });

    let profile = support::profile(&addr.ip().to_string(), addr.port(), 0);
    let config = support::config(profile);
    let (tx, rx) = cucm_softphone::event_channel();

    let engine = SipEngine::connect(&config, Ipv4Addr::new(127, 0, 0, 1), tx).unwrap();
    engine.register(false).expect("registration should succeed");

    let mut saw_ringing = false;
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while std::time::Instant::now() < deadline {
        if let Ok(Event::IncomingCallRinging { .. }) = rx.recv_timeout(Duration::from_millis(100)) {
            saw_ringing = true;
            break;
        }
    }
    assert!(saw_ringing, "never observed an incoming call");

    engine.accept(8000, Box::new(support::SilentSource), Box::new(support::NullSink)).expect("accept should succeed");

    let mut saw_accepted = false;
    while let Ok(event) = rx.recv_timeout(Duration::from_millis(50)) {
        if event == Event::IncomingCallAccepted {
            saw_accepted = true;
        }
    }
    assert!(saw_accepted);

    engine.shutdown();
    server.join().unwrap();
}

#[test]
fn incoming_call_canceled_before_answer() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = std::thread::spawn(move || {
        let (mut sock, _) = listener.accept().unwrap();
        register(&mut sock);

        let invite = "INVITE sip:9100@127.0.0.1 SIP/2.0\r\nFrom: \"Caller\" <sip:9200@127.0.0.1>;tag=caller-tag\r\nTo: <sip:9100@127.0.0.1>\r\nCall-ID: call-cancel-1\r\nCSeq: 1 INVITE\r\nContent-Length: 0\r\n\r\n";
        support::send(&mut sock, invite);

        let (trying, _) = support::read_frame(&mut sock);
        assert!(trying.starts_with("SIP/2.0 100 Trying"));
        let (ringing, _) = support::read_frame(&mut sock);
        assert!(ringing.starts_with("SIP/2.0 180 Ringing"));

        let cancel = "CANCEL sip:9100@127.0.0.1 SIP/2.0\r\nFrom: \"Caller\" <sip:9200@127.0.0.1>;tag=caller-tag\r\nTo: <sip:9100@127.0.0.1>\r\nCall-ID: call-cancel-1\r\nCSeq: 2 CANCEL\r\nContent-Length: 0\r\n\r\n";
        support::send(&mut sock, cancel);
    });

    let profile = support::profile(&addr.ip().to_string(), addr.port(), 0);
    let config = support::config(profile);
    let (tx, rx) = cucm_softphone::event_channel();

    let engine = SipEngine::connect(&config, Ipv4Addr::new(127, 0, 0, 1), tx).unwrap();
    engine.register(false).expect("registration should succeed");

    let mut saw_canceled = false;
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while std::time::Instant::now() < deadline {
        if let Ok(Event::IncomingCallCanceled) = rx.recv_timeout(Duration::from_millis(100)) {
            saw_canceled = true;
            break;
        }
    }
    assert!(saw_canceled, "never observed the incoming call being canceled");

    assert!(engine.accept(8000, Box::new(support::SilentSource), Box::new(support::NullSink)).is_err());

    engine.shutdown();
    server.join().unwrap();
}

#[test]
fn established_call_closes_on_remote_bye() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = std::thread::spawn(move || {
        let (mut sock, _) = listener.accept().unwrap();
        register(&mut sock);

        let sdp = "v=0\r\no=x 1 2 IN IP4 127.0.0.1\r\nc=IN IP4 127.0.0.1\r\nt=0 0\r\nm=audio 30004 RTP/AVP 0\r\na=rtpmap:0 PCMU/8000\r\n";
        let invite = format!(
            "INVITE sip:9100@127.0.0.1 SIP/2.0\r\nFrom: \"Caller\" <sip:9200@127.0.0.1>;tag=caller-tag\r\nTo: <sip:9100@127.0.0.1>\r\nCall-ID: call-bye-1\r\nCSeq: 1 INVITE\r\nContent-Type: application/sdp\r\nContent-Length: {}\r\n\r\n{sdp}",
            sdp.len()
        );
        support::send(&mut sock, &invite);

        let (trying, _) = support::read_frame(&mut sock);
        assert!(trying.starts_with("SIP/2.0 100 Trying"));
        let (ringing, _) = support::read_frame(&mut sock);
        assert!(ringing.starts_with("SIP/2.0 180 Ringing"));
        let (ok, _) = support::read_frame(&mut sock);
        assert!(ok.starts_with("SIP/2.0 200 OK"));

        let bye = "BYE sip:9100@127.0.0.1 SIP/2.0\r\nFrom: \"Caller\" <sip:9200@127.0.0.1>;tag=caller-tag\r\nTo: <sip:9100@127.0.0.1>;tag=local-tag\r\nCall-ID: call-bye-1\r\nCSeq: 2 BYE\r\nContent-Length: 0\r\n\r\n";
        support::send(&mut sock, bye);

        let (bye_ok, _) = support::read_frame(&mut sock);
        assert!(bye_ok.starts_with("SIP/2.0 200 OK"), "expected 200 OK for BYE, got: {bye_ok}");
    });

    let profile = support::profile(&addr.ip().to_string(), addr.port(), 0);
    let config = support::config(profile);
    let (tx, rx) = cucm_softphone::event_channel();

    let engine = SipEngine::connect(&config, Ipv4Addr::new(127, 0, 0, 1), tx).unwrap();
    engine.register(false).expect("registration should succeed");

    let mut saw_ringing = false;
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while std::time::Instant::now() < deadline {
        if let Ok(Event::IncomingCallRinging { .. }) = rx.recv_timeout(Duration::from_millis(100)) {
            saw_ringing = true;
            break;
        }
    }
    assert!(saw_ringing);

    engine.accept(8000, Box::new(support::SilentSource), Box::new(support::NullSink)).expect("accept should succeed");

    let mut saw_closed = false;
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while std::time::Instant::now() < deadline {
        if let Ok(Event::CallClosed) = rx.recv_timeout(Duration::from_millis(100)) {
            saw_closed = true;
            break;
        }
    }
    assert!(saw_closed, "never observed the call close on remote BYE");

    engine.shutdown();
    server.join().unwrap();
}
