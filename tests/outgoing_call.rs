//! Outgoing call against a fake CUCM: REGISTER, then INVITE through to a
//! `200 OK` answer, verifying the engine sends the ACK and surfaces
//! `OutgoingCallAccepted`.

mod support;

use std::net::{Ipv4Addr, TcpListener};
use std::time::Duration;

use cucm_softphone::events::Event;
use cucm_softphone::sip::SipEngine;

#[test]
fn outgoing_call_is_accepted_and_acked() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = std::thread::spawn(move || {
        let (mut sock, _) = listener.accept().unwrap();

        let (head, _) = support::read_frame(&mut sock);
        assert!(head.starts_with("REGISTER"));
        assert!(head.contains("CSeq: 101 REGISTER"));
        support::send(&mut sock, "SIP/2.0 200 OK\r\nCSeq: 101 REGISTER\r\nExpires: 3600\r\nContent-Length: 0\r\n\r\n");

        let (head, _body) = support::read_frame(&mut sock);
        assert!(head.starts_with("INVITE sip:9200@"), "unexpected request: {head}");
        assert!(head.contains("CSeq: 101 INVITE"));
        let local_session_id = support::header(&head, "Session-ID")
            .split(';')
            .next()
            .unwrap()
            .to_string();
        assert!(head.contains(&format!("Session-ID: {local_session_id};remote=00000000000000000000000000000000")));
        let call_id = support::header(&head, "Call-ID");
        let from = support::header(&head, "From");
        let to = support::header(&head, "To");

        support::send(
            &mut sock,
            &format!(
                "SIP/2.0 100 Trying\r\nFrom: {from}\r\nTo: {to}\r\nCall-ID: {call_id}\r\nCSeq: 101 INVITE\r\nContent-Length: 0\r\n\r\n"
            ),
        );
        support::send(
            &mut sock,
            &format!(
                "SIP/2.0 180 Ringing\r\nFrom: {from}\r\nTo: {to};tag=remote-tag\r\nCall-ID: {call_id}\r\nCSeq: 101 INVITE\r\nContent-Length: 0\r\n\r\n"
            ),
        );

        let sdp = "v=0\r\no=x 1 2 IN IP4 127.0.0.1\r\nc=IN IP4 127.0.0.1\r\nt=0 0\r\nm=audio 30000 RTP/AVP 0\r\na=rtpmap:0 PCMU/8000\r\n";
        support::send(
            &mut sock,
            &format!(
                "SIP/2.0 200 OK\r\nFrom: {from}\r\nTo: {to};tag=remote-tag\r\nCall-ID: {call_id}\r\nCSeq: 101 INVITE\r\nContent-Type: application/sdp\r\nContent-Length: {}\r\n\r\n{sdp}",
                sdp.len()
            ),
        );

        let (ack_head, _) = support::read_frame(&mut sock);
        assert!(ack_head.starts_with("ACK sip:9200@"), "expected ACK, got: {ack_head}");
        assert!(ack_head.contains("tag=remote-tag"));
    });

    let profile = support::profile(&addr.ip().to_string(), addr.port(), 0);
    let config = support::config(profile);
    let (tx, rx) = cucm_softphone::event_channel();

    let engine = SipEngine::connect(&config, Ipv4Addr::new(127, 0, 0, 1), tx).unwrap();
    engine.register(false).expect("registration should succeed");

    engine
        .call("9200", 8000, Box::new(support::SilentSource), Box::new(support::NullSink))
        .expect("call should be accepted");

    let mut saw_accepted = false;
    while let Ok(event) = rx.recv_timeout(Duration::from_millis(50)) {
        if event == Event::OutgoingCallAccepted {
            saw_accepted = true;
        }
    }
    assert!(saw_accepted);

    engine.shutdown();
    server.join().unwrap();
}
