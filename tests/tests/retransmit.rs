// Retransmission behaviour against a black-holed UDP destination:
// exponential backoff capped at T2, 64·T1 timeout, and cancellation by a
// matching response.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use sipline_core::{Address, Method, Packet, Request, Response, TransportProto};
use sipline_dispatch::{DeliverOpts, DispatchConfig, Dispatcher, Error, Receiver, StaticDns};
use sipline_integration_tests::init_tracing;
use sipline_transport::{Leg, LegOptions};

struct Capture {
    tx: mpsc::UnboundedSender<Packet>,
}

#[async_trait]
impl Receiver for Capture {
    async fn receive(&self, packet: Packet, _leg: Leg, _from: Address) -> Option<u16> {
        let _ = self.tx.send(packet);
        Some(200)
    }
}

fn invite(callid: &str) -> Packet {
    let mut req = Request::new(Method::Invite, "sip:bob@far.example".parse().unwrap());
    req.headers.push("From", "<sip:alice@near.example>;tag=rt1");
    req.headers.push("To", "<sip:bob@far.example>");
    req.headers.push("Call-ID", callid);
    req.headers.push("CSeq", "1 INVITE");
    req.headers.push("Max-Forwards", "70");
    Packet::Request(req)
}

async fn stack(t1_ms: u64) -> (Dispatcher, Leg) {
    let config = DispatchConfig {
        t1_ms,
        ..Default::default()
    };
    let dispatcher = Dispatcher::with_dns(config, Arc::new(StaticDns::new()));
    let leg = dispatcher
        .bind_leg(
            TransportProto::Udp,
            "127.0.0.1".parse().unwrap(),
            0,
            LegOptions::default(),
        )
        .await
        .unwrap();
    (dispatcher, leg)
}

#[tokio::test]
async fn backoff_doubles_and_times_out() -> anyhow::Result<()> {
    init_tracing();
    // T1 = 40ms keeps the whole 64·T1 transaction inside ~2.6s.
    let t1 = Duration::from_millis(40);
    let (dispatcher, leg) = stack(40).await;
    let blackhole = UdpSocket::bind("127.0.0.1:0").await?;
    let dst = Address::from_socket_addr(TransportProto::Udp, blackhole.local_addr()?);

    let (err_tx, mut err_rx) = mpsc::unbounded_channel();
    let started = Instant::now();
    dispatcher.deliver(
        invite("backoff-1"),
        DeliverOpts {
            leg: Some(leg),
            dst: Some(dst),
            callback: Some(Box::new(move |r| {
                if let Err(e) = r {
                    let _ = err_tx.send((Instant::now(), e));
                }
            })),
            ..Default::default()
        },
    )?;

    // Record arrival offsets until the timeout callback fires.
    let mut arrivals: Vec<Duration> = Vec::new();
    let mut buf = [0u8; 4096];
    let (timed_out_at, err) = loop {
        tokio::select! {
            recv = blackhole.recv_from(&mut buf) => {
                let _ = recv?;
                arrivals.push(started.elapsed());
            }
            failed = err_rx.recv() => {
                break failed.expect("callback reports the timeout");
            }
        }
    };

    assert!(matches!(err, Error::Timeout), "unexpected error {err}");
    assert!(
        arrivals.len() >= 5,
        "too few retransmits: {}",
        arrivals.len()
    );

    // Gaps grow (exponential backoff) and never exceed T2.
    let t2 = Duration::from_secs(4);
    for pair in arrivals.windows(2) {
        let gap = pair[1] - pair[0];
        assert!(gap <= t2 + Duration::from_millis(200), "gap {gap:?} over T2");
    }
    let first_gap = arrivals[1] - arrivals[0];
    let later_gap = arrivals[arrivals.len() - 1] - arrivals[arrivals.len() - 2];
    assert!(
        later_gap > first_gap,
        "backoff did not grow: first {first_gap:?}, later {later_gap:?}"
    );

    // Whole transaction bounded by 64·T1 (plus scheduling slack).
    let lifetime = t1 * 64;
    let elapsed = timed_out_at.duration_since(started);
    assert!(
        elapsed >= lifetime && elapsed < lifetime + Duration::from_secs(2),
        "timeout at {elapsed:?}, expected ~{lifetime:?}"
    );
    Ok(())
}

#[tokio::test]
async fn matching_response_stops_retransmits() -> anyhow::Result<()> {
    init_tracing();
    let (dispatcher, leg) = stack(50).await;
    let far_end = UdpSocket::bind("127.0.0.1:0").await?;
    let dst = Address::from_socket_addr(TransportProto::Udp, far_end.local_addr()?);

    let (rx_tx, mut rx) = mpsc::unbounded_channel();
    dispatcher.set_receiver(Arc::new(Capture { tx: rx_tx }));

    dispatcher.deliver(
        invite("cancel-by-response-1"),
        DeliverOpts {
            leg: Some(leg.clone()),
            dst: Some(dst),
            ..Default::default()
        },
    )?;

    // Take the first transmission and answer it with a 180.
    let mut buf = [0u8; 4096];
    let (n, from) = far_end.recv_from(&mut buf).await?;
    let Packet::Request(received) = Packet::parse(&buf[..n])? else {
        panic!("expected the INVITE");
    };
    let ringing = Packet::Response(Response::for_request(&received, 180, "Ringing"));
    far_end.send_to(&ringing.to_bytes(), from).await?;

    // The response reaches the receiver exactly once...
    let got = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await?
        .expect("response forwarded");
    assert_eq!(got.code(), Some(180));

    // ...the queue entry is gone...
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(dispatcher.pending_deliveries(), 0);

    // ...and no further retransmission arrives.
    let quiet =
        tokio::time::timeout(Duration::from_millis(400), far_end.recv_from(&mut buf)).await;
    assert!(quiet.is_err(), "INVITE was retransmitted after the response");
    assert!(rx.try_recv().is_err(), "response delivered more than once");
    Ok(())
}

#[tokio::test]
async fn foreign_branch_response_cancels_nothing() -> anyhow::Result<()> {
    init_tracing();
    let (dispatcher, leg) = stack(50).await;
    let far_end = UdpSocket::bind("127.0.0.1:0").await?;
    let dst = Address::from_socket_addr(TransportProto::Udp, far_end.local_addr()?);

    let (rx_tx, mut rx) = mpsc::unbounded_channel();
    dispatcher.set_receiver(Arc::new(Capture { tx: rx_tx }));

    dispatcher.deliver(
        invite("foreign-branch-1"),
        DeliverOpts {
            leg: Some(leg.clone()),
            dst: Some(dst),
            ..Default::default()
        },
    )?;

    let mut buf = [0u8; 4096];
    let (n, from) = far_end.recv_from(&mut buf).await?;
    let Packet::Request(received) = Packet::parse(&buf[..n])? else {
        panic!("expected the INVITE");
    };

    // Same dialog identifiers, foreign Via branch.
    let mut bogus = Response::for_request(&received, 180, "Ringing");
    bogus.headers.set("Via", "SIP/2.0/UDP 127.0.0.1:5060;branch=z9hG4bK-other");
    far_end
        .send_to(&Packet::Response(bogus).to_bytes(), from)
        .await?;

    // Receiver never sees it; the delivery keeps retransmitting.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(rx.try_recv().is_err(), "bogus response was delivered");
    assert_eq!(dispatcher.pending_deliveries(), 1);
    assert!(
        dispatcher
            .stats()
            .via_rejected
            .load(std::sync::atomic::Ordering::Relaxed)
            >= 1
    );
    Ok(())
}
