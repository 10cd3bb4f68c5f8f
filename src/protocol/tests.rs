// test-only module included via protocol/mod.rs
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

use crate::config::{Version, ACK, EOT, MAGIC_BYTES, NAK, PROTOCOL_VERSION};
use crate::error::ProtocolError;
use crate::protocol::handshake::*;

fn hello(version: Version) -> Vec<u8> {
    let mut bytes = MAGIC_BYTES.to_vec();
    bytes.extend_from_slice(&version.to_bytes());
    bytes
}

#[tokio::test]
async fn test_handshake_between_both_roles() {
    let (mut initiator, mut acceptor) = duplex(64);
    let options = HandshakeOptions::new(true, false);

    let accept = tokio::spawn(async move {
        accept_plain(&mut acceptor, PROTOCOL_VERSION, options).await
    });
    let negotiated = initiate_plain(&mut initiator, PROTOCOL_VERSION)
        .await
        .expect("Initiator should complete");

    assert_eq!(negotiated, options);
    assert_eq!(accept.await.unwrap().unwrap(), PROTOCOL_VERSION);
}

#[tokio::test]
async fn test_acceptor_sends_nak_nak_on_minor_mismatch() {
    let (mut peer, mut acceptor) = duplex(64);
    let accept = tokio::spawn(async move {
        accept_plain(&mut acceptor, Version::new(1, 0, 0), HandshakeOptions::default()).await
    });

    peer.write_all(&hello(Version::new(1, 1, 0))).await.unwrap();
    let mut reply = [0u8; 2];
    peer.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [NAK, NAK]);

    assert!(matches!(
        accept.await.unwrap(),
        Err(ProtocolError::ProtocolViolation(_))
    ));
    // Nothing after the refusal: the acceptor never announces options
    let mut rest = Vec::new();
    peer.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
}

#[tokio::test]
async fn test_acceptor_rejects_major_mismatch() {
    let (mut peer, mut acceptor) = duplex(64);
    let accept = tokio::spawn(async move {
        accept_plain(&mut acceptor, Version::new(1, 0, 0), HandshakeOptions::default()).await
    });

    peer.write_all(&hello(Version::new(2, 0, 0))).await.unwrap();
    let mut reply = [0u8; 2];
    peer.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [NAK, NAK]);
    assert!(accept.await.unwrap().is_err());
}

#[tokio::test]
async fn test_acceptor_ignores_patch_difference() {
    let (mut peer, mut acceptor) = duplex(64);
    let accept = tokio::spawn(async move {
        accept_plain(&mut acceptor, Version::new(1, 0, 0), HandshakeOptions::new(false, true)).await
    });

    peer.write_all(&hello(Version::new(1, 0, 9))).await.unwrap();
    let mut reply = [0u8; 2];
    peer.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [ACK, 0b10]);

    peer.write_all(&[ACK]).await.unwrap();
    let mut eot = [0u8; 1];
    peer.read_exact(&mut eot).await.unwrap();
    assert_eq!(eot, [EOT]);

    assert_eq!(accept.await.unwrap().unwrap(), Version::new(1, 0, 9));
}

#[tokio::test]
async fn test_acceptor_rejects_bad_magic() {
    let (mut peer, mut acceptor) = duplex(64);
    let accept = tokio::spawn(async move {
        accept_plain(&mut acceptor, PROTOCOL_VERSION, HandshakeOptions::default()).await
    });

    peer.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
    assert!(matches!(
        accept.await.unwrap(),
        Err(ProtocolError::ProtocolViolation(_))
    ));
}

#[tokio::test]
async fn test_acceptor_aborts_on_non_ack() {
    let (mut peer, mut acceptor) = duplex(64);
    let accept = tokio::spawn(async move {
        accept_plain(&mut acceptor, PROTOCOL_VERSION, HandshakeOptions::default()).await
    });

    peer.write_all(&hello(PROTOCOL_VERSION)).await.unwrap();
    let mut reply = [0u8; 2];
    peer.read_exact(&mut reply).await.unwrap();
    peer.write_all(&[NAK]).await.unwrap();

    assert!(matches!(
        accept.await.unwrap(),
        Err(ProtocolError::ProtocolViolation(_))
    ));
    // No end-of-handshake marker follows a rejected ACK
    let mut rest = Vec::new();
    peer.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
}

#[tokio::test]
async fn test_acceptor_short_read_is_violation() {
    let (mut peer, mut acceptor) = duplex(64);
    let accept = tokio::spawn(async move {
        accept_plain(&mut acceptor, PROTOCOL_VERSION, HandshakeOptions::default()).await
    });

    peer.write_all(&MAGIC_BYTES[..4]).await.unwrap();
    drop(peer);
    assert!(matches!(
        accept.await.unwrap(),
        Err(ProtocolError::ProtocolViolation(_))
    ));
}

#[tokio::test]
async fn test_initiator_applies_every_option_combination() {
    for bits in 0u8..=3 {
        let (mut initiator, mut peer) = duplex(64);
        let scripted = tokio::spawn(async move {
            let mut hello_bytes = [0u8; 12];
            peer.read_exact(&mut hello_bytes).await.unwrap();
            peer.write_all(&[ACK, bits]).await.unwrap();
            let mut ack = [0u8; 1];
            peer.read_exact(&mut ack).await.unwrap();
            peer.write_all(&[EOT]).await.unwrap();
            (hello_bytes, ack[0])
        });

        let options = initiate_plain(&mut initiator, PROTOCOL_VERSION).await.unwrap();
        assert_eq!(options.no_delay, bits & 0b01 != 0);
        assert_eq!(options.encryption, bits & 0b10 != 0);

        let (hello_bytes, ack) = scripted.await.unwrap();
        assert_eq!(hello_bytes.to_vec(), hello(PROTOCOL_VERSION));
        assert_eq!(ack, ACK);
    }
}

#[test]
fn test_option_byte_0x03_enables_both() {
    let options = HandshakeOptions::from_bits(0x03);
    assert!(options.no_delay);
    assert!(options.encryption);
    assert_eq!(options.bits(), 0x03);
    assert_eq!(HandshakeOptions::from_bits(0xFC), HandshakeOptions::default());
}

#[tokio::test]
async fn test_initiator_reports_refusal() {
    let (mut initiator, mut peer) = duplex(64);
    tokio::spawn(async move {
        let mut hello_bytes = [0u8; 12];
        peer.read_exact(&mut hello_bytes).await.unwrap();
        peer.write_all(&[NAK, NAK]).await.unwrap();
    });

    let err = initiate_plain(&mut initiator, PROTOCOL_VERSION)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("refused"));
}

#[tokio::test]
async fn test_initiator_requires_eot() {
    let (mut initiator, mut peer) = duplex(64);
    tokio::spawn(async move {
        let mut hello_bytes = [0u8; 12];
        peer.read_exact(&mut hello_bytes).await.unwrap();
        peer.write_all(&[ACK, 0]).await.unwrap();
        let mut ack = [0u8; 1];
        peer.read_exact(&mut ack).await.unwrap();
        peer.write_all(&[ACK]).await.unwrap();
    });

    assert!(matches!(
        initiate_plain(&mut initiator, PROTOCOL_VERSION).await,
        Err(ProtocolError::ProtocolViolation(_))
    ));
}

#[tokio::test]
async fn test_confirmation_exchange() {
    let (mut initiator, mut acceptor) = duplex(8);
    let accept = tokio::spawn(async move { confirm_as_acceptor(&mut acceptor).await });
    confirm_as_initiator(&mut initiator).await.unwrap();
    accept.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_confirmation_failure_is_encryption_failure() {
    let (mut initiator, mut peer) = duplex(8);
    tokio::spawn(async move {
        let mut byte = [0u8; 1];
        peer.read_exact(&mut byte).await.unwrap();
        peer.write_all(&[NAK]).await.unwrap();
    });
    assert!(matches!(
        confirm_as_initiator(&mut initiator).await,
        Err(ProtocolError::EncryptionFailure(_))
    ));
}
