//! End-to-end scenarios driving a full [`Host`] over an in-memory duplex
//! pipe standing in for a serial port, with a [`TestEnv`] virtual clock so
//! watchdog timing is deterministic.

use std::time::Duration;

use bidib_core::TestEnv;
use bidib_host::{Host, HostConfig, Transport};
use bidib_proto::{
    encode_frame, encode_one, parse_all, Address, ClassId, CsPomOpCode, CsPomOptions, FeatureId, FrameReader,
    Message, SequenceNumber, UniqueId,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn cs_capable_uid() -> UniqueId {
    UniqueId { class: ClassId(0x10), class_ext: 0, vendor: 0x0D, product: [7, 0, 0, 0] }
}

/// Reads bytes off the device-side duplex half until a full frame decodes,
/// returning its messages.
async fn read_device_frame(device: &mut tokio::io::DuplexStream) -> Vec<Message> {
    let mut frame_reader = FrameReader::new();
    let mut byte = [0u8; 1];
    loop {
        device.read_exact(&mut byte).await.unwrap();
        if let Some(Ok(payload)) = frame_reader.feed(byte[0]) {
            return parse_all(&payload).unwrap().into_iter().map(|p| p.message).collect();
        }
    }
}

async fn send_from_device(device: &mut tokio::io::DuplexStream, addr: Address, seq: u8, message: Message) {
    let frame = encode_frame(&encode_one(&addr, SequenceNumber::from(seq), &message));
    device.write_all(&frame).await.unwrap();
}

async fn make_host() -> (Host<TestEnv>, tokio::io::DuplexStream, TestEnv) {
    let (host_side, mut device) = tokio::io::duplex(8192);
    let (transport, reader) = Transport::from_stream("test", host_side);
    let env = TestEnv::new();
    let clock = env.clone();
    let config = HostConfig::new("test");

    // Drain the startup SYS_RESET + read-properties frame the host sends
    // before handing control back, and answer with a command-station
    // capable unique id so go()/stop() have a command station to act on.
    let host = Host::bind_with_transport(config, env, transport, reader).await;
    read_device_frame(&mut device).await; // SYS_RESET
    read_device_frame(&mut device).await; // SysGetMagic/SwVersion/UniqueId/FeatureGetAll batch
    send_from_device(&mut device, Address::INTERFACE, 0, Message::SysUniqueId { uid: cs_capable_uid(), fingerprint: None })
        .await;
    send_from_device(&mut device, Address::INTERFACE, 1, Message::FeatureCount { count: 0, streaming: false }).await;
    read_device_frame(&mut device).await; // SYS_ENABLE, the tree is now fully discovered

    (host, device, clock)
}

#[tokio::test]
async fn scenario_4_cv_read_back_reports_one_based_cv() {
    let (host, mut device, _clock) = make_host().await;

    host.program_on_main(Address::INTERFACE, 3, CsPomOpCode::ReadByte, 1, [0; 4]).await.unwrap();
    let messages = read_device_frame(&mut device).await;
    let Message::CsPom(CsPomOptions { cv, .. }) = &messages[0] else { panic!("expected CsPom") };
    assert_eq!(*cv, 0);

    let (tx, rx) = tokio::sync::oneshot::channel();
    let tx = std::sync::Mutex::new(Some(tx));
    let handle = host
        .register_node_changed(move |_root| {
            if let Some(tx) = tx.lock().unwrap().take() {
                let _ = tx.send(());
            }
        })
        .await;

    send_from_device(&mut device, Address::INTERFACE, 1, Message::BmCv { addr: 3, cv: 0, data: 42 }).await;
    rx.await.unwrap();
    handle.cancel().await;

    host.close().await.unwrap();
}

#[tokio::test]
async fn scenario_5_watchdog_keepalive_repeats_until_stop() {
    let (host, mut device, clock) = make_host().await;

    send_from_device(&mut device, Address::INTERFACE, 1, Message::FeatureCount { count: 1, streaming: false }).await;
    read_device_frame(&mut device).await; // FeatureGetNext
    send_from_device(&mut device, Address::INTERFACE, 2, Message::Feature { id: FeatureId::GEN_WATCHDOG, value: 2 })
        .await;
    // The single advertised feature has now arrived, so no further
    // FeatureGetNext follows.

    host.go(Address::INTERFACE).await.unwrap();
    let first = read_device_frame(&mut device).await;
    assert!(matches!(first[0], Message::CsSetState { state } if state == bidib_proto::CsState::Go as u8));

    // GEN_WATCHDOG = 2 -> repeat period 100*(2/2) = 100ms.
    clock.advance(Duration::from_millis(100));
    let second = read_device_frame(&mut device).await;
    assert!(matches!(second[0], Message::CsSetState { state } if state == bidib_proto::CsState::Go as u8));

    host.stop(Address::INTERFACE).await.unwrap();
    read_device_frame(&mut device).await; // CsSetState(Stop)

    clock.advance(Duration::from_millis(100));
    let no_more = tokio::time::timeout(Duration::from_millis(50), read_device_frame(&mut device)).await;
    assert!(no_more.is_err(), "no further CsSetState(GO) should follow stop()");

    host.close().await.unwrap();
}

#[tokio::test]
async fn scenario_6_crc_corruption_drops_the_frame_silently() {
    let (host, mut device, _clock) = make_host().await;

    let mut frame = encode_frame(&encode_one(&Address::INTERFACE, SequenceNumber::from(9), &Message::SysGetMagic));
    let last = frame.len() - 2; // before trailing MAGIC
    frame[last] ^= 0x01;
    device.write_all(&frame).await.unwrap();

    let root_before = host.get_root().await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    let root_after = host.get_root().await.unwrap();
    assert_eq!(format!("{root_before:?}"), format!("{root_after:?}"));

    host.close().await.unwrap();
}
