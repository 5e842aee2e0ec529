use bytes::BytesMut;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio_util::codec::{Decoder, Encoder};

use mqtt_explorer::mqtt::codec::MqttCodec;
use mqtt_explorer::mqtt::packet::{
    ConnAck, Connect, ConnectReturnCode, Packet, Publish, SubAck, Subscribe, Unsubscribe, Will,
};
use mqtt_explorer::mqtt::{MqttError, ProtocolError, QoS, SubscribeReturnCode};

fn random_qos(rng: &mut StdRng) -> QoS {
    match rng.gen_range(0..3) {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

fn random_topic(rng: &mut StdRng) -> String {
    let levels = rng.gen_range(1..5);
    (0..levels)
        .map(|_| {
            let len = rng.gen_range(1..12);
            (0..len)
                .map(|_| rng.gen_range(b'a'..=b'z') as char)
                .collect::<String>()
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn random_id(rng: &mut StdRng) -> u16 {
    rng.gen_range(1..=u16::MAX)
}

fn random_packet(rng: &mut StdRng) -> Packet {
    match rng.gen_range(0..14) {
        0 => Packet::Connect(Connect {
            client_id: random_topic(rng).replace('/', "-"),
            clean_session: rng.gen(),
            keep_alive: rng.gen(),
            will: rng.gen_bool(0.5).then(|| Will {
                topic: random_topic(rng),
                payload: vec![rng.gen::<u8>(); rng.gen_range(0..32)].into(),
                qos: random_qos(rng),
                retain: rng.gen(),
            }),
            username: Some("user".to_string()),
            password: Some("secret".into()),
        }),
        1 => Packet::ConnAck(ConnAck {
            session_present: rng.gen(),
            code: ConnectReturnCode::Accepted,
        }),
        2 => {
            let qos = random_qos(rng);
            let size = rng.gen_range(0..2_000);
            Packet::Publish(Publish {
                dup: qos != QoS::AtMostOnce && rng.gen(),
                qos,
                retain: rng.gen(),
                topic: random_topic(rng),
                packet_id: (qos != QoS::AtMostOnce).then(|| random_id(rng)),
                payload: (0..size).map(|_| rng.gen::<u8>()).collect::<Vec<_>>().into(),
            })
        }
        3 => Packet::PubAck(random_id(rng)),
        4 => Packet::PubRec(random_id(rng)),
        5 => Packet::PubRel(random_id(rng)),
        6 => Packet::PubComp(random_id(rng)),
        7 => Packet::Subscribe(Subscribe {
            packet_id: random_id(rng),
            filters: (0..rng.gen_range(1..4))
                .map(|_| (format!("{}/#", random_topic(rng)), random_qos(rng)))
                .collect(),
        }),
        8 => Packet::SubAck(SubAck {
            packet_id: random_id(rng),
            return_codes: vec![
                SubscribeReturnCode::Success(random_qos(rng)),
                SubscribeReturnCode::Failure,
            ],
        }),
        9 => Packet::Unsubscribe(Unsubscribe {
            packet_id: random_id(rng),
            filters: vec![random_topic(rng)],
        }),
        10 => Packet::UnsubAck(random_id(rng)),
        11 => Packet::PingReq,
        12 => Packet::PingResp,
        _ => Packet::Disconnect,
    }
}

#[test]
fn decodes_packet_stream_split_at_arbitrary_points() {
    let mut rng = StdRng::seed_from_u64(0x6d71_7474);
    let packets: Vec<Packet> = (0..300).map(|_| random_packet(&mut rng)).collect();

    let mut wire = BytesMut::new();
    let mut encoder = MqttCodec::default();
    for packet in &packets {
        encoder.encode(packet.clone(), &mut wire).unwrap();
    }

    let mut decoder = MqttCodec::default();
    let mut buffer = BytesMut::new();
    let mut decoded = Vec::new();
    let mut offset = 0;
    while offset < wire.len() {
        let chunk = rng.gen_range(1..200).min(wire.len() - offset);
        buffer.extend_from_slice(&wire[offset..offset + chunk]);
        offset += chunk;
        while let Some(packet) = decoder.decode(&mut buffer).unwrap() {
            decoded.push(packet);
        }
    }

    assert!(buffer.is_empty());
    assert_eq!(decoded, packets);
}

#[test]
fn corrupt_frame_after_valid_ones_is_reported_in_order() {
    let mut wire = BytesMut::new();
    let mut codec = MqttCodec::default();
    codec.encode(Packet::PingResp, &mut wire).unwrap();
    codec.encode(Packet::PubAck(3), &mut wire).unwrap();
    // PUBREL with flags 0000 instead of 0010
    wire.extend_from_slice(&[0x60, 0x02, 0x00, 0x01]);

    assert_eq!(codec.decode(&mut wire).unwrap(), Some(Packet::PingResp));
    assert_eq!(codec.decode(&mut wire).unwrap(), Some(Packet::PubAck(3)));
    assert!(matches!(
        codec.decode(&mut wire),
        Err(MqttError::Protocol(ProtocolError::InvalidFlags { .. }))
    ));
}
