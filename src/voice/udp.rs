use async_trait::async_trait;
use serenity::model::id::{ChannelId, GuildId};
use std::io;
use tokio::net::UdpSocket;
use tracing::debug;

use super::{Connector, FrameSink};
use crate::audio::{pipeline::Frame, FRAME_SAMPLES};

const RTP_HEADER_LEN: usize = 12;
const RTP_VERSION: u8 = 0x80;
const RTP_PAYLOAD_TYPE: u8 = 0x78;

/// Envía frames como datagramas RTP a un endpoint de voz fijo.
pub struct UdpConnector {
    endpoint: String,
}

impl UdpConnector {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl Connector for UdpConnector {
    async fn connect(&self, guild_id: GuildId, channel_id: ChannelId) -> io::Result<Box<dyn FrameSink>> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(self.endpoint.as_str()).await?;

        let ssrc: u32 = rand::random();
        debug!(
            "📡 Socket UDP {} -> {} (guild {}, canal {}, ssrc {})",
            socket.local_addr()?,
            self.endpoint,
            guild_id,
            channel_id,
            ssrc
        );

        Ok(Box::new(UdpSink {
            socket,
            header: RtpHeader::new(ssrc),
            packet: Vec::with_capacity(RTP_HEADER_LEN + 4000),
        }))
    }
}

struct UdpSink {
    socket: UdpSocket,
    header: RtpHeader,
    packet: Vec<u8>,
}

#[async_trait]
impl FrameSink for UdpSink {
    async fn send(&mut self, frame: &Frame) -> io::Result<()> {
        self.packet.clear();
        self.packet.extend_from_slice(&self.header.next());
        self.packet.extend_from_slice(&frame.payload);
        self.socket.send(&self.packet).await?;
        Ok(())
    }
}

/// Cabecera RTP con secuencia y timestamp a 48 kHz.
struct RtpHeader {
    ssrc: u32,
    sequence: u16,
    timestamp: u32,
}

impl RtpHeader {
    fn new(ssrc: u32) -> Self {
        Self {
            ssrc,
            sequence: rand::random(),
            timestamp: rand::random(),
        }
    }

    fn next(&mut self) -> [u8; RTP_HEADER_LEN] {
        let mut header = [0u8; RTP_HEADER_LEN];
        header[0] = RTP_VERSION;
        header[1] = RTP_PAYLOAD_TYPE;
        header[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        header[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        header[8..12].copy_from_slice(&self.ssrc.to_be_bytes());

        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(FRAME_SAMPLES as u32);
        header
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn header_advances_sequence_and_timestamp() {
        let mut header = RtpHeader {
            ssrc: 0xDEADBEEF,
            sequence: u16::MAX,
            timestamp: 1000,
        };

        let first = header.next();
        assert_eq!(&first[..2], &[0x80, 0x78]);
        assert_eq!(u16::from_be_bytes([first[2], first[3]]), u16::MAX);
        assert_eq!(u32::from_be_bytes([first[8], first[9], first[10], first[11]]), 0xDEADBEEF);

        let second = header.next();
        assert_eq!(u16::from_be_bytes([second[2], second[3]]), 0);
        assert_eq!(
            u32::from_be_bytes([second[4], second[5], second[6], second[7]]),
            1000 + FRAME_SAMPLES as u32
        );
    }

    #[tokio::test]
    async fn sends_rtp_datagrams_to_endpoint() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let endpoint = receiver.local_addr().unwrap().to_string();

        let connector = UdpConnector::new(endpoint);
        let mut sink = connector
            .connect(GuildId::new(1), ChannelId::new(2))
            .await
            .unwrap();
        sink.send(&Frame {
            sequence: 0,
            payload: Bytes::from_static(b"opus"),
        })
        .await
        .unwrap();

        let mut buf = [0u8; 64];
        let len = receiver.recv(&mut buf).await.unwrap();
        assert_eq!(len, RTP_HEADER_LEN + 4);
        assert_eq!(&buf[RTP_HEADER_LEN..len], b"opus");
    }
}
