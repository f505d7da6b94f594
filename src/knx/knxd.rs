//! # knxd Group Socket Transport
//!
//! Connects to a running `knxd` over TCP and opens a group socket. Every knxd
//! message is framed as a 2-byte big-endian length followed by a 2-byte message
//! type and the message body:
//!
//! ```text
//! open:     00 05 | 00 26 | 00 00 00
//! outbound: LL LL | 00 27 | dst dst | apdu...
//! inbound:  LL LL | 00 27 | src src | dst dst | apdu...
//! ```

use crate::constants::{KNXD_GROUP_PACKET, KNXD_MAX_MESSAGE_LEN, KNXD_OPEN_GROUPCON};
use crate::error::BridgeError;
use crate::knx::address::{GroupAddress, IndividualAddress};
use crate::knx::telegram::{pack_apdu, parse_apdu, Telegram, TelegramKind};
use crate::knx::transport::{BusConnection, BusTransport};
use crate::util::logging::log_frame_hex;
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use log::{debug, info};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::{Decoder, Encoder, Framed};

/// One knxd protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnxdMessage {
    pub msg_type: u16,
    pub body: Bytes,
}

impl KnxdMessage {
    pub fn open_group_socket() -> Self {
        KnxdMessage {
            msg_type: KNXD_OPEN_GROUPCON,
            body: Bytes::from_static(&[0x00, 0x00, 0x00]),
        }
    }

    pub fn group_packet(destination: GroupAddress, apdu: &[u8]) -> Self {
        let mut body = BytesMut::with_capacity(2 + apdu.len());
        body.put_u16(destination.raw());
        body.put_slice(apdu);
        KnxdMessage {
            msg_type: KNXD_GROUP_PACKET,
            body: body.freeze(),
        }
    }

    /// Interprets an inbound group packet.
    pub fn to_telegram(&self) -> Result<Telegram, BridgeError> {
        if self.msg_type != KNXD_GROUP_PACKET || self.body.len() < 6 {
            return Err(BridgeError::Transport(format!(
                "not a group packet: type 0x{:04X}, {} bytes",
                self.msg_type,
                self.body.len()
            )));
        }
        let mut body = self.body.clone();
        let source = IndividualAddress::from_raw(body.get_u16());
        let destination = GroupAddress::from_raw(body.get_u16());
        let (kind, payload) = parse_apdu(&body)?;
        Ok(Telegram {
            source: Some(source),
            destination,
            kind,
            payload,
        })
    }
}

/// Length-prefixed framing of knxd messages.
#[derive(Debug, Default)]
pub struct KnxdCodec;

impl Decoder for KnxdCodec {
    type Item = KnxdMessage;
    type Error = BridgeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 2 {
            return Ok(None);
        }
        let len = usize::from(u16::from_be_bytes([src[0], src[1]]));
        if !(2..=KNXD_MAX_MESSAGE_LEN).contains(&len) {
            return Err(BridgeError::Transport(format!(
                "invalid knxd message length {len}"
            )));
        }
        if src.len() < 2 + len {
            src.reserve(2 + len - src.len());
            return Ok(None);
        }
        log_frame_hex("knxd <-", &src[..2 + len]);
        src.advance(2);
        let mut message = src.split_to(len);
        let msg_type = message.get_u16();
        Ok(Some(KnxdMessage {
            msg_type,
            body: message.freeze(),
        }))
    }
}

impl Encoder<KnxdMessage> for KnxdCodec {
    type Error = BridgeError;

    fn encode(&mut self, item: KnxdMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let len = 2 + item.body.len();
        if len > KNXD_MAX_MESSAGE_LEN {
            return Err(BridgeError::Transport(format!(
                "knxd message too long: {len}"
            )));
        }
        dst.reserve(2 + len);
        let start = dst.len();
        dst.put_u16(len as u16);
        dst.put_u16(item.msg_type);
        dst.put_slice(&item.body);
        log_frame_hex("knxd ->", &dst[start..]);
        Ok(())
    }
}

/// Transport reaching the bus through knxd's TCP socket.
#[derive(Debug, Clone)]
pub struct KnxdTransport {
    endpoint: String,
    handshake_timeout: Duration,
}

impl KnxdTransport {
    pub fn new(endpoint: impl Into<String>, handshake_timeout: Duration) -> Self {
        KnxdTransport {
            endpoint: endpoint.into(),
            handshake_timeout,
        }
    }
}

#[async_trait]
impl BusTransport for KnxdTransport {
    async fn connect(&self) -> Result<Box<dyn BusConnection>, BridgeError> {
        let stream = timeout(self.handshake_timeout, TcpStream::connect(&self.endpoint))
            .await
            .map_err(|_| BridgeError::Transport(format!("connect to {} timed out", self.endpoint)))??;
        stream.set_nodelay(true)?;
        let mut framed = Framed::new(stream, KnxdCodec);

        framed.send(KnxdMessage::open_group_socket()).await?;
        let reply = timeout(self.handshake_timeout, framed.next())
            .await
            .map_err(|_| BridgeError::Transport("group socket handshake timed out".into()))?;
        match reply {
            Some(Ok(msg)) if msg.msg_type == KNXD_OPEN_GROUPCON => {
                info!("Opened knxd group socket at {}", self.endpoint);
                Ok(Box::new(KnxdConnection { framed }))
            }
            Some(Ok(msg)) => Err(BridgeError::Transport(format!(
                "knxd refused group socket (reply type 0x{:04X})",
                msg.msg_type
            ))),
            Some(Err(e)) => Err(e),
            None => Err(BridgeError::Transport(
                "knxd closed the connection during handshake".into(),
            )),
        }
    }

    fn describe(&self) -> String {
        format!("knxd://{}", self.endpoint)
    }
}

/// An open knxd group socket.
pub struct KnxdConnection {
    framed: Framed<TcpStream, KnxdCodec>,
}

#[async_trait]
impl BusConnection for KnxdConnection {
    async fn send_read(&mut self, address: GroupAddress) -> Result<(), BridgeError> {
        let apdu = pack_apdu(TelegramKind::Read, &[]);
        self.framed
            .send(KnxdMessage::group_packet(address, &apdu))
            .await
    }

    async fn recv(&mut self) -> Result<Telegram, BridgeError> {
        loop {
            match self.framed.next().await {
                Some(Ok(msg)) if msg.msg_type == KNXD_GROUP_PACKET => match msg.to_telegram() {
                    Ok(telegram) => return Ok(telegram),
                    Err(e) => debug!("Skipping group packet: {e}"),
                },
                Some(Ok(msg)) => debug!("Ignoring knxd message type 0x{:04X}", msg.msg_type),
                Some(Err(e)) => return Err(e),
                None => return Err(BridgeError::Transport("knxd closed the connection".into())),
            }
        }
    }

    async fn close(&mut self) -> Result<(), BridgeError> {
        SinkExt::<KnxdMessage>::close(&mut self.framed).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_open_group_socket() {
        let mut buf = BytesMut::new();
        KnxdCodec
            .encode(KnxdMessage::open_group_socket(), &mut buf)
            .unwrap();
        assert_eq!(&buf[..], &[0x00, 0x05, 0x00, 0x26, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_encode_read_request() {
        let addr: GroupAddress = "1/2/3".parse().unwrap();
        let mut buf = BytesMut::new();
        KnxdCodec
            .encode(KnxdMessage::group_packet(addr, &[0x00, 0x00]), &mut buf)
            .unwrap();
        assert_eq!(&buf[..], &[0x00, 0x06, 0x00, 0x27, 0x0A, 0x03, 0x00, 0x00]);
    }

    #[test]
    fn test_decode_partial_then_complete() {
        let mut codec = KnxdCodec;
        let mut buf = BytesMut::from(&[0x00, 0x08, 0x00, 0x27, 0x11][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&[0x01, 0x0A, 0x03, 0x00, 0x81]);
        let msg = codec.decode(&mut buf).unwrap().unwrap();
        assert!(buf.is_empty());
        assert_eq!(msg.msg_type, KNXD_GROUP_PACKET);

        let telegram = msg.to_telegram().unwrap();
        assert_eq!(telegram.destination.to_string(), "1/2/3");
        assert_eq!(telegram.source.unwrap().to_string(), "1.1.1");
        assert_eq!(telegram.kind, TelegramKind::Write);
        assert_eq!(telegram.payload, vec![0x01]);
    }

    #[test]
    fn test_decode_rejects_bad_length() {
        let mut buf = BytesMut::from(&[0x00, 0x01, 0x00][..]);
        assert!(KnxdCodec.decode(&mut buf).is_err());
    }

    #[tokio::test]
    async fn test_connect_refused_is_transport_error() {
        // Port 9 on localhost is almost never listening; either refusal or
        // timeout must surface as a transport error.
        let transport = KnxdTransport::new("127.0.0.1:9", Duration::from_millis(200));
        assert!(matches!(
            transport.connect().await,
            Err(BridgeError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_handshake_and_receive_over_tcp() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut open = [0u8; 7];
            socket.read_exact(&mut open).await.unwrap();
            assert_eq!(open, [0x00, 0x05, 0x00, 0x26, 0x00, 0x00, 0x00]);
            socket.write_all(&[0x00, 0x02, 0x00, 0x26]).await.unwrap();
            // 21.0 degrees written to 1/2/3 by 1.1.1
            socket
                .write_all(&[0x00, 0x0A, 0x00, 0x27, 0x11, 0x01, 0x0A, 0x03, 0x00, 0x80, 0x0C, 0x1A])
                .await
                .unwrap();
            let mut read = [0u8; 8];
            socket.read_exact(&mut read).await.unwrap();
            read
        });

        let transport = KnxdTransport::new(endpoint, Duration::from_secs(2));
        let mut conn = transport.connect().await.unwrap();
        let telegram = conn.recv().await.unwrap();
        assert_eq!(telegram.kind, TelegramKind::Write);
        assert_eq!(telegram.payload, vec![0x0C, 0x1A]);

        conn.send_read(telegram.destination).await.unwrap();
        let read = server.await.unwrap();
        assert_eq!(read, [0x00, 0x06, 0x00, 0x27, 0x0A, 0x03, 0x00, 0x00]);
    }
}
