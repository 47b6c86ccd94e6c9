use std::net::SocketAddr;
use std::sync::Arc;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tracing::trace;

/// This is an abstraction for sending a datagram, introduced to facilitate mocking the I/O part
///  away for testing (and to plug in lossy links)
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) -> std::io::Result<()>;
}

/// A listening socket that is shared by all connections of a server
#[async_trait]
impl SendSocket for Arc<UdpSocket> {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) -> std::io::Result<()> {
        trace!("UDP socket: sending packet to {:?}", to);
        self.send_to(packet_buf, to).await?;
        Ok(())
    }
}

/// A socket that is connected to a single peer, ignoring the address it is called with
pub struct ConnectedUdpSocket(pub Arc<UdpSocket>);

#[async_trait]
impl SendSocket for ConnectedUdpSocket {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) -> std::io::Result<()> {
        trace!("connected UDP socket: sending packet to {:?}", to);
        self.0.send(packet_buf).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_to() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let sender = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());

        sender.do_send_packet(receiver.local_addr().unwrap(), &[1, 2, 3]).await.unwrap();

        let mut buf = [0u8; 16];
        let (len, from) = receiver.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], &[1, 2, 3]);
        assert_eq!(from, sender.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_connected_send() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.connect(receiver.local_addr().unwrap()).await.unwrap();
        let sender = ConnectedUdpSocket(Arc::new(socket));

        sender.do_send_packet(receiver.local_addr().unwrap(), &[4, 5]).await.unwrap();

        let mut buf = [0u8; 16];
        let len = receiver.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], &[4, 5]);
    }
}
