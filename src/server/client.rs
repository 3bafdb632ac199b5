use std::{
    fmt::Display,
    net::SocketAddr,
    sync::Arc,
};
use uuid::Uuid;
use dashmap::DashMap;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument};
use tungstenite::Message;
use futures_util::{Sink, SinkExt, StreamExt};

/// Outbound frames a connection may have queued before it counts as stalled.
pub const OUTBOUND_BUFFER: usize = 256;

/// Represents one accepted connection bound to a room.
///
/// Frames are queued on a bounded channel and written by a dedicated writer
/// task, so sending never waits on the socket.
#[derive(Debug, Clone)]
pub struct Client {
    /// Unique identifier for the client.
    pub id: Uuid,
    /// Socket address of the client.
    pub addr: SocketAddr,
    /// Channel sender feeding the writer task.
    sender: mpsc::Sender<Message>,
}

impl Client {
    /// Spawns the writer task that drains `receiver` into `writer`.
    ///
    /// `preamble` is written first, ahead of anything already queued. The
    /// task stops on the first write error or after writing a close frame;
    /// once it has stopped, every send fails.
    ///
    /// # Arguments
    ///
    /// * `receiver` - The outbound queue returned by [`Client::channel`].
    /// * `writer` - The sink half of the WebSocket stream.
    /// * `preamble` - Frames to write before the queue.
    #[instrument(skip(self, receiver, writer, preamble), fields(id = %self.id))]
    pub fn start_writer<W>(
        &self,
        mut receiver: mpsc::Receiver<Message>,
        writer: W,
        preamble: Vec<Message>,
    ) -> JoinHandle<()>
    where
        W: Sink<Message> + Unpin + Send + 'static,
        W::Error: Display,
    {
        let id = self.id;
        tokio::spawn(async move {
            let mut writer = writer;
            let mut frames = futures_util::stream::iter(preamble)
                .chain(futures_util::stream::poll_fn(move |cx| receiver.poll_recv(cx)));
            while let Some(msg) = frames.next().await {
                let closing = msg.is_close();
                if let Err(e) = writer.send(msg).await {
                    error!("Failed to write to {}: {}", id, e);
                    break;
                }
                if closing {
                    break;
                }
            }
            debug!("Writer for {} stopped", id);
        })
    }

    /// Creates a client together with the receiving end of its outbound queue.
    pub fn channel(addr: SocketAddr) -> (Self, mpsc::Receiver<Message>) {
        let (sender, receiver) = mpsc::channel(OUTBOUND_BUFFER);
        let client = Client {
            id: Uuid::new_v4(),
            addr,
            sender,
        };
        (client, receiver)
    }

    /// Queues a message for the client.
    ///
    /// # Errors
    ///
    /// * `ClientError::SendFailed` if the writer has stopped.
    /// * `ClientError::Backpressure` if the outbound queue is full.
    pub fn send(&self, message: Message) -> Result<(), ClientError> {
        self.sender.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => ClientError::Backpressure,
            TrySendError::Closed(_) => ClientError::SendFailed,
        })
    }

    /// Queues a close frame; the writer task exits after writing it.
    pub fn close(&self) {
        if self.send(Message::Close(None)).is_err() {
            debug!("Client {} already gone when closing", self.id);
        }
    }
}

/// Tracks live connections grouped by room.
///
/// Each room owns its own concurrent map, so admission, removal and fan-out
/// contend per room at most. Removal during broadcast is expected: a failed
/// send evicts the connection in the same pass.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    rooms: Arc<DashMap<String, DashMap<Uuid, Client>>>,
}

impl ConnectionRegistry {
    /// Creates a new, empty `ConnectionRegistry`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a client to the member set of `room`, creating the room on first use.
    pub fn admit(&self, room: &str, client: Client) {
        self.rooms
            .entry(room.to_string())
            .or_default()
            .insert(client.id, client);
    }

    /// Removes a client from `room`, dropping the room once it is empty.
    pub fn remove(&self, room: &str, id: &Uuid) {
        if let Some(members) = self.rooms.get(room) {
            members.remove(id);
        }
        self.rooms.remove_if(room, |_, members| members.is_empty());
    }

    /// Delivers `message` to every connection registered in `room`.
    ///
    /// Connections whose send fails are removed instead of being reported.
    /// Returns the number of connections the message was queued for.
    #[instrument(skip(self, message))]
    pub fn broadcast(&self, room: &str, message: &Message) -> usize {
        let mut delivered = 0;
        if let Some(members) = self.rooms.get(room) {
            members.retain(|id, client| match client.send(message.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(e) => {
                    error!("Broadcast failed to {} in {}: {}", id, room, e);
                    false
                }
            });
        }
        self.rooms.remove_if(room, |_, members| members.is_empty());
        delivered
    }

    /// Number of live connections in `room`.
    pub fn room_size(&self, room: &str) -> usize {
        self.rooms.get(room).map(|members| members.len()).unwrap_or(0)
    }

    /// Number of live connections across all rooms.
    pub fn len(&self) -> usize {
        self.rooms.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sends a close frame to every connection and empties the registry.
    pub fn close_all(&self) {
        self.rooms.iter().for_each(|entry| {
            entry.value().iter().for_each(|member| member.value().close());
        });
        self.rooms.clear();
    }
}

/// Represents errors that may occur in client operations.
#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("Failed to send message")]
    SendFailed,
    #[error("Outbound queue full")]
    Backpressure,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::PollSender;

    fn addr() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    #[tokio::test]
    async fn broadcast_evicts_dead_connections() {
        let registry = ConnectionRegistry::new();
        let (alive_a, mut rx_a) = Client::channel(addr());
        let (alive_b, mut rx_b) = Client::channel(addr());
        let (dead, rx_dead) = Client::channel(addr());
        drop(rx_dead);

        registry.admit("lobby", alive_a);
        registry.admit("lobby", alive_b);
        registry.admit("lobby", dead);
        assert_eq!(registry.room_size("lobby"), 3);

        let frame = Message::Text("hello".into());
        assert_eq!(registry.broadcast("lobby", &frame), 2);
        assert_eq!(registry.room_size("lobby"), 2);

        assert_eq!(rx_a.recv().await.unwrap(), frame);
        assert_eq!(rx_b.recv().await.unwrap(), frame);
    }

    #[tokio::test]
    async fn broadcast_is_scoped_to_room() {
        let registry = ConnectionRegistry::new();
        let (lobby, mut rx_lobby) = Client::channel(addr());
        let (garden, mut rx_garden) = Client::channel(addr());
        registry.admit("lobby", lobby);
        registry.admit("garden", garden);

        registry.broadcast("lobby", &Message::Text("only lobby".into()));

        assert_eq!(rx_lobby.recv().await.unwrap(), Message::Text("only lobby".into()));
        assert!(rx_garden.try_recv().is_err());
    }

    #[test]
    fn stalled_connection_is_evicted() {
        let registry = ConnectionRegistry::new();
        let (slow, _rx_kept_but_never_read) = Client::channel(addr());
        registry.admit("lobby", slow);

        let frame = Message::Text("x".into());
        for _ in 0..OUTBOUND_BUFFER {
            assert_eq!(registry.broadcast("lobby", &frame), 1);
        }
        assert_eq!(registry.broadcast("lobby", &frame), 0);
        assert_eq!(registry.room_size("lobby"), 0);
    }

    #[test]
    fn empty_rooms_are_dropped() {
        let registry = ConnectionRegistry::new();
        let (client, _rx) = Client::channel(addr());
        let id = client.id;
        registry.admit("lobby", client);
        assert_eq!(registry.room_size("lobby"), 1);

        registry.remove("lobby", &id);
        assert_eq!(registry.room_size("lobby"), 0);
        assert!(registry.rooms.is_empty());
        assert!(registry.is_empty());

        // Removing from an unknown room is a no-op.
        registry.remove("nowhere", &id);
    }

    #[tokio::test]
    async fn writer_sends_preamble_before_queued_frames() {
        let (client, rx) = Client::channel(addr());
        client.send(Message::Text("queued".into())).unwrap();

        let (sink, mut written) = mpsc::channel::<Message>(16);
        let writer = client.start_writer(
            rx,
            PollSender::new(sink),
            vec![Message::Text("first".into())],
        );
        client.send(Message::Text("later".into())).unwrap();
        client.close();
        writer.await.unwrap();

        let mut frames = Vec::new();
        while let Some(frame) = written.recv().await {
            frames.push(frame);
        }
        assert_eq!(
            frames,
            vec![
                Message::Text("first".into()),
                Message::Text("queued".into()),
                Message::Text("later".into()),
                Message::Close(None),
            ]
        );
        assert!(client.send(Message::Text("gone".into())).is_err());
    }
}
