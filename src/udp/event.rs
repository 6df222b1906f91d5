use super::client::ClientState;
use super::peer::PeerInfo;
use crate::error::Error;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// Something the client observed that its owner may want to render or act on.
#[derive(Debug)]
pub enum ClientEvent {
    StateChanged(ClientState),
    PeerAssigned(PeerInfo),
    /// Opaque application data from a peer.
    MessageReceived { from: SocketAddr, data: Vec<u8> },
    /// Non-fatal failure, the client keeps running.
    ErrorOccurred(Error),
}

/// Fans every event out to one queue per subscriber.
///
/// A subscriber sees events in the order the client produced them. Slow
/// subscribers only delay themselves.
#[derive(Default)]
pub(crate) struct EventBus {
    subscribers: Mutex<Vec<UnboundedSender<Arc<ClientEvent>>>>,
}

impl EventBus {
    pub fn emit(&self, event: ClientEvent) {
        let event = Arc::new(event);
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn channel(&self) -> UnboundedReceiver<Arc<ClientEvent>> {
        let (tx, rx) = unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Runs `f` on its own task for every event. Must be called within a
    /// Tokio runtime.
    pub fn subscribe<F>(&self, f: F)
    where
        F: Fn(&ClientEvent) + Send + 'static,
    {
        let mut rx = self.channel();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                f(&event);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_each_subscriber_sees_every_event_in_order() {
        let bus = EventBus::default();
        let mut a = bus.channel();
        let mut b = bus.channel();

        bus.emit(ClientEvent::StateChanged(ClientState::Connecting));
        bus.emit(ClientEvent::StateChanged(ClientState::Waiting));

        for rx in [&mut a, &mut b] {
            for want in [ClientState::Connecting, ClientState::Waiting] {
                match rx.recv().await.unwrap().as_ref() {
                    ClientEvent::StateChanged(s) => assert_eq!(*s, want),
                    e => panic!("unexpected {:?}", e),
                }
            }
        }
    }

    #[tokio::test]
    async fn test_dropped_subscriber_is_pruned() {
        let bus = EventBus::default();
        drop(bus.channel());
        bus.emit(ClientEvent::ErrorOccurred(Error::NoPeerInfo));
        assert!(bus.subscribers.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_runs_closure() {
        let bus = EventBus::default();
        let (tx, mut rx) = unbounded_channel();
        bus.subscribe(move |e| {
            if let ClientEvent::MessageReceived { data, .. } = e {
                let _ = tx.send(data.clone());
            }
        });

        bus.emit(ClientEvent::MessageReceived {
            from: "127.0.0.1:1".parse().unwrap(),
            data: b"hello".to_vec(),
        });

        let got = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(got.unwrap(), b"hello");
    }
}
