//! Typed event bus.
//!
//! Every connection publishes semantic events here; subscribers hold a
//! bounded queue and lagging subscribers lose the oldest events with a
//! warning rather than stalling the producer. Dispatch order for one
//! event is the subscription order of the receivers.

use std::sync::Arc;
use std::time::Duration;

use munin_proto::ModeChange;
use tokio::sync::broadcast;
use tracing::warn;

/// Queue depth per subscriber before drop-oldest kicks in.
const BUS_CAPACITY: usize = 1024;

/// One semantic event with its originating server.
#[derive(Debug, Clone)]
pub struct Event {
    /// Server id from the configuration.
    pub server_id: String,
    /// IRCv3 batch reference, when the message arrived inside one.
    pub batch: Option<String>,
    pub kind: EventKind,
}

/// Whois summary accumulated across 311/312/319/330 and finalized by 318.
#[derive(Debug, Clone, Default)]
pub struct WhoisInfo {
    pub nick: String,
    pub username: Option<String>,
    pub host: Option<String>,
    pub realname: Option<String>,
    pub server: Option<String>,
    pub account: Option<String>,
    pub channels: Vec<String>,
    pub is_operator: bool,
}

#[derive(Debug, Clone)]
pub enum EventKind {
    Connected,
    Registered,
    Disconnected {
        reason: String,
    },
    Reconnecting {
        attempt: u32,
        delay: Duration,
    },
    ChannelMessage {
        channel: String,
        nick: String,
        hostmask: String,
        text: String,
        action: bool,
    },
    PrivateMessage {
        nick: String,
        hostmask: String,
        text: String,
        action: bool,
    },
    Notice {
        target: String,
        nick: String,
        hostmask: String,
        text: String,
    },
    Ctcp {
        target: String,
        nick: String,
        hostmask: String,
        command: String,
        args: String,
    },
    ChannelJoined {
        channel: String,
    },
    ChannelParted {
        channel: String,
    },
    UserJoined {
        channel: String,
        nick: String,
        hostmask: String,
        account: Option<String>,
    },
    UserParted {
        channel: String,
        nick: String,
        hostmask: String,
        reason: Option<String>,
    },
    UserQuit {
        nick: String,
        hostmask: String,
        reason: Option<String>,
        channels: Vec<String>,
    },
    UserKicked {
        channel: String,
        kicker: String,
        kicker_hostmask: String,
        kicked: String,
        reason: Option<String>,
    },
    NickChanged {
        old_nick: String,
        new_nick: String,
        hostmask: String,
    },
    TopicChanged {
        channel: String,
        setter: String,
        topic: String,
    },
    ModeChanged {
        target: String,
        setter: String,
        setter_hostmask: String,
        changes: Vec<ModeChange>,
    },
    Invited {
        channel: String,
        nick: String,
        hostmask: String,
    },
    UserListUpdated {
        channel: String,
    },
    WhoisReceived {
        info: WhoisInfo,
    },
    ChannelListEntry {
        channel: String,
        user_count: u32,
        topic: String,
    },
    ChannelListComplete,
    LatencyUpdated {
        ms: u64,
    },
    RawMessageReceived {
        line: String,
    },
    Error {
        code: &'static str,
        detail: String,
    },
}

/// Fan-out bus shared by all connections.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Arc<Event>>,
}

impl EventBus {
    pub fn new() -> EventBus {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        EventBus { tx }
    }

    /// Publish an event. Nobody listening is not an error.
    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(Arc::new(event));
    }

    pub fn subscribe(&self) -> EventStream {
        EventStream {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for EventBus {
    fn default() -> EventBus {
        EventBus::new()
    }
}

/// A subscriber handle. Lag is absorbed by dropping the oldest events.
pub struct EventStream {
    rx: broadcast::Receiver<Arc<Event>>,
}

impl EventStream {
    /// Receive the next event, or `None` once the bus shuts down.
    pub async fn next(&mut self) -> Option<Arc<Event>> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "slow event subscriber dropped oldest events");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: EventKind) -> Event {
        Event {
            server_id: "test".into(),
            batch: None,
            kind,
        }
    }

    #[tokio::test]
    async fn fan_out_reaches_all_subscribers() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.publish(event(EventKind::Connected));
        assert!(matches!(a.next().await.unwrap().kind, EventKind::Connected));
        assert!(matches!(b.next().await.unwrap().kind, EventKind::Connected));
    }

    #[tokio::test]
    async fn late_subscriber_misses_earlier_events() {
        let bus = EventBus::new();
        bus.publish(event(EventKind::Connected));
        let mut sub = bus.subscribe();
        bus.publish(event(EventKind::ChannelListComplete));
        assert!(matches!(
            sub.next().await.unwrap().kind,
            EventKind::ChannelListComplete
        ));
    }

    #[tokio::test]
    async fn closed_bus_ends_stream() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        drop(bus);
        assert!(sub.next().await.is_none());
    }
}
