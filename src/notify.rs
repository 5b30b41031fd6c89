use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// What a listener can subscribe to. Channel names match `LISTEN <name>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Reservations,
    Profiles,
}

impl Topic {
    pub const ALL: [Topic; 2] = [Topic::Reservations, Topic::Profiles];

    pub fn channel(self) -> &'static str {
        match self {
            Topic::Reservations => "reservations",
            Topic::Profiles => "profiles",
        }
    }

    pub fn from_channel(channel: &str) -> Option<Topic> {
        let channel = channel.trim().trim_matches('"');
        Topic::ALL
            .into_iter()
            .find(|t| t.channel().eq_ignore_ascii_case(channel))
    }

    /// Admin grants travel with profile changes.
    pub fn of(event: &Event) -> Topic {
        if event.is_reservation_event() {
            Topic::Reservations
        } else {
            Topic::Profiles
        }
    }
}

/// Broadcast hub for committed events, one channel per topic.
pub struct NotifyHub {
    channels: DashMap<Topic, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a topic. Creates the channel if needed.
    pub fn subscribe(&self, topic: Topic) -> broadcast::Receiver<Event> {
        self.channels
            .entry(topic)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// No-op if nobody is listening.
    pub fn publish(&self, event: &Event) {
        if let Some(sender) = self.channels.get(&Topic::of(event)) {
            let _ = sender.send(event.clone());
        }
    }

    #[cfg(test)]
    pub fn listener_count(&self, topic: Topic) -> usize {
        self.channels
            .get(&topic)
            .map_or(0, |s| s.receiver_count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Span;
    use ulid::Ulid;

    #[tokio::test]
    async fn reservation_events_reach_reservation_listeners() {
        let hub = NotifyHub::new();
        let mut reservations = hub.subscribe(Topic::Reservations);
        let mut profiles = hub.subscribe(Topic::Profiles);

        let event = Event::ReservationCreated {
            id: Ulid::new(),
            owner_id: "anna".into(),
            span: Span::new(0, 10),
            created_at: 0,
        };
        hub.publish(&event);

        assert_eq!(reservations.recv().await.unwrap(), event);
        assert!(profiles.try_recv().is_err());
    }

    #[tokio::test]
    async fn admin_events_go_to_profiles() {
        let hub = NotifyHub::new();
        let mut profiles = hub.subscribe(Topic::Profiles);
        let event = Event::AdminGranted { id: "anna".into() };
        hub.publish(&event);
        assert_eq!(profiles.recv().await.unwrap(), event);
    }

    #[test]
    fn publish_without_listeners_is_noop() {
        let hub = NotifyHub::new();
        hub.publish(&Event::ReservationDeleted { id: Ulid::new() });
        assert_eq!(hub.listener_count(Topic::Reservations), 0);
    }

    #[test]
    fn channel_names() {
        assert_eq!(Topic::from_channel("reservations"), Some(Topic::Reservations));
        assert_eq!(Topic::from_channel("\"PROFILES\""), Some(Topic::Profiles));
        assert_eq!(Topic::from_channel("slots"), None);
        for t in Topic::ALL {
            assert_eq!(Topic::from_channel(t.channel()), Some(t));
        }
    }
}
