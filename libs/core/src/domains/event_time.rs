//! Unified event timestamp derivation. A core `Event` carries up to three
//! separate timestamp fields; callers sort and display by one derived key
//! instead of picking a field ad hoc at each call site (an Open Question
//! resolved in favor of this single `eventTimestamp`, see DESIGN.md).

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Event;

pub fn event_timestamp(event: &Event) -> DateTime<Utc> {
    if let Some(t) = &event.event_time {
        return t.0;
    }
    if let Some(t) = &event.last_timestamp {
        return t.0;
    }
    if let Some(t) = &event.first_timestamp {
        return t.0;
    }
    DateTime::<Utc>::UNIX_EPOCH
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ObjectReference;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta, Time};

    fn base_event() -> Event {
        Event {
            metadata: ObjectMeta::default(),
            involved_object: ObjectReference::default(),
            ..Default::default()
        }
    }

    #[test]
    fn prefers_event_time_over_last_timestamp() {
        let mut event = base_event();
        let early = Utc::now() - chrono::Duration::hours(1);
        let late = Utc::now();
        event.event_time = Some(MicroTime(late));
        event.last_timestamp = Some(Time(early));
        assert_eq!(event_timestamp(&event), late);
    }

    #[test]
    fn falls_back_to_first_timestamp_when_others_absent() {
        let mut event = base_event();
        let first = Utc::now() - chrono::Duration::minutes(5);
        event.first_timestamp = Some(Time(first));
        assert_eq!(event_timestamp(&event), first);
    }
}
