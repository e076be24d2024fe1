use crate::message_log::TopicState;

/// Offset below which no attached subscription needs messages.
///
/// Without any attached subscription nothing is retained: new subscriptions
/// start at the end of the topic.
pub(crate) fn min_cursor(state: &TopicState) -> u64 {
    state
        .cursors
        .values()
        .copied()
        .min()
        .unwrap_or_else(|| state.end_offset())
}

/// Removes messages below the slowest cursor and messages published before
/// `horizon_ns`. Returns the number of messages removed.
pub(crate) fn compact_topic(state: &mut TopicState, horizon_ns: Option<u64>) -> u64 {
    let floor = min_cursor(state).min(state.end_offset());
    let mut removed = 0;
    while let Some(front) = state.messages.front() {
        let below_cursor = front.offset < floor;
        let past_horizon = horizon_ns.is_some_and(|horizon| front.publish_time_ns < horizon);
        if !below_cursor && !past_horizon {
            break;
        }
        state.messages.pop_front();
        state.base_offset += 1;
        removed += 1;
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use std::collections::{BTreeMap, HashMap, VecDeque};
    use std::sync::Arc;

    fn state(count: u64) -> TopicState {
        let messages = (0..count)
            .map(|offset| {
                Arc::new(Message {
                    id: offset.to_string(),
                    topic: "t".into(),
                    offset,
                    payload: Vec::new(),
                    publish_time_ns: offset * 100,
                    ordering_key: None,
                    attributes: BTreeMap::new(),
                })
            })
            .collect::<VecDeque<_>>();
        TopicState {
            base_offset: 0,
            messages,
            cursors: HashMap::new(),
        }
    }

    #[test]
    fn no_cursors_drops_everything() {
        let mut state = state(4);
        assert_eq!(compact_topic(&mut state, None), 4);
        assert_eq!(state.base_offset, 4);
        assert_eq!(state.end_offset(), 4);
    }

    #[test]
    fn lagging_cursor_pins_messages() {
        let mut state = state(6);
        state.cursors.insert("a".into(), 5);
        state.cursors.insert("b".into(), 2);
        assert_eq!(compact_topic(&mut state, None), 2);
        assert_eq!(state.messages.front().map(|m| m.offset), Some(2));
    }

    #[test]
    fn horizon_overrides_lagging_cursor() {
        let mut state = state(6);
        state.cursors.insert("b".into(), 0);
        assert_eq!(compact_topic(&mut state, Some(350)), 4);
        assert_eq!(state.base_offset, 4);
    }
}
