use ethers::abi::{parse_abi, Abi, Event, RawLog, Token};
use ethers::types::{Address, Log, H256, U256};
use std::collections::HashMap;
use std::fmt;

use super::SyncError;

/// Pure state transition for one event: `(previous state, event, raw log) -> new state`.
pub type EventHandler<S> = Box<dyn Fn(&S, &DecodedEvent, &Log) -> Result<S, SyncError> + Send + Sync>;

/// A log decoded against its ABI event, with named parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedEvent {
    pub name: String,
    pub params: Vec<(String, Token)>,
}

impl DecodedEvent {
    pub fn param(&self, name: &str) -> Option<&Token> {
        self.params
            .iter()
            .find(|(param, _)| param == name)
            .map(|(_, token)| token)
    }

    pub fn uint(&self, name: &str) -> Result<U256, SyncError> {
        match self.param(name) {
            Some(Token::Uint(value)) => Ok(*value),
            _ => Err(self.missing(name)),
        }
    }

    pub fn address(&self, name: &str) -> Result<Address, SyncError> {
        match self.param(name) {
            Some(Token::Address(value)) => Ok(*value),
            _ => Err(self.missing(name)),
        }
    }

    fn missing(&self, param: &str) -> SyncError {
        SyncError::MissingParam {
            event: self.name.clone(),
            param: param.to_string(),
        }
    }
}

/// Topic-keyed event decoding with name-keyed handlers.
///
/// Logs whose first topic is not in the ABI, and events without a registered
/// handler, are ignored rather than treated as errors.
pub struct EventDecoder<S> {
    events: HashMap<H256, Event>,
    handlers: HashMap<String, EventHandler<S>>,
}

impl<S> EventDecoder<S> {
    pub fn new(abi: &Abi) -> Self {
        Self {
            events: abi
                .events()
                .filter(|event| !event.anonymous)
                .map(|event| (event.signature(), event.clone()))
                .collect(),
            handlers: HashMap::new(),
        }
    }

    /// Builds a decoder from human-readable event signatures, e.g.
    /// `"event Sync(uint112 reserve0, uint112 reserve1)"`.
    pub fn from_signatures(signatures: &[&str]) -> anyhow::Result<Self> {
        let abi = parse_abi(signatures)?;
        Ok(Self::new(&abi))
    }

    /// Registers the handler for `event_name`, replacing any previous one.
    pub fn on<F>(mut self, event_name: &str, handler: F) -> Self
    where
        F: Fn(&S, &DecodedEvent, &Log) -> Result<S, SyncError> + Send + Sync + 'static,
    {
        self.handlers.insert(event_name.to_string(), Box::new(handler));
        self
    }

    /// First topics of every event the decoder knows.
    pub fn topics(&self) -> Vec<H256> {
        let mut topics: Vec<H256> = self.events.keys().copied().collect();
        topics.sort();
        topics
    }

    pub fn topic_of(&self, event_name: &str) -> Option<H256> {
        self.events
            .iter()
            .find(|(_, event)| event.name == event_name)
            .map(|(topic, _)| *topic)
    }

    /// Decodes `log`, or returns `None` if its first topic is unknown.
    pub fn decode(&self, log: &Log) -> Result<Option<DecodedEvent>, SyncError> {
        let Some(event) = log.topics.first().and_then(|topic| self.events.get(topic)) else {
            return Ok(None);
        };
        let raw = RawLog {
            topics: log.topics.clone(),
            data: log.data.to_vec(),
        };
        let parsed = event.parse_log(raw).map_err(|e| SyncError::Decode {
            event: event.name.clone(),
            reason: e.to_string(),
        })?;
        Ok(Some(DecodedEvent {
            name: event.name.clone(),
            params: parsed
                .params
                .into_iter()
                .map(|param| (param.name, param.value))
                .collect(),
        }))
    }

    /// Applies `log` to `state`. `Ok(None)` means the log does not affect this
    /// state (unknown topic or no handler).
    pub fn apply(&self, state: &S, log: &Log) -> Result<Option<S>, SyncError> {
        let Some(event) = self.decode(log)? else {
            return Ok(None);
        };
        match self.handlers.get(&event.name) {
            Some(handler) => handler(state, &event, log).map(Some),
            None => Ok(None),
        }
    }
}

impl<S> fmt::Debug for EventDecoder<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut handlers: Vec<&String> = self.handlers.keys().collect();
        handlers.sort();
        f.debug_struct("EventDecoder")
            .field("events", &self.events.len())
            .field("handlers", &handlers)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::abi::encode;

    #[derive(Debug, Clone, PartialEq, Default)]
    struct Counter {
        total: U256,
        last_sender: Address,
    }

    fn decoder() -> EventDecoder<Counter> {
        EventDecoder::from_signatures(&[
            "event Added(address indexed sender, uint256 amount)",
            "event Paused()",
        ])
        .unwrap()
        .on("Added", |state: &Counter, event, _log| {
            Ok(Counter {
                total: state.total + event.uint("amount")?,
                last_sender: event.address("sender")?,
            })
        })
    }

    fn added_log(decoder: &EventDecoder<Counter>, sender: Address, amount: u64) -> Log {
        Log {
            topics: vec![
                decoder.topic_of("Added").unwrap(),
                H256::from(sender),
            ],
            data: encode(&[Token::Uint(amount.into())]).into(),
            ..Default::default()
        }
    }

    #[test]
    fn applies_registered_handler() {
        let decoder = decoder();
        let sender = Address::repeat_byte(9);
        let next = decoder
            .apply(&Counter::default(), &added_log(&decoder, sender, 5))
            .unwrap()
            .unwrap();
        assert_eq!(next.total, U256::from(5));
        assert_eq!(next.last_sender, sender);
    }

    #[test]
    fn unknown_topics_and_unhandled_events_are_ignored() {
        let decoder = decoder();
        let unknown = Log {
            topics: vec![H256::repeat_byte(0xee)],
            ..Default::default()
        };
        assert_eq!(decoder.apply(&Counter::default(), &unknown).unwrap(), None);

        let paused = Log {
            topics: vec![decoder.topic_of("Paused").unwrap()],
            ..Default::default()
        };
        assert_eq!(decoder.apply(&Counter::default(), &paused).unwrap(), None);
        assert_eq!(decoder.topics().len(), 2);
    }

    #[test]
    fn malformed_data_is_a_decode_error() {
        let decoder = decoder();
        let mut log = added_log(&decoder, Address::zero(), 1);
        log.data = vec![1u8, 2, 3].into();
        assert!(matches!(
            decoder.apply(&Counter::default(), &log),
            Err(SyncError::Decode { .. })
        ));
    }
}
