//! Vendor contract log decoding
//!
//! Raw logs are matched on topic0 against the three event signatures the
//! relay handles and decoded into [`VendorEvent`]s. Anything else is
//! rejected here, before it reaches the queue.

use ethers::abi::{Event, RawLog, Token};
use ethers::types::{Address, Log, H256, U256};

use crate::chain::vendor_abi;
use crate::error::{RelayError, RelayResult};
use crate::types::{QueuedEvent, VendorEvent};

/// Decoder for `Purchase`, `LockerAssigned` and `LockerOpened` logs
#[derive(Debug, Clone)]
pub struct EventCodec {
    purchase: Event,
    locker_assigned: Event,
    locker_opened: Event,
}

impl EventCodec {
    pub fn new() -> RelayResult<Self> {
        let abi = vendor_abi()?;
        let event = |name: &str| {
            abi.event(name)
                .cloned()
                .map_err(|e| RelayError::Config(format!("Vendor ABI has no event {}: {}", name, e)))
        };
        Ok(Self {
            purchase: event("Purchase")?,
            locker_assigned: event("LockerAssigned")?,
            locker_opened: event("LockerOpened")?,
        })
    }

    /// topic0 values to filter logs on
    pub fn topics(&self) -> Vec<H256> {
        vec![
            self.purchase.signature(),
            self.locker_assigned.signature(),
            self.locker_opened.signature(),
        ]
    }

    /// Decode one log into a queue entry carrying its block and transaction
    pub fn decode(&self, log: &Log) -> RelayResult<QueuedEvent> {
        let topic0 = log.topics.first().copied();
        let raw = RawLog {
            topics: log.topics.clone(),
            data: log.data.to_vec(),
        };

        let event = match topic0 {
            Some(t) if t == self.purchase.signature() => {
                let parsed = parse(&self.purchase, raw)?;
                VendorEvent::Purchase {
                    buyer: address_param(&parsed, "buyer")?,
                    amount: uint_param(&parsed, "amount")?,
                    email: string_param(&parsed, "email")?,
                }
            }
            Some(t) if t == self.locker_assigned.signature() => {
                let parsed = parse(&self.locker_assigned, raw)?;
                VendorEvent::LockerAssigned {
                    buyer: address_param(&parsed, "buyer")?,
                    locker_number: locker_param(&parsed)?,
                }
            }
            Some(t) if t == self.locker_opened.signature() => {
                let parsed = parse(&self.locker_opened, raw)?;
                VendorEvent::LockerOpened {
                    buyer: address_param(&parsed, "buyer")?,
                    locker_number: locker_param(&parsed)?,
                }
            }
            other => return Err(RelayError::UnknownEvent(other)),
        };

        Ok(QueuedEvent::new(event)
            .with_origin(log.block_number.map(|n| n.as_u64()), log.transaction_hash))
    }
}

fn parse(event: &Event, raw: RawLog) -> RelayResult<ethers::abi::Log> {
    event
        .parse_log(raw)
        .map_err(|e| RelayError::MalformedEvent(format!("{}: {}", event.name, e)))
}

fn param<'a>(log: &'a ethers::abi::Log, name: &str) -> RelayResult<&'a Token> {
    log.params
        .iter()
        .find(|p| p.name == name)
        .map(|p| &p.value)
        .ok_or_else(|| RelayError::MalformedEvent(format!("missing parameter {}", name)))
}

fn address_param(log: &ethers::abi::Log, name: &str) -> RelayResult<Address> {
    match param(log, name)? {
        Token::Address(a) => Ok(*a),
        other => Err(RelayError::MalformedEvent(format!("{} is not an address: {:?}", name, other))),
    }
}

fn uint_param(log: &ethers::abi::Log, name: &str) -> RelayResult<U256> {
    match param(log, name)? {
        Token::Uint(v) => Ok(*v),
        other => Err(RelayError::MalformedEvent(format!("{} is not a uint: {:?}", name, other))),
    }
}

fn string_param(log: &ethers::abi::Log, name: &str) -> RelayResult<String> {
    match param(log, name)? {
        Token::String(s) => Ok(s.clone()),
        other => Err(RelayError::MalformedEvent(format!("{} is not a string: {:?}", name, other))),
    }
}

fn locker_param(log: &ethers::abi::Log) -> RelayResult<u8> {
    let value = uint_param(log, "lockerNumber")?;
    if value > U256::from(u8::MAX) {
        return Err(RelayError::MalformedEvent(format!("lockerNumber {} out of range", value)));
    }
    Ok(value.low_u32() as u8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::abi::encode;
    use ethers::types::{Bytes, U64};

    fn log(topics: Vec<H256>, data: Vec<u8>) -> Log {
        Log {
            topics,
            data: Bytes::from(data),
            block_number: Some(U64::from(42)),
            transaction_hash: Some(H256::repeat_byte(0x99)),
            ..Default::default()
        }
    }

    fn buyer_topic(buyer: Address) -> H256 {
        H256::from(buyer)
    }

    #[test]
    fn test_decode_purchase() {
        let codec = EventCodec::new().unwrap();
        let buyer = Address::repeat_byte(0xaa);
        let data = encode(&[Token::Uint(U256::from(500)), Token::String("a@x.com".into())]);
        let queued = codec
            .decode(&log(vec![codec.purchase.signature(), buyer_topic(buyer)], data))
            .unwrap();

        assert_eq!(
            queued.event,
            VendorEvent::Purchase {
                buyer,
                amount: U256::from(500),
                email: "a@x.com".to_string()
            }
        );
        assert_eq!(queued.block_number, Some(42));
        assert_eq!(queued.transaction_hash, Some(H256::repeat_byte(0x99)));
    }

    #[test]
    fn test_decode_locker_events() {
        let codec = EventCodec::new().unwrap();
        let buyer = Address::repeat_byte(0xbb);
        let data = encode(&[Token::Uint(U256::from(255))]);

        let assigned = codec
            .decode(&log(vec![codec.locker_assigned.signature(), buyer_topic(buyer)], data.clone()))
            .unwrap();
        assert_eq!(
            assigned.event,
            VendorEvent::LockerAssigned { buyer, locker_number: 255 }
        );

        let opened = codec
            .decode(&log(vec![codec.locker_opened.signature(), buyer_topic(buyer)], data))
            .unwrap();
        assert_eq!(opened.event, VendorEvent::LockerOpened { buyer, locker_number: 255 });
    }

    #[test]
    fn test_unknown_topic_is_rejected() {
        let codec = EventCodec::new().unwrap();
        let topic = H256::repeat_byte(0x01);
        assert!(matches!(
            codec.decode(&log(vec![topic], vec![])),
            Err(RelayError::UnknownEvent(Some(t))) if t == topic
        ));
        assert!(matches!(
            codec.decode(&log(vec![], vec![])),
            Err(RelayError::UnknownEvent(None))
        ));
    }

    #[test]
    fn test_truncated_payload_is_malformed() {
        let codec = EventCodec::new().unwrap();
        let buyer = Address::repeat_byte(0xcc);
        let result = codec.decode(&log(vec![codec.purchase.signature(), buyer_topic(buyer)], vec![0u8; 8]));
        assert!(matches!(result, Err(RelayError::MalformedEvent(_))));
    }

    #[test]
    fn test_topics_match_event_signatures() {
        let codec = EventCodec::new().unwrap();
        let topics = codec.topics();
        assert_eq!(topics.len(), 3);
        assert_eq!(
            topics[1],
            H256::from(ethers::utils::keccak256("LockerAssigned(address,uint8)"))
        );
    }
}
