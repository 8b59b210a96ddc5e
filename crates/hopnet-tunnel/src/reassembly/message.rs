//! One partially received message.

use crate::codec::Delivery;
use crate::timer::TimerHandle;
use crate::{Result, TunnelError, MAX_FRAGMENTS, MAX_MESSAGE_SIZE};

/// Fragments of one message, indexed by fragment number.
pub struct FragmentedMessage {
    message_id: u32,
    serial: u64,
    fragments: Vec<Option<Vec<u8>>>,
    delivery: Option<Delivery>,
    last_number: Option<u8>,
    highest: u8,
    received: usize,
    size: usize,
    created: u64,
    expire: Option<TimerHandle>,
}

impl FragmentedMessage {
    pub fn new(message_id: u32, serial: u64, now: u64) -> Self {
        Self {
            message_id,
            serial,
            fragments: vec![None; MAX_FRAGMENTS],
            delivery: None,
            last_number: None,
            highest: 0,
            received: 0,
            size: 0,
            created: now,
            expire: None,
        }
    }

    pub fn message_id(&self) -> u32 {
        self.message_id
    }

    /// Distinguishes this message from a later one reusing its id.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn created(&self) -> u64 {
        self.created
    }

    /// Fragments received so far.
    pub fn fragment_count(&self) -> usize {
        self.received
    }

    /// Payload bytes received so far.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn expire_handle(&self) -> Option<TimerHandle> {
        self.expire
    }

    pub fn set_expire_handle(&mut self, handle: TimerHandle) {
        self.expire = Some(handle);
    }

    /// Store fragment 0, which carries the delivery instructions.
    pub fn receive_first(&mut self, delivery: Delivery, payload: &[u8]) -> Result<()> {
        self.store(0, payload, false)?;
        self.delivery = Some(delivery);
        Ok(())
    }

    /// Store follow-on fragment `number`.
    pub fn receive(&mut self, number: u8, payload: &[u8], is_last: bool) -> Result<()> {
        if number == 0 {
            return Err(TunnelError::Corrupt("follow-on fragment numbered 0".into()));
        }
        self.store(number, payload, is_last)
    }

    fn store(&mut self, number: u8, payload: &[u8], is_last: bool) -> Result<()> {
        let index = usize::from(number);
        if index >= MAX_FRAGMENTS {
            return Err(TunnelError::Corrupt(format!("fragment number {number}")));
        }
        if self.fragments[index].is_some() {
            return Err(TunnelError::Corrupt(format!(
                "duplicate fragment {number} of message {}",
                self.message_id
            )));
        }
        if let Some(last) = self.last_number {
            if number > last || (is_last && number != last) {
                return Err(TunnelError::Corrupt(format!(
                    "fragment {number} conflicts with last fragment {last}"
                )));
            }
        }
        if is_last && number < self.highest {
            return Err(TunnelError::Corrupt(format!(
                "last fragment {number} below fragment {}",
                self.highest
            )));
        }
        let size = self.size + payload.len();
        if size > MAX_MESSAGE_SIZE {
            return Err(TunnelError::MessageTooLarge(size));
        }

        self.fragments[index] = Some(payload.to_vec());
        self.size = size;
        self.received += 1;
        self.highest = self.highest.max(number);
        if is_last {
            self.last_number = Some(number);
        }
        Ok(())
    }

    /// Whether the last fragment and everything before it are present.
    pub fn is_complete(&self) -> bool {
        match self.last_number {
            Some(last) => self.fragments[..=usize::from(last)]
                .iter()
                .all(Option::is_some),
            None => false,
        }
    }

    /// Concatenate the fragments. Only meaningful once complete.
    pub fn assemble(self) -> (Vec<u8>, Delivery) {
        let mut data = Vec::with_capacity(self.size);
        for fragment in self.fragments.into_iter().flatten() {
            data.extend_from_slice(&fragment);
        }
        (data, self.delivery.unwrap_or(Delivery::Local))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_order() {
        let mut msg = FragmentedMessage::new(1, 0, 0);
        msg.receive_first(Delivery::Local, b"ab").expect("first");
        assert!(!msg.is_complete());
        msg.receive(1, b"cd", false).expect("middle");
        msg.receive(2, b"e", true).expect("last");
        assert!(msg.is_complete());
        assert_eq!(msg.fragment_count(), 3);
        let (data, delivery) = msg.assemble();
        assert_eq!(data, b"abcde");
        assert_eq!(delivery, Delivery::Local);
    }

    #[test]
    fn test_out_of_order() {
        let mut msg = FragmentedMessage::new(1, 0, 0);
        msg.receive(2, b"e", true).expect("last");
        msg.receive(1, b"cd", false).expect("middle");
        assert!(!msg.is_complete());
        msg.receive_first(Delivery::Local, b"ab").expect("first");
        assert!(msg.is_complete());
        assert_eq!(msg.assemble().0, b"abcde");
    }

    #[test]
    fn test_gap_is_incomplete() {
        let mut msg = FragmentedMessage::new(1, 0, 0);
        msg.receive_first(Delivery::Local, b"a").expect("first");
        msg.receive(3, b"d", true).expect("last");
        msg.receive(1, b"b", false).expect("one");
        assert!(!msg.is_complete());
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut msg = FragmentedMessage::new(1, 0, 0);
        msg.receive(1, b"x", false).expect("first copy");
        assert!(msg.receive(1, b"x", false).is_err());
    }

    #[test]
    fn test_beyond_last_rejected() {
        let mut msg = FragmentedMessage::new(1, 0, 0);
        msg.receive(2, b"x", true).expect("last");
        assert!(msg.receive(3, b"y", false).is_err());
        assert!(msg.receive(1, b"y", true).is_err());

        let mut msg = FragmentedMessage::new(2, 0, 0);
        msg.receive(4, b"x", false).expect("four");
        assert!(msg.receive(3, b"y", true).is_err());
    }

    #[test]
    fn test_overflow_rejected() {
        let mut msg = FragmentedMessage::new(1, 0, 0);
        let chunk = vec![0u8; 1000];
        let mut result = Ok(());
        for number in 1..MAX_FRAGMENTS as u8 {
            result = msg.receive(number, &chunk, false);
            if result.is_err() {
                break;
            }
        }
        assert!(matches!(result, Err(TunnelError::MessageTooLarge(_))));
    }

    #[test]
    fn test_zero_follow_rejected() {
        let mut msg = FragmentedMessage::new(1, 0, 0);
        assert!(msg.receive(0, b"x", false).is_err());
    }
}
