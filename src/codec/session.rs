use std::collections::HashMap;

/// Issues session IDs per (service_id, method_id) pair.
/// IDs start at 1 and wrap from 0xFFFF back to 1; 0 is never handed out.
#[derive(Debug, Default)]
pub struct SessionIdManager {
    // Next session ID to return for each pair
    counters: HashMap<(u16, u16), u16>,
}

impl SessionIdManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_session_id(&mut self, service_id: u16, method_id: u16) -> u16 {
        let next = self.counters.entry((service_id, method_id)).or_insert(1);
        let current = *next;
        *next = if current == 0xFFFF { 1 } else { current + 1 };
        current
    }

    /// Next call for this pair returns 1 again.
    pub fn reset(&mut self, service_id: u16, method_id: u16) {
        self.counters.remove(&(service_id, method_id));
    }

    pub fn reset_all(&mut self) {
        self.counters.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_increment() {
        let mut manager = SessionIdManager::new();

        assert_eq!(manager.next_session_id(0x1234, 0x0421), 1);
        assert_eq!(manager.next_session_id(0x1234, 0x0421), 2);
        assert_eq!(manager.next_session_id(0x1234, 0x0421), 3);
    }

    #[test]
    fn test_different_methods() {
        let mut manager = SessionIdManager::new();

        assert_eq!(manager.next_session_id(0x1234, 0x0421), 1);
        assert_eq!(manager.next_session_id(0x1234, 0x8778), 1);
        assert_eq!(manager.next_session_id(0x1234, 0x0421), 2);
        assert_eq!(manager.next_session_id(0x1234, 0x8778), 2);
    }

    #[test]
    fn test_reset() {
        let mut manager = SessionIdManager::new();

        manager.next_session_id(0x1234, 0x0421);
        manager.next_session_id(0x1234, 0x0421);
        manager.reset(0x1234, 0x0421);

        assert_eq!(manager.next_session_id(0x1234, 0x0421), 1);
    }

    #[test]
    fn test_session_id_wrap_skips_zero() {
        let mut manager = SessionIdManager::new();
        manager.counters.insert((0x1234, 0x0421), 0xFFFE);

        assert_eq!(manager.next_session_id(0x1234, 0x0421), 0xFFFE);
        assert_eq!(manager.next_session_id(0x1234, 0x0421), 0xFFFF);
        assert_eq!(manager.next_session_id(0x1234, 0x0421), 1);
    }

    #[test]
    fn test_reset_all() {
        let mut manager = SessionIdManager::new();

        manager.next_session_id(0x1234, 0x0421);
        manager.next_session_id(0x5678, 0x0001);
        manager.reset_all();

        assert_eq!(manager.next_session_id(0x1234, 0x0421), 1);
        assert_eq!(manager.next_session_id(0x5678, 0x0001), 1);
    }
}
