//! Tracks a server's subscribers: addresses that have sent a `SUBSCRIBE`
//! beacon and are still considered live (§4.6).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

struct Subscriber {
	last_seen: Instant,
	/// MTU this subscriber last requested via `CONFIG_UPDATE`, overriding the
	/// server's default `max_packet_size` for fragmenting frames sent to it
	/// (§9 open question: the client's declared MTU wins on mismatch).
	max_packet_size: Option<u16>,
}

/// A server's table of known subscriber addresses, keyed by the remote
/// `SocketAddr` each `SUBSCRIBE` beacon or keep-alive arrived from (the
/// donor's `handle_video_packets` does the same "learn the peer address from
/// the first recognized datagram" trick, just for a single peer).
///
/// Lifecycle per §4.6 is a single step: an address is live from its first
/// recognized datagram until it has been idle past `staleness_timeout`, at
/// which point [`Self::prune_expired`] removes it outright. There is no
/// separate lingering grace period between "live" and "gone".
pub struct SubscriberTable {
	subscribers: HashMap<SocketAddr, Subscriber>,
	staleness_timeout: Duration,
}

impl SubscriberTable {
	pub fn new(staleness_timeout: Duration) -> Self {
		Self { subscribers: HashMap::new(), staleness_timeout }
	}

	/// Records activity from `addr`. Returns `true` if `addr` was not already
	/// in the table (i.e. this is its first recognized datagram).
	pub fn touch(&mut self, addr: SocketAddr, now: Instant) -> bool {
		match self.subscribers.get_mut(&addr) {
			Some(subscriber) => {
				subscriber.last_seen = now;
				false
			},
			None => {
				self.subscribers.insert(addr, Subscriber { last_seen: now, max_packet_size: None });
				true
			},
		}
	}

	pub fn remove(&mut self, addr: &SocketAddr) {
		self.subscribers.remove(addr);
	}

	/// Records the MTU a subscriber requested via `CONFIG_UPDATE`, taking
	/// effect for every frame fragmented for it from this point on.
	pub fn set_max_packet_size(&mut self, addr: SocketAddr, max_packet_size: u16) {
		if let Some(subscriber) = self.subscribers.get_mut(&addr) {
			subscriber.max_packet_size = Some(max_packet_size);
		}
	}

	pub fn max_packet_size(&self, addr: &SocketAddr) -> Option<u16> {
		self.subscribers.get(addr).and_then(|s| s.max_packet_size)
	}

	/// Removes every subscriber not seen within the staleness timeout,
	/// returning the removed addresses. Called before fan-out in
	/// [`crate::server::StreamServer::send`] and before every stats snapshot,
	/// so `len()`/`live_addresses()` never include an address idle past the
	/// timeout (§8: "Subscriber count never exceeds the number of distinct
	/// sources seen in the last 10 s.").
	pub fn prune_expired(&mut self, now: Instant) -> Vec<SocketAddr> {
		let expired: Vec<SocketAddr> = self
			.subscribers
			.iter()
			.filter(|(_, s)| now.duration_since(s.last_seen) >= self.staleness_timeout)
			.map(|(addr, _)| *addr)
			.collect();

		for addr in &expired {
			self.subscribers.remove(addr);
		}

		expired
	}

	pub fn live_addresses(&self) -> impl Iterator<Item = SocketAddr> + '_ {
		self.subscribers.keys().copied()
	}

	pub fn len(&self) -> usize {
		self.subscribers.len()
	}

	pub fn is_empty(&self) -> bool {
		self.subscribers.is_empty()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn addr(port: u16) -> SocketAddr {
		format!("127.0.0.1:{port}").parse().unwrap()
	}

	#[test]
	fn first_touch_is_new_subsequent_touches_are_not() {
		let mut table = SubscriberTable::new(Duration::from_secs(10));
		let now = Instant::now();
		assert!(table.touch(addr(1), now));
		assert!(!table.touch(addr(1), now));
	}

	#[test]
	fn stale_subscribers_are_pruned_from_the_table() {
		let mut table = SubscriberTable::new(Duration::from_secs(10));
		let now = Instant::now();
		table.touch(addr(1), now);
		let removed = table.prune_expired(now + Duration::from_secs(11));
		assert_eq!(removed, vec![addr(1)]);
		assert_eq!(table.live_addresses().count(), 0);
	}

	#[test]
	fn subscriber_rejoins_as_new_after_being_pruned() {
		let mut table = SubscriberTable::new(Duration::from_secs(10));
		let now = Instant::now();
		table.touch(addr(1), now);
		let later = now + Duration::from_secs(11);
		table.prune_expired(later);
		assert!(table.touch(addr(1), later));
		assert_eq!(table.live_addresses().count(), 1);
	}
}
