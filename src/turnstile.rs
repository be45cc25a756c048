//! A first-come, first-served lock that admits one command at a time.
//!
//! The wire protocol has no way to match replies to requests, so a device may
//! only have one command in flight. Callers draw a [`Ticket`] and are let
//! through in the order the tickets were drawn. Drawing the ticket is separate
//! from waiting on it so that a command handed to a background thread keeps
//! its place in the queue from the moment it was issued.

use std::{
	collections::BTreeSet,
	sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
};

#[derive(Debug, Default)]
struct Queue {
	/// The next ticket number to hand out.
	next: u64,
	/// The ticket number currently allowed through.
	serving: u64,
	/// Tickets dropped before their turn came; they are skipped.
	abandoned: BTreeSet<u64>,
}

impl Queue {
	/// Let the next live ticket through.
	fn advance(&mut self) {
		self.serving += 1;
		while self.abandoned.remove(&self.serving) {
			self.serving += 1;
		}
	}
}

/// The shared queue that [`Ticket`]s are drawn from.
#[derive(Debug, Default)]
pub(crate) struct Turnstile {
	queue: Mutex<Queue>,
	turn_changed: Condvar,
}

impl Turnstile {
	pub(crate) fn new() -> Arc<Self> {
		Arc::new(Turnstile::default())
	}

	/// Lock the queue.
	///
	/// The queue is never left in an inconsistent state, so a panic on another
	/// thread while it was held is harmless.
	fn queue(&self) -> MutexGuard<'_, Queue> {
		self.queue.lock().unwrap_or_else(PoisonError::into_inner)
	}

	/// Draw the next ticket.
	pub(crate) fn ticket(self: &Arc<Self>) -> Ticket {
		let mut queue = self.queue();
		let number = queue.next;
		queue.next += 1;
		Ticket {
			turnstile: Arc::clone(self),
			number,
			pending: true,
		}
	}

	fn release(&self) {
		self.queue().advance();
		self.turn_changed.notify_all();
	}

	fn abandon(&self, number: u64) {
		let mut queue = self.queue();
		if queue.serving == number {
			queue.advance();
			drop(queue);
			self.turn_changed.notify_all();
		} else {
			queue.abandoned.insert(number);
		}
	}
}

/// A place in a [`Turnstile`]'s queue.
///
/// Dropping a ticket without waiting on it gives up its place.
#[derive(Debug)]
pub(crate) struct Ticket {
	turnstile: Arc<Turnstile>,
	number: u64,
	/// Whether the ticket has not yet been waited on.
	pending: bool,
}

impl Ticket {
	/// Block until it is this ticket's turn.
	///
	/// The turn lasts until the returned [`Turn`] is dropped.
	pub(crate) fn wait(mut self) -> Turn {
		self.pending = false;
		let turnstile = Arc::clone(&self.turnstile);
		let mut queue = turnstile.queue();
		while queue.serving != self.number {
			queue = turnstile
				.turn_changed
				.wait(queue)
				.unwrap_or_else(PoisonError::into_inner);
		}
		drop(queue);
		Turn { turnstile }
	}
}

impl Drop for Ticket {
	fn drop(&mut self) {
		if self.pending {
			self.turnstile.abandon(self.number);
		}
	}
}

/// Exclusive access granted by a [`Ticket`]; the next ticket is let through
/// when this is dropped.
#[derive(Debug)]
pub(crate) struct Turn {
	turnstile: Arc<Turnstile>,
}

impl Drop for Turn {
	fn drop(&mut self) {
		self.turnstile.release();
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use std::{sync::mpsc, thread, time::Duration};

	#[test]
	fn tickets_are_served_in_draw_order() {
		let turnstile = Turnstile::new();
		let first = turnstile.ticket().wait();
		let (tx, rx) = mpsc::channel();

		let handles: Vec<_> = (0..8)
			.map(|i| {
				let ticket = turnstile.ticket();
				let tx = tx.clone();
				thread::spawn(move || {
					// Later tickets try to jump the queue.
					thread::sleep(Duration::from_millis(40 - 5 * i));
					let _turn = ticket.wait();
					tx.send(i).unwrap();
				})
			})
			.collect();

		drop(first);
		for handle in handles {
			handle.join().unwrap();
		}
		drop(tx);
		assert_eq!(rx.iter().collect::<Vec<_>>(), (0..8).collect::<Vec<_>>());
	}

	#[test]
	fn abandoned_tickets_do_not_stall_the_queue() {
		let turnstile = Turnstile::new();
		let turn = turnstile.ticket().wait();
		let skipped = turnstile.ticket();
		let next = turnstile.ticket();
		drop(skipped);
		drop(turn);
		// Would block forever if the abandoned ticket were still queued.
		let _turn = next.wait();

		// Abandoning the ticket currently being served also moves things along.
		drop(_turn);
		let current = turnstile.ticket();
		drop(current);
		let _turn = turnstile.ticket().wait();
	}
}
