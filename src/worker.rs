// Copyright 2015-2020 Parity Technologies (UK) Ltd.
// This file is part of Parity.

// Parity is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// Parity is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with Parity.  If not, see <http://www.gnu.org/licenses/>.

use std::collections::{BinaryHeap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

pub type TaskId = u64;

struct Scheduled {
	due: Instant,
	seq: u64,
	id: TaskId,
	period: Option<Duration>,
	job: Box<dyn FnMut() + Send>,
}

impl PartialEq for Scheduled {
	fn eq(&self, other: &Self) -> bool {
		self.due == other.due && self.seq == other.seq
	}
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
	fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
		Some(self.cmp(other))
	}
}

impl Ord for Scheduled {
	// Reversed so the binary heap pops the earliest deadline first.
	fn cmp(&self, other: &Self) -> std::cmp::Ordering {
		other.due.cmp(&self.due).then(other.seq.cmp(&self.seq))
	}
}

struct State {
	queue: BinaryHeap<Scheduled>,
	cancelled: HashSet<TaskId>,
	shutdown: bool,
}

struct Inner {
	state: Mutex<State>,
	signal: Condvar,
	next_id: AtomicU64,
}

/// Runs delayed and periodic jobs on a small pool of worker threads.
/// Cancellation is by task id and lazy: a cancelled job is dropped the
/// next time it comes up. `shutdown` joins the workers; jobs still queued
/// are dropped.
pub struct Scheduler {
	inner: Arc<Inner>,
	threads: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl Scheduler {
	pub fn new(threads: usize) -> Scheduler {
		let inner = Arc::new(Inner {
			state: Mutex::new(State {
				queue: BinaryHeap::new(),
				cancelled: HashSet::new(),
				shutdown: false,
			}),
			signal: Condvar::new(),
			next_id: AtomicU64::new(1),
		});
		let handles = (0..threads.max(1))
			.map(|i| {
				let inner = inner.clone();
				std::thread::Builder::new()
					.name(format!("cask-db-worker-{}", i))
					.spawn(move || Self::worker(inner))
					.expect("failed to spawn worker thread")
			})
			.collect();
		Scheduler { inner, threads: Mutex::new(handles) }
	}

	fn worker(inner: Arc<Inner>) {
		let mut state = inner.state.lock();
		loop {
			if state.shutdown {
				return;
			}
			match state.queue.peek().map(|next| next.due) {
				None => {
					inner.signal.wait(&mut state);
					continue;
				}
				Some(due) if due > Instant::now() => {
					inner.signal.wait_until(&mut state, due);
					continue;
				}
				Some(_) => {}
			}
			let mut task = state.queue.pop().unwrap();
			if state.cancelled.remove(&task.id) {
				continue;
			}
			drop(state);
			(task.job)();
			state = inner.state.lock();
			if let Some(period) = task.period {
				if state.cancelled.remove(&task.id) {
					continue;
				}
				task.due = Instant::now() + period;
				state.queue.push(task);
			}
		}
	}

	fn push(&self, delay: Duration, period: Option<Duration>, job: Box<dyn FnMut() + Send>) -> TaskId {
		let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
		let mut state = self.inner.state.lock();
		if state.shutdown {
			return id;
		}
		state.queue.push(Scheduled { due: Instant::now() + delay, seq: id, id, period, job });
		drop(state);
		self.inner.signal.notify_all();
		id
	}

	pub fn schedule_once<F: FnOnce() + Send + 'static>(&self, delay: Duration, job: F) -> TaskId {
		let mut job = Some(job);
		self.push(
			delay,
			None,
			Box::new(move || {
				if let Some(job) = job.take() {
					job()
				}
			}),
		)
	}

	pub fn schedule_every<F: FnMut() + Send + 'static>(
		&self,
		initial: Duration,
		period: Duration,
		job: F,
	) -> TaskId {
		self.push(initial, Some(period), Box::new(job))
	}

	pub fn cancel(&self, id: TaskId) {
		self.inner.state.lock().cancelled.insert(id);
	}

	/// Stops the workers and joins them. The running job of each worker
	/// finishes; queued jobs are dropped.
	pub fn shutdown(&self) {
		{
			let mut state = self.inner.state.lock();
			if state.shutdown {
				return;
			}
			state.shutdown = true;
			state.queue.clear();
		}
		self.inner.signal.notify_all();
		let handles = std::mem::take(&mut *self.threads.lock());
		for handle in handles {
			let _ = handle.join();
		}
	}
}

impl Drop for Scheduler {
	fn drop(&mut self) {
		self.shutdown();
	}
}
