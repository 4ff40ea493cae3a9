//! # Exclusive Write Gate
//!
//! Purpose: Let many callers share one connection's write path, granting it
//! to exactly one holder at a time. Callers either block their thread or
//! suspend their task while they wait.
//!
//! ## Design Principles
//! 1. **Tickets, Not Guards**: Every acquisition yields a `WriteTicket` whose
//!    state says whether the gate was granted, timed out, or was canceled.
//! 2. **Strict FIFO**: Releasing hands the gate directly to the oldest live
//!    waiter; an immediate acquisition never overtakes a queued waiter.
//! 3. **Latched Outcomes**: A waiter's state leaves `Pending` exactly once, by
//!    CAS. Whoever loses a release/timeout race accepts the winner's result.
//! 4. **Cheap Fast Path**: An uncontended acquisition allocates nothing.
//!
//! ## Memory Layout
//! ```text
//! ExclusiveWriteGate<T>
//! ┌──────────────────────────────────────────────┐
//! │ state: Mutex<GateState>                      │
//! │   held: bool                                 │
//! │   generation: u64   (bumped per grant)       │
//! │   waiters: VecDeque<Arc<WaitSlot>>  (FIFO)   │
//! │ value: Mutex<T>  (locked by the holder only) │
//! └──────────────────────────────────────────────┘
//! ```

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::ptr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};
use tokio::time::{Instant as TimerInstant, Sleep};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use crate::error::GateError;

/// Outcome of an acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TicketState {
    /// Still queued.
    Pending = 0,
    /// The ticket holds the gate.
    Success = 1,
    /// The waiter was canceled before the gate was granted.
    Canceled = 2,
    /// The deadline passed before the gate was granted.
    Timeout = 3,
}

impl TicketState {
    fn from_u8(raw: u8) -> TicketState {
        match raw {
            0 => TicketState::Pending,
            1 => TicketState::Success,
            2 => TicketState::Canceled,
            _ => TicketState::Timeout,
        }
    }
}

enum Continuation {
    Thread(Thread),
    Task(Waker),
}

/// One queued waiter.
///
/// The generation is written before the state leaves `Pending`, so anyone who
/// observes `Success` also observes the generation of the grant.
struct WaitSlot {
    state: AtomicU8,
    generation: AtomicU64,
    continuation: Mutex<Option<Continuation>>,
}

impl WaitSlot {
    fn new() -> Self {
        WaitSlot {
            state: AtomicU8::new(TicketState::Pending as u8),
            generation: AtomicU64::new(0),
            continuation: Mutex::new(None),
        }
    }

    fn reset(&self) {
        self.state.store(TicketState::Pending as u8, Ordering::Release);
        self.generation.store(0, Ordering::Relaxed);
        *self.continuation.lock() = None;
    }

    fn state(&self) -> TicketState {
        TicketState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::Relaxed)
    }

    /// Moves `Pending -> to`. On failure returns the state that won.
    fn try_transition(&self, to: TicketState) -> Result<(), TicketState> {
        self.state
            .compare_exchange(
                TicketState::Pending as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(TicketState::from_u8)
    }

    fn register(&self, continuation: Continuation) -> Result<(), GateError> {
        let mut current = self.continuation.lock();
        if current.is_some() {
            return Err(GateError::ContinuationAlreadyRegistered);
        }
        *current = Some(continuation);
        Ok(())
    }

    /// Installs or updates the task waker. Re-polling with a new waker is not
    /// a second registration.
    fn refresh_waker(&self, waker: &Waker) -> Result<(), GateError> {
        let mut current = self.continuation.lock();
        match current.as_mut() {
            None => {
                *current = Some(Continuation::Task(waker.clone()));
                Ok(())
            }
            Some(Continuation::Task(existing)) => {
                if !existing.will_wake(waker) {
                    existing.clone_from(waker);
                }
                Ok(())
            }
            Some(Continuation::Thread(_)) => Err(GateError::ContinuationAlreadyRegistered),
        }
    }

    fn wake(&self) {
        let continuation = self.continuation.lock().take();
        match continuation {
            Some(Continuation::Thread(thread)) => thread.unpark(),
            Some(Continuation::Task(waker)) => waker.wake(),
            None => {}
        }
    }
}

thread_local! {
    static BLOCKING_SLOT: RefCell<Option<Arc<WaitSlot>>> = const { RefCell::new(None) };
}

/// Returns this thread's reusable wait slot, reset to `Pending`.
fn blocking_slot() -> Arc<WaitSlot> {
    BLOCKING_SLOT.with(|cached| {
        let mut cached = cached.borrow_mut();
        match cached.as_ref() {
            // No gate queue still references it.
            Some(slot) if Arc::strong_count(slot) == 1 => {
                slot.reset();
                Arc::clone(slot)
            }
            _ => {
                let slot = Arc::new(WaitSlot::new());
                *cached = Some(Arc::clone(&slot));
                slot
            }
        }
    })
}

struct GateState {
    held: bool,
    generation: u64,
    waiters: VecDeque<Arc<WaitSlot>>,
}

/// A FIFO single-holder gate guarding a value of type `T`.
pub struct ExclusiveWriteGate<T> {
    state: Mutex<GateState>,
    // Only a `Success` ticket locks it, so the lock is never contended.
    value: Mutex<T>,
}

impl<T> ExclusiveWriteGate<T> {
    /// Creates an unheld gate at generation 0.
    pub fn new(value: T) -> Self {
        ExclusiveWriteGate {
            state: Mutex::new(GateState {
                held: false,
                generation: 0,
                waiters: VecDeque::new(),
            }),
            value: Mutex::new(value),
        }
    }

    /// Takes the gate if nobody holds it. Never queues and never allocates.
    pub fn try_acquire_immediate(&self) -> Option<WriteTicket<'_, T>> {
        let mut state = self.state.lock();
        if state.held {
            return None;
        }
        Some(self.grant_locked(&mut state))
    }

    /// Blocks the calling thread until the gate is granted or `timeout`
    /// elapses. `None` waits forever.
    pub fn acquire_blocking(&self, timeout: Option<Duration>) -> WriteTicket<'_, T> {
        let deadline = timeout.and_then(|timeout| Instant::now().checked_add(timeout));
        let slot = {
            let mut state = self.state.lock();
            if !state.held {
                return self.grant_locked(&mut state);
            }
            if timeout == Some(Duration::ZERO) {
                return WriteTicket::failed(self, TicketState::Timeout);
            }
            let slot = blocking_slot();
            if let Err(err) = slot.register(Continuation::Thread(thread::current())) {
                panic!("blocking waiter: {err}");
            }
            state.waiters.push_back(Arc::clone(&slot));
            slot
        };

        loop {
            match slot.state() {
                TicketState::Pending => {}
                TicketState::Success => return WriteTicket::granted(self, slot.generation()),
                other => return WriteTicket::failed(self, other),
            }
            match deadline {
                None => thread::park(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return self.abandon(&slot, TicketState::Timeout);
                    }
                    thread::park_timeout(deadline - now);
                }
            }
        }
    }

    /// Returns a future that resolves once the gate is granted, `timeout`
    /// elapses, or `cancel` fires.
    ///
    /// If the gate is free the future is ready immediately and nothing is
    /// allocated. Otherwise the waiter joins the queue now, not on first
    /// poll. Dropping the future gives up the place in line.
    pub fn acquire_suspending(
        &self,
        timeout: Option<Duration>,
        cancel: Option<CancellationToken>,
    ) -> Acquire<'_, T> {
        let mut state = self.state.lock();
        if !state.held {
            state.held = true;
            state.generation += 1;
            return Acquire {
                gate: self,
                stage: Stage::Ready(state.generation),
                deadline: None,
                sleep: None,
                cancel: None,
            };
        }

        let slot = Arc::new(WaitSlot::new());
        state.waiters.push_back(Arc::clone(&slot));
        drop(state);

        Acquire {
            gate: self,
            stage: Stage::Waiting(slot),
            deadline: timeout.and_then(|timeout| TimerInstant::now().checked_add(timeout)),
            sleep: None,
            cancel: cancel.map(|token| Box::pin(token.cancelled_owned())),
        }
    }

    /// Releases the gate held by `ticket`.
    ///
    /// A ticket that never held the gate is simply discarded. A ticket from
    /// another gate is rejected; it is still dropped, which releases the gate
    /// it came from.
    pub fn release(&self, ticket: WriteTicket<'_, T>) -> Result<(), GateError> {
        if !ptr::eq(ticket.gate, self) {
            return Err(GateError::ForeignTicket);
        }
        drop(ticket);
        Ok(())
    }

    /// Returns true while some ticket holds the gate.
    pub fn is_held(&self) -> bool {
        self.state.lock().held
    }

    /// Number of queued waiters.
    pub fn waiter_count(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Generation of the most recent grant.
    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    fn grant_locked(&self, state: &mut GateState) -> WriteTicket<'_, T> {
        state.held = true;
        state.generation += 1;
        WriteTicket::granted(self, state.generation)
    }

    /// Hands the gate to the oldest waiter still pending, or frees it.
    fn hand_off(&self) {
        let mut state = self.state.lock();
        while let Some(slot) = state.waiters.pop_front() {
            let next = state.generation + 1;
            slot.generation.store(next, Ordering::Relaxed);
            if slot.try_transition(TicketState::Success).is_ok() {
                state.generation = next;
                drop(state);
                slot.wake();
                return;
            }
        }
        state.held = false;
    }

    /// Gives up waiting with `reason`, unless the gate was granted first.
    fn abandon(&self, slot: &Arc<WaitSlot>, reason: TicketState) -> WriteTicket<'_, T> {
        match slot.try_transition(reason) {
            Ok(()) => {
                let mut state = self.state.lock();
                if let Some(index) = state.waiters.iter().position(|w| Arc::ptr_eq(w, slot)) {
                    state.waiters.remove(index);
                }
                WriteTicket::failed(self, reason)
            }
            Err(TicketState::Success) => WriteTicket::granted(self, slot.generation()),
            Err(other) => WriteTicket::failed(self, other),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for ExclusiveWriteGate<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ExclusiveWriteGate")
            .field("held", &state.held)
            .field("generation", &state.generation)
            .field("waiters", &state.waiters.len())
            .finish_non_exhaustive()
    }
}

/// Result of an acquisition. Releases the gate on drop if it holds it.
pub struct WriteTicket<'a, T> {
    gate: &'a ExclusiveWriteGate<T>,
    state: TicketState,
    generation: u64,
}

impl<'a, T> WriteTicket<'a, T> {
    fn granted(gate: &'a ExclusiveWriteGate<T>, generation: u64) -> Self {
        WriteTicket {
            gate,
            state: TicketState::Success,
            generation,
        }
    }

    fn failed(gate: &'a ExclusiveWriteGate<T>, state: TicketState) -> Self {
        WriteTicket {
            gate,
            state,
            generation: 0,
        }
    }

    pub fn state(&self) -> TicketState {
        self.state
    }

    /// Grant generation; 0 for tickets that never held the gate.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_success(&self) -> bool {
        self.state == TicketState::Success
    }

    /// Access to the guarded value.
    ///
    /// # Panics
    /// Panics if the ticket does not hold the gate.
    pub fn value_mut(&mut self) -> MutexGuard<'_, T> {
        match self.try_value_mut() {
            Ok(value) => value,
            Err(err) => panic!("{err}"),
        }
    }

    pub fn try_value_mut(&mut self) -> Result<MutexGuard<'_, T>, GateError> {
        if self.state != TicketState::Success {
            return Err(GateError::NotHeld(self.state));
        }
        Ok(self.gate.value.lock())
    }
}

impl<T> Drop for WriteTicket<'_, T> {
    fn drop(&mut self) {
        if self.state == TicketState::Success {
            self.gate.hand_off();
        }
    }
}

impl<T> fmt::Debug for WriteTicket<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteTicket")
            .field("state", &self.state)
            .field("generation", &self.generation)
            .finish()
    }
}

enum Stage {
    Ready(u64),
    Waiting(Arc<WaitSlot>),
    Done,
}

/// Future returned by [`ExclusiveWriteGate::acquire_suspending`].
#[must_use = "futures do nothing unless polled; dropping gives up the queue position"]
pub struct Acquire<'a, T> {
    gate: &'a ExclusiveWriteGate<T>,
    stage: Stage,
    deadline: Option<TimerInstant>,
    sleep: Option<Pin<Box<Sleep>>>,
    cancel: Option<Pin<Box<WaitForCancellationFutureOwned>>>,
}

impl<'a, T> Future for Acquire<'a, T> {
    type Output = WriteTicket<'a, T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let slot = match &this.stage {
            Stage::Ready(generation) => {
                let generation = *generation;
                this.stage = Stage::Done;
                return Poll::Ready(WriteTicket::granted(this.gate, generation));
            }
            Stage::Waiting(slot) => Arc::clone(slot),
            Stage::Done => panic!("`Acquire` polled after completion"),
        };

        if let Err(err) = slot.refresh_waker(cx.waker()) {
            panic!("suspending waiter: {err}");
        }

        match slot.state() {
            TicketState::Pending => {}
            TicketState::Success => {
                this.stage = Stage::Done;
                return Poll::Ready(WriteTicket::granted(this.gate, slot.generation()));
            }
            other => {
                this.stage = Stage::Done;
                return Poll::Ready(WriteTicket::failed(this.gate, other));
            }
        }

        if let Some(cancel) = this.cancel.as_mut() {
            if cancel.as_mut().poll(cx).is_ready() {
                this.stage = Stage::Done;
                return Poll::Ready(this.gate.abandon(&slot, TicketState::Canceled));
            }
        }

        if let Some(deadline) = this.deadline {
            let sleep = this
                .sleep
                .get_or_insert_with(|| Box::pin(tokio::time::sleep_until(deadline)));
            if sleep.as_mut().poll(cx).is_ready() {
                this.stage = Stage::Done;
                return Poll::Ready(this.gate.abandon(&slot, TicketState::Timeout));
            }
        }

        Poll::Pending
    }
}

impl<T> Drop for Acquire<'_, T> {
    fn drop(&mut self) {
        match std::mem::replace(&mut self.stage, Stage::Done) {
            Stage::Ready(generation) => drop(WriteTicket::granted(self.gate, generation)),
            // A grant that raced the drop is released by the ticket's Drop.
            Stage::Waiting(slot) => drop(self.gate.abandon(&slot, TicketState::Canceled)),
            Stage::Done => {}
        }
    }
}
