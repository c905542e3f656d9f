//! Ticket: a result some provider completes later
//!
//! A ticket completes once, successfully or with an error. Everyone signed
//! to it is told exactly once and then forgotten; signing a completed ticket
//! answers at once. Tasks subscribe through [`Task::await_ticket`] and get
//! the result as a signal payload.
//!
//! [`Task::await_ticket`]: crate::Task::await_ticket

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// Completion state of a ticket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketStatus {
    /// Not completed yet
    Pending,
    /// Completed with a value
    Ready,
    /// Completed with an error
    Failed,
}

impl TicketStatus {
    /// Completed either way
    pub fn is_complete(self) -> bool {
        self != TicketStatus::Pending
    }
}

/// Failure of a ticket, delivered in place of its value
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("ticket failed: {message}")]
pub struct TicketError {
    message: String,
}

impl TicketError {
    /// Failure text given by the provider
    pub fn message(&self) -> &str {
        &self.message
    }
}

type Waiter<T> = Box<dyn FnOnce(Result<T, TicketError>) + Send>;

struct TicketState<T> {
    outcome: Option<Result<T, TicketError>>,
    waiters: Vec<Waiter<T>>,
}

/// One-shot result shared between a provider and its subscribers
pub struct Ticket<T> {
    state: Arc<Mutex<TicketState<T>>>,
}

impl<T> Clone for Ticket<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Default for Ticket<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Ticket<T> {
    /// Pending ticket
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(TicketState {
                outcome: None,
                waiters: Vec::new(),
            })),
        }
    }

    /// Current state
    pub fn status(&self) -> TicketStatus {
        match &self.state.lock().outcome {
            None => TicketStatus::Pending,
            Some(Ok(_)) => TicketStatus::Ready,
            Some(Err(_)) => TicketStatus::Failed,
        }
    }

    /// The value, once completed successfully
    pub fn take(&self) -> Option<T> {
        match &self.state.lock().outcome {
            Some(Ok(value)) => Some(value.clone()),
            _ => None,
        }
    }

    /// The error, once failed
    pub fn error(&self) -> Option<TicketError> {
        match &self.state.lock().outcome {
            Some(Err(error)) => Some(error.clone()),
            _ => None,
        }
    }

    /// Complete with a value; false if already completed
    pub fn complete(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    /// Complete with an error; false if already completed
    pub fn fail(&self, error: impl fmt::Display) -> bool {
        self.settle(Err(TicketError {
            message: error.to_string(),
        }))
    }

    /// Run `waiter` once the ticket completes, or now if it already has
    pub fn sign(&self, waiter: impl FnOnce(Result<T, TicketError>) + Send + 'static) {
        let outcome = {
            let mut state = self.state.lock();
            match &state.outcome {
                Some(outcome) => outcome.clone(),
                None => {
                    state.waiters.push(Box::new(waiter));
                    return;
                }
            }
        };
        waiter(outcome);
    }

    fn settle(&self, outcome: Result<T, TicketError>) -> bool {
        let waiters = {
            let mut state = self.state.lock();
            if state.outcome.is_some() {
                return false;
            }
            state.outcome = Some(outcome.clone());
            std::mem::take(&mut state.waiters)
        };
        for waiter in waiters {
            waiter(outcome.clone());
        }
        true
    }
}

impl<T> fmt::Debug for Ticket<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        let status = match &state.outcome {
            None => TicketStatus::Pending,
            Some(Ok(_)) => TicketStatus::Ready,
            Some(Err(_)) => TicketStatus::Failed,
        };
        f.debug_struct("Ticket")
            .field("status", &status)
            .field("waiters", &state.waiters.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_waiters_told_once() {
        let ticket = Ticket::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..2 {
            let seen = seen.clone();
            ticket.sign(move |outcome| seen.lock().push(outcome));
        }
        assert_eq!(ticket.status(), TicketStatus::Pending);
        assert!(ticket.complete(5));
        assert!(!ticket.complete(6));
        assert_eq!(*seen.lock(), vec![Ok(5), Ok(5)]);
        assert_eq!(ticket.take(), Some(5));
    }

    #[test]
    fn test_sign_after_completion_answers_now() {
        let ticket = Ticket::<String>::new();
        assert!(ticket.fail("disk gone"));
        let seen = Arc::new(Mutex::new(None));
        let slot = seen.clone();
        ticket.sign(move |outcome| *slot.lock() = Some(outcome));
        let outcome = seen.lock().take().unwrap();
        assert_eq!(outcome.unwrap_err().message(), "disk gone");
        assert_eq!(ticket.status(), TicketStatus::Failed);
        assert!(ticket.take().is_none());
        assert!(ticket.error().is_some());
    }
}
