use crate::model::{Delivery, Method, ProcessHandle, TerminationOutcome};
use crate::sys::{self, Signal, SignalError};
use std::future::Future;

pub trait Terminator {
    /// Signal every handle. Delivery only: whether the process actually
    /// exited is decided by the caller re-probing.
    fn terminate(
        &self,
        handles: &[ProcessHandle],
        method: Method,
    ) -> impl Future<Output = Vec<TerminationOutcome>>;
}

#[derive(Debug, Clone, Copy)]
pub struct SignalTerminator {
    graceful: Signal,
}

impl SignalTerminator {
    pub fn new(graceful: Signal) -> Self {
        Self { graceful }
    }

    pub fn signal_for(&self, method: Method) -> Signal {
        match method {
            Method::Graceful => self.graceful,
            Method::Forceful => sys::FORCE_SIGNAL,
        }
    }

    fn deliver(&self, handle: &ProcessHandle, method: Method) -> TerminationOutcome {
        let signal = self.signal_for(method);
        let delivery = match sys::send_signal(handle.pid, signal) {
            Ok(()) => {
                tracing::info!("sent {signal} to pid {} ({})", handle.pid, handle.origin);
                Delivery::Delivered
            }
            Err(SignalError::NoSuchProcess) => {
                tracing::debug!("pid {} already exited", handle.pid);
                Delivery::AlreadyExited
            }
            Err(e) => {
                tracing::warn!("could not send {signal} to pid {}: {e}", handle.pid);
                Delivery::Failed(e.to_string())
            }
        };
        TerminationOutcome::new(handle.clone(), method, delivery)
    }
}

impl Terminator for SignalTerminator {
    async fn terminate(&self, handles: &[ProcessHandle], method: Method) -> Vec<TerminationOutcome> {
        handles.iter().map(|h| self.deliver(h, method)).collect()
    }
}
